//! Callback executors
//!
//! An executor owns a sequential context. Jobs handed to it run one at a time
//! in the order they arrive. The engine uses an executor, when configured, to
//! move callback delivery off the worker threads.

use crate::engine::panic_message;
use crate::error::Result;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, ThreadId};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// A nullary unit of work
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Sequential execution context for callback delivery
pub trait Executor: Send + Sync {
    /// Run `job` eventually, serialized with every other job of this executor.
    fn execute(&self, job: Job);
}

fn run_job(job: Job) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
        error!(panic = %panic_message(payload.as_ref()), "executor job panicked");
    }
}

/// Executor backed by one dedicated OS thread
pub struct ThreadExecutor {
    tx: mpsc::UnboundedSender<Job>,
    thread_id: ThreadId,
    name: String,
}

impl ThreadExecutor {
    /// Spawn the executor thread under the given name.
    ///
    /// The thread exits once the executor is dropped and its backlog is done.
    pub fn spawn(name: &str) -> Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let thread_name = name.to_string();
        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                while let Some(job) = rx.blocking_recv() {
                    run_job(job);
                }
                debug!(executor = %thread_name, "executor thread exiting");
            })?;

        Ok(Self {
            tx,
            thread_id: handle.thread().id(),
            name: name.to_string(),
        })
    }

    /// Id of the thread every job runs on
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Executor for ThreadExecutor {
    fn execute(&self, job: Job) {
        if self.tx.send(job).is_err() {
            warn!(executor = %self.name, "executor thread gone, job dropped");
        }
    }
}

/// Executor backed by a single task on a tokio runtime.
///
/// Jobs run on a runtime thread, so they should not block.
pub struct TokioExecutor {
    tx: mpsc::UnboundedSender<Job>,
}

impl TokioExecutor {
    /// Spawn the executor task on the current runtime.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn() -> Self {
        Self::spawn_on(&tokio::runtime::Handle::current())
    }

    /// Spawn the executor task on the given runtime.
    pub fn spawn_on(handle: &tokio::runtime::Handle) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        handle.spawn(async move {
            while let Some(job) = rx.recv().await {
                run_job(job);
            }
        });
        Self { tx }
    }
}

impl Executor for TokioExecutor {
    fn execute(&self, job: Job) {
        if self.tx.send(job).is_err() {
            warn!("tokio executor task gone, job dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_thread_executor_runs_jobs_in_order_on_its_thread() {
        let executor = ThreadExecutor::spawn("test-executor").unwrap();
        let expected_thread = executor.thread_id();
        let (tx, rx) = std::sync::mpsc::channel();

        for i in 0..20 {
            let tx = tx.clone();
            executor.execute(Box::new(move || {
                tx.send((i, thread::current().id())).unwrap();
            }));
        }

        let mut seen = Vec::new();
        for _ in 0..20 {
            let (i, thread_id) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(thread_id, expected_thread);
            seen.push(i);
        }
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_thread_executor_survives_panicking_job() {
        let executor = ThreadExecutor::spawn("test-executor-panic").unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = std::sync::mpsc::channel();

        executor.execute(Box::new(|| panic!("job blew up")));
        let counter_clone = Arc::clone(&counter);
        executor.execute(Box::new(move || {
            counter_clone.fetch_add(1, Ordering::SeqCst);
            tx.send(()).unwrap();
        }));

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_tokio_executor_runs_jobs() {
        let executor = TokioExecutor::spawn();
        let (tx, rx) = tokio::sync::oneshot::channel();
        executor.execute(Box::new(move || {
            tx.send(42).unwrap();
        }));
        assert_eq!(rx.await.unwrap(), 42);
    }
}
