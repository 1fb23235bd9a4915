//! Asynchronous command engine
//!
//! The engine owns one bounded `CommandQueue` and a fixed pool of named worker
//! threads. Each worker pops a command, runs it against the shared driver,
//! and hands the resulting `Delivery` to the callback dispatcher: inline on
//! the worker, or onto the configured `Executor`.
//!
//! Both store facades (`KvClient`, `DocClient`) are thin layers over an
//! `Engine` parameterized by their command enum.

use crate::classify::Classification;
use crate::error::{DbQueueError, DriverError, DriverResult, Result};
use crate::executor::{Executor, Job};
use crate::queue::CommandQueue;
use crate::reply::{Callback, Reply};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, warn};

/// One queued operation against a driver of type `Self::Driver`.
pub trait Command: Send + 'static {
    type Driver: ?Sized + Send + Sync + 'static;

    /// Operation name used in logs
    fn kind(&self) -> &'static str;

    /// Key or collection the operation targets
    fn target(&self) -> &str;

    /// Run the blocking driver call and package the classified result.
    fn execute(self, driver: &Self::Driver) -> Delivery;
}

/// A classified result bound to its callback, ready to be invoked
pub struct Delivery {
    kind: &'static str,
    target: String,
    classification: Classification,
    job: Job,
}

impl Delivery {
    /// Bind `reply` to `callback`. FAIL replies are logged here, with the
    /// command's kind and target; MISS is not logged.
    pub fn new<T: Send + 'static>(kind: &'static str, reply: Reply<T>, callback: Callback<T>) -> Self {
        if let Some(err) = reply.error.as_ref().filter(|err| !err.is_not_found()) {
            error!(kind, target = %reply.key, error = %err, "command failed");
        }
        let target = reply.key.clone();
        let classification = reply.classification;
        Self {
            kind,
            target,
            classification,
            job: Box::new(move || callback(reply)),
        }
    }

    /// Run one driver call against `target` and bind the classified reply to
    /// `callback`. A panicking driver call becomes a FAIL reply.
    pub fn call<T: Default + Send + 'static>(
        kind: &'static str,
        target: String,
        callback: Callback<T>,
        call: impl FnOnce(&str) -> DriverResult<T>,
    ) -> Self {
        let result = call_driver(|| call(&target));
        Self::new(kind, Reply::from_result(target, result), callback)
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn classification(&self) -> Classification {
        self.classification
    }

    /// Invoke the callback. A panic inside it is logged and swallowed.
    pub fn deliver(self) {
        let Delivery { kind, target, job, .. } = self;
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
            error!(
                kind,
                target = %target,
                panic = %panic_message(payload.as_ref()),
                "callback panicked"
            );
        }
    }
}

/// Run one driver call, turning a panic into `DriverError::Panicked` so the
/// command still gets exactly one reply.
pub fn call_driver<T>(f: impl FnOnce() -> DriverResult<T>) -> DriverResult<T> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(DriverError::Panicked(panic_message(payload.as_ref()))),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "(non-string panic)".to_string()
    }
}

/// Engine metrics snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    /// Commands waiting in the queue
    pub queued: usize,
    pub capacity: usize,
    pub workers: usize,
    /// Commands taken off the queue and executed, panicked ones included
    pub executed: u64,
    /// Executions that panicked outside the driver call boundary
    pub execution_panics: u64,
    pub stopped: bool,
}

struct Shared<C: Command> {
    name: String,
    queue: CommandQueue<C>,
    driver: Arc<C::Driver>,
    executor: Option<Arc<dyn Executor>>,
    executed: AtomicU64,
    execution_panics: AtomicU64,
}

impl<C: Command> Shared<C> {
    fn dispatch(&self, delivery: Delivery) {
        match &self.executor {
            Some(executor) => executor.execute(Box::new(move || delivery.deliver())),
            None => delivery.deliver(),
        }
    }
}

/// Queue plus worker pool for one client
pub struct Engine<C: Command> {
    shared: Arc<Shared<C>>,
    workers: usize,
}

impl<C: Command> Engine<C> {
    /// Start `workers` threads draining a queue of `capacity` commands.
    ///
    /// Workers are named `<name>-worker-<n>` and run until the engine stops.
    pub fn start(
        name: &str,
        driver: Arc<C::Driver>,
        workers: usize,
        capacity: usize,
        executor: Option<Arc<dyn Executor>>,
    ) -> Result<Self> {
        if workers == 0 {
            return Err(DbQueueError::Configuration(
                "worker count must be at least 1".to_string(),
            ));
        }
        if capacity == 0 {
            return Err(DbQueueError::Configuration(
                "queue capacity must be at least 1".to_string(),
            ));
        }

        let shared = Arc::new(Shared {
            name: name.to_string(),
            queue: CommandQueue::new(capacity),
            driver,
            executor,
            executed: AtomicU64::new(0),
            execution_panics: AtomicU64::new(0),
        });

        for i in 0..workers {
            let worker_shared = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("{}-worker-{}", name, i))
                .spawn(move || worker_loop(&worker_shared, i));
            if let Err(e) = spawned {
                // Release the workers that did start
                shared.queue.close();
                return Err(DbQueueError::Io(e));
            }
        }

        info!(client = %name, workers, capacity, "command engine started");
        Ok(Self { shared, workers })
    }

    /// Enqueue a command, blocking only while the queue is full.
    pub fn submit(&self, command: C) -> Result<()> {
        let kind = command.kind();
        self.shared
            .queue
            .submit(command)
            .map_err(|_| DbQueueError::Stopped(kind))
    }

    /// The shared driver handle, for calls that bypass the queue
    pub fn driver(&self) -> &C::Driver {
        self.shared.driver.as_ref()
    }

    /// Stop accepting commands and let the workers exit.
    ///
    /// Commands still queued are abandoned without delivery and their count
    /// is returned. Commands already inside a driver call complete normally.
    /// Workers are not joined.
    pub fn stop(&self) -> usize {
        let abandoned = self.shared.queue.close();
        let count = abandoned.len();
        if count > 0 {
            warn!(client = %self.shared.name, abandoned = count, "engine stopped with queued commands");
        } else {
            info!(client = %self.shared.name, "engine stopped");
        }
        drop(abandoned);
        count
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.queue.is_closed()
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            queued: self.shared.queue.len(),
            capacity: self.shared.queue.capacity(),
            workers: self.workers,
            executed: self.shared.executed.load(Ordering::Relaxed),
            execution_panics: self.shared.execution_panics.load(Ordering::Relaxed),
            stopped: self.is_stopped(),
        }
    }
}

impl<C: Command> Drop for Engine<C> {
    fn drop(&mut self) {
        if !self.is_stopped() {
            self.stop();
        }
    }
}

fn worker_loop<C: Command>(shared: &Shared<C>, worker: usize) {
    debug!(client = %shared.name, worker, "worker started");

    while let Some(command) = shared.queue.pop() {
        let kind = command.kind();
        let target = command.target().to_string();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            command.execute(shared.driver.as_ref())
        }));
        shared.executed.fetch_add(1, Ordering::Relaxed);

        match outcome {
            Ok(delivery) => shared.dispatch(delivery),
            Err(payload) => {
                shared.execution_panics.fetch_add(1, Ordering::Relaxed);
                error!(
                    client = %shared.name,
                    worker,
                    kind,
                    target = %target,
                    panic = %panic_message(payload.as_ref()),
                    "command execution panicked"
                );
            }
        }
    }

    debug!(client = %shared.name, worker, "worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ThreadExecutor;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::sync::mpsc;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    #[derive(Default)]
    struct Journal {
        executed: Mutex<Vec<u32>>,
    }

    enum TestCommand {
        Record { id: u32, callback: Callback<u32> },
        Panic,
        Block { started: mpsc::Sender<()>, release: mpsc::Receiver<()> },
    }

    impl Command for TestCommand {
        type Driver = Journal;

        fn kind(&self) -> &'static str {
            match self {
                TestCommand::Record { .. } => "record",
                TestCommand::Panic => "panic",
                TestCommand::Block { .. } => "block",
            }
        }

        fn target(&self) -> &str {
            "journal"
        }

        fn execute(self, driver: &Journal) -> Delivery {
            match self {
                TestCommand::Record { id, callback } => {
                    driver.executed.lock().push(id);
                    Delivery::new("record", Reply::new("journal", id, None), callback)
                }
                TestCommand::Panic => panic!("test command exploded"),
                TestCommand::Block { started, release } => {
                    started.send(()).unwrap();
                    let _ = release.recv();
                    Delivery::new(
                        "block",
                        Reply::new("journal", 0u32, None),
                        Box::new(|_: Reply<u32>| {}),
                    )
                }
            }
        }
    }

    fn record(id: u32, tx: &mpsc::Sender<u32>) -> TestCommand {
        let tx = tx.clone();
        TestCommand::Record {
            id,
            callback: Box::new(move |reply: Reply<u32>| {
                tx.send(reply.value).unwrap();
            }),
        }
    }

    fn start(workers: usize, capacity: usize) -> (Engine<TestCommand>, Arc<Journal>) {
        let journal = Arc::new(Journal::default());
        let engine = Engine::start("engine-test", Arc::clone(&journal), workers, capacity, None).unwrap();
        (engine, journal)
    }

    /// Park the single worker inside a driver call until the sender is used.
    fn block_worker(engine: &Engine<TestCommand>) -> mpsc::Sender<()> {
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        engine
            .submit(TestCommand::Block { started: started_tx, release: release_rx })
            .unwrap();
        started_rx.recv_timeout(WAIT).unwrap();
        release_tx
    }

    #[test]
    fn test_rejects_zero_workers_and_capacity() {
        let journal = Arc::new(Journal::default());
        assert!(matches!(
            Engine::<TestCommand>::start("engine-test", Arc::clone(&journal), 0, 10, None),
            Err(DbQueueError::Configuration(_))
        ));
        assert!(matches!(
            Engine::<TestCommand>::start("engine-test", journal, 2, 0, None),
            Err(DbQueueError::Configuration(_))
        ));
    }

    #[test]
    fn test_concurrent_submissions_execute_exactly_once() {
        let (engine, journal) = start(4, 1000);
        let engine = Arc::new(engine);
        let (tx, rx) = mpsc::channel();

        let mut producers = Vec::new();
        for p in 0..10u32 {
            let engine = Arc::clone(&engine);
            let tx = tx.clone();
            producers.push(thread::spawn(move || {
                for i in 0..50u32 {
                    engine.submit(record(p * 100 + i, &tx)).unwrap();
                }
            }));
        }
        for producer in producers {
            producer.join().unwrap();
        }

        let mut delivered = HashSet::new();
        for _ in 0..500 {
            let id = rx.recv_timeout(WAIT).unwrap();
            assert!(delivered.insert(id), "callback for {id} delivered twice");
        }
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        let executed = journal.executed.lock().clone();
        assert_eq!(executed.len(), 500);
        assert_eq!(executed.iter().collect::<HashSet<_>>().len(), 500);
        assert_eq!(engine.stats().executed, 500);
    }

    #[test]
    fn test_single_worker_is_fifo() {
        let (engine, journal) = start(1, 100);
        let (tx, rx) = mpsc::channel();
        for id in 0..20 {
            engine.submit(record(id, &tx)).unwrap();
        }
        for _ in 0..20 {
            rx.recv_timeout(WAIT).unwrap();
        }
        assert_eq!(*journal.executed.lock(), (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_execution_panic_does_not_stop_worker() {
        let (engine, _journal) = start(1, 10);
        let (tx, rx) = mpsc::channel();

        engine.submit(TestCommand::Panic).unwrap();
        engine.submit(record(7, &tx)).unwrap();

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), 7);
        let stats = engine.stats();
        assert_eq!(stats.execution_panics, 1);
        assert_eq!(stats.executed, 2);
    }

    #[test]
    fn test_callback_panic_does_not_stop_worker() {
        let (engine, _journal) = start(1, 10);
        let (tx, rx) = mpsc::channel();

        engine
            .submit(TestCommand::Record {
                id: 1,
                callback: Box::new(|_: Reply<u32>| panic!("callback exploded")),
            })
            .unwrap();
        engine.submit(record(2, &tx)).unwrap();

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), 2);
        assert_eq!(engine.stats().execution_panics, 0);
    }

    #[test]
    fn test_callbacks_run_on_executor_thread() {
        let executor = Arc::new(ThreadExecutor::spawn("test-executor").unwrap());
        let executor_thread = executor.thread_id();
        let journal = Arc::new(Journal::default());
        let engine: Engine<TestCommand> =
            Engine::start("engine-test", journal, 4, 1000, Some(executor)).unwrap();

        let (tx, rx) = mpsc::channel();
        for id in 0..100 {
            let tx = tx.clone();
            engine
                .submit(TestCommand::Record {
                    id,
                    callback: Box::new(move |_: Reply<u32>| {
                        tx.send(thread::current().id()).unwrap();
                    }),
                })
                .unwrap();
        }

        for _ in 0..100 {
            assert_eq!(rx.recv_timeout(WAIT).unwrap(), executor_thread);
        }
    }

    #[test]
    fn test_submit_with_spare_capacity_returns_immediately() {
        let (engine, _journal) = start(1, 8);
        let release = block_worker(&engine);

        let (tx, rx) = mpsc::channel();
        for id in 0..8 {
            engine.submit(record(id, &tx)).unwrap();
        }
        assert_eq!(engine.stats().queued, 8);

        release.send(()).unwrap();
        for _ in 0..8 {
            rx.recv_timeout(WAIT).unwrap();
        }
    }

    #[test]
    fn test_stop_with_queued_commands() {
        let (engine, journal) = start(1, 16);
        let release = block_worker(&engine);

        let (tx, _rx) = mpsc::channel();
        for id in 0..5 {
            engine.submit(record(id, &tx)).unwrap();
        }

        assert_eq!(engine.stop(), 5);
        assert!(engine.is_stopped());
        assert!(matches!(
            engine.submit(record(99, &tx)),
            Err(DbQueueError::Stopped("record"))
        ));

        release.send(()).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(journal.executed.lock().is_empty());
    }

    #[test]
    fn test_call_driver_converts_panic() {
        let result: DriverResult<u32> = call_driver(|| panic!("driver fell over"));
        assert_eq!(result, Err(DriverError::Panicked("driver fell over".to_string())));
        assert_eq!(call_driver(|| Ok::<_, DriverError>(3)), Ok(3));
    }
}
