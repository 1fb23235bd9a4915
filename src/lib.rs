//! dbqueue - asynchronous command queues over synchronous store drivers
//!
//! Callers submit operations against a key-value store or a document store
//! and return immediately. Each client owns:
//! - A bounded FIFO command queue with blocking backpressure
//! - A fixed pool of worker threads sharing one driver handle
//! - SUCCESS / MISS / FAIL classification of every driver result
//! - Exactly-once callback delivery, inline or through an `Executor`
//! - Batched key-value pipelines sent in one round trip

pub mod classify;
pub mod config;
pub mod console;
pub mod doc;
pub mod engine;
pub mod error;
pub mod executor;
pub mod kv;
pub mod logging;
pub mod pool;
pub mod queue;
pub mod reply;

pub use classify::{classify, Classification};
pub use config::{ClientOptions, Credentials, Endpoint};
pub use doc::{DocClient, DocDriver, Document, MemoryDocs};
pub use engine::{Command, Delivery, Engine, EngineStats};
pub use error::{DbQueueError, DriverError, DriverResult, Result};
pub use executor::{Executor, Job, ThreadExecutor, TokioExecutor};
pub use kv::{KvClient, KvDriver, MemoryKv, PipeResult, PipeValue, Pipeline, ScoredMember};
pub use pool::ConnectionPool;
pub use reply::{Callback, Reply};
