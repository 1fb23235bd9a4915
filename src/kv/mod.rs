//! Key-value store backend

pub mod client;
pub mod command;
pub mod driver;
pub mod memory;

pub use client::KvClient;
pub use command::{KvCommand, PipelineFn};
pub use driver::{KvDriver, PipeOp, PipeResult, PipeValue, Pipeline, ScoredMember};
pub use memory::MemoryKv;
