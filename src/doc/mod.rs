//! Document store backend

pub mod client;
pub mod command;
pub mod driver;
pub mod memory;

pub use client::DocClient;
pub use command::DocCommand;
pub use driver::{DocDriver, Document};
pub use memory::MemoryDocs;
