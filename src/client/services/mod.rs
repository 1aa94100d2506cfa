pub mod memory_chain;
pub mod thrift_service;

pub use memory_chain::MemoryChain;
pub use thrift_service::{ActionOutcome, ActionRequest, Fulfiller, ThriftService};
