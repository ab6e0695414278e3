//! Storage backends implementing the engine's store contracts.

pub mod memory;

pub use memory::MemoryStore;
