//! Persistence backends for the serialized flow document.

pub mod memory;
pub mod store;

pub use memory::MemoryStore;
pub use store::SqliteStore;
