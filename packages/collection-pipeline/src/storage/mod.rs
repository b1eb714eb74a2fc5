pub mod memory;
pub mod postgres;

pub use memory::{MemoryCacheStore, MemoryDocumentStore, MemoryRelationalStore, MemoryVectorIndex};
pub use postgres::{PostgresDocumentStore, PostgresRelationalStore};
