//! Storage backends for the admission ports
//!
//! - [`MemoryStore`] keeps everything in process and is used by tests and embedders
//! - [`SqliteStore`] persists to a database file shared by every engine process

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
