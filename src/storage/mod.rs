//! Durable local state: the [`StateStore`] seam and its backends.

pub mod memory;
pub mod sql;
pub mod traits;

pub use memory::InMemoryStore;
pub use sql::SqlStore;
pub use traits::{StateStore, StorageError};
