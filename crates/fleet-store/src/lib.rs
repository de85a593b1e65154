pub mod memory;
pub mod sqlite;

pub use memory::MemoryDebounce;
pub use sqlite::SqliteStore;
