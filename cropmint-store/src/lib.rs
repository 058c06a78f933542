pub mod storage_traits;

#[cfg(feature = "sqlite")]
pub mod sqlite;

// Re-export the main types for convenience
pub use storage_traits::{NotificationSink, RecordStore};

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteRecordStore;
