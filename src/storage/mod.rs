pub mod error;
pub mod expiry;
pub mod persistent;
pub mod snapshot;
pub mod snapshot_manager;
pub mod store;
pub mod types;

pub use error::StorageError;
pub use persistent::PersistentStore;
pub use snapshot_manager::SnapshotManager;
pub use store::Store;
pub use types::{Entry, SetOptions};
