pub mod remote_storage;
pub mod service;
pub mod sizes;
pub mod types;

pub use remote_storage::{BunnyStorageClient, RemoteStorage, UploadBody};
pub use service::{Migrator, UploadThrottle};
pub use types::{CompletenessStatus, FileMigration, FixOutcome, MigrationVerification};
