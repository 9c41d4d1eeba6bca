pub mod cache;
pub mod file_storage_service;
pub mod media_types;

pub use cache::{LookupCache, MokaLookupCache, NoopCache};
pub use file_storage_service::{FileStorageError, FileStorageResult, FileStorageService, LocalFileStorageService};
pub use media_types::ImageFormat;
