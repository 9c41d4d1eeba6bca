pub mod repository;
pub mod scanner;
pub mod service;
pub mod types;

pub use repository::{QueueRepository, SqliteQueueRepository};
pub use scanner::QueueScanner;
pub use service::{ProcessOutcome, WorkQueue};
pub use types::{BatchOutcome, BatchProcessor, BatchReport, EligibilityCheck, QueueEntry, QueueName};
