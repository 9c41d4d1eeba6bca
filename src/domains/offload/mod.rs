pub mod orchestrator;
pub mod services;
pub mod worker;

pub use orchestrator::{ConnectionCheck, ConnectionReport, OffloadOrchestrator, TickReport, TickStatus, TickTrigger};
pub use services::OffloadServices;
pub use worker::OffloadWorker;
