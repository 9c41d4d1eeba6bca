pub mod rules;
pub mod service;
pub mod types;

pub use service::EligibilityService;
pub use types::{Candidate, CheckOutcome, EligibilityStats, Ineligible};
