pub mod asset;
pub mod core;
pub mod eligibility;
pub mod migration;
pub mod offload;
pub mod optimization;
pub mod queue;
