pub mod client;
pub mod service;
pub mod types;
pub mod validation;

pub use client::{HttpOptimizationApi, OptimizationApi};
pub use service::Optimizer;
pub use types::{AccountStatus, OptimizeResult};
