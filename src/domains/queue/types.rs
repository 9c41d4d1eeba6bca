//! Type definitions for the work queue domain.

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use crate::errors::{DomainError, ValidationError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    Optimization,
    Migration,
}

impl QueueName {
    pub const ALL: [QueueName; 2] = [QueueName::Optimization, QueueName::Migration];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Optimization => "optimization",
            QueueName::Migration => "migration",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueName {
    type Err = DomainError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "optimization" => Ok(QueueName::Optimization),
            "migration" => Ok(QueueName::Migration),
            _ => Err(DomainError::Validation(ValidationError::invalid_value(
                "queue_name",
                &format!("unknown queue '{}'", s),
            ))),
        }
    }
}

/// A queued path together with its failed-attempt counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueEntry {
    pub path: String,
    pub retry_count: u32,
}

/// Per-path split of a processed batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, String)>,
    /// Permanently ineligible; dropped from the queue without counting as a retry.
    pub ineligible: Vec<(String, String)>,
    pub messages: Vec<String>,
}

impl BatchReport {
    pub fn success_count(&self) -> usize {
        self.succeeded.len()
    }

    pub fn attempted(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    pub fn succeed(&mut self, path: &str, message: String) {
        log::info!("{}", message);
        self.succeeded.push(path.to_string());
        self.messages.push(message);
    }

    pub fn fail(&mut self, path: &str, reason: String) {
        log::warn!("{}: {}", path, reason);
        self.messages.push(format!("{}: {}", path, reason));
        self.failed.push((path.to_string(), reason));
    }

    pub fn skip_ineligible(&mut self, path: &str, reason: String) {
        log::debug!("Skipping {}: {}", path, reason);
        self.ineligible.push((path.to_string(), reason));
    }

    /// Paths that leave the queue after this batch.
    pub fn completed_paths(&self) -> Vec<String> {
        self.succeeded
            .iter()
            .cloned()
            .chain(self.ineligible.iter().map(|(path, _)| path.clone()))
            .collect()
    }
}

/// What a batch entry point reports. Never an error: failures are data.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BatchOutcome {
    /// Credentials are missing; retrying cannot help.
    NotConfigured { message: String },
    /// The whole batch failed (transport, malformed response). Every path stays queued.
    Failed { reason: String },
    Processed(BatchReport),
}

impl BatchOutcome {
    pub fn success_count(&self) -> Option<usize> {
        match self {
            BatchOutcome::Processed(report) => Some(report.success_count()),
            _ => None,
        }
    }
}

/// Anything that can consume a batch of queued paths.
#[async_trait]
pub trait BatchProcessor: Send + Sync {
    async fn process_batch(&self, paths: &[String]) -> BatchOutcome;
}

/// Eligibility check used while scanning the asset population.
#[async_trait]
pub trait EligibilityCheck: Send + Sync {
    async fn is_eligible(&self, path: &str) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_name_parse() {
        for name in QueueName::ALL {
            assert_eq!(name.as_str().parse::<QueueName>().unwrap(), name);
        }
        assert!("other".parse::<QueueName>().is_err());
    }

    #[test]
    fn test_completed_paths_include_ineligible() {
        let mut report = BatchReport::default();
        report.succeed("a", "ok".into());
        report.fail("b", "upload failed".into());
        report.skip_ineligible("c", "missing".into());
        assert_eq!(report.completed_paths(), vec!["a".to_string(), "c".to_string()]);
        assert_eq!(report.attempted(), 2);
        assert_eq!(BatchOutcome::Processed(report).success_count(), Some(1));
        assert_eq!(BatchOutcome::Failed { reason: "x".into() }.success_count(), None);
    }
}
