//! Type definitions for the migration domain.

use serde::Serialize;
use std::fmt;

use crate::domains::asset::types::AssetId;

/// Result of auditing one asset's migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletenessStatus {
    NotMigrated,
    MissingBunnyUrl,
    /// Local files remain and the asset is not marked as locally deleted.
    IncompleteDeletion,
    /// Marked as locally deleted but files remain.
    DeletionFailed,
    Complete,
}

impl CompletenessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompletenessStatus::NotMigrated => "not_migrated",
            CompletenessStatus::MissingBunnyUrl => "missing_bunny_url",
            CompletenessStatus::IncompleteDeletion => "incomplete_deletion",
            CompletenessStatus::DeletionFailed => "deletion_failed",
            CompletenessStatus::Complete => "complete",
        }
    }

    /// Status from the flags and whatever is still on disk.
    pub fn classify(migrated: bool, has_remote_url: bool, local_deleted: bool, local_files_found: bool) -> Self {
        match (migrated, has_remote_url, local_files_found, local_deleted) {
            (false, _, _, _) => CompletenessStatus::NotMigrated,
            (true, false, _, _) => CompletenessStatus::MissingBunnyUrl,
            (true, true, true, false) => CompletenessStatus::IncompleteDeletion,
            (true, true, true, true) => CompletenessStatus::DeletionFailed,
            (true, true, false, _) => CompletenessStatus::Complete,
        }
    }
}

impl fmt::Display for CompletenessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationVerification {
    pub asset_id: AssetId,
    pub status: CompletenessStatus,
    pub is_migrated: bool,
    pub bunny_url: Option<String>,
    pub local_deleted: bool,
    /// Relative paths of the primary file and variants still on disk.
    pub local_files_found: Vec<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FixOutcome {
    AlreadyComplete,
    /// The repair ran; `new_status` is the audit afterwards.
    Fixed { new_status: CompletenessStatus },
    Error { message: String },
}

/// What happened to one file.
#[derive(Debug, Clone, PartialEq)]
pub enum FileMigration {
    Migrated {
        remote_url: String,
        variants_uploaded: usize,
        variants_failed: usize,
    },
    Ineligible(String),
    Failed(String),
}

impl FileMigration {
    pub fn is_success(&self) -> bool {
        matches!(self, FileMigration::Migrated { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completeness_classification() {
        use CompletenessStatus::*;
        assert_eq!(CompletenessStatus::classify(false, true, true, false), NotMigrated);
        assert_eq!(CompletenessStatus::classify(true, false, false, true), MissingBunnyUrl);
        assert_eq!(CompletenessStatus::classify(true, true, false, true), Complete);
        assert_eq!(CompletenessStatus::classify(true, true, true, false), IncompleteDeletion);
        assert_eq!(CompletenessStatus::classify(true, true, true, true), DeletionFailed);
    }

    #[test]
    fn test_fix_outcome_serializes_with_status_tag() {
        let value = serde_json::to_value(FixOutcome::Fixed { new_status: CompletenessStatus::Complete }).unwrap();
        assert_eq!(value["status"], "fixed");
        assert_eq!(value["new_status"], "complete");
    }
}
