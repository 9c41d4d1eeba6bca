//! Type definitions for the eligibility domain.

use serde::Serialize;
use thiserror::Error;

use crate::domains::asset::types::Asset;
use crate::domains::core::file_storage_service::FileInfo;

/// Funnel counts over the image asset population.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EligibilityStats {
    pub total_images: u64,
    /// Already optimized (or already migrated, for migration stats).
    pub already_processed: u64,
    pub locally_stored: u64,
    pub correct_type: u64,
    pub correct_size: u64,
    pub eligible_total: u64,
}

/// Why a file cannot be processed. Every reason is permanent for the file's current state.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Ineligible {
    #[error("file does not exist")]
    Missing,
    #[error("file is not readable")]
    Unreadable,
    #[error("path is outside the uploads directory")]
    NotLocal,
    #[error("no asset owns this file")]
    NoOwningAsset,
    #[error("unsupported mime type '{0}'")]
    UnsupportedType(String),
    #[error("already optimized")]
    AlreadyOptimized,
    #[error("already migrated")]
    AlreadyMigrated,
    #[error("already served from remote storage")]
    OnRemoteStorage,
    #[error("size {size_kb:.1} KB outside the optimization range")]
    SizeOutOfRange { size_kb: f64 },
    #[error("size {size_kb:.1} KB exceeds the migration limit")]
    TooLargeForMigration { size_kb: f64 },
}

/// A file that passed an eligibility check, with everything gathered on the way.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Path exactly as it was queued.
    pub path: String,
    pub relative_path: String,
    pub mime_type: String,
    pub info: FileInfo,
    pub asset: Asset,
}

pub type CheckOutcome = Result<Candidate, Ineligible>;
