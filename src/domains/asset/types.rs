//! Type definitions for the asset domain.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use crate::domains::core::file_storage_service::{join_relative, parent_dir};
use crate::errors::{DomainError, ValidationError};

pub type AssetId = i64;

/// Processing-status fields stored as key/value flags on an asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssetFlag {
    Optimized,
    OptimizationDate,
    OptimizationStats,
    FileSize,
    OriginalPath,
    OldUrl,
    NewUrl,
    Migrated,
    BunnyUrl,
    MigrationDate,
    OriginalUrl,
    LocalDeleted,
    VersionHash,
    SizeUrls,
    /// Cached public URL; recomputed from the other flags when absent.
    PublicUrl,
}

impl AssetFlag {
    pub const ALL: [AssetFlag; 15] = [
        AssetFlag::Optimized,
        AssetFlag::OptimizationDate,
        AssetFlag::OptimizationStats,
        AssetFlag::FileSize,
        AssetFlag::OriginalPath,
        AssetFlag::OldUrl,
        AssetFlag::NewUrl,
        AssetFlag::Migrated,
        AssetFlag::BunnyUrl,
        AssetFlag::MigrationDate,
        AssetFlag::OriginalUrl,
        AssetFlag::LocalDeleted,
        AssetFlag::VersionHash,
        AssetFlag::SizeUrls,
        AssetFlag::PublicUrl,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            AssetFlag::Optimized => "optimized",
            AssetFlag::OptimizationDate => "optimization_date",
            AssetFlag::OptimizationStats => "optimization_stats",
            AssetFlag::FileSize => "file_size",
            AssetFlag::OriginalPath => "original_path",
            AssetFlag::OldUrl => "old_url",
            AssetFlag::NewUrl => "new_url",
            AssetFlag::Migrated => "migrated",
            AssetFlag::BunnyUrl => "bunny_url",
            AssetFlag::MigrationDate => "migration_date",
            AssetFlag::OriginalUrl => "original_url",
            AssetFlag::LocalDeleted => "local_deleted",
            AssetFlag::VersionHash => "version_hash",
            AssetFlag::SizeUrls => "size_urls",
            AssetFlag::PublicUrl => "public_url",
        }
    }
}

impl FromStr for AssetFlag {
    type Err = DomainError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AssetFlag::ALL
            .iter()
            .copied()
            .find(|flag| flag.key() == s)
            .ok_or_else(|| DomainError::Validation(ValidationError::custom(
                &format!("Invalid asset flag: {}", s)
            )))
    }
}

/// Serialized form of a boolean flag.
pub fn flag_bool(value: bool) -> String {
    if value { "1".to_string() } else { "0".to_string() }
}

fn parse_bool(value: Option<&String>) -> bool {
    matches!(value.map(|v| v.trim()), Some("1") | Some("true") | Some("yes"))
}

fn parse_date(value: Option<&String>) -> Option<DateTime<Utc>> {
    value
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|d| d.with_timezone(&Utc))
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.map(|v| v.trim()).filter(|v| !v.is_empty()).map(str::to_string)
}

/// Result of an optimization, kept for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationStats {
    pub original_format: Option<String>,
    pub target_format: Option<String>,
    pub original_size: u64,
    pub compressed_size: u64,
    pub compression_ratio: f64,
    pub optimized_quality: Option<u32>,
}

/// Old and new URL of one size variant after migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeUrl {
    pub original: String,
    pub remote: String,
}

/// A derived size of an asset. `file_name` is relative to the primary file's directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeVariant {
    pub name: String,
    pub file_name: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// Decoded view of an asset's flags.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssetFlags {
    pub optimized: bool,
    pub optimization_date: Option<DateTime<Utc>>,
    pub optimization_stats: Option<OptimizationStats>,
    pub file_size: Option<u64>,
    pub migrated: bool,
    pub bunny_url: Option<String>,
    pub migration_date: Option<DateTime<Utc>>,
    pub original_url: Option<String>,
    pub local_deleted: bool,
    pub version_hash: Option<String>,
    pub size_urls: BTreeMap<String, SizeUrl>,
    pub public_url: Option<String>,
}

impl AssetFlags {
    /// Builds the typed view from raw stored values. Malformed values read as absent.
    pub fn from_raw(raw: &HashMap<String, String>) -> Self {
        let get = |flag: AssetFlag| raw.get(flag.key());
        Self {
            optimized: parse_bool(get(AssetFlag::Optimized)),
            optimization_date: parse_date(get(AssetFlag::OptimizationDate)),
            optimization_stats: get(AssetFlag::OptimizationStats)
                .and_then(|v| serde_json::from_str(v).ok()),
            file_size: get(AssetFlag::FileSize).and_then(|v| v.trim().parse().ok()),
            migrated: parse_bool(get(AssetFlag::Migrated)),
            bunny_url: non_empty(get(AssetFlag::BunnyUrl)),
            migration_date: parse_date(get(AssetFlag::MigrationDate)),
            original_url: non_empty(get(AssetFlag::OriginalUrl)),
            local_deleted: parse_bool(get(AssetFlag::LocalDeleted)),
            version_hash: non_empty(get(AssetFlag::VersionHash)),
            size_urls: get(AssetFlag::SizeUrls)
                .and_then(|v| serde_json::from_str(v).ok())
                .unwrap_or_default(),
            public_url: non_empty(get(AssetFlag::PublicUrl)),
        }
    }
}

/// The logical record owning a media file.
#[derive(Debug, Clone, PartialEq)]
pub struct Asset {
    pub id: AssetId,
    /// Primary file, relative to the uploads root.
    pub file_path: String,
    pub mime_type: String,
    pub variants: Vec<SizeVariant>,
    pub flags: AssetFlags,
}

impl Asset {
    pub fn directory(&self) -> &str {
        parent_dir(&self.file_path)
    }

    /// (size name, relative path) for every recorded variant.
    pub fn variant_paths(&self) -> Vec<(String, String)> {
        let dir = self.directory();
        self.variants
            .iter()
            .map(|v| (v.name.clone(), join_relative(dir, &v.file_name)))
            .collect()
    }
}

/// Row returned when walking the asset population.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetSummary {
    pub id: AssetId,
    pub file_path: String,
    pub mime_type: String,
}

/// Why flags and the observed public URL disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inconsistency {
    /// Public URL is remote but the asset is not flagged as migrated.
    RemoteUrlWithoutFlag,
    /// Asset is flagged as migrated but the public URL is still local.
    FlagWithoutRemoteUrl,
}

/// Migration state derived from stored flags and the resolved public URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationStatus {
    NotMigrated,
    /// Uploaded and flagged, local copy not yet removed.
    Migrating,
    Migrated,
    Inconsistent(Inconsistency),
}

impl MigrationStatus {
    /// Maps flags plus the observed URL state to a status.
    pub fn classify(flags: &AssetFlags, url_is_remote: bool) -> Self {
        let flagged = flags.migrated && flags.bunny_url.is_some();
        match (url_is_remote, flagged, flags.migrated) {
            (true, true, _) if flags.local_deleted => MigrationStatus::Migrated,
            (true, true, _) => MigrationStatus::Migrating,
            (true, false, _) => MigrationStatus::Inconsistent(Inconsistency::RemoteUrlWithoutFlag),
            (false, _, true) => MigrationStatus::Inconsistent(Inconsistency::FlagWithoutRemoteUrl),
            (false, _, false) => MigrationStatus::NotMigrated,
        }
    }

    pub fn is_migrated(&self) -> bool {
        matches!(self, MigrationStatus::Migrating | MigrationStatus::Migrated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(pairs: &[(AssetFlag, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.key().to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_flags_from_raw() {
        let flags = AssetFlags::from_raw(&raw(&[
            (AssetFlag::Migrated, "1"),
            (AssetFlag::BunnyUrl, "https://zone.b-cdn.net/a.jpg"),
            (AssetFlag::FileSize, "2048"),
            (AssetFlag::SizeUrls, r#"{"thumbnail":{"original":"o","remote":"r"}}"#),
            (AssetFlag::OptimizationDate, "not a date"),
        ]));
        assert!(flags.migrated);
        assert_eq!(flags.bunny_url.as_deref(), Some("https://zone.b-cdn.net/a.jpg"));
        assert_eq!(flags.file_size, Some(2048));
        assert_eq!(flags.size_urls["thumbnail"].remote, "r");
        assert_eq!(flags.optimization_date, None);
        assert!(!flags.optimized);
    }

    #[test]
    fn test_empty_bunny_url_reads_as_absent() {
        let flags = AssetFlags::from_raw(&raw(&[(AssetFlag::Migrated, "1"), (AssetFlag::BunnyUrl, "")]));
        assert_eq!(flags.bunny_url, None);
    }

    #[test]
    fn test_flag_keys_roundtrip() {
        for flag in AssetFlag::ALL {
            assert_eq!(flag.key().parse::<AssetFlag>().unwrap(), flag);
        }
        assert!("nope".parse::<AssetFlag>().is_err());
    }

    #[test]
    fn test_migration_status_classification() {
        let mut flags = AssetFlags::default();
        assert_eq!(MigrationStatus::classify(&flags, false), MigrationStatus::NotMigrated);
        assert_eq!(
            MigrationStatus::classify(&flags, true),
            MigrationStatus::Inconsistent(Inconsistency::RemoteUrlWithoutFlag)
        );

        flags.migrated = true;
        assert_eq!(
            MigrationStatus::classify(&flags, false),
            MigrationStatus::Inconsistent(Inconsistency::FlagWithoutRemoteUrl)
        );

        flags.bunny_url = Some("https://zone.b-cdn.net/a.jpg".into());
        assert_eq!(MigrationStatus::classify(&flags, true), MigrationStatus::Migrating);
        flags.local_deleted = true;
        assert_eq!(MigrationStatus::classify(&flags, true), MigrationStatus::Migrated);
        assert!(MigrationStatus::Migrated.is_migrated());
    }

    #[test]
    fn test_variant_paths_join_directory() {
        let asset = Asset {
            id: 1,
            file_path: "2024/05/photo.webp".into(),
            mime_type: "image/webp".into(),
            variants: vec![SizeVariant {
                name: "medium".into(),
                file_name: "photo-300x300.webp".into(),
                width: Some(300),
                height: Some(300),
            }],
            flags: AssetFlags::default(),
        };
        assert_eq!(
            asset.variant_paths(),
            vec![("medium".to_string(), "2024/05/photo-300x300.webp".to_string())]
        );
    }
}
