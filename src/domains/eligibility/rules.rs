//! Pure eligibility rules.

use crate::config::OPTIMIZATION_CEILING_KB;
use crate::domains::asset::types::{Inconsistency, MigrationStatus};
use crate::domains::core::file_storage_service::FileInfo;
use crate::domains::core::media_types::ImageFormat;
use super::types::Ineligible;

/// Optimized at any size.
pub const OPTIMIZE_ALWAYS: [ImageFormat; 5] = [
    ImageFormat::Jpeg,
    ImageFormat::Png,
    ImageFormat::Heic,
    ImageFormat::Heif,
    ImageFormat::Tiff,
];

/// Already efficient; optimized only when unusually large.
pub const OPTIMIZE_WHEN_LARGE: [ImageFormat; 2] = [ImageFormat::Webp, ImageFormat::Avif];

pub const MIGRATION_FORMATS: [ImageFormat; 8] = [
    ImageFormat::Avif,
    ImageFormat::Webp,
    ImageFormat::Svg,
    ImageFormat::Jpeg,
    ImageFormat::Png,
    ImageFormat::Heic,
    ImageFormat::Heif,
    ImageFormat::Tiff,
];

pub fn optimization_type_ok(format: ImageFormat) -> bool {
    OPTIMIZE_ALWAYS.contains(&format) || OPTIMIZE_WHEN_LARGE.contains(&format)
}

pub fn optimization_size_ok(format: ImageFormat, size_kb: f64, max_kb: u64) -> bool {
    if OPTIMIZE_ALWAYS.contains(&format) {
        return true;
    }
    OPTIMIZE_WHEN_LARGE.contains(&format)
        && size_kb > max_kb as f64
        && size_kb < OPTIMIZATION_CEILING_KB as f64
}

pub fn migration_type_ok(format: ImageFormat) -> bool {
    MIGRATION_FORMATS.contains(&format)
}

pub fn migration_size_ok(size_kb: f64, max_kb: u64) -> bool {
    size_kb <= max_kb as f64
}

fn file_present(info: &FileInfo) -> Result<(), Ineligible> {
    if !info.exists {
        return Err(Ineligible::Missing);
    }
    if !info.readable {
        return Err(Ineligible::Unreadable);
    }
    Ok(())
}

pub fn check_optimization(
    info: &FileInfo,
    mime_type: &str,
    optimized: bool,
    on_remote: bool,
    max_kb: u64,
) -> Result<(), Ineligible> {
    file_present(info)?;
    if optimized {
        return Err(Ineligible::AlreadyOptimized);
    }
    if on_remote {
        return Err(Ineligible::OnRemoteStorage);
    }
    let format = ImageFormat::from_mime(mime_type)
        .filter(|f| optimization_type_ok(*f))
        .ok_or_else(|| Ineligible::UnsupportedType(mime_type.to_string()))?;
    if !optimization_size_ok(format, info.size_kb(), max_kb) {
        return Err(Ineligible::SizeOutOfRange { size_kb: info.size_kb() });
    }
    Ok(())
}

/// `status` must already be reconciled; a remote URL without the flag still counts as migrated.
pub fn check_migration(
    info: &FileInfo,
    mime_type: &str,
    status: MigrationStatus,
    max_kb: u64,
) -> Result<(), Ineligible> {
    file_present(info)?;
    match status {
        MigrationStatus::Migrating
        | MigrationStatus::Migrated
        | MigrationStatus::Inconsistent(Inconsistency::RemoteUrlWithoutFlag) => {
            return Err(Ineligible::AlreadyMigrated);
        }
        MigrationStatus::NotMigrated
        | MigrationStatus::Inconsistent(Inconsistency::FlagWithoutRemoteUrl) => {}
    }
    if !ImageFormat::from_mime(mime_type).map_or(false, migration_type_ok) {
        return Err(Ineligible::UnsupportedType(mime_type.to_string()));
    }
    if !migration_size_ok(info.size_kb(), max_kb) {
        return Err(Ineligible::TooLargeForMigration { size_kb: info.size_kb() });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(size_kb: u64) -> FileInfo {
        FileInfo { exists: true, readable: true, size_bytes: size_kb * 1024 }
    }

    #[test]
    fn test_always_formats_ignore_size() {
        for mime in ["image/jpeg", "image/jpg", "image/png", "image/heic", "image/heif", "image/tiff"] {
            for size in [1, 150, 9_000, 50_000] {
                assert!(check_optimization(&file(size), mime, false, false, 150).is_ok(), "{} {}", mime, size);
            }
        }
    }

    #[test]
    fn test_webp_avif_optimization_and_migration_are_exclusive() {
        for mime in ["image/webp", "image/avif"] {
            for max_kb in [50u64, 150, 500] {
                for size in [1u64, 49, 50, 51, 149, 150, 151, 499, 500, 501, 10_239, 10_240, 20_000] {
                    let info = file(size);
                    let optimize = check_optimization(&info, mime, false, false, max_kb).is_ok();
                    let migrate = check_migration(&info, mime, MigrationStatus::NotMigrated, max_kb).is_ok();
                    assert_eq!(optimize, size > max_kb && size < 10_240, "{} {} {}", mime, max_kb, size);
                    assert_eq!(migrate, size <= max_kb, "{} {} {}", mime, max_kb, size);
                    assert!(!(optimize && migrate));
                }
            }
        }
    }

    #[test]
    fn test_optimization_rejections() {
        let info = file(10);
        assert_eq!(check_optimization(&info, "image/png", true, false, 150), Err(Ineligible::AlreadyOptimized));
        assert_eq!(check_optimization(&info, "image/png", false, true, 150), Err(Ineligible::OnRemoteStorage));
        assert!(matches!(
            check_optimization(&info, "image/gif", false, false, 150),
            Err(Ineligible::UnsupportedType(_))
        ));
        let missing = FileInfo::default();
        assert_eq!(check_optimization(&missing, "image/png", false, false, 150), Err(Ineligible::Missing));
        let locked = FileInfo { exists: true, readable: false, size_bytes: 10 };
        assert_eq!(check_optimization(&locked, "image/png", false, false, 150), Err(Ineligible::Unreadable));
    }

    #[test]
    fn test_migration_respects_status() {
        let info = file(10);
        assert!(check_migration(&info, "image/svg+xml", MigrationStatus::NotMigrated, 150).is_ok());
        assert_eq!(
            check_migration(&info, "image/png", MigrationStatus::Migrated, 150),
            Err(Ineligible::AlreadyMigrated)
        );
        assert_eq!(
            check_migration(&info, "image/png", MigrationStatus::Inconsistent(Inconsistency::RemoteUrlWithoutFlag), 150),
            Err(Ineligible::AlreadyMigrated)
        );
        assert!(check_migration(
            &info,
            "image/png",
            MigrationStatus::Inconsistent(Inconsistency::FlagWithoutRemoteUrl),
            150
        )
        .is_ok());
        assert!(matches!(
            check_migration(&info, "image/gif", MigrationStatus::NotMigrated, 150),
            Err(Ineligible::UnsupportedType(_))
        ));
    }
}
