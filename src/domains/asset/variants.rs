//! Recognition of derived size-variant file names on disk.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::domains::core::file_storage_service::{
    file_name, join_relative, parent_dir, FileStorageResult, FileStorageService,
};

static RESIZED_SUFFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d+)x(\d+)$").expect("static regex")
});

static EDITED_SUFFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^e(\d+)$").expect("static regex")
});

/// How a file name relates to its primary file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VariantKind {
    /// `name-WxH.ext`
    Resized { width: u32, height: u32 },
    /// `name-scaled.ext`
    Scaled,
    /// `name-rotated.ext`
    Rotated,
    /// `name-eN.ext`
    Edited(u64),
    /// `name-anything.ext`
    Suffixed(String),
    /// The unscaled original kept next to a `-scaled`/`-rotated` primary.
    Original,
}

fn split_extension(name: &str) -> Option<(&str, &str)> {
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        None
    } else {
        Some((stem, ext))
    }
}

/// Stems whose `-suffix` files count as variants of `stem`.
fn base_stems(stem: &str) -> Vec<&str> {
    let mut stems = vec![stem];
    for marker in ["-scaled", "-rotated"] {
        if let Some(base) = stem.strip_suffix(marker) {
            if !base.is_empty() {
                stems.push(base);
            }
        }
    }
    stems
}

fn classify_suffix(suffix: &str) -> VariantKind {
    if let Some(caps) = RESIZED_SUFFIX.captures(suffix) {
        let width = caps[1].parse().unwrap_or(0);
        let height = caps[2].parse().unwrap_or(0);
        return VariantKind::Resized { width, height };
    }
    if let Some(caps) = EDITED_SUFFIX.captures(suffix) {
        return VariantKind::Edited(caps[1].parse().unwrap_or(0));
    }
    match suffix {
        "scaled" => VariantKind::Scaled,
        "rotated" => VariantKind::Rotated,
        other => VariantKind::Suffixed(other.to_string()),
    }
}

/// Classifies `candidate` (a bare file name) as a variant of `primary` (a bare file name).
pub fn classify_variant(primary: &str, candidate: &str) -> Option<VariantKind> {
    if candidate == primary {
        return None;
    }
    let (stem, ext) = split_extension(primary)?;
    let (candidate_stem, candidate_ext) = split_extension(candidate)?;
    if !candidate_ext.eq_ignore_ascii_case(ext) {
        return None;
    }

    for base in base_stems(stem) {
        if base != stem && candidate_stem == base {
            return Some(VariantKind::Original);
        }
        if let Some(rest) = candidate_stem.strip_prefix(base) {
            if let Some(suffix) = rest.strip_prefix('-') {
                if !suffix.is_empty() {
                    return Some(classify_suffix(suffix));
                }
            }
        }
    }
    None
}

/// Relative paths of every file next to `primary_relative` that looks like one of its variants.
pub async fn discover_variants(
    storage: &dyn FileStorageService,
    primary_relative: &str,
) -> FileStorageResult<Vec<String>> {
    let dir = parent_dir(primary_relative);
    let primary = file_name(primary_relative);

    let variants = storage
        .list_directory(dir)
        .await?
        .into_iter()
        .filter(|candidate| classify_variant(primary, candidate).is_some())
        .map(|candidate| join_relative(dir, &candidate))
        .collect();

    Ok(variants)
}
