use async_trait::async_trait;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tokio::fs; // Use tokio::fs for async file operations

#[derive(Debug, Error)]
pub enum FileStorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("File not found: {0}")]
    NotFound(String),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Invalid path: {0}")]
    InvalidPath(String),
    #[error("Unknown storage error: {0}")]
    Other(String),
}

pub type FileStorageResult<T> = Result<T, FileStorageError>;

/// What the eligibility checks need to know about a file on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileInfo {
    pub exists: bool,
    pub readable: bool,
    pub size_bytes: u64,
}

impl FileInfo {
    pub fn size_kb(&self) -> f64 {
        self.size_bytes as f64 / 1024.0
    }
}

/// Service trait for the local uploads directory.
///
/// All paths are relative to the storage root and use `/` separators.
#[async_trait]
pub trait FileStorageService: Send + Sync {
    /// Root directory of the storage.
    fn base_path(&self) -> &Path;

    /// Get the full absolute path for a given relative path
    fn get_absolute_path(&self, relative_path: &str) -> PathBuf;

    /// Converts an absolute or relative path into a storage-relative one.
    /// Returns `None` for absolute paths outside the storage root.
    fn relative_path(&self, path: &str) -> Option<String>;

    /// Existence, readability and size. Never fails for a missing file.
    async fn file_info(&self, relative_path: &str) -> FileStorageResult<FileInfo>;

    async fn get_file_data(&self, relative_path: &str) -> FileStorageResult<Vec<u8>>;

    /// Get the size of a file on disk without reading it into memory.
    async fn get_file_size(&self, relative_path: &str) -> FileStorageResult<u64>;

    /// Writes through a temporary file in the target directory, then renames it into place.
    async fn write_file_atomic(&self, relative_path: &str, data: Vec<u8>) -> FileStorageResult<u64>;

    /// Delete a file. A file that is already gone counts as deleted.
    async fn delete_file(&self, relative_path: &str) -> FileStorageResult<()>;

    /// File names (not paths) of the regular files in a directory.
    async fn list_directory(&self, relative_dir: &str) -> FileStorageResult<Vec<String>>;
}

// --- Local File Storage Implementation ---

pub struct LocalFileStorageService {
    base_path: PathBuf,
}

impl LocalFileStorageService {
    /// Creates the service, making sure the root directory exists. The root is
    /// canonicalized so absolute paths built from it match stored queue entries.
    pub fn new(base_path: impl Into<PathBuf>) -> io::Result<Self> {
        let base_path = base_path.into();
        std::fs::create_dir_all(&base_path)?;
        let base_path = std::fs::canonicalize(&base_path)?;
        Ok(Self { base_path })
    }

    fn checked_path(&self, relative_path: &str) -> FileStorageResult<PathBuf> {
        let absolute_path = self.get_absolute_path(relative_path);
        if absolute_path == self.base_path || !absolute_path.starts_with(&self.base_path) {
            return Err(FileStorageError::InvalidPath(relative_path.to_string()));
        }
        Ok(absolute_path)
    }
}

/// Joins the normal components of a path with `/`, dropping `.`/`..`/roots.
fn clean_relative(path: &Path) -> String {
    path.components()
        .filter_map(|component| match component {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Cleaned form of a relative path, without touching the filesystem.
pub fn lexical_relative(path: &str) -> Option<String> {
    let candidate = Path::new(path);
    if candidate.is_absolute() {
        return None;
    }
    let relative = clean_relative(candidate);
    if relative.is_empty() { None } else { Some(relative) }
}

#[async_trait]
impl FileStorageService for LocalFileStorageService {
    fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn get_absolute_path(&self, relative_path: &str) -> PathBuf {
        // Only normal components are kept, so ".." can never escape the root.
        let mut abs_path = self.base_path.clone();
        for component in Path::new(relative_path).components() {
            if let Component::Normal(part) = component {
                if part.to_str().map_or(false, |s| !s.is_empty()) {
                    abs_path.push(part);
                }
            }
        }
        abs_path
    }

    fn relative_path(&self, path: &str) -> Option<String> {
        let candidate = Path::new(path);
        if candidate.is_absolute() {
            let stripped = candidate.strip_prefix(&self.base_path).ok()?;
            let relative = clean_relative(stripped);
            return if relative.is_empty() { None } else { Some(relative) };
        }
        // A relative path only counts when it names a file under the root.
        let relative = lexical_relative(path)?;
        if self.base_path.join(&relative).is_file() {
            Some(relative)
        } else {
            None
        }
    }

    async fn file_info(&self, relative_path: &str) -> FileStorageResult<FileInfo> {
        let absolute_path = self.checked_path(relative_path)?;

        let meta = match fs::metadata(&absolute_path).await {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => return Ok(FileInfo::default()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(FileInfo::default()),
            Err(e) => return Err(FileStorageError::Io(e)),
        };

        let readable = fs::File::open(&absolute_path).await.is_ok();
        Ok(FileInfo {
            exists: true,
            readable,
            size_bytes: meta.len(),
        })
    }

    async fn get_file_data(&self, relative_path: &str) -> FileStorageResult<Vec<u8>> {
        let absolute_path = self.checked_path(relative_path)?;

        match fs::read(&absolute_path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(FileStorageError::NotFound(relative_path.to_string()))
            }
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                Err(FileStorageError::PermissionDenied(relative_path.to_string()))
            }
            Err(e) => Err(FileStorageError::Io(e)),
        }
    }

    async fn get_file_size(&self, relative_path: &str) -> FileStorageResult<u64> {
        let absolute_path = self.checked_path(relative_path)?;

        match fs::metadata(&absolute_path).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(FileStorageError::NotFound(relative_path.to_string())),
            Err(e) => Err(FileStorageError::Io(e)),
        }
    }

    async fn write_file_atomic(&self, relative_path: &str, data: Vec<u8>) -> FileStorageResult<u64> {
        let absolute_path = self.checked_path(relative_path)?;
        let parent_dir = absolute_path
            .parent()
            .ok_or_else(|| FileStorageError::InvalidPath(relative_path.to_string()))?
            .to_path_buf();

        fs::create_dir_all(&parent_dir).await?;

        let size = data.len() as u64;
        tokio::task::spawn_blocking(move || -> FileStorageResult<()> {
            let mut temp = tempfile::NamedTempFile::new_in(&parent_dir)?;
            temp.write_all(&data)?;
            temp.flush()?;
            temp.persist(&absolute_path).map_err(|e| FileStorageError::Io(e.error))?;
            Ok(())
        })
        .await
        .map_err(|e| FileStorageError::Other(format!("Write task failed: {}", e)))??;

        Ok(size)
    }

    async fn delete_file(&self, relative_path: &str) -> FileStorageResult<()> {
        let absolute_path = self.checked_path(relative_path)?;

        match fs::remove_file(&absolute_path).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FileStorageError::Io(e)),
        }
    }

    async fn list_directory(&self, relative_dir: &str) -> FileStorageResult<Vec<String>> {
        let absolute_dir = self.get_absolute_path(relative_dir);
        if !absolute_dir.starts_with(&self.base_path) {
            return Err(FileStorageError::PermissionDenied("Attempt to list outside base path".to_string()));
        }

        let mut entries = match fs::read_dir(&absolute_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(FileStorageError::Io(e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Directory part of a relative path ("" for files at the root).
pub fn parent_dir(relative_path: &str) -> &str {
    relative_path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}

/// File name part of a relative path.
pub fn file_name(relative_path: &str) -> &str {
    relative_path.rsplit_once('/').map(|(_, name)| name).unwrap_or(relative_path)
}

pub fn join_relative(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir.trim_end_matches('/'), name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn storage() -> (TempDir, LocalFileStorageService) {
        let dir = TempDir::new().unwrap();
        let service = LocalFileStorageService::new(dir.path()).unwrap();
        (dir, service)
    }

    #[test]
    fn test_absolute_path_cannot_escape_root() {
        let (_dir, service) = storage();
        let path = service.get_absolute_path("../../etc/passwd");
        assert!(path.starts_with(service.base_path()));
        assert!(path.ends_with("etc/passwd"));
    }

    #[tokio::test]
    async fn test_relative_path_strips_root() {
        let (_dir, service) = storage();
        let absolute = service.get_absolute_path("2024/05/photo.jpg");
        assert_eq!(
            service.relative_path(absolute.to_str().unwrap()).as_deref(),
            Some("2024/05/photo.jpg")
        );
        assert_eq!(service.relative_path("/somewhere/else/photo.jpg"), None);

        // Relative input must name an existing file under the root.
        assert_eq!(service.relative_path("2024/05/photo.jpg"), None);
        service.write_file_atomic("2024/05/photo.jpg", vec![1u8; 8]).await.unwrap();
        assert_eq!(service.relative_path("2024/05/photo.jpg").as_deref(), Some("2024/05/photo.jpg"));
        assert_eq!(service.relative_path("uploads/2024/05/photo.jpg"), None);
    }

    #[test]
    fn test_relative_root_is_resolved() {
        let dir = tempfile::Builder::new().prefix("uploads-").tempdir_in(".").unwrap();
        let name = dir.path().file_name().unwrap().to_str().unwrap().to_string();
        let service = LocalFileStorageService::new(format!("./{}", name)).unwrap();

        assert!(service.base_path().is_absolute());
        let absolute = service.get_absolute_path("2024/05/a.jpg");
        assert!(absolute.is_absolute());
        assert_eq!(
            service.relative_path(absolute.to_str().unwrap()).as_deref(),
            Some("2024/05/a.jpg")
        );
    }

    #[test]
    fn test_lexical_relative() {
        assert_eq!(lexical_relative("./2024/05/a.jpg").as_deref(), Some("2024/05/a.jpg"));
        assert_eq!(lexical_relative("/abs/a.jpg"), None);
        assert_eq!(lexical_relative("."), None);
    }

    #[tokio::test]
    async fn test_write_info_list_and_delete() {
        let (_dir, service) = storage();

        let missing = service.file_info("2024/05/none.jpg").await.unwrap();
        assert!(!missing.exists);

        let written = service.write_file_atomic("2024/05/a.jpg", vec![1u8; 2048]).await.unwrap();
        assert_eq!(written, 2048);

        let info = service.file_info("2024/05/a.jpg").await.unwrap();
        assert!(info.exists && info.readable);
        assert_eq!(info.size_kb(), 2.0);

        let names = service.list_directory("2024/05").await.unwrap();
        assert_eq!(names, vec!["a.jpg".to_string()]);

        service.delete_file("2024/05/a.jpg").await.unwrap();
        service.delete_file("2024/05/a.jpg").await.unwrap();
        assert!(!service.file_info("2024/05/a.jpg").await.unwrap().exists);
    }

    #[test]
    fn test_path_helpers() {
        assert_eq!(parent_dir("2024/05/a.jpg"), "2024/05");
        assert_eq!(parent_dir("a.jpg"), "");
        assert_eq!(file_name("2024/05/a.jpg"), "a.jpg");
        assert_eq!(join_relative("", "a.jpg"), "a.jpg");
        assert_eq!(join_relative("2024/05", "a.jpg"), "2024/05/a.jpg");
    }
}
