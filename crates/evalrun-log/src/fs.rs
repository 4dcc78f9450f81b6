//! Storage backends for log locations.
//!
//! A location is either a local path (optionally `file://`-prefixed) or a
//! `<scheme>://bucket/key` object-store URL. [`Storage`] maps a location to
//! the backend that owns it.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tempfile::NamedTempFile;
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{LogError, LogResult};

/// Directory entry kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Directory,
}

/// Metadata for one entry returned by [`LogFs::info`] / [`LogFs::ls`].
#[derive(Debug, Clone, PartialEq)]
pub struct FileInfo {
    /// Full location of the entry (same addressing scheme as the query).
    pub name: String,
    pub kind: FileKind,
    pub size: u64,
    pub mtime: Option<DateTime<Utc>>,
}

/// Byte-level access to a family of locations.
#[async_trait]
pub trait LogFs: Send + Sync {
    /// True for object stores where every write is a full round trip.
    fn is_remote(&self) -> bool;

    /// Local path backing `location`, if it has one.
    fn local_path(&self, location: &str) -> Option<PathBuf>;

    async fn read(&self, location: &str) -> LogResult<Vec<u8>>;

    /// Replace the object at `location` with `data`.
    async fn write(&self, location: &str, data: &[u8]) -> LogResult<()>;

    async fn exists(&self, location: &str) -> LogResult<bool>;

    async fn info(&self, location: &str) -> LogResult<FileInfo>;

    /// List files under `location`. Missing directories are `NotFound`.
    async fn ls(&self, location: &str, recursive: bool) -> LogResult<Vec<FileInfo>>;

    /// Whether `dir` accepts writes, creating it if needed.
    async fn is_writeable(&self, dir: &str) -> bool;

    async fn remove(&self, location: &str) -> LogResult<()>;
}

/// Join a file name onto a directory location.
pub fn join_location(dir: &str, name: &str) -> String {
    if dir.contains("://") {
        format!("{}/{}", dir.trim_end_matches('/'), name)
    } else {
        Path::new(dir).join(name).to_string_lossy().into_owned()
    }
}

/// Last path component of a location.
pub fn basename(location: &str) -> &str {
    location
        .trim_end_matches(['/', '\\'])
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(location)
}

fn scheme_of(location: &str) -> Option<&str> {
    location.split_once("://").map(|(scheme, _)| scheme)
}

fn system_time_to_utc(time: std::io::Result<SystemTime>) -> Option<DateTime<Utc>> {
    time.ok().map(DateTime::<Utc>::from)
}

fn not_found(location: &str, err: std::io::Error) -> LogError {
    if err.kind() == std::io::ErrorKind::NotFound {
        LogError::NotFound {
            location: location.to_string(),
        }
    } else {
        LogError::Io(err)
    }
}

/// Local filesystem backend.
///
/// Writes go to a temp file in the target directory and are renamed into
/// place, so a reader never observes a half-written log.
#[derive(Debug, Default, Clone)]
pub struct LocalFs;

impl LocalFs {
    pub fn new() -> Self {
        Self
    }

    fn path(location: &str) -> PathBuf {
        PathBuf::from(location.strip_prefix("file://").unwrap_or(location))
    }

    fn file_info(location: String, meta: &std::fs::Metadata) -> FileInfo {
        FileInfo {
            name: location,
            kind: if meta.is_dir() {
                FileKind::Directory
            } else {
                FileKind::File
            },
            size: meta.len(),
            mtime: system_time_to_utc(meta.modified()),
        }
    }
}

#[async_trait]
impl LogFs for LocalFs {
    fn is_remote(&self) -> bool {
        false
    }

    fn local_path(&self, location: &str) -> Option<PathBuf> {
        Some(Self::path(location))
    }

    async fn read(&self, location: &str) -> LogResult<Vec<u8>> {
        tokio::fs::read(Self::path(location))
            .await
            .map_err(|e| not_found(location, e))
    }

    async fn write(&self, location: &str, data: &[u8]) -> LogResult<()> {
        let path = Self::path(location);
        let data = data.to_vec();
        tokio::task::spawn_blocking(move || -> LogResult<()> {
            let dir = match path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
                _ => PathBuf::from("."),
            };
            std::fs::create_dir_all(&dir)?;
            let mut tmp = NamedTempFile::new_in(&dir)?;
            tmp.write_all(&data)?;
            tmp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        })
        .await??;
        debug!(location, "wrote log file");
        Ok(())
    }

    async fn exists(&self, location: &str) -> LogResult<bool> {
        Ok(tokio::fs::try_exists(Self::path(location)).await?)
    }

    async fn info(&self, location: &str) -> LogResult<FileInfo> {
        let meta = tokio::fs::metadata(Self::path(location))
            .await
            .map_err(|e| not_found(location, e))?;
        Ok(Self::file_info(location.to_string(), &meta))
    }

    async fn ls(&self, location: &str, recursive: bool) -> LogResult<Vec<FileInfo>> {
        let root = Self::path(location);
        let owned = location.to_string();
        tokio::task::spawn_blocking(move || -> LogResult<Vec<FileInfo>> {
            if !root.is_dir() {
                return Err(LogError::NotFound { location: owned });
            }
            let mut walker = WalkDir::new(&root).min_depth(1).sort_by_file_name();
            if !recursive {
                walker = walker.max_depth(1);
            }
            let mut entries = Vec::new();
            for entry in walker {
                let entry = entry.map_err(|e| {
                    LogError::Io(
                        e.into_io_error()
                            .unwrap_or_else(|| std::io::Error::other("directory walk failed")),
                    )
                })?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let meta = entry.metadata().map_err(|e| {
                    LogError::Io(
                        e.into_io_error()
                            .unwrap_or_else(|| std::io::Error::other("metadata unavailable")),
                    )
                })?;
                let name = entry.path().to_string_lossy().into_owned();
                entries.push(Self::file_info(name, &meta));
            }
            Ok(entries)
        })
        .await?
    }

    async fn is_writeable(&self, dir: &str) -> bool {
        let dir = Self::path(dir);
        tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&dir).is_ok() && NamedTempFile::new_in(&dir).is_ok()
        })
        .await
        .unwrap_or(false)
    }

    async fn remove(&self, location: &str) -> LogResult<()> {
        tokio::fs::remove_file(Self::path(location))
            .await
            .map_err(|e| not_found(location, e))
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    modified: DateTime<Utc>,
}

/// In-process object store addressed as `<scheme>://bucket/key`.
///
/// Objects are replaced whole on every write; there is no append.
#[derive(Debug)]
pub struct MemoryObjectStore {
    scheme: String,
    objects: Mutex<BTreeMap<String, StoredObject>>,
    read_only: bool,
}

impl MemoryObjectStore {
    pub fn new(scheme: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            objects: Mutex::new(BTreeMap::new()),
            read_only: false,
        }
    }

    /// Store that rejects every write.
    pub fn read_only(scheme: impl Into<String>) -> Self {
        Self {
            read_only: true,
            ..Self::new(scheme)
        }
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Override the modification time of an object.
    pub fn set_modified(&self, location: &str, modified: DateTime<Utc>) -> LogResult<()> {
        let mut objects = self.lock();
        let object = objects
            .get_mut(location)
            .ok_or_else(|| LogError::NotFound {
                location: location.to_string(),
            })?;
        object.modified = modified;
        Ok(())
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, StoredObject>> {
        self.objects.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn info_for(name: &str, object: &StoredObject) -> FileInfo {
        FileInfo {
            name: name.to_string(),
            kind: FileKind::File,
            size: object.data.len() as u64,
            mtime: Some(object.modified),
        }
    }
}

#[async_trait]
impl LogFs for MemoryObjectStore {
    fn is_remote(&self) -> bool {
        true
    }

    fn local_path(&self, _location: &str) -> Option<PathBuf> {
        None
    }

    async fn read(&self, location: &str) -> LogResult<Vec<u8>> {
        self.lock()
            .get(location)
            .map(|o| o.data.clone())
            .ok_or_else(|| LogError::NotFound {
                location: location.to_string(),
            })
    }

    async fn write(&self, location: &str, data: &[u8]) -> LogResult<()> {
        if self.read_only {
            return Err(LogError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("object store {} is read-only", self.scheme),
            )));
        }
        self.lock().insert(
            location.to_string(),
            StoredObject {
                data: data.to_vec(),
                modified: Utc::now(),
            },
        );
        Ok(())
    }

    async fn exists(&self, location: &str) -> LogResult<bool> {
        Ok(self.lock().contains_key(location))
    }

    async fn info(&self, location: &str) -> LogResult<FileInfo> {
        self.lock()
            .get(location)
            .map(|o| Self::info_for(location, o))
            .ok_or_else(|| LogError::NotFound {
                location: location.to_string(),
            })
    }

    async fn ls(&self, location: &str, recursive: bool) -> LogResult<Vec<FileInfo>> {
        let prefix = format!("{}/", location.trim_end_matches('/'));
        let entries: Vec<FileInfo> = self
            .lock()
            .iter()
            .filter(|(name, _)| {
                name.strip_prefix(&prefix)
                    .is_some_and(|rest| recursive || !rest.contains('/'))
            })
            .map(|(name, object)| Self::info_for(name, object))
            .collect();
        if entries.is_empty() {
            return Err(LogError::NotFound {
                location: location.to_string(),
            });
        }
        Ok(entries)
    }

    async fn is_writeable(&self, _dir: &str) -> bool {
        !self.read_only
    }

    async fn remove(&self, location: &str) -> LogResult<()> {
        self.lock()
            .remove(location)
            .map(|_| ())
            .ok_or_else(|| LogError::NotFound {
                location: location.to_string(),
            })
    }
}

/// Resolves locations to storage backends.
#[derive(Clone)]
pub struct Storage {
    local: Arc<LocalFs>,
    backends: HashMap<String, Arc<dyn LogFs>>,
}

impl Default for Storage {
    fn default() -> Self {
        Self::local()
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut schemes: Vec<&String> = self.backends.keys().collect();
        schemes.sort();
        f.debug_struct("Storage").field("schemes", &schemes).finish()
    }
}

impl Storage {
    /// Storage that only knows the local filesystem.
    pub fn local() -> Self {
        Self {
            local: Arc::new(LocalFs::new()),
            backends: HashMap::new(),
        }
    }

    /// Register a backend for `scheme://` locations.
    pub fn with_backend(mut self, scheme: impl Into<String>, fs: Arc<dyn LogFs>) -> Self {
        self.backends.insert(scheme.into(), fs);
        self
    }

    /// Backend owning `location`. Unknown schemes fall back to the local
    /// filesystem.
    pub fn resolve(&self, location: &str) -> Arc<dyn LogFs> {
        match scheme_of(location).and_then(|s| self.backends.get(s)) {
            Some(fs) => Arc::clone(fs),
            None => self.local.clone() as Arc<dyn LogFs>,
        }
    }
}
