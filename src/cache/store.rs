//! Rendered page storage.
//!
//! [`PageStore`] is the seam the middleware talks to; [`FsPageStore`] keeps one
//! flat file per [`CacheKey`] in a pre-existing directory. Expiry is decided at
//! lookup time from the file's modification time, nothing is ever evicted.

use std::{
    io::{self, ErrorKind, Write},
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::{fs, task};

use super::keys::CacheKey;

const TEMP_PREFIX: &str = ".xscache-";
const TEMP_SUFFIX: &str = ".tmp";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cache entry not found")]
    NotFound,
    #[error("cache directory `{}` is not a directory", .0.display())]
    NotADirectory(PathBuf),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Result of looking an entry up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh { modified: SystemTime },
    Stale { modified: SystemTime },
    Absent,
}

impl Freshness {
    /// Classify an entry last modified at `modified`, observed at `now`.
    ///
    /// Modification times in the future count as zero age.
    pub fn classify(modified: SystemTime, now: SystemTime, expire: Duration) -> Self {
        let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
        if age < expire {
            Self::Fresh { modified }
        } else {
            Self::Stale { modified }
        }
    }

    pub fn is_fresh(&self) -> bool {
        matches!(self, Self::Fresh { .. })
    }

    pub fn modified(&self) -> Option<SystemTime> {
        match self {
            Self::Fresh { modified } | Self::Stale { modified } => Some(*modified),
            Self::Absent => None,
        }
    }
}

/// Storage backend for rendered pages.
#[async_trait]
pub trait PageStore: Send + Sync {
    /// Freshness of the entry as observed at `now`.
    async fn check_at(&self, key: &CacheKey, now: SystemTime) -> Result<Freshness, StoreError>;

    async fn check(&self, key: &CacheKey) -> Result<Freshness, StoreError> {
        self.check_at(key, SystemTime::now()).await
    }

    async fn read(&self, key: &CacheKey) -> Result<Bytes, StoreError>;

    /// Replace the entry. Readers see either the old or the new body, never a
    /// partial one.
    async fn write(&self, key: &CacheKey, body: Bytes) -> Result<(), StoreError>;
}

/// Filesystem-backed page store.
#[derive(Debug, Clone)]
pub struct FsPageStore {
    root: PathBuf,
    expire: Duration,
}

impl FsPageStore {
    /// Open a store over an existing directory. The directory is never created.
    pub fn open(root: impl Into<PathBuf>, expire: Duration) -> Result<Self, StoreError> {
        let root = root.into();
        let metadata = std::fs::metadata(&root)?;
        if !metadata.is_dir() {
            return Err(StoreError::NotADirectory(root));
        }
        Ok(Self { root, expire })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn expire(&self) -> Duration {
        self.expire
    }

    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.file_name())
    }
}

#[async_trait]
impl PageStore for FsPageStore {
    async fn check_at(&self, key: &CacheKey, now: SystemTime) -> Result<Freshness, StoreError> {
        match fs::metadata(self.path_for(key)).await {
            Ok(metadata) if metadata.is_file() => {
                let modified = metadata.modified()?;
                Ok(Freshness::classify(modified, now, self.expire))
            }
            Ok(_) => Ok(Freshness::Absent),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Freshness::Absent),
            Err(err) => Err(StoreError::Io(err)),
        }
    }

    async fn read(&self, key: &CacheKey) -> Result<Bytes, StoreError> {
        match fs::read(self.path_for(key)).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(StoreError::NotFound),
            Err(err) => Err(StoreError::Io(err)),
        }
    }

    async fn write(&self, key: &CacheKey, body: Bytes) -> Result<(), StoreError> {
        let root = self.root.clone();
        let target = self.path_for(key);
        task::spawn_blocking(move || write_atomic(&root, &target, &body))
            .await
            .map_err(io::Error::other)??;
        Ok(())
    }
}

fn write_atomic(root: &Path, target: &Path, body: &[u8]) -> io::Result<()> {
    let mut temp = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .suffix(TEMP_SUFFIX)
        .tempfile_in(root)?;
    temp.write_all(body)?;
    temp.flush()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        // Cached pages may be served by an external static server.
        temp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o644))?;
    }

    temp.persist(target).map_err(|err| err.error)?;
    Ok(())
}
