//! Object storage backends.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::error::{Error, Result};

/// Metadata about a stored object, as returned by [`ObjectStore::head`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Object path (key).
    pub path: String,
    /// Object size in bytes.
    pub size: u64,
}

/// Object storage backend.
///
/// Paths are forward-slash-separated keys relative to the backend's root.
/// Objects are written whole and never mutated in place.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write an object, replacing any existing one at the path.
    async fn put(&self, path: &str, data: Bytes) -> Result<()>;

    /// Read an entire object. Returns [`Error::NotFound`] if absent.
    async fn get(&self, path: &str) -> Result<Bytes>;

    /// Object metadata without reading content. `None` if absent.
    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>>;
}

/// In-memory backend for tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: RwLock<HashMap<String, Bytes>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.objects.read().expect("poisoned").len()
    }

    /// Whether the store holds no objects.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn put(&self, path: &str, data: Bytes) -> Result<()> {
        self.objects
            .write()
            .expect("poisoned")
            .insert(path.to_string(), data);
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Bytes> {
        self.objects
            .read()
            .expect("poisoned")
            .get(path)
            .cloned()
            .ok_or_else(|| Error::NotFound(path.to_string()))
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        Ok(self
            .objects
            .read()
            .expect("poisoned")
            .get(path)
            .map(|data| ObjectMeta {
                path: path.to_string(),
                size: data.len() as u64,
            }))
    }
}

/// Local-filesystem backend.
///
/// Object keys map to files under a root directory. Writes go through a
/// temporary sibling and a rename so a crashed upload never leaves a
/// partial object that would pass the non-zero-size verification.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Create a backend rooted at `root`. The directory is created lazily
    /// on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        let escapes = relative.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
        if path.is_empty() || escapes {
            return Err(Error::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn put(&self, path: &str, data: Bytes) -> Result<()> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = target.with_extension("tmp");
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &target).await?;

        debug!("wrote {} bytes to {}", data.len(), target.display());
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Bytes> {
        let target = self.resolve(path)?;
        match tokio::fs::read(&target).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        let target = self.resolve(path)?;
        match tokio::fs::metadata(&target).await {
            Ok(meta) => Ok(Some(ObjectMeta {
                path: path.to_string(),
                size: meta.len(),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
