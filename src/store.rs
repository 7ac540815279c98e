//! Blob store abstraction for input documents and analysis results.
//!
//! Objects are addressed by `(store, path)`. The filesystem implementation maps
//! that to `<root>/<store>/<path>` and keeps tags in a JSON sidecar.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::document::DocumentRef;
use crate::error::StoreError;

/// Address of a stored object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Locator {
    pub store: String,
    pub path: String,
}

impl Locator {
    pub fn new(store: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            store: store.into(),
            path: path.into(),
        }
    }

    /// File name without directories or extension.
    pub fn stem(&self) -> &str {
        let name = self.path.rsplit('/').next().unwrap_or(&self.path);
        match name.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem,
            _ => name,
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.store, self.path)
    }
}

#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, locator: &Locator) -> Result<Vec<u8>, StoreError>;
    async fn put(&self, locator: &Locator, data: &[u8], content_type: &str) -> Result<(), StoreError>;
    /// Add or replace one tag, keeping any others already on the object.
    async fn tag(&self, locator: &Locator, key: &str, value: &str) -> Result<(), StoreError>;
    /// Shareable location of an object for notifications.
    fn uri(&self, locator: &Locator) -> String;
}

/// Resolve a document to its bytes, fetching stored objects.
pub async fn load_document(doc: &DocumentRef, store: &dyn BlobStore) -> Result<Arc<[u8]>, StoreError> {
    match doc {
        DocumentRef::Bytes { data, .. } => Ok(Arc::clone(data)),
        DocumentRef::Stored {
            fetched: Some(data),
            ..
        } => Ok(Arc::clone(data)),
        DocumentRef::Stored { locator, .. } => {
            let data = store.get(locator).await?;
            debug!("Loaded {} ({} bytes)", locator, data.len());
            Ok(data.into())
        }
    }
}

/// Blob store rooted in a local directory.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TagSet {
    content_type: Option<String>,
    #[serde(default)]
    tags: BTreeMap<String, String>,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, locator: &Locator) -> Result<PathBuf, StoreError> {
        let store = Path::new(&locator.store);
        let path = Path::new(&locator.path);
        for part in [store, path] {
            let safe = !part.as_os_str().is_empty()
                && part.components().all(|c| matches!(c, Component::Normal(_)));
            if !safe {
                return Err(StoreError::InvalidLocator(locator.to_string()));
            }
        }
        Ok(self.root.join(store).join(path))
    }

    fn sidecar_path(object: &Path) -> PathBuf {
        let mut name = object.as_os_str().to_owned();
        name.push(".tags.json");
        PathBuf::from(name)
    }

    async fn read_tags(sidecar: &Path) -> Result<TagSet, StoreError> {
        match tokio::fs::read(sidecar).await {
            Ok(raw) => serde_json::from_slice(&raw)
                .map_err(|e| StoreError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(TagSet::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_tags(sidecar: &Path, tags: &TagSet) -> Result<(), StoreError> {
        let raw = serde_json::to_vec_pretty(tags)
            .map_err(|e| StoreError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
        tokio::fs::write(sidecar, raw).await?;
        Ok(())
    }

    /// Read back the tags of an object.
    #[cfg(test)]
    pub async fn tags(&self, locator: &Locator) -> Result<BTreeMap<String, String>, StoreError> {
        let object = self.object_path(locator)?;
        Ok(Self::read_tags(&Self::sidecar_path(&object)).await?.tags)
    }
}

#[async_trait::async_trait]
impl BlobStore for FsBlobStore {
    async fn get(&self, locator: &Locator) -> Result<Vec<u8>, StoreError> {
        let path = self.object_path(locator)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(locator.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, locator: &Locator, data: &[u8], content_type: &str) -> Result<(), StoreError> {
        let path = self.object_path(locator)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, data).await?;

        let sidecar = Self::sidecar_path(&path);
        let mut tags = Self::read_tags(&sidecar).await?;
        tags.content_type = Some(content_type.to_string());
        Self::write_tags(&sidecar, &tags).await?;

        info!("FsBlobStore: stored {} ({} bytes, {})", locator, data.len(), content_type);
        Ok(())
    }

    async fn tag(&self, locator: &Locator, key: &str, value: &str) -> Result<(), StoreError> {
        let path = self.object_path(locator)?;
        if !tokio::fs::try_exists(&path).await? {
            return Err(StoreError::NotFound(locator.to_string()));
        }

        let sidecar = Self::sidecar_path(&path);
        let mut tags = Self::read_tags(&sidecar).await?;
        tags.tags.insert(key.to_string(), value.to_string());
        Self::write_tags(&sidecar, &tags).await?;

        info!("FsBlobStore: tagged {} with {}={}", locator, key, value);
        Ok(())
    }

    fn uri(&self, locator: &Locator) -> String {
        match self.object_path(locator) {
            Ok(path) => format!("file://{}", path.display()),
            Err(_) => locator.to_string(),
        }
    }
}
