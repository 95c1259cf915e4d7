//! Object storage collaborator.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::RwLock;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tracing::debug;

#[async_trait]
pub trait BlobStorage: Send + Sync {
    /// Stores an object. Overwriting an existing object is not an error.
    async fn put(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<()>;

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>>;

    /// Deletes the objects that exist; missing paths are ignored.
    async fn delete(&self, paths: &[String]) -> Result<()>;

    /// Copies an object into a local file and returns its size, or `None`
    /// when the object does not exist.
    async fn download_to(&self, path: &str, dest: &Path) -> Result<Option<u64>> {
        let Some(bytes) = self.get(path).await? else {
            return Ok(None);
        };
        let len = bytes.len() as u64;
        tokio::fs::write(dest, bytes)
            .await
            .with_context(|| format!("writing {}", dest.display()))?;
        Ok(Some(len))
    }

    /// Stores the contents of a local file and returns its size.
    async fn upload_file(&self, path: &str, source: &Path, content_type: &str) -> Result<u64> {
        let bytes = tokio::fs::read(source)
            .await
            .with_context(|| format!("reading {}", source.display()))?;
        let len = bytes.len() as u64;
        self.put(path, bytes, content_type).await?;
        Ok(len)
    }
}

/// Blobs as files under a root directory.
pub struct FileBlobStorage {
    root: PathBuf,
}

impl FileBlobStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FileBlobStorage { root: root.into() }
    }

    async fn prepare(&self, path: &str) -> Result<(PathBuf, PathBuf)> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut staging = target.clone().into_os_string();
        staging.push(".partial");
        Ok((target, PathBuf::from(staging)))
    }

    async fn promote(staging: &Path, target: &Path) -> Result<()> {
        tokio::fs::rename(staging, target)
            .await
            .with_context(|| format!("moving {} into place", target.display()))
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            bail!("invalid blob path {path:?}");
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStorage for FileBlobStorage {
    async fn put(&self, path: &str, bytes: Vec<u8>, _content_type: &str) -> Result<()> {
        // Write then rename so readers never observe a half-written object.
        let (target, staging) = self.prepare(path).await?;
        tokio::fs::write(&staging, bytes)
            .await
            .with_context(|| format!("writing {}", staging.display()))?;
        Self::promote(&staging, &target).await?;
        debug!(path, "Stored blob");
        Ok(())
    }

    async fn upload_file(&self, path: &str, source: &Path, _content_type: &str) -> Result<u64> {
        let (target, staging) = self.prepare(path).await?;
        let len = tokio::fs::copy(source, &staging)
            .await
            .with_context(|| format!("copying {}", source.display()))?;
        Self::promote(&staging, &target).await?;
        debug!(path, bytes = len, "Stored blob from file");
        Ok(len)
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let target = self.resolve(path)?;
        match tokio::fs::read(&target).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("reading {}", target.display())),
        }
    }

    async fn delete(&self, paths: &[String]) -> Result<()> {
        for path in paths {
            let target = self.resolve(path)?;
            match tokio::fs::remove_file(&target).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err).with_context(|| format!("deleting {}", target.display()))
                }
            }
        }
        Ok(())
    }

    async fn download_to(&self, path: &str, dest: &Path) -> Result<Option<u64>> {
        let source = self.resolve(path)?;
        match tokio::fs::copy(&source, dest).await {
            Ok(len) => Ok(Some(len)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("copying {}", source.display())),
        }
    }
}

#[derive(Default)]
pub struct MemoryBlobStorage {
    objects: RwLock<HashMap<String, (Vec<u8>, String)>>,
}

impl MemoryBlobStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.objects
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(path)
    }

    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .objects
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        paths.sort();
        paths
    }

    pub fn content_type(&self, path: &str) -> Option<String> {
        self.objects
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(path)
            .map(|(_, ct)| ct.clone())
    }
}

#[async_trait]
impl BlobStorage for MemoryBlobStorage {
    async fn put(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        self.objects
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.to_string(), (bytes, content_type.to_string()));
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .objects
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(path)
            .map(|(bytes, _)| bytes.clone()))
    }

    async fn delete(&self, paths: &[String]) -> Result<()> {
        let mut objects = self.objects.write().unwrap_or_else(|e| e.into_inner());
        for path in paths {
            objects.remove(path);
        }
        Ok(())
    }
}
