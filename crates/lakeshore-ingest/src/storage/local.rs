use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, instrument};

use super::{ObjectInfo, ObjectReader, ObjectStore};

/// Object store backed by a local directory. Keys map to relative paths.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create store root {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.split('/').any(|part| part == "..") {
            anyhow::bail!("Invalid object key: {:?}", key);
        }
        Ok(self.root.join(key))
    }
}

fn walk(root: &Path, dir: &Path, out: &mut Vec<ObjectInfo>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let meta = entry.metadata()?;
        if meta.is_dir() {
            walk(root, &path, out)?;
            continue;
        }
        // In-flight writes are not objects yet
        if path.extension().is_some_and(|ext| ext == "tmp") {
            continue;
        }
        let Ok(relative) = path.strip_prefix(root) else { continue };
        let key = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        out.push(ObjectInfo {
            key,
            size: meta.len() as i64,
            last_modified: meta.modified().ok().map(DateTime::<Utc>::from),
        });
    }
    Ok(())
}

#[async_trait]
impl ObjectStore for LocalStore {
    fn location(&self) -> String {
        format!("file://{}", self.root.display())
    }

    #[instrument(skip(self))]
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let root = self.root.clone();
        let mut objects = tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            walk(&root, &root, &mut out).map(|_| out)
        })
        .await
        .context("Listing task failed")?
        .with_context(|| format!("Failed to list {}", self.root.display()))?;

        objects.retain(|o| o.key.starts_with(prefix));
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        debug!("Found {} objects under {}", objects.len(), prefix);
        Ok(objects)
    }

    async fn open(&self, key: &str) -> Result<ObjectReader> {
        let path = self.path_of(key)?;
        let file = tokio::fs::File::open(&path)
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;
        Ok(Box::pin(file))
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_of(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(anyhow::Error::new(e).context(format!("Failed to read {}", path.display()))),
        }
    }

    async fn get_tail(&self, key: &str, len: usize) -> Result<Option<Vec<u8>>> {
        let path = self.path_of(key)?;
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(anyhow::Error::new(e).context(format!("Failed to open {}", path.display()))),
        };
        let size = file
            .metadata()
            .await
            .with_context(|| format!("Failed to stat {}", path.display()))?
            .len();
        let start = size.saturating_sub(len as u64);
        file.seek(SeekFrom::Start(start))
            .await
            .with_context(|| format!("Failed to seek {}", path.display()))?;
        let mut data = Vec::with_capacity((size - start) as usize);
        file.read_to_end(&mut data)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(Some(data))
    }

    #[instrument(skip(self, data, _content_type))]
    async fn put(&self, key: &str, data: Vec<u8>, _content_type: Option<&str>) -> Result<()> {
        let path = self.path_of(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        // Write then rename so readers never observe a partial object
        let tmp = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, &data)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to move {} into place", path.display()))?;

        debug!("Wrote {} bytes to {}", data.len(), path.display());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_of(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(anyhow::Error::new(e).context(format!("Failed to delete {}", path.display()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_list_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path()).unwrap();

        store.put("raw/b.csv", b"b".to_vec(), None).await.unwrap();
        store.put("raw/a.csv", b"aa".to_vec(), Some("text/csv")).await.unwrap();
        store.put("other/c.csv", b"c".to_vec(), None).await.unwrap();

        let listed = store.list("raw/").await.unwrap();
        let keys: Vec<_> = listed.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["raw/a.csv", "raw/b.csv"]);
        assert_eq!(listed[0].size, 2);
        assert!(listed[0].last_modified.is_some());

        assert_eq!(store.get("raw/a.csv").await.unwrap(), Some(b"aa".to_vec()));
        assert_eq!(store.get("raw/missing.csv").await.unwrap(), None);
        assert_eq!(store.get_tail("raw/a.csv", 1).await.unwrap(), Some(b"a".to_vec()));
        assert_eq!(store.get_tail("raw/a.csv", 10).await.unwrap(), Some(b"aa".to_vec()));
        assert_eq!(store.get_tail("raw/missing.csv", 1).await.unwrap(), None);

        store.delete("raw/a.csv").await.unwrap();
        store.delete("raw/a.csv").await.unwrap();
        assert_eq!(store.list("raw/").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_open_streams_content() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path()).unwrap();
        store.put("x/y.json", b"{\"a\":1}".to_vec(), None).await.unwrap();

        let mut reader = store.open("x/y.json").await.unwrap();
        let mut text = String::new();
        reader.read_to_string(&mut text).await.unwrap();
        assert_eq!(text, "{\"a\":1}");
    }

    #[tokio::test]
    async fn test_rejects_parent_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path()).unwrap();
        assert!(store.get("../etc/passwd").await.is_err());
    }
}
