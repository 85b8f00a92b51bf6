//! Content-addressed blob store with two backends: a directory tree for
//! deployments and an in-memory map for tests. Keys look like
//! `raw-data-item/{id}` and `bundle-payload/{plan_id}`. Deleting a missing
//! key succeeds; the janitor depends on that.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[derive(Clone)]
pub enum ObjectStore {
    Fs { root: PathBuf },
    Mem(Arc<MemStore>),
}

#[derive(Default)]
pub struct MemStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    parts: Mutex<BTreeMap<String, BTreeMap<i64, Vec<u8>>>>,
}

impl ObjectStore {
    pub fn fs(root: impl Into<PathBuf>) -> Self {
        Self::Fs { root: root.into() }
    }

    pub fn mem() -> Self {
        Self::Mem(Arc::new(MemStore::default()))
    }

    pub async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        validate_key(key)?;
        match self {
            Self::Fs { root } => {
                let path = object_path(root, key);
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .with_context(|| format!("create parent dirs for {key}"))?;
                }
                // Write-then-rename so readers never observe a partial blob.
                let tmp = path.with_extension("tmp");
                let mut file = tokio::fs::File::create(&tmp)
                    .await
                    .with_context(|| format!("create {key}"))?;
                file.write_all(bytes)
                    .await
                    .with_context(|| format!("write {key}"))?;
                file.flush().await.with_context(|| format!("flush {key}"))?;
                tokio::fs::rename(&tmp, &path)
                    .await
                    .with_context(|| format!("rename {key}"))?;
                Ok(())
            }
            Self::Mem(mem) => {
                mem.objects
                    .lock()
                    .await
                    .insert(key.to_string(), bytes.to_vec());
                Ok(())
            }
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        validate_key(key)?;
        match self {
            Self::Fs { root } => match tokio::fs::read(object_path(root, key)).await {
                Ok(bytes) => Ok(Some(bytes)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e).with_context(|| format!("read {key}")),
            },
            Self::Mem(mem) => Ok(mem.objects.lock().await.get(key).cloned()),
        }
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        match self {
            Self::Fs { root } => Ok(tokio::fs::try_exists(object_path(root, key))
                .await
                .with_context(|| format!("stat {key}"))?),
            Self::Mem(mem) => Ok(mem.objects.lock().await.contains_key(key)),
        }
    }

    /// Missing keys are success: retries and replays of the janitor must not
    /// trip on already-deleted blobs.
    pub async fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        match self {
            Self::Fs { root } => match tokio::fs::remove_file(object_path(root, key)).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e).with_context(|| format!("delete {key}")),
            },
            Self::Mem(mem) => {
                mem.objects.lock().await.remove(key);
                Ok(())
            }
        }
    }

    /// Stages one chunk of a multipart upload at a byte offset.
    pub async fn put_part(&self, upload_id: &str, offset: i64, bytes: &[u8]) -> Result<()> {
        validate_key(upload_id)?;
        if offset < 0 {
            anyhow::bail!("negative multipart offset: {offset}");
        }
        match self {
            Self::Fs { root } => {
                let dir = parts_dir(root, upload_id);
                tokio::fs::create_dir_all(&dir)
                    .await
                    .with_context(|| format!("create multipart dir for {upload_id}"))?;
                let path = dir.join(format!("part-{offset:020}"));
                tokio::fs::write(&path, bytes)
                    .await
                    .with_context(|| format!("write part {offset} of {upload_id}"))?;
                Ok(())
            }
            Self::Mem(mem) => {
                mem.parts
                    .lock()
                    .await
                    .entry(upload_id.to_string())
                    .or_default()
                    .insert(offset, bytes.to_vec());
                Ok(())
            }
        }
    }

    /// Total bytes staged so far.
    pub async fn multipart_size(&self, upload_id: &str) -> Result<u64> {
        validate_key(upload_id)?;
        match self {
            Self::Fs { root } => {
                let dir = parts_dir(root, upload_id);
                let mut total = 0u64;
                let mut entries = match tokio::fs::read_dir(&dir).await {
                    Ok(entries) => entries,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
                    Err(e) => return Err(e).with_context(|| format!("read dir {upload_id}")),
                };
                while let Some(entry) = entries
                    .next_entry()
                    .await
                    .with_context(|| format!("list parts of {upload_id}"))?
                {
                    total += entry
                        .metadata()
                        .await
                        .with_context(|| format!("stat part of {upload_id}"))?
                        .len();
                }
                Ok(total)
            }
            Self::Mem(mem) => Ok(mem
                .parts
                .lock()
                .await
                .get(upload_id)
                .map(|parts| parts.values().map(|v| v.len() as u64).sum())
                .unwrap_or(0)),
        }
    }

    /// Assembles staged parts in offset order into the final object and
    /// drops the staging area. Returns the assembled size.
    pub async fn complete_multipart(&self, upload_id: &str, key: &str) -> Result<u64> {
        validate_key(upload_id)?;
        validate_key(key)?;
        match self {
            Self::Fs { root } => {
                let dir = parts_dir(root, upload_id);
                let mut names = Vec::new();
                let mut entries = tokio::fs::read_dir(&dir)
                    .await
                    .with_context(|| format!("read multipart dir for {upload_id}"))?;
                while let Some(entry) = entries
                    .next_entry()
                    .await
                    .with_context(|| format!("list parts of {upload_id}"))?
                {
                    names.push(entry.path());
                }
                names.sort();

                let mut assembled = Vec::new();
                for path in &names {
                    let part = tokio::fs::read(path)
                        .await
                        .with_context(|| format!("read part {path:?}"))?;
                    assembled.extend_from_slice(&part);
                }
                let total = assembled.len() as u64;
                self.put(key, &assembled).await?;
                tokio::fs::remove_dir_all(&dir)
                    .await
                    .with_context(|| format!("remove multipart dir for {upload_id}"))?;
                Ok(total)
            }
            Self::Mem(mem) => {
                let parts = mem
                    .parts
                    .lock()
                    .await
                    .remove(upload_id)
                    .unwrap_or_default();
                let mut assembled = Vec::new();
                for part in parts.values() {
                    assembled.extend_from_slice(part);
                }
                let total = assembled.len() as u64;
                mem.objects.lock().await.insert(key.to_string(), assembled);
                Ok(total)
            }
        }
    }

    pub async fn abort_multipart(&self, upload_id: &str) -> Result<()> {
        validate_key(upload_id)?;
        match self {
            Self::Fs { root } => match tokio::fs::remove_dir_all(parts_dir(root, upload_id)).await
            {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e).with_context(|| format!("abort multipart {upload_id}")),
            },
            Self::Mem(mem) => {
                mem.parts.lock().await.remove(upload_id);
                Ok(())
            }
        }
    }
}

fn object_path(root: &Path, key: &str) -> PathBuf {
    root.join("objects").join(key)
}

fn parts_dir(root: &Path, upload_id: &str) -> PathBuf {
    root.join("multipart").join(upload_id)
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.starts_with('/') || key.contains("..") {
        anyhow::bail!("invalid object key: {key:?}");
    }
    Ok(())
}

pub fn raw_data_item_key(data_item_id: &str) -> String {
    format!("raw-data-item/{data_item_id}")
}

pub fn bundle_payload_key(plan_id: &str) -> String {
    format!("bundle-payload/{plan_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mem_put_get_delete_roundtrip() {
        let store = ObjectStore::mem();
        let key = raw_data_item_key("abc");
        store.put(&key, b"bytes").await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), Some(b"bytes".to_vec()));
        assert!(store.exists(&key).await.unwrap());

        store.delete(&key).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), None);
        // Deleting again is still success.
        store.delete(&key).await.unwrap();
    }

    #[tokio::test]
    async fn mem_multipart_assembles_in_offset_order() {
        let store = ObjectStore::mem();
        store.put_part("up1", 10, b" world").await.unwrap();
        store.put_part("up1", 0, b"hello").await.unwrap();
        assert_eq!(store.multipart_size("up1").await.unwrap(), 11);

        let total = store.complete_multipart("up1", "final/key").await.unwrap();
        assert_eq!(total, 11);
        assert_eq!(
            store.get("final/key").await.unwrap(),
            Some(b"hello world".to_vec())
        );
        // Staging area is gone.
        assert_eq!(store.multipart_size("up1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn fs_backend_roundtrips_under_a_temp_root() {
        let root = std::env::temp_dir().join(format!("store-test-{}", std::process::id()));
        let store = ObjectStore::fs(&root);
        let key = raw_data_item_key("fs-item");
        store.put(&key, b"persisted").await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), Some(b"persisted".to_vec()));

        store.put_part("fs-up", 0, b"aa").await.unwrap();
        store.put_part("fs-up", 2, b"bb").await.unwrap();
        let total = store.complete_multipart("fs-up", "assembled/blob").await.unwrap();
        assert_eq!(total, 4);
        assert_eq!(
            store.get("assembled/blob").await.unwrap(),
            Some(b"aabb".to_vec())
        );

        store.delete(&key).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), None);
        let _ = tokio::fs::remove_dir_all(&root).await;
    }

    #[tokio::test]
    async fn traversal_keys_are_rejected() {
        let store = ObjectStore::mem();
        assert!(store.put("../etc/passwd", b"x").await.is_err());
        assert!(store.get("/absolute").await.is_err());
        assert!(store.delete("").await.is_err());
    }
}
