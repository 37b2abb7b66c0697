use crate::error::ChatResult;
use anyhow::Result;
use bytes::Bytes;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::sync::{OwnedRwLockReadGuard, RwLock};
use url::Url;
use uuid::Uuid;
use walkdir::WalkDir;

/// Content-addressed store for uploaded audio clips.
#[derive(Clone, Debug)]
pub struct BlobStore {
    root: PathBuf,
    public_base: Url,
    // uploads hold it shared from save until their row is written; sweeps
    // hold it exclusively while deleting
    uploads: Arc<RwLock<()>>,
}

/// Metadata recorded for a stored blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobMeta {
    pub id: String,
    pub mime: String,
    pub size_bytes: i64,
}

impl BlobStore {
    /// `public_base` is the externally reachable origin of this server.
    pub fn new<P: Into<PathBuf>>(root: P, public_base: &str) -> Result<Self> {
        let mut base = public_base.to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        Ok(Self {
            root: root.into(),
            public_base: Url::parse(&base)?,
            uploads: Arc::new(RwLock::new(())),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Keep orphan sweeps out until the guard is dropped. Take it before
    /// `save` and hold it until the blob's metadata row is written.
    pub async fn hold(&self) -> OwnedRwLockReadGuard<()> {
        self.uploads.clone().read_owned().await
    }

    /// Save data and return its hash id. The blob is only visible under its
    /// final name once fully written. Saving content that is already stored
    /// refreshes its modification time.
    pub async fn save(&self, data: &Bytes) -> Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(data);
        let hash = format!("{:x}", hasher.finalize());
        let dir = self.root.join(&hash[..2]);
        fs::create_dir_all(&dir).await?;
        let path = dir.join(&hash);
        if fs::try_exists(&path).await.unwrap_or(false) && touch(path.clone()).await.is_ok() {
            return Ok(hash);
        }
        let tmp = dir.join(format!("{hash}.{}.part", Uuid::new_v4().simple()));
        if let Err(e) = fs::write(&tmp, data).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            // a concurrent save of the same content got there first
            if !fs::try_exists(&path).await.unwrap_or(false) {
                return Err(e.into());
            }
        }
        Ok(hash)
    }

    /// On-disk location of a blob, or None if `id` is not a valid hash id.
    pub fn path(&self, id: &str) -> Option<PathBuf> {
        if !is_blob_id(id) {
            return None;
        }
        Some(self.root.join(&id[..2]).join(id))
    }

    /// Public download URL for a blob.
    pub fn url_for(&self, id: &str) -> Result<String> {
        Ok(self.public_base.join(&format!("api/files/{id}"))?.to_string())
    }

    /// Remove files not named in `keep`. Files modified within `grace` are
    /// left alone since their metadata row may not be written yet, and so is
    /// any blob `is_live` reports as recorded at the moment of deletion.
    pub async fn cleanup_orphans<F>(
        &self,
        keep: &HashSet<String>,
        grace: Duration,
        is_live: F,
    ) -> Result<usize>
    where
        F: Fn(&str) -> bool + Send + 'static,
    {
        let root = self.root.clone();
        let keep = keep.clone();
        let _sweep = self.uploads.clone().write_owned().await;
        let removed = tokio::task::spawn_blocking(move || {
            let candidates = WalkDir::new(&root)
                .min_depth(2)
                .max_depth(2)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .filter(|e| {
                    let name = e.file_name().to_string_lossy();
                    !keep.contains(name.as_ref())
                })
                .map(|e| e.into_path())
                .collect::<Vec<_>>();
            let mut removed = 0;
            for path in candidates {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                if !older_than(&path, grace) || (is_blob_id(&name) && is_live(&name)) {
                    continue;
                }
                if std::fs::remove_file(&path).is_ok() {
                    removed += 1;
                }
            }
            removed
        })
        .await?;
        Ok(removed)
    }
}

async fn touch(path: PathBuf) -> Result<()> {
    tokio::task::spawn_blocking(move || {
        std::fs::File::options()
            .append(true)
            .open(&path)?
            .set_modified(SystemTime::now())
    })
    .await??;
    Ok(())
}

fn older_than(path: &Path, grace: Duration) -> bool {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| SystemTime::now().duration_since(t).ok())
        .map(|age| age >= grace)
        .unwrap_or(false)
}

fn is_blob_id(id: &str) -> bool {
    id.len() == 64 && id.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Record blob metadata; re-uploading identical content is a no-op.
pub fn record_blob(conn: &Connection, id: &str, mime: &str, size_bytes: i64, now: i64) -> ChatResult<()> {
    conn.execute(
        "INSERT OR IGNORE INTO files (id, mime, size_bytes, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![id, mime, size_bytes, now],
    )?;
    Ok(())
}

pub fn blob_meta(conn: &Connection, id: &str) -> ChatResult<Option<BlobMeta>> {
    let meta = conn
        .query_row(
            "SELECT id, mime, size_bytes FROM files WHERE id = ?1",
            [id],
            |row| {
                Ok(BlobMeta {
                    id: row.get(0)?,
                    mime: row.get(1)?,
                    size_bytes: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(meta)
}

/// Delete metadata rows created before `cutoff` that no message references.
/// Returns the ids removed.
pub fn prune_unreferenced(conn: &Connection, cutoff: i64) -> ChatResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "DELETE FROM files WHERE created_at < ?1 \
         AND NOT EXISTS (SELECT 1 FROM messages m WHERE m.audio_file_id = files.id) RETURNING id",
    )?;
    let ids = stmt
        .query_map([cutoff], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

pub fn all_blob_ids(conn: &Connection) -> ChatResult<HashSet<String>> {
    let mut stmt = conn.prepare("SELECT id FROM files")?;
    let ids = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<HashSet<_>, _>>()?;
    Ok(ids)
}
