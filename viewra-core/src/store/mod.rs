//! Content-addressable segment store.
//!
//! Published encodes live under `<root>/<fp[0:2]>/<fp[2:4]>/<fp>/`, one
//! leaf per content fingerprint, each holding the manifest, segments and a
//! `metadata.json`. Publish is atomic: stage as a sibling directory on the
//! same filesystem, fsync, rename into place. Readers either see a full
//! leaf or nothing.

use chrono::Utc;
use dashmap::DashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::fingerprint;
use crate::models::{ContentRecord, EncodingProfile, MediaId};
use crate::{Error, Result};

const METADATA_FILE: &str = "metadata.json";

/// Directory-rooted content store.
pub struct ContentStore {
    root: PathBuf,
    retention: Duration,
    /// At-most-one concurrent publish per fingerprint, above the rename.
    publish_guards: DashMap<String, Arc<Mutex<()>>>,
    shutdown: CancellationToken,
}

impl ContentStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>, retention: Duration) -> Result<Arc<Self>> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| {
            Error::Fatal(format!("content store root {} not writable: {e}", root.display()))
        })?;
        Ok(Arc::new(Self {
            root,
            retention,
            publish_guards: DashMap::new(),
            shutdown: CancellationToken::new(),
        }))
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministic fingerprint for a transcode request; see
    /// [`fingerprint::generate_content_hash`].
    #[must_use]
    pub fn generate_content_hash(
        media_id: &MediaId,
        profile: &EncodingProfile,
        formats: &[String],
    ) -> String {
        fingerprint::generate_content_hash(media_id, profile, formats)
    }

    /// Leaf directory for a fingerprint. Rejects anything that is not a
    /// plain hex digest, which also rules out path traversal.
    pub fn leaf_path(&self, fp: &str) -> Result<PathBuf> {
        if fp.len() < 4 || !fp.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::Validation(format!("malformed fingerprint: {fp}")));
        }
        Ok(self.root.join(&fp[0..2]).join(&fp[2..4]).join(fp))
    }

    /// True iff a fully-published record exists.
    #[must_use]
    pub fn exists(&self, fp: &str) -> bool {
        self.leaf_path(fp)
            .map(|leaf| leaf.join(METADATA_FILE).is_file())
            .unwrap_or(false)
    }

    /// Metadata and absolute leaf path; refreshes `last_accessed_at`.
    pub fn get(&self, fp: &str) -> Result<(ContentRecord, PathBuf)> {
        let leaf = self.leaf_path(fp)?;
        let mut record = read_metadata(&leaf)
            .map_err(|_| Error::NotFound(format!("no content for fingerprint {fp}")))?;

        record.last_accessed_at = Utc::now();
        if let Err(e) = write_metadata(&leaf, &record) {
            // A reader losing the access-time touch is not a read failure.
            debug!(fingerprint = fp, error = %e, "failed to touch last_accessed_at");
        }
        Ok((record, leaf))
    }

    /// Atomic publish of `source_dir` under `fp`.
    ///
    /// First writer wins: when a record already exists (or appears during
    /// the rename race), the incoming directory is discarded and the
    /// existing record returned, so retries and duplicate sessions are
    /// safe.
    pub async fn store(
        &self,
        fp: &str,
        source_dir: &Path,
        media_id: &MediaId,
        manifests: Vec<String>,
    ) -> Result<ContentRecord> {
        let leaf = self.leaf_path(fp)?;
        let guard = self
            .publish_guards
            .entry(fp.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _locked = guard.lock().await;

        if self.exists(fp) {
            debug!(fingerprint = fp, "record already published, discarding staged output");
            let _ = fs::remove_dir_all(source_dir);
            return self.get(fp).map(|(record, _)| record);
        }

        let parent = leaf
            .parent()
            .ok_or_else(|| Error::Fatal("content leaf has no parent".to_string()))?;
        fs::create_dir_all(parent)?;

        // Stage as a sibling so the final step is a same-filesystem rename.
        let stage = parent.join(format!(".stage-{}", crate::models::generate_id()));
        fs::rename(source_dir, &stage).map_err(|e| {
            Error::Transient(format!(
                "failed to stage {} for publish: {e}",
                source_dir.display()
            ))
        })?;

        let now = Utc::now();
        let record = ContentRecord {
            fingerprint: fp.to_string(),
            media_id: media_id.clone(),
            manifests,
            size_bytes: dir_size(&stage),
            created_at: now,
            last_accessed_at: now,
            expires_at: now
                + chrono::Duration::from_std(self.retention)
                    .unwrap_or_else(|_| chrono::Duration::days(7)),
        };
        write_metadata(&stage, &record)?;
        fsync_dir(&stage);

        match fs::rename(&stage, &leaf) {
            Ok(()) => {
                info!(fingerprint = fp, size_bytes = record.size_bytes, "content published");
                Ok(record)
            }
            Err(_) if leaf.join(METADATA_FILE).is_file() => {
                // Lost the publish race; the existing record stands.
                let _ = fs::remove_dir_all(&stage);
                self.get(fp).map(|(record, _)| record)
            }
            Err(e) => {
                let _ = fs::remove_dir_all(&stage);
                Err(Error::Transient(format!("publish rename failed: {e}")))
            }
        }
    }

    /// Remove the leaf for a fingerprint. Idempotent. The leaf is renamed
    /// to a tombstone before removal so concurrent readers observe
    /// not-found rather than a torn directory.
    pub fn delete(&self, fp: &str) -> Result<()> {
        let leaf = self.leaf_path(fp)?;
        if !leaf.exists() {
            return Ok(());
        }
        let parent = leaf
            .parent()
            .ok_or_else(|| Error::Fatal("content leaf has no parent".to_string()))?;
        let tombstone = parent.join(format!(".tombstone-{}", crate::models::generate_id()));
        match fs::rename(&leaf, &tombstone) {
            Ok(()) => {
                fs::remove_dir_all(&tombstone)?;
                Ok(())
            }
            // Lost a delete race; nothing left to remove.
            Err(e) if !leaf.exists() => {
                debug!(fingerprint = fp, error = %e, "leaf vanished during delete");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// All records tagged with the given source media identity.
    pub fn list_by_media_id(&self, media_id: &MediaId) -> Result<Vec<ContentRecord>> {
        Ok(self
            .walk_records()
            .into_iter()
            .filter(|r| &r.media_id == media_id)
            .collect())
    }

    /// Records whose `expires_at` has passed.
    pub fn list_expired(&self) -> Result<Vec<ContentRecord>> {
        let now = Utc::now();
        Ok(self
            .walk_records()
            .into_iter()
            .filter(|r| r.is_expired(now))
            .collect())
    }

    /// Delete expired records. Returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let expired = self.list_expired().unwrap_or_default();
        let mut removed = 0;
        for record in expired {
            match self.delete(&record.fingerprint) {
                Ok(()) => {
                    info!(fingerprint = %record.fingerprint, "expired content removed");
                    removed += 1;
                }
                Err(e) => {
                    warn!(fingerprint = %record.fingerprint, error = %e, "failed to remove expired content");
                }
            }
        }
        removed
    }

    /// Spawn the background expiry sweeper. Stops on [`Self::shutdown`].
    pub fn spawn_expiry_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = store.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        store.cleanup_expired();
                    }
                }
            }
        })
    }

    /// Stop background sweeping.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn walk_records(&self) -> Vec<ContentRecord> {
        let mut records = Vec::new();
        let Ok(shards) = fs::read_dir(&self.root) else {
            return records;
        };
        for shard in shards.flatten() {
            if !is_visible_dir(&shard) {
                continue;
            }
            let Ok(subshards) = fs::read_dir(shard.path()) else {
                continue;
            };
            for subshard in subshards.flatten() {
                if !is_visible_dir(&subshard) {
                    continue;
                }
                let Ok(leaves) = fs::read_dir(subshard.path()) else {
                    continue;
                };
                for leaf in leaves.flatten() {
                    if !is_visible_dir(&leaf) {
                        continue;
                    }
                    if let Ok(record) = read_metadata(&leaf.path()) {
                        records.push(record);
                    }
                }
            }
        }
        records
    }
}

fn is_visible_dir(entry: &fs::DirEntry) -> bool {
    entry.path().is_dir()
        && !entry
            .file_name()
            .to_string_lossy()
            .starts_with('.')
}

fn read_metadata(leaf: &Path) -> Result<ContentRecord> {
    let raw = fs::read_to_string(leaf.join(METADATA_FILE))?;
    Ok(serde_json::from_str(&raw)?)
}

fn write_metadata(leaf: &Path, record: &ContentRecord) -> Result<()> {
    let tmp = leaf.join(format!("{METADATA_FILE}.tmp"));
    fs::write(&tmp, serde_json::to_vec_pretty(record)?)?;
    fs::rename(&tmp, leaf.join(METADATA_FILE))?;
    Ok(())
}

fn fsync_dir(dir: &Path) {
    if let Ok(handle) = fs::File::open(dir) {
        let _ = handle.sync_all();
    }
}

fn dir_size(dir: &Path) -> u64 {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| {
            let path = entry.path();
            if path.is_dir() {
                dir_size(&path)
            } else {
                entry.metadata().map(|m| m.len()).unwrap_or(0)
            }
        })
        .sum()
}
