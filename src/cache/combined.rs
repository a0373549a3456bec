//! The combined local+remote cache (component C6): the single object the
//! protocol front-end talks to. Startup reconciles the local index against
//! one remote bundle and eagerly prefetches whatever that bundle has that
//! the local disk doesn't; every GET afterward is a pure local lookup.
//! CLOSE persists the local index and, if anything changed, commits a
//! fresh remote bundle.

use crate::cache::index::{now_nanos, now_timestamp, Index};
use crate::cache::local::{self, LocalStore, LocalStoreError};
use crate::model::{ActionId, IndexEntry, OutputId};
use crate::remote::provider::{cache_keys, version_tag, DownloadClient, ProviderError, RemoteProvider};
use crate::remote::transfer::{Downloader, TransferError, Uploader};
use crate::remote::{BundleHeader, DEFAULT_DOMAIN_TAG};
use crate::util::coalesce::FirstSuccess;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("local store error: {0}")]
    Local(#[from] LocalStoreError),
    #[error("remote provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("remote transfer error: {0}")]
    Transfer(#[from] TransferError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetOutcome {
    Hit {
        output_id: OutputId,
        disk_path: PathBuf,
        size: u64,
        time_nanos: i64,
    },
    Miss,
}

/// What cache key the remote bundle is reached under for this run. `os`
/// is always part of the key; `git_ref`/`sha` (when known) narrow it
/// further, with restore (fallback) keys yielded most-specific-first.
#[derive(Debug, Clone)]
pub struct RemoteIdentity {
    pub prefix: String,
    pub os: String,
    pub git_ref: Option<String>,
    pub sha: Option<String>,
}

struct BaseBundle {
    download: Arc<dyn DownloadClient>,
    header: BundleHeader,
    payload_offset: u64,
}

pub struct CombinedCache {
    local: Arc<LocalStore>,
    remote: Option<Arc<dyn RemoteProvider>>,
    identity: Option<RemoteIdentity>,
    index: Mutex<Index>,
    object_locks: Mutex<HashMap<OutputId, FirstSuccess>>,
    base: Mutex<Option<BaseBundle>>,
    dirty: AtomicBool,
}

impl CombinedCache {
    /// Opens the local store at `local_dir` and returns immediately with
    /// the local index alone; when `remote` is configured, the bundle
    /// reconciliation and prefetch (spec §4.6 Startup step 4, §5) are
    /// kicked off on a background task so live traffic is never blocked
    /// on the remote round-trip.
    pub async fn open(
        local_dir: PathBuf,
        remote: Option<Arc<dyn RemoteProvider>>,
        identity: Option<RemoteIdentity>,
    ) -> Result<Arc<Self>, CacheError> {
        let local = Arc::new(LocalStore::open(local_dir.clone()).await?);
        let local_index = local::read_metadata(&local_dir).await;
        let filtered = local_index.filter_lru_window(now_timestamp());

        let cache = Arc::new(CombinedCache {
            local,
            remote,
            identity,
            index: Mutex::new(filtered),
            object_locks: Mutex::new(HashMap::new()),
            base: Mutex::new(None),
            dirty: AtomicBool::new(false),
        });

        if cache.remote.is_some() && cache.identity.is_some() {
            let background = cache.clone();
            tokio::spawn(async move {
                background.prefetch_remote_bundle().await;
            });
        }

        Ok(cache)
    }

    /// Looks up the remote bundle for this run's identity and, if one
    /// exists, streams into the local store whatever it has that the
    /// disk doesn't (spec §2, §4.6). Runs on the process-wide task group
    /// rather than blocking `open`; any failure just leaves the process
    /// local-only, same as it would have before the lookup ever started.
    /// The index is re-merged against whatever is current at completion,
    /// not the snapshot taken when the prefetch began, so PUTs served
    /// while the download was in flight are never clobbered.
    async fn prefetch_remote_bundle(self: Arc<Self>) {
        let (Some(remote), Some(identity)) = (&self.remote, &self.identity) else {
            return;
        };
        let (primary, fallbacks) = cache_keys(
            &identity.prefix,
            &identity.os,
            identity.git_ref.as_deref(),
            identity.sha.as_deref(),
        );
        let version = version_tag(DEFAULT_DOMAIN_TAG);
        let download = match remote.lookup_entry(&primary, &fallbacks, &version).await {
            Ok(Some(download)) => download,
            Ok(None) => return,
            Err(e) => {
                log::warn!("remote cache lookup failed, continuing local-only: {e}");
                return;
            }
        };
        let download: Arc<dyn DownloadClient> = Arc::from(download);
        let downloader = Downloader::new();
        let index_snapshot = self.index.lock().await.clone();
        match downloader.sync(download.clone(), self.local.clone(), index_snapshot).await {
            Ok((_, header, payload_offset)) => {
                let remote_index = header.index.clone();
                {
                    let mut index = self.index.lock().await;
                    *index = index.clone().merge_remote(remote_index).filter_lru_window(now_timestamp());
                }
                *self.base.lock().await = Some(BaseBundle {
                    download,
                    header,
                    payload_offset,
                });
                log::info!("remote bundle prefetch complete");
            }
            Err(e) => {
                log::warn!("remote bundle prefetch failed, continuing local-only: {e}");
            }
        }
    }

    /// Looks up `action_id`. A hit always refers to bytes durably present
    /// on local disk; an index entry whose artifact the prefetch failed to
    /// materialize is reported as a miss, never a corrupt hit.
    pub async fn get(&self, action_id: &ActionId) -> GetOutcome {
        let entry = {
            let index = self.index.lock().await;
            index.get(action_id).cloned()
        };
        let Some(entry) = entry else {
            return GetOutcome::Miss;
        };

        if let Some(disk_path) = self.local.get(&entry.output_id).await {
            self.touch(action_id, &entry).await;
            return GetOutcome::Hit {
                output_id: entry.output_id,
                disk_path,
                size: entry.size,
                time_nanos: entry.time_nanos,
            };
        }

        // The eager startup prefetch should have already materialized this
        // output; if it didn't (a transient failure, or a request racing
        // the prefetch), fall back to an on-demand fetch of just this one
        // object, coalesced so concurrent callers share a single attempt.
        if self.fetch_one_output(&entry.output_id).await {
            if let Some(disk_path) = self.local.get(&entry.output_id).await {
                self.touch(action_id, &entry).await;
                return GetOutcome::Hit {
                    output_id: entry.output_id,
                    disk_path,
                    size: entry.size,
                    time_nanos: entry.time_nanos,
                };
            }
        }

        log::warn!(
            "index referenced output {:?} for action {:?} but it could not be materialized locally; reporting a miss",
            entry.output_id,
            action_id
        );
        GetOutcome::Miss
    }

    /// Fetches a single output's bytes out of the base bundle and writes
    /// them locally, coalesced per-OutputID so concurrent callers racing
    /// for the same missing artifact share one attempt. Returns `false`
    /// when there is no base bundle, the output isn't in it, or the fetch
    /// failed — any of which just leave the caller to report a miss.
    async fn fetch_one_output(&self, output_id: &OutputId) -> bool {
        let coalescer = self.object_lock(output_id).await;
        let result = coalescer
            .run(
                || async {
                    let base = self.base.lock().await;
                    let Some(base) = base.as_ref() else {
                        return Err(());
                    };
                    let Some(record) = base.header.outputs.iter().find(|o| &o.output_id == output_id) else {
                        return Err(());
                    };
                    let bytes = base
                        .download
                        .read_range(base.payload_offset + record.offset, record.size)
                        .await
                        .map_err(|_| ())?;
                    let bytes = match record.compression {
                        crate::remote::Compression::Zstd => {
                            crate::util::compress::decompress(&bytes).map_err(|_| ())?
                        }
                        crate::remote::Compression::None => bytes,
                    };
                    let size = bytes.len() as u64;
                    self.local
                        .put(output_id, size, std::io::Cursor::new(bytes))
                        .await
                        .map_err(|_| ())?;
                    Ok(())
                },
                || async { Ok(()) },
            )
            .await;
        result.is_ok()
    }

    /// Records a fresh LastUsedAt without touching the artifact itself,
    /// so repeated hits keep an entry inside the next run's LRU window.
    async fn touch(&self, action_id: &ActionId, entry: &IndexEntry) {
        let mut index = self.index.lock().await;
        index.insert(
            action_id.clone(),
            IndexEntry {
                output_id: entry.output_id.clone(),
                size: entry.size,
                time_nanos: entry.time_nanos,
                last_used_at: now_timestamp(),
            },
        );
    }

    /// Writes `body` to the local store under `output_id` and binds
    /// `action_id` to it in the in-memory index. Marks the cache dirty so
    /// CLOSE knows to commit a fresh remote bundle.
    pub async fn put<R: AsyncRead + Unpin>(
        &self,
        action_id: ActionId,
        output_id: OutputId,
        size: u64,
        body: R,
    ) -> Result<PathBuf, CacheError> {
        let path = self.local.put(&output_id, size, body).await?;
        {
            let mut index = self.index.lock().await;
            index.insert(
                action_id,
                IndexEntry {
                    output_id,
                    size,
                    time_nanos: now_nanos(),
                    last_used_at: now_timestamp(),
                },
            );
        }
        self.dirty.store(true, Ordering::SeqCst);
        Ok(path)
    }

    /// Returns (creating if absent) the per-OutputID coalescer used to
    /// dedupe concurrent on-demand fetches of the same artifact.
    pub async fn object_lock(&self, output_id: &OutputId) -> FirstSuccess {
        let mut locks = self.object_locks.lock().await;
        locks.entry(output_id.clone()).or_default().clone()
    }

    /// Persists the local index and, if anything changed this run,
    /// commits a fresh remote bundle. Idempotent: a second call with
    /// nothing newly dirty only rewrites the local index file.
    pub async fn close(&self) -> Result<(), CacheError> {
        let index = self.index.lock().await.clone();
        local::write_metadata(self.local.dir(), &index).await?;

        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let (Some(remote), Some(identity)) = (&self.remote, &self.identity) else {
            return Ok(());
        };
        let (primary, _fallbacks) = cache_keys(
            &identity.prefix,
            &identity.os,
            identity.git_ref.as_deref(),
            identity.sha.as_deref(),
        );
        let version = version_tag(DEFAULT_DOMAIN_TAG);

        match remote.create_entry(&primary, &version).await {
            Ok(Some(upload)) => {
                let base = self.base.lock().await;
                let base_ref = base
                    .as_ref()
                    .map(|b| (b.download.as_ref(), &b.header, b.payload_offset));
                let uploader = Uploader::new();
                uploader.upload(upload.as_ref(), base_ref, &index, &self.local).await?;
            }
            Ok(None) => {
                log::warn!("remote cache entry {primary} already reserved by another writer; skipping upload");
            }
            Err(e) => {
                log::warn!("remote cache entry creation failed, local cache still persisted: {e}");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn put_then_get_is_a_hit() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CombinedCache::open(dir.path().to_path_buf(), None, None).await.unwrap();

        let action_id = ActionId("A".into());
        cache
            .put(action_id.clone(), OutputId("O".into()), 5, Cursor::new(b"hello".to_vec()))
            .await
            .unwrap();

        match cache.get(&action_id).await {
            GetOutcome::Hit { size, .. } => assert_eq!(size, 5),
            GetOutcome::Miss => panic!("expected a hit"),
        }
    }

    #[tokio::test]
    async fn unknown_action_id_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CombinedCache::open(dir.path().to_path_buf(), None, None).await.unwrap();
        assert_eq!(cache.get(&ActionId("nope".into())).await, GetOutcome::Miss);
    }

    #[tokio::test]
    async fn close_persists_index_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let action_id = ActionId("A".into());
        {
            let cache = CombinedCache::open(dir.path().to_path_buf(), None, None).await.unwrap();
            cache
                .put(action_id.clone(), OutputId("O".into()), 5, Cursor::new(b"hello".to_vec()))
                .await
                .unwrap();
            cache.close().await.unwrap();
        }
        let reopened = CombinedCache::open(dir.path().to_path_buf(), None, None).await.unwrap();
        match reopened.get(&action_id).await {
            GetOutcome::Hit { size, .. } => assert_eq!(size, 5),
            GetOutcome::Miss => panic!("expected a hit after reopen"),
        }
    }
}
