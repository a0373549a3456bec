//! The downloader and uploader halves of the remote tier (component C5):
//! turning a fetched bundle header into locally-stored artifacts, and
//! turning newly-written local artifacts into a fresh committed bundle.

use crate::cache::index::Index;
use crate::cache::local::LocalStore;
use crate::model::{IndexEntry, OutputId};
use crate::remote::bundle::{self, BundleError, BundleHeader, Compression, OutputRecord};
use crate::remote::provider::{BoxAsyncRead, DownloadClient, ProviderError, UploadClient};
use crate::util::compress;
use crate::util::joined_writer::{AsyncCloseWrite, JoinedWriter};
use crate::util::pool::BoundedPool;
use base64::Engine;
use byteorder::{BigEndian, ByteOrder};
use futures::StreamExt;
use rand::RngCore;
use std::collections::HashSet;
use std::io;
use std::io::Cursor;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("remote provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("bundle codec error: {0}")]
    Bundle(#[from] BundleError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("local store error: {0}")]
    LocalStore(#[from] crate::cache::local::LocalStoreError),
}

/// Reads the 8-byte length prefix and the header protobuf that follows
/// it via two ranged reads, rather than guessing how much of the object
/// to fetch up front.
pub async fn fetch_header(client: &dyn DownloadClient) -> Result<(BundleHeader, u64), TransferError> {
    let prefix = client.read_range(0, 8).await?;
    let len = BigEndian::read_u64(&prefix);
    let body = client.read_range(8, len).await?;
    let mut full = prefix;
    full.extend_from_slice(&body);
    let (header, payload_offset) = bundle::parse_header(&full)?;
    Ok((header, payload_offset))
}

/// Writer slot fed by [`Downloader::sync`]'s chunked pull: a duplex pipe
/// into a concurrently-running [`LocalStore::put`] for a raw output, an
/// in-memory buffer for a compressed output (decompressed once fully
/// received), or a sink for an output already present locally.
enum Slot {
    Duplex(tokio::io::DuplexStream),
    Buffer(Arc<tokio::sync::Mutex<Vec<u8>>>),
    Discard,
}

#[async_trait::async_trait]
impl AsyncCloseWrite for Slot {
    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self {
            Slot::Duplex(w) => w.write_all(buf).await,
            Slot::Buffer(v) => {
                v.lock().await.extend_from_slice(buf);
                Ok(())
            }
            Slot::Discard => Ok(()),
        }
    }

    async fn close(&mut self) -> io::Result<()> {
        match self {
            Slot::Duplex(w) => w.shutdown().await,
            _ => Ok(()),
        }
    }
}

pub struct Downloader {
    pool: BoundedPool,
    chunk_bytes: u64,
}

impl Downloader {
    pub fn new() -> Self {
        Downloader {
            pool: BoundedPool::new(BoundedPool::default_prefetch_capacity()),
            // A single ranged read covers many small outputs at once; this
            // bound just keeps one chunk's in-flight duplex buffers modest.
            chunk_bytes: 8 * 1024 * 1024,
        }
    }

    /// Fetches the bundle header, writes every output not already present
    /// in `store`, and returns the header's index merged into whatever the
    /// caller already has locally, alongside the header itself (so the
    /// caller can reuse it as the base bundle for a later upload without
    /// fetching it a second time).
    pub async fn sync(
        &self,
        client: Arc<dyn DownloadClient>,
        store: Arc<LocalStore>,
        local_index: Index,
    ) -> Result<(Index, BundleHeader, u64), TransferError> {
        let (header, payload_offset) = fetch_header(client.as_ref()).await?;
        let merged = local_index.merge_remote(header.index.clone());

        let outputs = header.outputs_by_offset();
        let mut runs: Vec<Vec<&OutputRecord>> = Vec::new();
        let mut current: Vec<&OutputRecord> = Vec::new();
        let mut current_bytes = 0u64;
        let mut any_missing = false;
        let mut seen: HashSet<&OutputId> = HashSet::new();

        for output in outputs {
            if !seen.insert(&output.output_id) {
                continue; // the same OutputID may appear more than once
            }
            if store.get(&output.output_id).await.is_none() {
                any_missing = true;
            }
            current.push(output);
            current_bytes += output.size;
            if current_bytes >= self.chunk_bytes {
                if any_missing {
                    runs.push(std::mem::take(&mut current));
                } else {
                    current.clear();
                }
                current_bytes = 0;
                any_missing = false;
            }
        }
        if !current.is_empty() && any_missing {
            runs.push(current);
        }

        let results = futures::stream::iter(runs.into_iter().map(|run| {
            let client = client.clone();
            let store = store.clone();
            let pool = self.pool.clone();
            async move {
                let _permit = pool.acquire().await;
                download_run(client.as_ref(), &store, payload_offset, run).await
            }
        }))
        .buffer_unordered(8)
        .collect::<Vec<_>>()
        .await;

        for result in results {
            result?;
        }

        Ok((merged, header, payload_offset))
    }
}

async fn download_run(
    client: &dyn DownloadClient,
    store: &Arc<LocalStore>,
    payload_offset: u64,
    run: Vec<&OutputRecord>,
) -> Result<(), TransferError> {
    let start = run.first().map(|o| o.offset).unwrap_or(0);
    let end = run.last().map(|o| o.offset + o.size).unwrap_or(0);
    let run_len = end - start;

    let mut slots: Vec<(Slot, u64)> = Vec::with_capacity(run.len());
    let mut put_tasks = Vec::new();
    let mut pending_buffers: Vec<(OutputId, Arc<tokio::sync::Mutex<Vec<u8>>>)> = Vec::new();

    for output in &run {
        let present = store.get(&output.output_id).await.is_some();
        if present {
            slots.push((Slot::Discard, output.size));
            continue;
        }
        match output.compression {
            Compression::None => {
                let (read_half, write_half) = tokio::io::duplex(64 * 1024);
                let store = store.clone_handle();
                let output_id = output.output_id.clone();
                let size = output.size;
                put_tasks.push(tokio::spawn(async move {
                    store.put(&output_id, size, read_half).await
                }));
                slots.push((Slot::Duplex(write_half), output.size));
            }
            Compression::Zstd => {
                let buffer = Arc::new(tokio::sync::Mutex::new(Vec::with_capacity(output.size as usize)));
                slots.push((Slot::Buffer(buffer.clone()), output.size));
                pending_buffers.push((output.output_id.clone(), buffer));
            }
        }
    }

    let mut joined = JoinedWriter::new(slots).await?;
    let mut reader = client.stream_range(payload_offset + start, run_len).await?;
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        joined.write_all(&buf[..n]).await?;
    }
    joined.close_remaining().await?;

    for task in put_tasks {
        task.await.map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;
    }

    for (output_id, buffer) in pending_buffers {
        let compressed = buffer.lock().await;
        let decompressed = compress::decompress(&compressed)?;
        let size = decompressed.len() as u64;
        store.put(&output_id, size, Cursor::new(decompressed)).await?;
    }

    Ok(())
}

impl LocalStore {
    /// A cheap `Arc`-free handle usable from a spawned task: `LocalStore`
    /// only needs `&self` for every operation, so a bare reference wrapped
    /// in `Arc` at the call site is all spawning requires. Provided as a
    /// method so call sites read naturally.
    fn clone_handle(self: &Arc<Self>) -> Arc<Self> {
        self.clone()
    }
}

#[derive(Default)]
pub struct Uploader {}

impl Uploader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds and commits a fresh bundle from `index`, reusing bytes from
    /// `base` (the previously-committed bundle, if any) via a server-side
    /// block copy when a `DownloadClient` for it is available, and
    /// uploading from `store` otherwise.
    pub async fn upload(
        &self,
        upload: &dyn UploadClient,
        base: Option<(&dyn DownloadClient, &BundleHeader, u64)>,
        index: &Index,
        store: &LocalStore,
    ) -> Result<(), TransferError> {
        let base_records: std::collections::HashMap<&OutputId, &OutputRecord> = base
            .map(|(_, header, _)| header.outputs.iter().map(|o| (&o.output_id, o)).collect())
            .unwrap_or_default();

        let mut output_ids: Vec<&OutputId> = index.iter().map(|(_, entry)| &entry.output_id).collect();
        output_ids.sort_by(|a, b| a.0.cmp(&b.0));
        output_ids.dedup();

        struct Planned<'a> {
            output_id: &'a OutputId,
            size: u64,
            compression: Compression,
            source: Source<'a>,
        }
        enum Source<'a> {
            Reused { offset: u64 },
            Fresh { bytes: Vec<u8> },
        }

        let mut planned: Vec<Planned> = Vec::with_capacity(output_ids.len());
        for output_id in output_ids {
            if let Some(record) = base_records.get(output_id) {
                planned.push(Planned {
                    output_id,
                    size: record.size,
                    compression: record.compression,
                    source: Source::Reused { offset: record.offset },
                });
                continue;
            }

            let entry = index
                .iter()
                .find(|(_, e)| &e.output_id == output_id)
                .map(|(_, e)| e)
                .expect("output_id was collected from this index");
            let path = store
                .get(output_id)
                .await
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "output missing from local store"))?;
            let raw = tokio::fs::read(&path).await?;

            let (bytes, compression) = match compress::choose(entry.size) {
                compress::CompressionChoice::Zstd => (compress::compress(&raw)?, Compression::Zstd),
                compress::CompressionChoice::Raw => (raw, Compression::None),
            };
            let size = bytes.len() as u64;
            planned.push(Planned {
                output_id,
                size,
                compression,
                source: Source::Fresh { bytes },
            });
        }

        let mut offset = 0u64;
        let mut records = Vec::with_capacity(planned.len());
        for p in &planned {
            records.push(OutputRecord {
                output_id: p.output_id.clone(),
                offset,
                size: p.size,
                compression: p.compression,
            });
            offset += p.size;
        }
        let output_total_size = offset;

        let header = BundleHeader {
            index: index.clone(),
            outputs: records,
            output_total_size,
        };
        let header_bytes = bundle::create_header(&header);
        let header_len = header_bytes.len() as u64;

        let mut block_ids = Vec::with_capacity(planned.len() + 1);
        let header_block_id = random_block_id();
        block_ids.push(header_block_id.clone());
        let header_reader: BoxAsyncRead = Box::pin(Cursor::new(header_bytes));
        upload.stage_block(&header_block_id, header_len, header_reader).await?;

        for p in &planned {
            // Zero-size outputs are recorded in the header but contribute
            // no block to the commit list (spec §4.5.2): there is nothing
            // to stage.
            if p.size == 0 {
                continue;
            }
            let block_id = random_block_id();
            block_ids.push(block_id.clone());
            match &p.source {
                Source::Reused { offset } => {
                    let (download, base_header, payload_offset) =
                        base.expect("Reused source implies a base bundle was provided");
                    let _ = base_header;
                    upload
                        .stage_block_from_url(&block_id, download.object_url(), payload_offset + offset, p.size)
                        .await?;
                }
                Source::Fresh { bytes } => {
                    let reader: BoxAsyncRead = Box::pin(Cursor::new(bytes.clone()));
                    upload.stage_block(&block_id, p.size, reader).await?;
                }
            }
        }

        upload.commit(&block_ids).await?;
        // `header_len` already includes the 8-byte length prefix
        // (`create_header` prepends it), so the committed object's total
        // size is just header_len + output_total_size (spec §4.5.2 step 5).
        upload.finalize(header_len + output_total_size).await?;
        Ok(())
    }
}

/// A fresh random block ID for one staged block: base64 of 32 random
/// bytes (spec §4.5.2), so a new bundle's block IDs never collide with
/// a prior upload session's regardless of how many outputs it carries.
fn random_block_id() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ActionId;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use tokio::io::AsyncRead;
    use url::Url;

    fn new_entry(output_id: OutputId, size: u64, time_nanos: i64, last_used_at: i64) -> IndexEntry {
        IndexEntry {
            output_id,
            size,
            time_nanos,
            last_used_at,
        }
    }

    struct FakeDownload {
        url: Url,
        bytes: Vec<u8>,
    }

    #[async_trait]
    impl DownloadClient for FakeDownload {
        fn object_url(&self) -> &Url {
            &self.url
        }
        async fn read_range(&self, offset: u64, len: u64) -> Result<Vec<u8>, ProviderError> {
            let start = offset as usize;
            let end = start + len as usize;
            Ok(self.bytes[start..end].to_vec())
        }
        async fn stream_range(&self, offset: u64, len: u64) -> Result<BoxAsyncRead, ProviderError> {
            let start = offset as usize;
            let end = start + len as usize;
            Ok(Box::pin(Cursor::new(self.bytes[start..end].to_vec())))
        }
    }

    struct FakeUpload {
        blocks: StdMutex<std::collections::HashMap<String, Vec<u8>>>,
        committed: StdMutex<Vec<String>>,
    }

    impl FakeUpload {
        fn new() -> Self {
            FakeUpload {
                blocks: StdMutex::new(std::collections::HashMap::new()),
                committed: StdMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl UploadClient for FakeUpload {
        async fn stage_block(&self, block_id: &str, _len: u64, mut body: BoxAsyncRead) -> Result<(), ProviderError> {
            let mut buf = Vec::new();
            tokio::io::AsyncReadExt::read_to_end(&mut body, &mut buf)
                .await
                .map_err(ProviderError::Io)?;
            self.blocks.lock().unwrap().insert(block_id.to_string(), buf);
            Ok(())
        }
        async fn stage_block_from_url(
            &self,
            block_id: &str,
            _source_url: &Url,
            _offset: u64,
            _size: u64,
        ) -> Result<(), ProviderError> {
            self.blocks.lock().unwrap().insert(block_id.to_string(), vec![]);
            Ok(())
        }
        async fn commit(&self, block_ids: &[String]) -> Result<(), ProviderError> {
            *self.committed.lock().unwrap() = block_ids.to_vec();
            Ok(())
        }
        async fn finalize(&self, _total_size: u64) -> Result<(), ProviderError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn fetch_header_round_trips_against_a_fake_client() {
        let mut index = Index::new();
        index.insert(
            ActionId("A".into()),
            new_entry(OutputId("O".into()), 3, 1, 2),
        );
        let header = BundleHeader {
            index,
            outputs: vec![OutputRecord {
                output_id: OutputId("O".into()),
                offset: 0,
                size: 3,
                compression: Compression::None,
            }],
            output_total_size: 3,
        };
        let mut bytes = bundle::create_header(&header);
        bytes.extend_from_slice(b"abc");

        let client = FakeDownload {
            url: Url::parse("https://example.invalid/o").unwrap(),
            bytes,
        };
        let (restored, payload_offset) = fetch_header(&client).await.unwrap();
        assert_eq!(restored.outputs.len(), 1);
        assert_eq!(payload_offset as usize, restored_header_len(&client).await);
    }

    async fn restored_header_len(client: &FakeDownload) -> usize {
        let prefix = client.read_range(0, 8).await.unwrap();
        let len = BigEndian::read_u64(&prefix);
        8 + len as usize
    }

    #[tokio::test]
    async fn upload_stages_a_header_block_and_commits_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path().to_path_buf()).await.unwrap();
        let output_id = OutputId("O".into());
        store.put(&output_id, 3, Cursor::new(b"abc".to_vec())).await.unwrap();

        let mut index = Index::new();
        index.insert(ActionId("A".into()), new_entry(output_id, 3, 1, 2));

        let upload = FakeUpload::new();
        let uploader = Uploader::new();
        uploader.upload(&upload, None, &index, &store).await.unwrap();

        let committed = upload.committed.lock().unwrap().clone();
        assert_eq!(committed.len(), 2);
        let blocks = upload.blocks.lock().unwrap();
        assert!(blocks.contains_key(&committed[0]));
        assert!(blocks.contains_key(&committed[1]));
        assert_ne!(committed[0], committed[1]);
    }

    #[tokio::test]
    async fn zero_size_output_contributes_no_block() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path().to_path_buf()).await.unwrap();
        let output_id = OutputId("empty".into());
        store.put(&output_id, 0, Cursor::new(Vec::new())).await.unwrap();

        let mut index = Index::new();
        index.insert(ActionId("A".into()), new_entry(output_id, 0, 1, 2));

        let upload = FakeUpload::new();
        let uploader = Uploader::new();
        uploader.upload(&upload, None, &index, &store).await.unwrap();

        // Only the header block is staged and committed; the zero-size
        // output contributes nothing.
        let committed = upload.committed.lock().unwrap().clone();
        assert_eq!(committed.len(), 1);
    }
}
