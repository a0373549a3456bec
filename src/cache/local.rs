//! Local disk store (spec §4.3, component C3): a single-directory
//! content-addressed artifact store plus the persisted `r-metadata`
//! index file.

use crate::cache::index::Index;
use crate::model::OutputId;
use crate::pb;
use prost::Message;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::{Mutex, RwLock};

const METADATA_FILE_NAME: &str = "r-metadata";

#[derive(Debug, Error)]
pub enum LocalStoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt index: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("artifact body shorter than declared size: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
}

/// Per-OutputID slot: `true` once the artifact is durably written. `get`
/// takes a read lock (so it waits behind any in-flight writer); `put`
/// takes the write lock for the duration of the copy, so at most one
/// writer touches a given OutputID's file at a time (spec §4.3, §5).
type Slot = Arc<RwLock<bool>>;

pub struct LocalStore {
    dir: PathBuf,
    objects: Mutex<HashMap<OutputId, Slot>>,
}

impl LocalStore {
    /// Opens (creating if necessary) the store directory and builds the
    /// "seen" set by scanning it for `o-*` artifact files.
    pub async fn open(dir: PathBuf) -> Result<Self, LocalStoreError> {
        tokio::fs::create_dir_all(&dir).await?;
        let mut objects = HashMap::new();
        let mut read_dir = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(encoded) = name.strip_prefix("o-") {
                let output_id = OutputId::from_encoded(encoded);
                objects.insert(output_id, Arc::new(RwLock::new(true)));
            }
        }
        Ok(LocalStore {
            dir,
            objects: Mutex::new(objects),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, output_id: &OutputId) -> PathBuf {
        self.dir.join(output_id.disk_file_name())
    }

    async fn slot_for(&self, output_id: &OutputId) -> Slot {
        let mut objects = self.objects.lock().await;
        objects
            .entry(output_id.clone())
            .or_insert_with(|| Arc::new(RwLock::new(false)))
            .clone()
    }

    /// Returns the artifact's path if it has been durably written in this
    /// process, `None` on miss. Never returns a path to a partially
    /// written file (spec §4.3 invariant).
    pub async fn get(&self, output_id: &OutputId) -> Option<PathBuf> {
        let slot = {
            let objects = self.objects.lock().await;
            objects.get(output_id).cloned()
        }?;
        let written = slot.read().await;
        if *written {
            Some(self.path_for(output_id))
        } else {
            None
        }
    }

    /// Writes `reader` to disk as `output_id`'s artifact. If the OutputID
    /// was already seen, `reader` is drained (to unblock the producer,
    /// e.g. a concurrent remote uploader reading the same body) and the
    /// existing path is returned without touching the file again. A short
    /// read is a [`LocalStoreError::SizeMismatch`] and leaves no "seen"
    /// marker, so the next PUT for the same OutputID can retry cleanly.
    pub async fn put<R: AsyncRead + Unpin>(
        &self,
        output_id: &OutputId,
        size: u64,
        mut reader: R,
    ) -> Result<PathBuf, LocalStoreError> {
        let slot = self.slot_for(output_id).await;
        let path = self.path_for(output_id);

        {
            let already = slot.read().await;
            if *already {
                drain(&mut reader).await?;
                return Ok(path);
            }
        }

        let mut written = slot.write().await;
        if *written {
            drain(&mut reader).await?;
            return Ok(path);
        }

        let mut file = tokio::fs::File::create(&path).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(std::fs::Permissions::from_mode(0o600))
                .await?;
        }
        let copied = tokio::io::copy(&mut reader.take(size), &mut file).await?;
        file.flush().await?;
        if copied < size {
            drop(file);
            let _ = tokio::fs::remove_file(&path).await;
            return Err(LocalStoreError::SizeMismatch {
                expected: size,
                actual: copied,
            });
        }
        *written = true;
        Ok(path)
    }
}

async fn drain<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(), LocalStoreError> {
    tokio::io::copy(reader, &mut tokio::io::sink()).await?;
    Ok(())
}

/// Reads the persisted index, returning an empty index (with a warning)
/// if the file is absent or corrupt (spec §4.3, §7: never fatal).
pub async fn read_metadata(dir: &Path) -> Index {
    match read_metadata_inner(dir).await {
        Ok(index) => index,
        Err(LocalStoreError::Io(e)) if e.kind() == io::ErrorKind::NotFound => Index::new(),
        Err(e) => {
            log::warn!("local index at {} is unreadable ({e}); starting empty", dir.display());
            Index::new()
        }
    }
}

async fn read_metadata_inner(dir: &Path) -> Result<Index, LocalStoreError> {
    let bytes = tokio::fs::read(dir.join(METADATA_FILE_NAME)).await?;
    let proto = pb::Index::decode(bytes.as_slice())?;
    Ok(Index::from_proto(proto))
}

/// Persists `index` as the local `r-metadata` file, mode 0600 (spec
/// §4.3).
pub async fn write_metadata(dir: &Path, index: &Index) -> Result<(), LocalStoreError> {
    let bytes = index.to_proto().encode_to_vec();
    let path = dir.join(METADATA_FILE_NAME);
    let mut file = tokio::fs::File::create(&path).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))
            .await?;
    }
    file.write_all(&bytes).await?;
    file.flush().await?;
    Ok(())
}
