//! Resumable encrypted attachment store.
//!
//! The server stores opaque ciphertext blobs; every key, name and content
//! type stays inside the sender's encrypted pointer. Uploads are chunked
//! and resumable: chunks arrive in any order, re-uploading an index
//! overwrites it, and nothing is visible to downloaders until the upload
//! is completed. Completion concatenates the chunks in index order into a
//! single blob and deletes the staging directory.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use cachet_proto::DeviceAddress;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::devices::DeviceRegistry;
use crate::error::ServerError;

/// Default attachment retention: ninety days.
pub const ATTACHMENT_TTL_SECS: u64 = 90 * 24 * 60 * 60;

enum State {
    Uploading { chunks: BTreeSet<u32> },
    Complete {
        #[allow(dead_code)]
        size: u64,
    },
}

struct Meta {
    owner: DeviceAddress,
    created_at: u64,
    state: State,
}

struct Inner {
    next_id: u64,
    attachments: HashMap<u64, Meta>,
}

/// Filesystem-backed attachment store. Clone shares the same state.
#[derive(Clone)]
pub struct AttachmentStore {
    root: PathBuf,
    devices: DeviceRegistry,
    clock: Arc<dyn Clock>,
    retention_secs: u64,
    inner: Arc<Mutex<Inner>>,
}

impl AttachmentStore {
    /// Create a store rooted at `root`. The directory is created on first
    /// use.
    pub fn new(root: PathBuf, devices: DeviceRegistry, clock: Arc<dyn Clock>) -> Self {
        Self {
            root,
            devices,
            clock,
            retention_secs: ATTACHMENT_TTL_SECS,
            inner: Arc::new(Mutex::new(Inner { next_id: 1, attachments: HashMap::new() })),
        }
    }

    /// Override the retention window. Tests use short values.
    pub fn with_retention_secs(mut self, secs: u64) -> Self {
        self.retention_secs = secs;
        self
    }

    fn staging_dir(&self, id: u64) -> PathBuf {
        self.root.join(id.to_string())
    }

    fn chunk_path(&self, id: u64, index: u32) -> PathBuf {
        self.staging_dir(id).join(format!("chunk-{index}"))
    }

    fn blob_path(&self, id: u64) -> PathBuf {
        self.root.join(format!("{id}.blob"))
    }

    /// Start an upload, returning the new attachment id.
    pub async fn initiate(&self, owner: DeviceAddress) -> Result<u64, ServerError> {
        self.devices.require_active(owner)?;
        let now = self.clock.now_unix();
        let mut inner = self.inner.lock().await;
        let id = inner.next_id;
        inner.next_id += 1;
        inner.attachments.insert(
            id,
            Meta { owner, created_at: now, state: State::Uploading { chunks: BTreeSet::new() } },
        );
        drop(inner);

        fs::create_dir_all(self.staging_dir(id)).await?;
        debug!(%owner, id, "upload initiated");
        Ok(id)
    }

    /// Store one chunk. Any order; a repeated index overwrites.
    pub async fn upload_chunk(
        &self,
        owner: DeviceAddress,
        id: u64,
        index: u32,
        data: Vec<u8>,
    ) -> Result<(), ServerError> {
        let mut inner = self.inner.lock().await;
        let meta = inner.attachments.get_mut(&id).ok_or(ServerError::AttachmentNotFound(id))?;
        if meta.owner != owner {
            return Err(ServerError::Unauthorized(id));
        }
        let State::Uploading { chunks } = &mut meta.state else {
            return Err(ServerError::AlreadyComplete(id));
        };
        chunks.insert(index);

        // Hold the lock through the write so a concurrent complete cannot
        // assemble a half-written chunk.
        let mut file = fs::File::create(self.chunk_path(id, index)).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        Ok(())
    }

    /// Finalize an upload: concatenate chunks in index order, delete the
    /// staging area, and make the blob downloadable.
    pub async fn complete(&self, owner: DeviceAddress, id: u64) -> Result<u64, ServerError> {
        let mut inner = self.inner.lock().await;
        let meta = inner.attachments.get_mut(&id).ok_or(ServerError::AttachmentNotFound(id))?;
        if meta.owner != owner {
            return Err(ServerError::Unauthorized(id));
        }
        let State::Uploading { chunks } = &meta.state else {
            return Err(ServerError::AlreadyComplete(id));
        };
        if chunks.is_empty() {
            return Err(ServerError::EmptyUpload(id));
        }

        let mut blob = fs::File::create(self.blob_path(id)).await?;
        let mut size: u64 = 0;
        for &index in chunks {
            let data = fs::read(self.chunk_path(id, index)).await?;
            size += data.len() as u64;
            blob.write_all(&data).await?;
        }
        blob.sync_all().await?;
        fs::remove_dir_all(self.staging_dir(id)).await?;

        meta.state = State::Complete { size };
        info!(id, size, "attachment complete");
        Ok(size)
    }

    /// Read a complete attachment's ciphertext.
    ///
    /// Incomplete uploads are indistinguishable from missing ones; neither
    /// is downloadable.
    pub async fn download(&self, id: u64) -> Result<Vec<u8>, ServerError> {
        let inner = self.inner.lock().await;
        match inner.attachments.get(&id) {
            Some(Meta { state: State::Complete { .. }, .. }) => {}
            _ => return Err(ServerError::AttachmentNotFound(id)),
        }
        let path = self.blob_path(id);
        drop(inner);
        Ok(fs::read(path).await?)
    }

    /// Delete attachments past the retention window, complete or not.
    /// Returns the number removed.
    pub async fn sweep_expired(&self) -> Result<usize, ServerError> {
        let now = self.clock.now_unix();
        let mut inner = self.inner.lock().await;
        let expired: Vec<u64> = inner
            .attachments
            .iter()
            .filter(|(_, meta)| now >= meta.created_at.saturating_add(self.retention_secs))
            .map(|(&id, _)| id)
            .collect();

        for &id in &expired {
            let was_complete =
                matches!(inner.attachments.remove(&id), Some(Meta { state: State::Complete { .. }, .. }));
            if was_complete {
                fs::remove_file(self.blob_path(id)).await?;
            } else {
                fs::remove_dir_all(self.staging_dir(id)).await?;
            }
        }
        if !expired.is_empty() {
            debug!(removed = expired.len(), "expired attachments swept");
        }
        Ok(expired.len())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use crate::clock::ManualClock;

    use super::*;

    fn setup(root: PathBuf) -> (Arc<ManualClock>, DeviceRegistry, AttachmentStore) {
        let clock = ManualClock::at(1_000);
        let devices = DeviceRegistry::new(clock.clone());
        let store = AttachmentStore::new(root, devices.clone(), clock.clone());
        (clock, devices, store)
    }

    fn register(devices: &DeviceRegistry, user_id: u64) -> DeviceAddress {
        let d = devices.register(user_id, "dev".into());
        DeviceAddress { user_id: d.user_id, device_id: d.device_id }
    }

    #[tokio::test]
    async fn out_of_order_chunks_assemble_in_index_order() {
        let dir = tempfile::tempdir().unwrap();
        let (_, devices, store) = setup(dir.path().to_path_buf());
        let owner = register(&devices, 1);

        let id = store.initiate(owner).await.unwrap();
        store.upload_chunk(owner, id, 2, b"cc".to_vec()).await.unwrap();
        store.upload_chunk(owner, id, 0, b"aa".to_vec()).await.unwrap();
        store.upload_chunk(owner, id, 1, b"bb".to_vec()).await.unwrap();
        let size = store.complete(owner, id).await.unwrap();

        assert_eq!(size, 6);
        assert_eq!(store.download(id).await.unwrap(), b"aabbcc");
    }

    #[tokio::test]
    async fn reuploaded_chunk_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let (_, devices, store) = setup(dir.path().to_path_buf());
        let owner = register(&devices, 1);

        let id = store.initiate(owner).await.unwrap();
        store.upload_chunk(owner, id, 0, b"old".to_vec()).await.unwrap();
        store.upload_chunk(owner, id, 0, b"new".to_vec()).await.unwrap();
        store.complete(owner, id).await.unwrap();
        assert_eq!(store.download(id).await.unwrap(), b"new");
    }

    #[tokio::test]
    async fn incomplete_upload_is_not_downloadable() {
        let dir = tempfile::tempdir().unwrap();
        let (_, devices, store) = setup(dir.path().to_path_buf());
        let owner = register(&devices, 1);

        let id = store.initiate(owner).await.unwrap();
        store.upload_chunk(owner, id, 0, b"data".to_vec()).await.unwrap();
        assert!(matches!(store.download(id).await, Err(ServerError::AttachmentNotFound(_))));
    }

    #[tokio::test]
    async fn complete_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let (_, devices, store) = setup(dir.path().to_path_buf());
        let owner = register(&devices, 1);

        let id = store.initiate(owner).await.unwrap();
        store.upload_chunk(owner, id, 0, b"data".to_vec()).await.unwrap();
        store.complete(owner, id).await.unwrap();

        assert!(matches!(store.complete(owner, id).await, Err(ServerError::AlreadyComplete(_))));
        assert!(matches!(
            store.upload_chunk(owner, id, 1, b"late".to_vec()).await,
            Err(ServerError::AlreadyComplete(_))
        ));
    }

    #[tokio::test]
    async fn only_the_owner_may_upload_and_complete() {
        let dir = tempfile::tempdir().unwrap();
        let (_, devices, store) = setup(dir.path().to_path_buf());
        let owner = register(&devices, 1);
        let other = register(&devices, 2);

        let id = store.initiate(owner).await.unwrap();
        assert!(matches!(
            store.upload_chunk(other, id, 0, b"x".to_vec()).await,
            Err(ServerError::Unauthorized(_))
        ));
        assert!(matches!(store.complete(other, id).await, Err(ServerError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn empty_upload_cannot_complete() {
        let dir = tempfile::tempdir().unwrap();
        let (_, devices, store) = setup(dir.path().to_path_buf());
        let owner = register(&devices, 1);
        let id = store.initiate(owner).await.unwrap();
        assert!(matches!(store.complete(owner, id).await, Err(ServerError::EmptyUpload(_))));
    }

    #[tokio::test]
    async fn sweep_removes_expired_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let (clock, devices, store) = setup(dir.path().to_path_buf());
        let owner = register(&devices, 1);

        let id = store.initiate(owner).await.unwrap();
        store.upload_chunk(owner, id, 0, b"data".to_vec()).await.unwrap();
        store.complete(owner, id).await.unwrap();

        clock.advance(ATTACHMENT_TTL_SECS);
        assert_eq!(store.sweep_expired().await.unwrap(), 1);
        assert!(matches!(store.download(id).await, Err(ServerError::AttachmentNotFound(_))));
    }

    #[tokio::test]
    async fn sweep_removes_abandoned_uploads() {
        let dir = tempfile::tempdir().unwrap();
        let (clock, devices, store) = setup(dir.path().to_path_buf());
        let owner = register(&devices, 1);

        let id = store.initiate(owner).await.unwrap();
        store.upload_chunk(owner, id, 0, b"data".to_vec()).await.unwrap();

        clock.advance(ATTACHMENT_TTL_SECS);
        assert_eq!(store.sweep_expired().await.unwrap(), 1);
        assert!(matches!(
            store.upload_chunk(owner, id, 1, b"late".to_vec()).await,
            Err(ServerError::AttachmentNotFound(_))
        ));
    }
}
