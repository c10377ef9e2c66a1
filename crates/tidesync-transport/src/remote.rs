//! The abstract remote store surface the engine programs against.

use crate::Result;
use crate::types::{
    BlockHashResponse, ChangesResponse, RemoteMetadata, Share, SyncConfigDoc, SyncStateDoc,
};
use async_trait::async_trait;

/// Everything the reconciler needs from the server side.
///
/// [`crate::SyncClient`] is the production implementation; tests drive the
/// engine with an in-memory one.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Shares this device is authorized to sync.
    async fn list_shares(&self) -> Result<Vec<Share>>;

    /// Fetch the device sync configuration.
    async fn get_config(&self) -> Result<SyncConfigDoc>;

    /// Store the device sync configuration.
    async fn put_config(&self, config: &SyncConfigDoc) -> Result<()>;

    /// Pull a bounded batch of changes after `cursor`.
    async fn get_changes(
        &self,
        share_id: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<ChangesResponse>;

    /// Metadata of one remote path.
    async fn get_metadata(
        &self,
        share_id: &str,
        path: &str,
        include_children: bool,
    ) -> Result<RemoteMetadata>;

    /// Block hashes of a remote file at `block_size`.
    async fn get_block_hashes(
        &self,
        share_id: &str,
        path: &str,
        block_size: u32,
    ) -> Result<BlockHashResponse>;

    /// Server-side copy of this device's per-share sync state.
    async fn get_sync_state(&self, share_id: &str) -> Result<SyncStateDoc>;

    /// Mirror this device's per-share sync state to the server.
    async fn put_sync_state(&self, share_id: &str, state: &SyncStateDoc) -> Result<()>;

    /// Fetch a whole file body.
    async fn download(&self, share_id: &str, path: &str) -> Result<Vec<u8>>;

    /// Fetch `[offset, offset + length)` of a file body.
    async fn download_range(
        &self,
        share_id: &str,
        path: &str,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>>;

    /// Store a whole file body.
    async fn upload(&self, share_id: &str, path: &str, bytes: Vec<u8>) -> Result<()>;

    /// Delete a remote path.
    async fn delete(&self, share_id: &str, path: &str) -> Result<()>;

    /// Create a remote directory.
    async fn mkdir(&self, share_id: &str, path: &str) -> Result<()>;

    /// Move a remote path.
    async fn rename(&self, share_id: &str, src: &str, dst: &str) -> Result<()>;
}
