use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{SandcoreError, SandcoreResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// What a sandbox volume is cloned from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeRequest {
    /// The workspace, for prebuild lookup.
    pub workspace_id: Option<String>,

    /// The base image when no prebuild is used.
    pub base_image: Option<String>,

    /// Clone the workspace prebuild instead of the base image.
    pub use_prebuild: bool,
}

/// Facts about an existing sandbox volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeInfo {
    /// The block device path.
    pub path: PathBuf,

    /// Virtual size in bytes.
    pub size_bytes: u64,
}

/// Result of resizing a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "outcome")]
pub enum ResizeOutcome {
    /// The volume grew.
    Resized {
        /// Size before, in GiB.
        previous_gb: u32,

        /// Size after, in GiB.
        new_gb: u32,
    },

    /// The volume already had at least the requested size.
    Unchanged,
}

/// Copy-on-write volume storage (thin logical volumes in production).
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Whether volumes can be created on this host. When `false`, flat overlay files are used.
    async fn is_available(&self) -> bool;

    /// Clones a volume for `sandbox_id` and returns its device path.
    async fn create_sandbox_volume(
        &self,
        sandbox_id: &str,
        request: &VolumeRequest,
    ) -> SandcoreResult<PathBuf>;

    /// Deletes the volume of `sandbox_id`. A missing volume is not an error.
    async fn delete_sandbox_volume(&self, sandbox_id: &str) -> SandcoreResult<()>;

    /// Whether a prebuild volume exists for `workspace_id`.
    async fn has_prebuild(&self, workspace_id: &str) -> bool;

    /// Snapshots the volume of `source_sandbox_id` as the prebuild of `workspace_id`.
    async fn create_prebuild(
        &self,
        workspace_id: &str,
        source_sandbox_id: &str,
    ) -> SandcoreResult<()>;

    /// The device path the volume of `sandbox_id` has, or would have.
    fn volume_path(&self, sandbox_id: &str) -> Option<PathBuf>;

    /// Facts about the volume of `sandbox_id`, if it exists.
    async fn volume_info(&self, sandbox_id: &str) -> SandcoreResult<Option<VolumeInfo>>;

    /// Grows the volume of `sandbox_id` to `size_gb`.
    async fn resize_sandbox_volume(
        &self,
        sandbox_id: &str,
        size_gb: u32,
    ) -> SandcoreResult<ResizeOutcome>;
}

/// A storage provider for hosts without volume support. Every sandbox uses an overlay file.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoVolumes;

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl StorageProvider for NoVolumes {
    async fn is_available(&self) -> bool {
        false
    }

    async fn create_sandbox_volume(
        &self,
        _sandbox_id: &str,
        _request: &VolumeRequest,
    ) -> SandcoreResult<PathBuf> {
        Err(unavailable())
    }

    async fn delete_sandbox_volume(&self, _sandbox_id: &str) -> SandcoreResult<()> {
        Ok(())
    }

    async fn has_prebuild(&self, _workspace_id: &str) -> bool {
        false
    }

    async fn create_prebuild(
        &self,
        _workspace_id: &str,
        _source_sandbox_id: &str,
    ) -> SandcoreResult<()> {
        Err(unavailable())
    }

    fn volume_path(&self, _sandbox_id: &str) -> Option<PathBuf> {
        None
    }

    async fn volume_info(&self, _sandbox_id: &str) -> SandcoreResult<Option<VolumeInfo>> {
        Ok(None)
    }

    async fn resize_sandbox_volume(
        &self,
        _sandbox_id: &str,
        _size_gb: u32,
    ) -> SandcoreResult<ResizeOutcome> {
        Err(unavailable())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn unavailable() -> SandcoreError {
    SandcoreError::Storage("volume storage is not available on this host".to_string())
}
