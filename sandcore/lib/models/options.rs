use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{SandcoreError, SandcoreResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Smallest accepted vCPU count.
pub const MIN_VCPUS: u8 = 1;

/// Largest accepted vCPU count.
pub const MAX_VCPUS: u8 = 8;

/// Smallest accepted memory size in MiB.
pub const MIN_MEMORY_MB: u32 = 512;

/// Largest accepted memory size in MiB.
pub const MAX_MEMORY_MB: u32 = 16384;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// What a caller asks for when spawning a sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
pub struct SpawnOptions {
    /// The workspace to inherit base image, shape and repositories from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option, into))]
    pub workspace_id: Option<String>,

    /// The base image to clone the root device from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option, into))]
    pub base_image: Option<String>,

    /// Number of vCPUs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option))]
    pub vcpus: Option<u8>,

    /// Memory size in MiB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option))]
    pub memory_mb: Option<u32>,
}

/// The resource shape a VM is configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineShape {
    /// Number of vCPUs.
    pub vcpus: u8,

    /// Memory size in MiB.
    pub memory_mb: u32,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SpawnOptions {
    /// Rejects out-of-range resource requests.
    pub fn validate(&self) -> SandcoreResult<()> {
        if let Some(vcpus) = self.vcpus {
            if !(MIN_VCPUS..=MAX_VCPUS).contains(&vcpus) {
                return Err(SandcoreError::Validation(format!(
                    "vcpus must be between {MIN_VCPUS} and {MAX_VCPUS}, got {vcpus}"
                )));
            }
        }

        if let Some(memory_mb) = self.memory_mb {
            if !(MIN_MEMORY_MB..=MAX_MEMORY_MB).contains(&memory_mb) {
                return Err(SandcoreError::Validation(format!(
                    "memoryMb must be between {MIN_MEMORY_MB} and {MAX_MEMORY_MB}, got {memory_mb}"
                )));
            }
        }

        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_bounds() {
        assert!(SpawnOptions::default().validate().is_ok());
        assert!(SpawnOptions::builder()
            .vcpus(8)
            .memory_mb(512)
            .build()
            .validate()
            .is_ok());

        let err = SpawnOptions::builder().vcpus(0).build().validate();
        assert!(matches!(err, Err(SandcoreError::Validation(_))));

        let err = SpawnOptions::builder().memory_mb(32768).build().validate();
        assert!(matches!(err, Err(SandcoreError::Validation(_))));
    }

    #[test]
    fn test_deserialize_camel_case() {
        let options: SpawnOptions =
            serde_json::from_str(r#"{"workspaceId":"w1","memoryMb":4096}"#).unwrap();
        assert_eq!(options.workspace_id.as_deref(), Some("w1"));
        assert_eq!(options.memory_mb, Some(4096));
        assert_eq!(options.vcpus, None);
    }
}
