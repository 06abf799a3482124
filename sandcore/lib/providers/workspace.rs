use std::collections::HashMap;

use async_trait::async_trait;

use crate::{
    models::{GuestProvisioning, Repository, Workspace},
    SandcoreResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Source of workspace definitions and the secrets injected into their sandboxes.
#[async_trait]
pub trait WorkspaceProvider: Send + Sync {
    /// Looks up a workspace.
    async fn workspace(&self, workspace_id: &str) -> SandcoreResult<Option<Workspace>>;

    /// Secrets, credentials and config files for a sandbox of `workspace`, or of no workspace.
    async fn provisioning(&self, workspace: Option<&Workspace>)
        -> SandcoreResult<GuestProvisioning>;

    /// The URL to clone `repository` from, with credentials embedded when available.
    async fn clone_url(&self, repository: &Repository) -> SandcoreResult<String>;
}

/// A fixed set of workspaces sharing one provisioning bundle.
#[derive(Debug, Clone, Default)]
pub struct StaticWorkspaces {
    workspaces: HashMap<String, Workspace>,
    provisioning: GuestProvisioning,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl StaticWorkspaces {
    /// Creates a provider serving `workspaces`.
    pub fn new(workspaces: impl IntoIterator<Item = Workspace>) -> Self {
        Self {
            workspaces: workspaces
                .into_iter()
                .map(|ws| (ws.id.clone(), ws))
                .collect(),
            provisioning: GuestProvisioning::default(),
        }
    }

    /// Sets the provisioning bundle handed to every sandbox.
    pub fn with_provisioning(mut self, provisioning: GuestProvisioning) -> Self {
        self.provisioning = provisioning;
        self
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl WorkspaceProvider for StaticWorkspaces {
    async fn workspace(&self, workspace_id: &str) -> SandcoreResult<Option<Workspace>> {
        Ok(self.workspaces.get(workspace_id).cloned())
    }

    async fn provisioning(
        &self,
        _workspace: Option<&Workspace>,
    ) -> SandcoreResult<GuestProvisioning> {
        Ok(self.provisioning.clone())
    }

    async fn clone_url(&self, repository: &Repository) -> SandcoreResult<String> {
        Ok(repository.url.clone())
    }
}
