use async_trait::async_trait;

use crate::{config::ServicePorts, models::ServiceUrls, SandcoreResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Publishes guest services through the host's reverse proxy.
#[async_trait]
pub trait RouteProvider: Send + Sync {
    /// Registers HTTP routes for the guest services and returns their public URLs.
    async fn register_routes(
        &self,
        sandbox_id: &str,
        ip_address: &str,
        ports: &ServicePorts,
    ) -> SandcoreResult<ServiceUrls>;

    /// Removes every HTTP route of `sandbox_id`. Missing routes are not an error.
    async fn remove_routes(&self, sandbox_id: &str) -> SandcoreResult<()>;

    /// Registers the SSH route of `sandbox_id`.
    async fn register_ssh_route(&self, sandbox_id: &str, ip_address: &str) -> SandcoreResult<()>;

    /// Removes the SSH route of `sandbox_id`. A missing route is not an error.
    async fn remove_ssh_route(&self, sandbox_id: &str) -> SandcoreResult<()>;
}

/// Routes nothing and points URLs straight at the guest address.
///
/// Useful on a single host where the guest network is reachable from the client.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectRoutes;

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl RouteProvider for DirectRoutes {
    async fn register_routes(
        &self,
        _sandbox_id: &str,
        ip_address: &str,
        ports: &ServicePorts,
    ) -> SandcoreResult<ServiceUrls> {
        Ok(ServiceUrls {
            vscode: format!("http://{ip_address}:{}", ports.get_vscode()),
            opencode: format!("http://{ip_address}:{}", ports.get_opencode()),
            terminal: format!("http://{ip_address}:{}", ports.get_terminal()),
            ssh: format!("ssh -p {} dev@{ip_address}", ports.get_ssh()),
            browser: None,
        })
    }

    async fn remove_routes(&self, _sandbox_id: &str) -> SandcoreResult<()> {
        Ok(())
    }

    async fn register_ssh_route(&self, _sandbox_id: &str, _ip_address: &str) -> SandcoreResult<()> {
        Ok(())
    }

    async fn remove_ssh_route(&self, _sandbox_id: &str) -> SandcoreResult<()> {
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
