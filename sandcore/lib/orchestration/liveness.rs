use std::time::Duration;

use crate::{models::SandboxStatus, SandcoreResult};

use super::Orchestrator;

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Orchestrator {
    /// Runs [`Orchestrator::status`] on every running sandbox. Returns the ids that were moved
    /// to `error`.
    pub async fn check_liveness(&self) -> SandcoreResult<Vec<String>> {
        let mut failed = Vec::new();

        for sandbox in self.store().list().await? {
            if sandbox.status != SandboxStatus::Running {
                continue;
            }

            match self.status(&sandbox.id).await {
                Ok(Some(checked)) if checked.status == SandboxStatus::Error => {
                    failed.push(checked.id)
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(sandbox_id = %sandbox.id, error = %e, "liveness check errored"),
            }
        }

        Ok(failed)
    }

    /// Checks liveness every configured interval until [`Orchestrator::shutdown`] is called.
    pub async fn run_liveness_checker(&self) {
        let interval = Duration::from_secs(self.config().get_timeouts().get_liveness_interval_secs());
        tracing::info!(interval_secs = interval.as_secs(), "liveness checker started");

        loop {
            tokio::select! {
                _ = self.shutdown_token().cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            match self.check_liveness().await {
                Ok(failed) if !failed.is_empty() => {
                    tracing::warn!(count = failed.len(), ?failed, "sandboxes failed liveness")
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "liveness sweep failed"),
            }
        }

        tracing::info!("liveness checker stopped");
    }
}
