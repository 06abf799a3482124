use std::{sync::Arc, time::Duration};

use sandcore::{
    agent::AgentClient,
    cli::AnsiStyles,
    config::SandcoreConfig,
    environment::{FirecrackerEnvironment, SandboxEnvironment, SimulatedEnvironment},
    management::SqliteSandboxStore,
    models::{Sandbox, SandboxStatus, SpawnOptions},
    network::NetworkAllocator,
    orchestration::Orchestrator,
    queue::SpawnQueue,
    SandcoreError, SandcoreResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// How often `serve` forgets finished spawn jobs past their retention.
const JOB_CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

//--------------------------------------------------------------------------------------------------
// Functions: Handlers
//--------------------------------------------------------------------------------------------------

/// Wires the orchestrator from the configuration and rehydrates the address pool.
pub async fn build_orchestrator(config: SandcoreConfig) -> SandcoreResult<Arc<Orchestrator>> {
    let network = Arc::new(NetworkAllocator::new(config.get_network().clone()));
    let store = Arc::new(SqliteSandboxStore::open(config.get_paths().get_database()).await?);

    let environment: Arc<dyn SandboxEnvironment> = if config.get_simulated() {
        tracing::warn!("running against the simulated host");
        Arc::new(SimulatedEnvironment::new())
    } else {
        let agent = Arc::new(AgentClient::new(
            config.get_paths().get_socket_dir().clone(),
            config.get_agent(),
        ));
        Arc::new(FirecrackerEnvironment::new(
            config.clone(),
            network.clone(),
            agent,
        ))
    };

    let orchestrator = Orchestrator::builder()
        .config(config)
        .environment(environment)
        .network(network)
        .store(store)
        .build();

    orchestrator.rehydrate().await?;
    Ok(Arc::new(orchestrator))
}

pub async fn serve_subcommand(
    orchestrator: Arc<Orchestrator>,
    queue: SpawnQueue,
) -> SandcoreResult<()> {
    let checker = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move { orchestrator.run_liveness_checker().await }
    });

    let retention = Duration::from_secs(orchestrator.config().get_queue().get_job_retention_secs());
    let cleaner = tokio::spawn({
        let shutdown = orchestrator.shutdown_token().clone();
        async move {
            queue
                .run_cleanup(shutdown, JOB_CLEANUP_INTERVAL, retention)
                .await
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupt received, shutting down");

    orchestrator.shutdown();
    checker.await?;
    cleaner.await?;
    Ok(())
}

pub async fn spawn_subcommand(
    orchestrator: &Orchestrator,
    queue: &SpawnQueue,
    workspace_id: Option<String>,
    base_image: Option<String>,
    vcpus: Option<u8>,
    memory_mb: Option<u32>,
) -> SandcoreResult<()> {
    let options = SpawnOptions {
        workspace_id,
        base_image,
        vcpus,
        memory_mb,
    };

    let deadline = spawn_deadline(orchestrator);
    let sandbox = queue.enqueue_and_wait(options, Some(deadline)).await?;
    print_sandbox(&sandbox);
    Ok(())
}

pub async fn stop_subcommand(orchestrator: &Orchestrator, id: &str) -> SandcoreResult<()> {
    let sandbox = orchestrator.stop(id).await?;
    print_sandbox(&sandbox);
    Ok(())
}

pub async fn start_subcommand(orchestrator: &Orchestrator, id: &str) -> SandcoreResult<()> {
    let sandbox = orchestrator.start(id).await?;
    print_sandbox(&sandbox);
    Ok(())
}

pub async fn destroy_subcommand(orchestrator: &Orchestrator, id: &str) -> SandcoreResult<()> {
    orchestrator.destroy(id).await?;
    println!("{} {}", "destroyed".header(), id.literal());
    Ok(())
}

pub async fn status_subcommand(
    orchestrator: &Orchestrator,
    id: &str,
    json: bool,
) -> SandcoreResult<()> {
    let sandbox = orchestrator
        .status(id)
        .await?
        .ok_or_else(|| SandcoreError::SandboxNotFound(id.to_string()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&sandbox)?);
    } else {
        print_sandbox(&sandbox);
    }
    Ok(())
}

pub async fn list_subcommand(orchestrator: &Orchestrator, json: bool) -> SandcoreResult<()> {
    let sandboxes = orchestrator.list().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&sandboxes)?);
        return Ok(());
    }

    if sandboxes.is_empty() {
        println!("{}", "no sandboxes".placeholder());
        return Ok(());
    }

    for sandbox in &sandboxes {
        println!(
            "{}  {:<8}  {:<15}  {}",
            sandbox.id.literal(),
            status_label(sandbox.status),
            sandbox.runtime.ip_address,
            sandbox
                .workspace_id
                .as_deref()
                .unwrap_or("-")
                .placeholder()
        );
    }
    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn print_sandbox(sandbox: &Sandbox) {
    println!("{} {}", "sandbox".header(), sandbox.id.literal());
    println!("  status:  {}", status_label(sandbox.status));
    println!("  ip:      {}", sandbox.runtime.ip_address);
    if let Some(pid) = sandbox.runtime.pid {
        println!("  pid:     {pid}");
    }
    if !sandbox.runtime.urls.vscode.is_empty() {
        println!("  vscode:  {}", sandbox.runtime.urls.vscode);
        println!("  ssh:     {}", sandbox.runtime.urls.ssh);
    }
    if let Some(error) = &sandbox.runtime.error {
        println!("  error:   {}", error.error());
    }
}

/// Long enough for every attempt to run into its own deadlines.
fn spawn_deadline(orchestrator: &Orchestrator) -> Duration {
    let config = orchestrator.config();
    let timeouts = config.get_timeouts();
    let queue = config.get_queue();

    let attempt_ms = timeouts.get_launch_grace_ms()
        + timeouts.get_socket_wait_ms()
        + timeouts.get_boot_ms()
        + timeouts.get_agent_wait_ms()
        + timeouts.get_clone_ms();
    let attempts = u64::from(queue.get_max_retries()) + 1;

    Duration::from_millis(attempt_ms * attempts + queue.get_retry_delay_ms() * (attempts - 1))
}

fn status_label(status: SandboxStatus) -> String {
    match status {
        SandboxStatus::Running => status.as_str().valid(),
        SandboxStatus::Error => status.as_str().error(),
        _ => status.as_str().placeholder(),
    }
}
