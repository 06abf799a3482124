mod handlers;

use clap::{CommandFactory, Parser};
use sandcore::{
    cli::{SandcoreArgs, SandcoreSubcommand},
    config::SandcoreConfig,
    init_logging, SandcoreResult,
};

//--------------------------------------------------------------------------------------------------
// Functions: main
//--------------------------------------------------------------------------------------------------

#[tokio::main]
async fn main() -> SandcoreResult<()> {
    let args = SandcoreArgs::parse();

    let log_dir = match &args.subcommand {
        Some(SandcoreSubcommand::Serve { log_dir }) => log_dir.clone(),
        _ => None,
    };
    let _guard = init_logging(args.verbose, log_dir.as_deref())?;

    let mut config = SandcoreConfig::load(args.config.as_deref())?;
    if args.simulated {
        config = config.into_simulated();
    }

    let Some(subcommand) = args.subcommand else {
        SandcoreArgs::command().print_help()?;
        return Ok(());
    };

    let orchestrator = handlers::build_orchestrator(config).await?;
    let queue = orchestrator.spawn_queue();
    match subcommand {
        SandcoreSubcommand::Serve { .. } => {
            handlers::serve_subcommand(orchestrator, queue).await?
        }
        SandcoreSubcommand::Spawn {
            workspace,
            image,
            vcpus,
            memory,
        } => {
            handlers::spawn_subcommand(&orchestrator, &queue, workspace, image, vcpus, memory)
                .await?
        }
        SandcoreSubcommand::Stop { id } => handlers::stop_subcommand(&orchestrator, &id).await?,
        SandcoreSubcommand::Start { id } => handlers::start_subcommand(&orchestrator, &id).await?,
        SandcoreSubcommand::Destroy { id } => {
            handlers::destroy_subcommand(&orchestrator, &id).await?
        }
        SandcoreSubcommand::Status { id, json } => {
            handlers::status_subcommand(&orchestrator, &id, json).await?
        }
        SandcoreSubcommand::List { json } => handlers::list_subcommand(&orchestrator, json).await?,
    }

    Ok(())
}
