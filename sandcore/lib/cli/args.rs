use std::path::PathBuf;

use clap::Parser;

use crate::cli::styles;

//-------------------------------------------------------------------------------------------------
// Types
//-------------------------------------------------------------------------------------------------

/// `sandcore` provisions Firecracker sandboxes and manages their lifecycle
#[derive(Debug, Parser)]
#[command(name = "sandcore", author, version, styles = styles::styles())]
pub struct SandcoreArgs {
    /// The subcommand to run
    #[command(subcommand)]
    pub subcommand: Option<SandcoreSubcommand>,

    /// Path to the TOML configuration file
    #[arg(short, long, global = true, env = "SANDCORE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Run against the simulated host instead of real VMs
    #[arg(long, global = true)]
    pub simulated: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available subcommands for managing sandboxes
#[derive(Debug, Parser)]
pub enum SandcoreSubcommand {
    /// Run the liveness checker until interrupted
    #[command(name = "serve")]
    Serve {
        /// Also write logs to daily files in this directory
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },

    /// Spawn a new sandbox
    #[command(name = "spawn")]
    Spawn {
        /// Workspace to inherit image, shape and repositories from
        #[arg(short, long)]
        workspace: Option<String>,

        /// Base image to clone the root device from
        #[arg(short, long)]
        image: Option<String>,

        /// Number of vCPUs
        #[arg(long)]
        vcpus: Option<u8>,

        /// Memory in MiB
        #[arg(long)]
        memory: Option<u32>,
    },

    /// Stop a running sandbox
    #[command(name = "stop")]
    Stop {
        /// The sandbox id
        id: String,
    },

    /// Start a stopped sandbox
    #[command(name = "start")]
    Start {
        /// The sandbox id
        id: String,
    },

    /// Destroy a sandbox and release its resources
    #[command(name = "destroy")]
    Destroy {
        /// The sandbox id
        id: String,
    },

    /// Check a sandbox's liveness and show it
    #[command(name = "status")]
    Status {
        /// The sandbox id
        id: String,

        /// Print the record as JSON
        #[arg(long)]
        json: bool,
    },

    /// List every sandbox
    #[command(name = "list")]
    List {
        /// Print the records as JSON
        #[arg(long)]
        json: bool,
    },
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
