mod actuator;
mod api;
mod backends;
mod client;
mod commands;
mod config;
mod domain;
mod error;
mod initializer;
mod liveness;
mod reconciler;
mod server;
#[cfg(test)]
mod testing;

use clap::{Parser, Subcommand};

use client::NodeCommand;
use commands::node::{Request, Target};

#[derive(Parser)]
#[command(
    name = "wakeward",
    version,
    about = "Power-lifecycle controller for homelab hosts and hypervisor guests"
)]
struct Cli {
    /// Path to config file (default: ~/.config/wakeward/config.yaml)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Target controller name (from config controllers map; defaults to localhost)
    #[arg(long, global = true)]
    controller: Option<String>,

    /// Output format (table or json)
    #[arg(long, global = true, default_value = "table")]
    format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the controller daemon (REST API + reconciliation loops)
    Daemon {
        /// HTTP listen address (overrides config)
        #[arg(long)]
        http_addr: Option<String>,

        /// Log level (overrides config)
        #[arg(long)]
        log_level: Option<String>,

        /// Durable state snapshot path (overrides config)
        #[arg(long)]
        state_file: Option<String>,
    },

    /// Controller health
    Health,

    /// List all nodes
    Nodes,

    /// Show one node in full
    Node {
        /// Node ID
        id: String,
    },

    /// List the guests a hypervisor host reports
    Guests {
        /// Hypervisor host node ID
        host: String,
    },

    /// Wake a node (and its host first, for guests)
    Wake { id: String },

    /// Suspend a node
    Suspend { id: String },

    /// Shut a node down
    Shutdown { id: String },

    /// Force-stop a hypervisor guest
    Stop { id: String },

    /// Run a liveness detection pass now
    Detect,

    /// Run a reconcile pass now, for one node or all
    Reconcile {
        /// Node ID (all nodes when omitted)
        id: Option<String>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let request = match cli.command {
        Commands::Daemon {
            http_addr,
            log_level,
            state_file,
        } => return commands::daemon::run(http_addr, log_level, state_file, cli.config),
        Commands::Health => Request::Health,
        Commands::Nodes => Request::Nodes,
        Commands::Node { id } => Request::Node(id),
        Commands::Guests { host } => Request::Guests(host),
        Commands::Wake { id } => Request::Command(id, NodeCommand::Wake),
        Commands::Suspend { id } => Request::Command(id, NodeCommand::Suspend),
        Commands::Shutdown { id } => Request::Command(id, NodeCommand::Shutdown),
        Commands::Stop { id } => Request::Command(id, NodeCommand::Stop),
        Commands::Detect => Request::Detect,
        Commands::Reconcile { id } => Request::Reconcile(id),
    };

    let target = Target {
        controller: cli.controller.as_deref(),
        config_path: cli.config.as_deref(),
        format: &cli.format,
    };
    commands::node::run(&target, request)
}
