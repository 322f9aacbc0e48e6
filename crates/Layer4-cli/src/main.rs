//! Tether CLI - Main entry point

mod demo;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Tether - persistent task coordination for clustered services
#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run an in-process demonstration cluster
    Demo {
        /// Cluster topology file (TOML); defaults to a three node cluster
        #[arg(long)]
        config: Option<PathBuf>,

        /// Number of nodes when no config file is given
        #[arg(long, default_value = "3")]
        nodes: usize,

        /// Number of countdown tasks to submit
        #[arg(long, default_value = "4")]
        tasks: usize,

        /// Skip the simulated node failure halfway through
        #[arg(long)]
        no_failures: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_filter = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .init();

    match args.command {
        Command::Demo {
            config,
            nodes,
            tasks,
            no_failures,
        } => {
            demo::run(demo::DemoOptions {
                config,
                nodes,
                tasks,
                simulate_failure: !no_failures,
            })
            .await
        }
    }
}
