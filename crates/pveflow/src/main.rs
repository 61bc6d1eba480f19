mod commands;
mod utils;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "pveflow")]
#[command(about = "Declarative Proxmox VE instances, reconciled.", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the changes an apply would make
    Plan {
        /// Instance definition (YAML)
        #[arg(short, long)]
        file: PathBuf,
        /// Keep inherited values for blocks the definition leaves empty
        #[arg(long)]
        clone_provenance: bool,
    },
    /// Create the instance or bring it to the declared state
    Apply {
        /// Instance definition (YAML)
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Print the observed configuration of an instance
    Show {
        /// Node the instance lives on
        #[arg(long)]
        node: String,
        /// Instance id
        #[arg(long)]
        id: u32,
        /// The instance is an LXC container
        #[arg(long)]
        container: bool,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if matches!(cli.command, Commands::Version) {
        println!("pveflow {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let settings = pveflow_config::Settings::load()?;

    match cli.command {
        Commands::Plan {
            file,
            clone_provenance,
        } => {
            commands::plan::handle(&settings, &file, clone_provenance).await?;
        }
        Commands::Apply { file } => {
            commands::apply::handle(&settings, &file).await?;
        }
        Commands::Show {
            node,
            id,
            container,
        } => {
            commands::show::handle(&settings, &node, id, container).await?;
        }
        Commands::Version => {
            unreachable!("Version is handled before settings are loaded");
        }
    }

    Ok(())
}
