use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "bridged", version, about = "Per-user bridge worker supervisor")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the daemon with config file
    Serve {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Print the worker config that would be generated for a user
    Materialize {
        #[arg(short, long)]
        config: PathBuf,
        user_id: String,
    },
}
