mod cli;

use bridged::config::{LogFormat, load_config};
use bridged::server::{render_config, serve};
use clap::Parser;
use cli::{Cli, Commands};
use tracing_subscriber::EnvFilter;

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Plain => builder.init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config } => {
            let cfg = load_config(&config)?;
            init_tracing(cfg.log_format);
            serve(cfg).await?;
        }
        Commands::Materialize { config, user_id } => {
            let cfg = load_config(&config)?;
            println!("{}", render_config(&cfg, &user_id).await?);
        }
    }

    Ok(())
}
