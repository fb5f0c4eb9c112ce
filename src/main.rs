use clap::{Parser, Subcommand};
use juz_gateway::{config::GatewayConfig, init_tracing, run_gateway, run_limiter};
use std::path::PathBuf;

/// API gateway and its rate limiter
#[derive(Parser)]
#[command(name = "juz")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway
    Api {
        /// Configuration file path
        #[arg(short, long, env = "JUZ_CONFIG", default_value = "config/gateway.yaml")]
        config: PathBuf,
    },

    /// Run the rate limiter RPC server
    Limiter {
        /// Configuration file path
        #[arg(short, long, env = "JUZ_CONFIG", default_value = "config/gateway.yaml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Api { config } => {
            let config = GatewayConfig::from_file(&config)?;
            run_gateway(config).await?;
        }
        Commands::Limiter { config } => {
            let config = GatewayConfig::from_file(&config)?;
            run_limiter(config).await?;
        }
    }

    Ok(())
}
