use anyhow::Result;
use clap::{Parser, Subcommand};
use hourline_pipeline::{run_once, summary_line, RunConfig};
use hourline_store::JsonFileStore;

#[derive(Debug, Parser)]
#[command(name = "hourline-cli")]
#[command(about = "Warehouse hourly performance ledger reconciliation")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one reconciliation batch against the configured store.
    Run,
    /// Serve the HTTP trigger endpoint.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let config = RunConfig::from_env();
            let store = JsonFileStore::new(config.store_path.clone());
            let summary = run_once(&store, &config).await?;
            println!("{}", summary_line(&summary));
        }
        Commands::Serve => {
            hourline_web::serve_from_env().await?;
        }
    }

    Ok(())
}
