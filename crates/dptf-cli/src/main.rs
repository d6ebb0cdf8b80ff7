use anyhow::Result;
use chrono::Local;
use clap::{Parser, Subcommand};
use dptf_engine::{run_report, EngineConfig};
use dptf_fetch::{HtmlTableFetcher, HttpClientConfig};

#[derive(Debug, Parser)]
#[command(name = "dptf-cli")]
#[command(about = "Daily procurement tender finder")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the tender report API over HTTP.
    Serve,
    /// Run one report for today and print it as JSON.
    Fetch,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => dptf_web::serve_from_env().await?,
        Commands::Fetch => {
            let config = EngineConfig::from_env()?;
            let fetcher = HtmlTableFetcher::new(HttpClientConfig::default());
            let report = run_report(&fetcher, &config, Local::now().date_naive()).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}
