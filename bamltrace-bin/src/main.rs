mod inventory;

use std::path::PathBuf;
use std::sync::Arc;

use bamltrace_core::baml::openai::OpenAiFunctionClient;
use bamltrace_core::{Config, InMemoryBackend, MlflowBackend, TraceBackend, Tracer};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::inventory::{Inventory, summarize};

#[derive(Parser)]
#[command(author, version, about = "Trace BAML inventory functions to MLflow", long_about = None)]
struct Cli {
    /// Config file (JSON or TOML). Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Keep traces in memory and print their span trees instead of exporting.
    #[arg(long, global = true)]
    dry_run: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// ListInventory in a trace of its own
    Single,
    /// ListInventory then UpdateInventory in one shared trace
    Multi,
    /// Both of the above
    Demo,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let cli = Cli::parse();

    let cfg = Config::load(cli.config.as_deref())?;
    let memory = Arc::new(InMemoryBackend::new());
    let backend: Arc<dyn TraceBackend> = if cli.dry_run {
        memory.clone()
    } else {
        Arc::new(MlflowBackend::from_config(&cfg)?)
    };
    tracing::info!(
        tracking_uri = %cfg.tracking.uri,
        dry_run = cli.dry_run,
        mode = ?cfg.trace.mode,
        "starting"
    );

    let tracer = Tracer::with_settings(backend, cfg.trace.clone());
    let app = Inventory::new(Arc::new(OpenAiFunctionClient::from_config(
        &cfg.llm, &cfg.http,
    )?));

    let mut lines = Vec::new();
    if matches!(cli.command, Commands::Single | Commands::Demo) {
        lines.extend(app.run_single(&tracer).await?);
    }
    if matches!(cli.command, Commands::Multi | Commands::Demo) {
        lines.extend(app.run_multi(&tracer, &cfg.tracking.experiment).await?);
    }
    for line in &lines {
        println!("{line}");
    }

    if cli.dry_run {
        println!();
        for line in summarize(&memory.traces()) {
            println!("{line}");
        }
    }
    Ok(())
}
