use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use futures::stream::{self, StreamExt, TryStreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use ingest::streaming::DuplexConnector;
use ingest::{normalize_path, AddOptions, ClientConfig, IngestClient, ServerCommand, TcpConnector};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "ingest")]
#[command(about = "Stream files and directories to an ingestion service", long_about = None)]
#[command(version)]
struct Cli {
    /// Files or directories to add
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// Service endpoint (host:port or tcp://host:port)
    #[arg(short, long, env = "INGEST_URL")]
    url: Option<String>,

    /// Run this command as the service and talk to it over stdin/stdout
    #[arg(long, conflicts_with = "url")]
    exec: Option<String>,

    /// Deadline for the whole operation, in seconds
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Config file (default: ~/.config/ingest/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Content chunk size in bytes
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Print results as JSON lines
    #[arg(long)]
    json: bool,

    /// No progress bar
    #[arg(short, long)]
    quiet: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "ingest=debug" } else { "ingest=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn progress_bar(quiet: bool) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {bytes} {wide_msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    bar.enable_steady_tick(Duration::from_millis(100));
    bar
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = ClientConfig::resolve(cli.config.as_deref()).context("Failed to load config")?;
    if let Some(url) = cli.url.clone() {
        config.url = Some(url);
    }
    if let Some(secs) = cli.timeout {
        config.timeout_secs = Some(secs);
    }
    if let Some(size) = cli.chunk_size {
        anyhow::ensure!(size > 0, "--chunk-size must be positive");
        config.chunk_size = size;
    }

    let connector: Arc<dyn DuplexConnector> = match &cli.exec {
        Some(command) => Arc::new(ServerCommand::parse(command).context("Invalid --exec command")?),
        None => Arc::new(TcpConnector::new(config.url.clone())),
    };

    let chunk_size = config.chunk_size;
    let roots = cli.paths.clone();
    let entries = stream::iter(roots)
        .map(move |root| normalize_path(root, chunk_size))
        .flatten()
        .boxed();

    let bar = progress_bar(cli.quiet || cli.json);
    let ticker = bar.clone();
    let options = AddOptions::new().with_progress(move |bytes, path| {
        ticker.set_position(bytes);
        ticker.set_message(path.to_string());
    });

    let client = IngestClient::new(connector, config);
    let mut results = client.add_all(entries, options);

    let mut added = 0u64;
    let outcome = async {
        while let Some(result) = results.try_next().await? {
            added += 1;
            if cli.json {
                println!("{}", serde_json::to_string(&result)?);
            } else {
                bar.suspend(|| {
                    println!("{} {} {}", "added".green().bold(), result.cid, result.path.cyan());
                });
            }
        }
        Ok::<(), anyhow::Error>(())
    }
    .await;
    bar.finish_and_clear();

    match outcome {
        Ok(()) => {
            if !cli.json && !cli.quiet {
                eprintln!("{} {} entries", "Done:".green().bold(), added);
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("{} {:#}", "error:".red().bold(), e);
            if added > 0 {
                eprintln!("{} entries were added before the failure", added);
            }
            std::process::exit(1);
        }
    }
}
