use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use coh_sync::{report_recent_runs, HarvestConfig, HarvestPipeline};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "coh-cli")]
#[command(about = "Contract opportunity harvester command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one harvest (the default command).
    Harvest(HarvestArgs),
    /// Summarize the most recent run reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
        #[arg(long)]
        reports_dir: Option<PathBuf>,
    },
}

/// Flags override the filter file, which overrides environment variables.
#[derive(Debug, Default, Args)]
struct HarvestArgs {
    /// YAML filter file (camelCase keys).
    #[arg(long)]
    filters: Option<PathBuf>,
    #[arg(long)]
    keywords: Option<String>,
    #[arg(long, value_delimiter = ',')]
    naics: Vec<String>,
    #[arg(long = "set-aside", value_delimiter = ',')]
    set_asides: Vec<String>,
    #[arg(long = "state", value_delimiter = ',')]
    states: Vec<String>,
    #[arg(long = "opp-type", value_delimiter = ',')]
    opp_types: Vec<String>,
    /// 0 disables the lookback filter.
    #[arg(long)]
    posted_within_days: Option<u32>,
    #[arg(long)]
    max_opportunities: Option<usize>,
    #[arg(long)]
    workers: Option<usize>,
    #[arg(long)]
    no_download: bool,
    #[arg(long)]
    extract_text: bool,
    #[arg(long)]
    storage_dir: Option<PathBuf>,
    #[arg(long)]
    dataset: Option<PathBuf>,
    #[arg(long)]
    reports_dir: Option<PathBuf>,
}

impl HarvestArgs {
    fn into_config(self) -> Result<HarvestConfig> {
        let mut config = HarvestConfig::from_env();
        if let Some(path) = self.filters.or_else(|| config.filters_file.clone()) {
            config.apply_filters_file(&path)?;
        }

        let filters = &mut config.filters;
        if let Some(keywords) = self.keywords {
            filters.keywords = Some(keywords);
        }
        if !self.naics.is_empty() {
            filters.naics_codes = self.naics;
        }
        if !self.set_asides.is_empty() {
            filters.set_aside_types = self.set_asides;
        }
        if !self.states.is_empty() {
            filters.states = self.states;
        }
        if !self.opp_types.is_empty() {
            filters.opportunity_types = self.opp_types;
        }
        if let Some(days) = self.posted_within_days {
            filters.posted_within_days = (days > 0).then_some(days);
        }

        if let Some(max) = self.max_opportunities {
            config.max_opportunities = max;
        }
        if let Some(workers) = self.workers {
            config.workers = workers.max(1);
        }
        if self.no_download {
            config.download_attachments = false;
        }
        if self.extract_text {
            config.extract_text = true;
        }
        if let Some(dir) = self.storage_dir {
            config.storage_dir = dir;
        }
        if let Some(path) = self.dataset {
            config.dataset_path = path;
        }
        if let Some(dir) = self.reports_dir {
            config.reports_dir = Some(dir);
        }
        config.http.rate_limit.jitter = config.workers > 1;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli
        .command
        .unwrap_or_else(|| Commands::Harvest(HarvestArgs::default()))
    {
        Commands::Harvest(args) => harvest(args).await?,
        Commands::Report { runs, reports_dir } => {
            let root = reports_dir
                .or_else(|| HarvestConfig::from_env().reports_dir)
                .unwrap_or_else(|| PathBuf::from("./reports"));
            println!("{}", report_recent_runs(&root, runs)?);
        }
    }

    Ok(())
}

async fn harvest(args: HarvestArgs) -> Result<()> {
    let config = args.into_config()?;
    if config.http.api_key.is_none() {
        info!("SAM_API_KEY not set; using the public endpoints without a key");
    }
    let pipeline = HarvestPipeline::from_config(config).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let summary = pipeline.run(shutdown_rx).await?;
    println!(
        "harvest complete: run_id={} exported={} failed={} attachments_downloaded={} attachments_failed={} reports={}",
        summary.run_id,
        summary.exported(),
        summary.tally.opportunities_failed,
        summary.tally.attachments_downloaded,
        summary.tally.attachments_failed,
        summary.reports_dir.as_deref().unwrap_or("-"),
    );

    if summary.is_aborted() {
        bail!(
            "search failed: {}",
            summary.search_error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

/// Resolves on SIGINT or SIGTERM; in-flight opportunities still finish.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "could not listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "could not listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received SIGINT; finishing in-flight opportunities"),
        () = terminate => info!("received SIGTERM; finishing in-flight opportunities"),
    }
}
