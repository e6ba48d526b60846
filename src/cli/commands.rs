//! CLI command definitions for stacforge.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use crate::catalog::{CatalogApi, GeoCatalogClient, StaticBearer};
use crate::config::ForgeConfig;
use crate::engine::{BlobFetcher, Environment, HttpFetcher, MemoryFetcher};
use crate::engine::validation::validate_template;
use crate::logsink::{LogSink, MemorySink, NdjsonSink};
use crate::orchestrator::{parse_run_info, Orchestrator, RunStatus};
use crate::retry::RetryPolicy;
use crate::server::{AppState, AzureStoreFactory, RunRegistry, StoreFactory};
use crate::source::SourceManager;

/// Template-driven STAC item generation pipeline.
#[derive(Parser)]
#[command(name = "stacforge")]
#[command(about = "Generate STAC items from templates over bulk geospatial data")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Serve the HTTP trigger surface.
    Serve(ServeArgs),

    /// Run one transformation to completion and print the report.
    Transform(TransformArgs),

    /// Check that a template compiles against the full function library.
    ValidateTemplate(ValidateTemplateArgs),
}

/// Arguments for `stacforge serve`.
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Listen address, overriding STACFORGE_LISTEN_ADDR.
    #[arg(long)]
    pub listen: Option<String>,
}

/// Arguments for `stacforge transform`.
#[derive(Parser, Debug)]
pub struct TransformArgs {
    /// Path to the trigger payload JSON file.
    #[arg(short, long)]
    pub payload: String,

    /// Print the full per-scene report as JSON.
    #[arg(short, long)]
    pub json: bool,
}

/// Arguments for `stacforge validate-template`.
#[derive(Parser, Debug)]
pub struct ValidateTemplateArgs {
    /// Path to the template file.
    pub template: String,
}

pub fn parse_cli() -> Cli {
    Cli::parse()
}

fn build_sink(config: &ForgeConfig) -> anyhow::Result<Arc<dyn LogSink>> {
    match &config.log_table_path {
        Some(path) => Ok(Arc::new(
            NdjsonSink::open(path.clone()).context("opening log table")?,
        )),
        None => Ok(Arc::new(MemorySink::new())),
    }
}

fn build_orchestrator(config: &ForgeConfig) -> anyhow::Result<Arc<Orchestrator>> {
    let bearer = StaticBearer::from_env().context("loading catalog credential")?;
    let catalog: Arc<dyn CatalogApi> = Arc::new(GeoCatalogClient::new(
        &config.catalog_url,
        &config.api_version,
        Box::new(bearer),
        RetryPolicy::new(config.retry_attempts, config.retry_wait),
    ));
    let sources = Arc::new(SourceManager::new(
        Arc::clone(&catalog),
        config.source_refresh_margin,
        config.sas_lifetime,
    ));
    let sink = build_sink(config)?;
    let fetcher: Arc<dyn BlobFetcher> =
        Arc::new(HttpFetcher::new(config.retry_attempts, config.retry_wait));
    Ok(Arc::new(Orchestrator::new(
        config.clone(),
        catalog,
        sources,
        sink,
        fetcher,
    )))
}

pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Serve(args) => serve(args).await,
        Commands::Transform(args) => transform(args).await,
        Commands::ValidateTemplate(args) => validate(args),
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let mut config = ForgeConfig::from_env().context("loading configuration")?;
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    let orchestrator = build_orchestrator(&config)?;
    let stores: Arc<dyn StoreFactory> = Arc::new(AzureStoreFactory::new(
        &config.storage_endpoint_suffix,
        config.storage_account_key.clone(),
        RetryPolicy::new(config.retry_attempts, config.retry_wait),
    ));
    let state = AppState::new(orchestrator, Arc::new(RunRegistry::new()), stores);
    crate::server::serve(&config.listen_addr, state)
        .await
        .context("serving trigger surface")
}

async fn transform(args: TransformArgs) -> anyhow::Result<()> {
    let config = ForgeConfig::from_env().context("loading configuration")?;
    let payload: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(&args.payload)
            .with_context(|| format!("reading payload '{}'", args.payload))?,
    )
    .context("parsing payload")?;
    let info = parse_run_info(&payload)?;

    let orchestrator = build_orchestrator(&config)?;
    let stores = AzureStoreFactory::new(
        &config.storage_endpoint_suffix,
        config.storage_account_key.clone(),
        RetryPolicy::new(config.retry_attempts, config.retry_wait),
    );
    let store = stores.store_for(
        &info.source_storage_account_name,
        &info.source_container_name,
    );

    let run_id = uuid::Uuid::new_v4().to_string();
    let (_cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);
    let report = orchestrator.run(&run_id, &info, store, cancel_rx).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        info!(
            run_id = %report.run_id,
            total = report.total,
            succeeded = report.succeeded,
            failed = report.failed,
            "transformation finished"
        );
        for (scene, outcome) in &report.outcomes {
            println!("{scene}: {outcome:?}");
        }
    }
    if report.status == RunStatus::Failed {
        anyhow::bail!(
            "{} of {} scenes failed",
            report.failed,
            report.total
        );
    }
    Ok(())
}

fn validate(args: ValidateTemplateArgs) -> anyhow::Result<()> {
    let source = std::fs::read_to_string(&args.template)
        .with_context(|| format!("reading template '{}'", args.template))?;
    // Validation never touches remote resources, so an empty in-memory
    // fetcher is enough to back the function library.
    let mut environment = Environment::new(Arc::new(MemoryFetcher::new()));
    let issues = validate_template(&mut environment, &source);
    if issues.is_empty() {
        println!("{}: ok", args.template);
        return Ok(());
    }
    for issue in &issues {
        eprintln!("{}: {:?}: {}", args.template, issue.kind, issue.message);
    }
    anyhow::bail!("template has {} issue(s)", issues.len());
}
