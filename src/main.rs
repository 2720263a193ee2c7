//! transx - media sync, remote transcription/translation and catalog publishing
//!
//! Entry point: resolves the configuration, wires the AWS and Vimeo clients
//! into a [`Workflow`] and runs the requested command.

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::{Level, info, warn};
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use transx::aws::load_sdk_config;
use transx::catalog::{VideoHostApi, VimeoClient};
use transx::cli::{Args, Commands, ConfigAction};
use transx::config::Config;
use transx::jobs::transcribe::AwsTranscribe;
use transx::jobs::translate::AwsTranslate;
use transx::roles::IamRoles;
use transx::storage::S3ObjectStore;
use transx::sync::{SyncReport, SyncStatus};
use transx::workflow::{BatchReport, CleanReport, Services, StageOutcome, Stages, Workflow};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging(args.verbose)?;
    info!("Starting transx");

    let config = Config::resolve(args.config.as_deref(), &args.overrides())?;

    if let Commands::Config { action } = &args.command {
        return run_config(action, &config);
    }

    let workflow = Arc::new(build_workflow(config).await?.with_progress(!args.verbose));

    match args.command {
        Commands::Sync => {
            let report = workflow.sync().await?;
            print_sync(&report);
            ensure_ok(report.status())?;
        }
        Commands::Transcribe => finish(workflow.run(Stages::TRANSCRIBE).await?)?,
        Commands::Translate { .. } => finish(workflow.run(Stages::TRANSLATE).await?)?,
        Commands::Publish => finish(workflow.run(Stages::PUBLISH).await?)?,
        Commands::Run { .. } => finish(workflow.run(Stages::ALL).await?)?,
        Commands::Clean => print_clean(&workflow.clean().await?),
        Commands::Config { action } => run_config(&action, workflow.config())?,
    }

    info!("transx completed");
    Ok(())
}

async fn build_workflow(config: Config) -> Result<Workflow> {
    let sdk_config = load_sdk_config(&config.storage).await;

    let catalog: Option<Arc<dyn VideoHostApi>> = if config.catalog.is_configured() {
        Some(Arc::new(VimeoClient::new(&config.catalog)?))
    } else {
        warn!("Vimeo credentials not configured, publishing is disabled");
        None
    };

    let services = Services {
        store: Arc::new(S3ObjectStore::new(&sdk_config, &config.storage)),
        transcription: Arc::new(AwsTranscribe::new(&sdk_config)),
        translation: Arc::new(AwsTranslate::new(&sdk_config)),
        roles: Arc::new(IamRoles::new(&sdk_config)),
        catalog,
    };

    info!(
        "Using bucket {} as {} ({} workers)",
        config.storage.bucket, config.storage.identity, config.workflow.workers
    );
    Ok(Workflow::new(config, services))
}

fn run_config(action: &ConfigAction, config: &Config) -> Result<()> {
    match action {
        ConfigAction::Show => {
            print!("{}", toml::to_string_pretty(config)?);
        }
        ConfigAction::Init { output, force } => {
            if output.exists() && !force {
                anyhow::bail!("{} already exists, use --force to overwrite", output.display());
            }
            Config::default().save_to_file(output)?;
            println!("Wrote default configuration to {}", output.display());
        }
    }
    Ok(())
}

fn ensure_ok(status: &str) -> Result<()> {
    if status != "ok" {
        anyhow::bail!("completed with failures (status: {})", status);
    }
    Ok(())
}

fn finish(report: BatchReport) -> Result<()> {
    print_sync(&report.sync);
    print_batch(&report);
    ensure_ok(report.status())
}

fn print_sync(report: &SyncReport) {
    println!("\nSync to s3://{}:", report.bucket);
    println!("{:<10} {:<60}", "Status", "File");
    println!("{}", "-".repeat(72));
    for record in &report.records {
        let status = match record.status {
            SyncStatus::InSync => "in-sync",
            SyncStatus::Uploaded => "uploaded",
            SyncStatus::Failed => "failed",
        };
        println!("{:<10} {:<60}", status, record.file.relative);
        if let Some(failure) = &record.failure {
            println!("{:<10} {:?}", "", failure);
        }
    }
    println!(
        "{} uploaded, {} in sync, {} failed",
        report.count(SyncStatus::Uploaded),
        report.count(SyncStatus::InSync),
        report.count(SyncStatus::Failed)
    );
}

fn print_batch(report: &BatchReport) {
    if report.media.is_empty() {
        println!("\nNo media processed.");
        return;
    }

    let cell = |outcome: &Option<StageOutcome>| outcome.as_ref().map(StageOutcome::label).unwrap_or("-");

    println!("\n{:<50} {:<12} {:<12} {:<12}", "Media", "Transcribe", "Translate", "Publish");
    println!("{}", "-".repeat(88));
    for media in &report.media {
        println!(
            "{:<50} {:<12} {:<12} {:<12}",
            media.media,
            cell(&media.transcribe),
            cell(&media.translate),
            cell(&media.publish)
        );
        for outcome in [&media.transcribe, &media.translate, &media.publish].into_iter().flatten() {
            if let StageOutcome::Failed(message) = outcome {
                println!("  {}", message);
            }
        }
    }
    println!("Status: {}", report.status());
}

fn print_clean(report: &CleanReport) {
    for path in &report.local_removed {
        println!("Deleted {}", path.display());
    }
    println!(
        "Removed {} local files and {} remote objects",
        report.local_removed.len(),
        report.remote_deleted
    );
}

/// Setup logging to both console and file
fn setup_logging(verbose: bool) -> Result<()> {
    let log_dir = std::env::current_dir()?.join(".transx").join("log");
    std::fs::create_dir_all(&log_dir)?;

    // Daily rotation; the guard must outlive the program
    let file_appender = rolling::daily(&log_dir, "transx.log");
    let (non_blocking_file, guard) = non_blocking(file_appender);
    std::mem::forget(guard);

    let log_level = if verbose { Level::DEBUG } else { Level::INFO };

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let file_layer = fmt::layer()
        .with_writer(non_blocking_file)
        .with_target(false)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!("Logging initialized - console: {}, file: {}", log_level, log_dir.join("transx.log").display());

    Ok(())
}
