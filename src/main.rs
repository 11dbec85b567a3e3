use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand};
use cutover::config::{Device, PipelineConfig, RunOverrides};
use cutover::locator::{find_dataset, find_weights};
use cutover::observability::{log_snapshot, open_run_log};
use cutover::orchestrator::{CancelFlag, PipelineOrchestrator};
use cutover::service::{ComposeController, NoService, ServiceController};
use cutover::validation::{ValidationReport, validate_config};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[cfg(feature = "otel")]
use opentelemetry::KeyValue;
#[cfg(feature = "otel")]
use opentelemetry_otlp::WithExportConfig;
#[cfg(feature = "otel")]
use opentelemetry_sdk::{resource::Resource, trace as sdktrace};

fn main() -> Result<()> {
    let Cli {
        config,
        command,
        run,
    } = Cli::parse();

    match command {
        Some(Commands::Validate) => {
            configure_tracing(None, None)?;
            let config = PipelineConfig::load(config.as_deref(), run.overrides()?)?;
            let report = validate_config(&config);
            report_validation(&report)?;
            info!("Pipeline configuration is valid");
            Ok(())
        }
        Some(Commands::Locate) => {
            configure_tracing(None, None)?;
            let config = PipelineConfig::load(config.as_deref(), run.overrides()?)?;
            locate(&config)
        }
        None => run_pipeline(config.as_deref(), run),
    }
}

fn run_pipeline(config_path: Option<&Path>, args: RunArgs) -> Result<()> {
    let config = PipelineConfig::load(config_path, args.overrides()?)?;
    let (log_path, log_file) = open_run_log(&config.log_dir)?;

    let otlp_endpoint = args.otlp_endpoint.clone();
    configure_tracing(otlp_endpoint.as_deref(), Some(log_file))?;
    info!(log = %log_path.display(), "Aggregate log opened");

    let report = validate_config(&config);
    report_validation(&report)?;

    let cancel = CancelFlag::new();
    cancel
        .install_ctrlc()
        .context("Failed to install interrupt handler")?;

    let compose = if config.skip_deploy || config.export_only {
        None
    } else {
        Some(ComposeController::new(&config.service, &config.project_root)?)
    };
    let controller: &dyn ServiceController = match &compose {
        Some(compose) => compose,
        None => &NoService,
    };
    let outcome = PipelineOrchestrator::new(&config, controller)
        .with_cancel(cancel)
        .with_log_path(&log_path)
        .run();

    if let Some(path) = &args.summary_json {
        outcome.summary.write_json(path)?;
        info!(summary = %path.display(), "Summary JSON written");
    }
    if args.print_metrics {
        log_snapshot(&outcome.metrics);
    }
    if let Some(path) = &args.metrics_prometheus {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create metrics directory: {}", parent.display())
            })?;
        }
        fs::write(path, outcome.metrics.to_prometheus())
            .with_context(|| format!("Failed to write Prometheus metrics: {}", path.display()))?;
        info!(metrics = %path.display(), "Prometheus metrics written");
    }

    #[cfg(feature = "otel")]
    if otlp_endpoint.is_some() {
        opentelemetry::global::shutdown_tracer_provider();
    }

    match outcome.failure {
        None => Ok(()),
        Some(failure) => Err(anyhow!(failure.to_string())),
    }
}

fn locate(config: &PipelineConfig) -> Result<()> {
    let dataset = find_dataset(
        &config.datasets_root,
        &config.dataset_prefix,
        &config.manifest_name,
    );
    let weights = find_weights(
        &config.runs_root,
        &config.run_prefix,
        &config.weights_extension,
    );

    match &dataset {
        Ok(dataset) => println!("dataset: {}", dataset.path.display()),
        Err(err) => println!("dataset: <none> ({err})"),
    }
    match &weights {
        Ok(weights) => println!(
            "weights: {} ({})",
            weights.path.display(),
            weights.kind.as_str()
        ),
        Err(err) => println!("weights: <none> ({err})"),
    }
    println!("production: {}", config.production_model.display());

    if dataset.is_err() && weights.is_err() {
        bail!("No usable artifacts found");
    }
    Ok(())
}

fn report_validation(report: &ValidationReport) -> Result<()> {
    for warning in &report.warnings {
        warn!("{warning}");
    }
    if report.is_ok() {
        return Ok(());
    }
    for error_msg in &report.errors {
        error!("{error_msg}");
    }
    Err(anyhow!(
        "Configuration validation failed with {} error(s)",
        report.errors.len()
    ))
}

fn configure_tracing(otlp_endpoint: Option<&str>, log_file: Option<File>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let file_layer = log_file.map(|file| {
        fmt::layer()
            .with_ansi(false)
            .with_writer(Mutex::new(file))
    });

    #[cfg(feature = "otel")]
    {
        if let Some(endpoint) = otlp_endpoint {
            let tracer =
                opentelemetry_otlp::new_pipeline()
                    .tracing()
                    .with_trace_config(sdktrace::Config::default().with_resource(Resource::new(
                        vec![KeyValue::new("service.name", "cutover")],
                    )))
                    .with_exporter(
                        opentelemetry_otlp::new_exporter()
                            .tonic()
                            .with_endpoint(endpoint),
                    )
                    .install_simple()?;

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .with(file_layer)
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .try_init()
                .map_err(|err| anyhow!(err.to_string()))?;
            return Ok(());
        }
    }

    #[cfg(not(feature = "otel"))]
    if let Some(endpoint) = otlp_endpoint {
        eprintln!(
            "warning: --otlp-endpoint '{}' requested but OpenTelemetry support is not enabled. Rebuild with --features otel.",
            endpoint
        );
    }

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .try_init()
        .map_err(|err| anyhow!(err.to_string()))?;

    Ok(())
}

#[derive(Parser)]
#[command(
    name = "cutover",
    version,
    about = "Export a dataset, train a model and promote it to production"
)]
struct Cli {
    #[arg(long, global = true, help = "Pipeline configuration (YAML)")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
    #[command(flatten)]
    run: RunArgs,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Check the configuration without running anything")]
    Validate,
    #[command(about = "Print the dataset and weights the next run would use")]
    Locate,
}

#[derive(Args)]
struct RunArgs {
    #[arg(long, conflicts_with = "skip_export", help = "Stop once the dataset is exported")]
    export_only: bool,
    #[arg(long, help = "Reuse the most recent existing dataset")]
    skip_export: bool,
    #[arg(long, help = "Train but leave the production model untouched")]
    skip_deploy: bool,
    #[arg(long)]
    epochs: Option<u32>,
    #[arg(long = "batch")]
    batch: Option<u32>,
    #[arg(long, help = "cpu or a GPU index")]
    device: Option<Device>,
    #[arg(long = "project-root")]
    project_root: Option<PathBuf>,
    #[arg(long = "log-dir")]
    log_dir: Option<PathBuf>,
    #[arg(long = "health-attempts")]
    health_attempts: Option<u32>,
    #[arg(long = "health-interval-secs")]
    health_interval_secs: Option<u64>,
    #[arg(long = "summary-json")]
    summary_json: Option<PathBuf>,
    #[arg(long = "metrics-prometheus")]
    metrics_prometheus: Option<PathBuf>,
    #[arg(long)]
    print_metrics: bool,
    #[arg(long = "otlp-endpoint")]
    otlp_endpoint: Option<String>,
}

impl RunArgs {
    fn overrides(&self) -> Result<RunOverrides> {
        let cwd = std::env::current_dir().context("Failed to determine current directory")?;
        let from_cwd = |path: &PathBuf| {
            if path.is_absolute() {
                path.clone()
            } else {
                cwd.join(path)
            }
        };
        Ok(RunOverrides {
            skip_export: self.skip_export,
            export_only: self.export_only,
            skip_deploy: self.skip_deploy,
            epochs: self.epochs,
            batch_size: self.batch,
            device: self.device,
            project_root: self.project_root.as_ref().map(from_cwd),
            log_dir: self.log_dir.as_ref().map(from_cwd),
            health_attempts: self.health_attempts,
            health_interval_secs: self.health_interval_secs,
        })
    }
}
