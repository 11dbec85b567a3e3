use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::PipelineConfig;
use crate::deploy::{DeploymentManager, HealthCheck, HealthCheckPolicy};
use crate::error::PipelineError;
use crate::locator::{self, DatasetArtifact, ResolvedWeights};
use crate::observability::{MetricsCollector, MetricsSnapshot};
use crate::runner::{LogSink, StageRunner, TracingSink};
use crate::service::ServiceController;
use crate::summary::{RunSummary, TrainingReport, log_summary};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Init,
    Exporting,
    ResolvingDataset,
    Training,
    ResolvingModel,
    Deploying,
    Summarizing,
    Done,
    Failed,
}

impl PipelineState {
    pub fn as_str(self) -> &'static str {
        match self {
            PipelineState::Init => "init",
            PipelineState::Exporting => "exporting",
            PipelineState::ResolvingDataset => "resolving_dataset",
            PipelineState::Training => "training",
            PipelineState::ResolvingModel => "resolving_model",
            PipelineState::Deploying => "deploying",
            PipelineState::Summarizing => "summarizing",
            PipelineState::Done => "done",
            PipelineState::Failed => "failed",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    flag: Arc<AtomicBool>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route SIGINT and SIGTERM into this flag.
    pub fn install_ctrlc(&self) -> Result<(), ctrlc::Error> {
        let flag = self.flag.clone();
        ctrlc::set_handler(move || {
            flag.store(true, Ordering::SeqCst);
        })
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct StageFailure {
    pub state: PipelineState,
    pub at: DateTime<Utc>,
    pub error: PipelineError,
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failed at {}: {}",
            self.state,
            self.at.to_rfc3339(),
            self.error
        )
    }
}

#[derive(Debug)]
pub struct PipelineReport {
    pub final_state: PipelineState,
    pub transitions: Vec<PipelineState>,
    pub summary: RunSummary,
    pub failure: Option<StageFailure>,
    pub metrics: MetricsSnapshot,
}

impl PipelineReport {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }

    pub fn exit_code(&self) -> i32 {
        if self.succeeded() { 0 } else { 1 }
    }

    pub fn visited(&self, state: PipelineState) -> bool {
        self.transitions.contains(&state)
    }
}

pub struct PipelineOrchestrator<'a> {
    config: &'a PipelineConfig,
    controller: &'a dyn ServiceController,
    sink: &'a dyn LogSink,
    runner: StageRunner,
    deployer: DeploymentManager,
    metrics: MetricsCollector,
    cancel: CancelFlag,
    log_path: Option<PathBuf>,
    state: PipelineState,
    transitions: Vec<PipelineState>,
}

impl<'a> PipelineOrchestrator<'a> {
    pub fn new(config: &'a PipelineConfig, controller: &'a dyn ServiceController) -> Self {
        let policy = HealthCheckPolicy {
            attempts: config.health_attempts,
            interval: config.health_interval,
        };
        Self {
            config,
            controller,
            sink: &TracingSink,
            runner: StageRunner::new(config.tail_lines),
            deployer: DeploymentManager::new(&config.backup_dir, policy),
            metrics: MetricsCollector::new(),
            cancel: CancelFlag::new(),
            log_path: None,
            state: PipelineState::Init,
            transitions: vec![PipelineState::Init],
        }
    }

    pub fn with_sink(mut self, sink: &'a dyn LogSink) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    pub fn run(mut self) -> PipelineReport {
        let started = Instant::now();
        info!(
            skip_export = self.config.skip_export,
            export_only = self.config.export_only,
            skip_deploy = self.config.skip_deploy,
            epochs = self.config.epochs,
            batch = self.config.batch_size,
            device = %self.config.device,
            at = %Utc::now().to_rfc3339(),
            "Pipeline started"
        );

        let mut summary = RunSummary {
            log_path: self.log_path.clone(),
            ..Default::default()
        };
        let outcome = self.drive(&mut summary);
        self.metrics.record_total_duration(started.elapsed());

        let failure = match outcome {
            Ok(()) => None,
            Err(err) => {
                let failed = StageFailure {
                    state: self.state,
                    at: Utc::now(),
                    error: err,
                };
                error!(
                    stage = failed.state.as_str(),
                    at = %failed.at.to_rfc3339(),
                    error = %failed.error,
                    "Pipeline failed"
                );
                for line in failed.error.tail() {
                    error!(target: "cutover::tool", stage = failed.state.as_str(), "{line}");
                }
                self.transition(PipelineState::Failed);
                Some(failed)
            }
        };

        let metrics = self.metrics.snapshot();
        summary.stage_timings_ms = metrics
            .stages
            .iter()
            .map(|(stage, m)| (stage.clone(), m.total_duration_ms))
            .collect();
        summary.halted_at = self.state.as_str().to_string();
        summary.success = failure.is_none();
        summary.failure = failure.as_ref().map(ToString::to_string);
        log_summary(&summary);

        PipelineReport {
            final_state: self.state,
            transitions: self.transitions,
            summary,
            failure,
            metrics,
        }
    }

    fn drive(&mut self, summary: &mut RunSummary) -> Result<(), PipelineError> {
        let datasets_before = if self.config.skip_export {
            info!("Export skipped; resuming against the most recent dataset");
            None
        } else {
            let before = self.stage(PipelineState::Exporting, |this| {
                let before =
                    locator::snapshot(&this.config.datasets_root, &this.config.dataset_prefix)?;
                this.export()?;
                Ok(before)
            })?;
            Some(before)
        };

        let dataset = self.stage(PipelineState::ResolvingDataset, |this| {
            let dataset = locator::find_dataset(
                &this.config.datasets_root,
                &this.config.dataset_prefix,
                &this.config.manifest_name,
            )?;
            if let Some(before) = &datasets_before {
                locator::ensure_produced(
                    "dataset",
                    &this.config.datasets_root,
                    &dataset.path,
                    before,
                )?;
            }
            Ok(dataset)
        })?;
        info!(dataset = %dataset.path.display(), "Dataset resolved");
        summary.dataset_used = Some(dataset.path.clone());

        if self.config.export_only {
            info!(dataset = %dataset.path.display(), "Export-only run finished");
            return Ok(());
        }

        let runs_before = self.stage(PipelineState::Training, |this| {
            let before = locator::snapshot(&this.config.runs_root, &this.config.run_prefix)?;
            this.train(&dataset)?;
            Ok(before)
        })?;

        let weights = self.stage(PipelineState::ResolvingModel, |this| {
            let weights = locator::find_weights(
                &this.config.runs_root,
                &this.config.run_prefix,
                &this.config.weights_extension,
            )?;
            locator::ensure_produced(
                "training run",
                &this.config.runs_root,
                &weights.run_dir,
                &runs_before,
            )?;
            Ok(weights)
        })?;
        info!(
            run = %weights.run_dir.display(),
            weights = %weights.path.display(),
            kind = weights.kind.as_str(),
            "Model resolved"
        );
        summary.model_produced = Some(weights.path.clone());
        if let Some(report) = TrainingReport::load(&weights.run_dir, &self.config.training_summary)
        {
            summary.apply_report(report);
        }

        if self.config.skip_deploy {
            info!(
                production = %self.config.production_model.display(),
                "Deploy skipped; production model untouched"
            );
        } else {
            self.stage(PipelineState::Deploying, |this| this.deploy(&weights, summary))?;
        }

        self.stage(PipelineState::Summarizing, |_| Ok(()))?;
        self.transition(PipelineState::Done);
        Ok(())
    }

    fn stage<T>(
        &mut self,
        next: PipelineState,
        body: impl FnOnce(&Self) -> Result<T, PipelineError>,
    ) -> Result<T, PipelineError> {
        if self.cancel.is_cancelled() {
            warn!(next = next.as_str(), "Interrupt received; stopping between stages");
            return Err(PipelineError::Cancelled {
                stage: next.as_str().to_string(),
            });
        }

        self.transition(next);
        let mut timer = self.metrics.start_stage(next.as_str());
        let started = Instant::now();
        info!(
            state = next.as_str(),
            phase = "start",
            at = %Utc::now().to_rfc3339(),
            "Stage started"
        );

        let result = body(self);

        let elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;
        match &result {
            Ok(_) => info!(
                state = next.as_str(),
                phase = "finish",
                outcome = "ok",
                elapsed_ms,
                at = %Utc::now().to_rfc3339(),
                "Stage finished"
            ),
            Err(_) => {
                timer.mark_failed();
                info!(
                    state = next.as_str(),
                    phase = "finish",
                    outcome = "error",
                    elapsed_ms,
                    at = %Utc::now().to_rfc3339(),
                    "Stage finished"
                );
            }
        }
        result
    }

    fn transition(&mut self, next: PipelineState) {
        info!(from = self.state.as_str(), to = next.as_str(), "State transition");
        self.state = next;
        self.transitions.push(next);
    }

    fn export(&self) -> Result<(), PipelineError> {
        self.runner
            .run(
                PipelineState::Exporting.as_str(),
                &self.config.export,
                &[],
                &self.config.project_root,
                self.sink,
            )?
            .check()?;
        Ok(())
    }

    fn train(&self, dataset: &DatasetArtifact) -> Result<(), PipelineError> {
        let args = self.config.training_args(&dataset.manifest);
        let outcome = self
            .runner
            .run(
                PipelineState::Training.as_str(),
                &self.config.train,
                &args,
                &self.config.project_root,
                self.sink,
            )?
            .check()?;
        info!(
            dataset = dataset.name().as_str(),
            elapsed_secs = outcome.elapsed.as_secs(),
            "Training finished"
        );
        Ok(())
    }

    fn deploy(
        &self,
        weights: &ResolvedWeights,
        summary: &mut RunSummary,
    ) -> Result<(), PipelineError> {
        let result =
            self.deployer
                .deploy(&weights.path, &self.config.production_model, self.controller)?;
        self.metrics.record_health_probes(result.health_attempts);

        summary.deployed = true;
        summary.health_check = Some(result.health);
        summary.health_attempts = Some(result.health_attempts);
        summary.backup_path = result.backup;
        summary.model_sha256 = Some(result.sha256);
        if result.health == HealthCheck::Timeout {
            warn!(
                production = %self.config.production_model.display(),
                "Deployment applied but health check timed out"
            );
        }
        Ok(())
    }
}
