use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Local;
use serde::Serialize;
use tracing::{debug, info};

#[derive(Debug, Default, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub stages: BTreeMap<String, StageMetrics>,
    pub total_duration_ms: f64,
    pub health_probes: u64,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct StageMetrics {
    pub calls: u64,
    pub failures: u64,
    pub total_duration_ms: f64,
    pub max_duration_ms: f64,
}

impl StageMetrics {
    fn observe(&mut self, elapsed: Duration, failed: bool) {
        let elapsed_ms = elapsed.as_secs_f64() * 1_000.0;
        self.calls += 1;
        self.total_duration_ms += elapsed_ms;
        self.max_duration_ms = self.max_duration_ms.max(elapsed_ms);
        if failed {
            self.failures += 1;
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct MetricsCollector {
    state: Arc<Mutex<MetricsSnapshot>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_stage(&self, stage: &str) -> StageTimer {
        StageTimer {
            stage: stage.to_string(),
            started: Instant::now(),
            failed: false,
            state: Arc::clone(&self.state),
        }
    }

    pub fn record_total_duration(&self, duration: Duration) {
        self.with_state(|state| state.total_duration_ms = duration.as_secs_f64() * 1_000.0);
    }

    pub fn record_health_probes(&self, probes: u32) {
        self.with_state(|state| state.health_probes += u64::from(probes));
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.with_state(|state| state.clone())
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MetricsSnapshot) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }
}

pub struct StageTimer {
    stage: String,
    started: Instant,
    failed: bool,
    state: Arc<Mutex<MetricsSnapshot>>,
}

impl StageTimer {
    pub fn mark_failed(&mut self) {
        self.failed = true;
    }
}

impl Drop for StageTimer {
    fn drop(&mut self) {
        let elapsed = self.started.elapsed();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .stages
            .entry(self.stage.clone())
            .or_default()
            .observe(elapsed, self.failed);
        debug!(
            stage = self.stage.as_str(),
            elapsed_ms = elapsed.as_secs_f64() * 1_000.0,
            failed = self.failed,
            "Stage timing recorded"
        );
    }
}

pub fn log_snapshot(snapshot: &MetricsSnapshot) {
    info!(
        total_ms = snapshot.total_duration_ms,
        stages = snapshot.stages.len(),
        health_probes = snapshot.health_probes,
        "Run metrics"
    );
    for (stage, metrics) in &snapshot.stages {
        info!(
            stage = stage.as_str(),
            calls = metrics.calls,
            failures = metrics.failures,
            total_ms = metrics.total_duration_ms,
            max_ms = metrics.max_duration_ms,
            "Stage metrics"
        );
    }
}

impl MetricsSnapshot {
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();
        let per_stage: [(&str, &str, &str, fn(&StageMetrics) -> String); 3] = [
            ("stage_calls_total", "counter", "Stage invocation count", |m| {
                m.calls.to_string()
            }),
            ("stage_failures_total", "counter", "Stage failure count", |m| {
                m.failures.to_string()
            }),
            (
                "stage_duration_seconds_total",
                "counter",
                "Accumulated stage duration in seconds",
                |m| format!("{:.6}", m.total_duration_ms / 1_000.0),
            ),
        ];
        for (name, kind, help, value) in per_stage {
            let _ = writeln!(out, "# HELP cutover_{name} {help}");
            let _ = writeln!(out, "# TYPE cutover_{name} {kind}");
            for (stage, metrics) in &self.stages {
                let _ = writeln!(out, "cutover_{name}{{stage=\"{stage}\"}} {}", value(metrics));
            }
        }

        let _ = writeln!(out, "# HELP cutover_health_probes_total Health probes issued after deploy");
        let _ = writeln!(out, "# TYPE cutover_health_probes_total counter");
        let _ = writeln!(out, "cutover_health_probes_total {}", self.health_probes);
        let _ = writeln!(out, "# HELP cutover_pipeline_duration_seconds Total pipeline duration");
        let _ = writeln!(out, "# TYPE cutover_pipeline_duration_seconds gauge");
        let _ = writeln!(
            out,
            "cutover_pipeline_duration_seconds {:.6}",
            self.total_duration_ms / 1_000.0
        );
        out
    }
}

pub fn open_run_log(log_dir: &Path) -> Result<(PathBuf, File)> {
    fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory: {}", log_dir.display()))?;
    let path = log_dir.join(format!(
        "pipeline_{}.log",
        Local::now().format("%Y%m%d_%H%M%S")
    ));
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open pipeline log: {}", path.display()))?;
    Ok((path, file))
}
