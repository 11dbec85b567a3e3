use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::deploy::HealthCheck;

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct TrainingReport {
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default)]
    pub architecture: Option<String>,
    #[serde(default)]
    pub epochs_total: Option<u32>,
    #[serde(default)]
    pub model_size_mb: Option<f64>,
}

impl TrainingReport {
    /// `None` (with a warning) when the report is missing or malformed.
    pub fn load(run_dir: &Path, file_name: &str) -> Option<Self> {
        let path = run_dir.join(file_name);
        if !path.is_file() {
            warn!(report = %path.display(), "Training report not found; metrics unavailable");
            return None;
        }
        let parsed = File::open(&path)
            .map_err(anyhow::Error::from)
            .and_then(|file| serde_json::from_reader::<_, TrainingReport>(file).map_err(Into::into));
        match parsed {
            Ok(report) => Some(report),
            Err(err) => {
                warn!(report = %path.display(), error = %err, "Training report unreadable; metrics unavailable");
                None
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub dataset_used: Option<PathBuf>,
    pub model_produced: Option<PathBuf>,
    pub deployed: bool,
    pub metrics: Option<BTreeMap<String, f64>>,
    pub log_path: Option<PathBuf>,
    pub health_check: Option<HealthCheck>,
    pub health_attempts: Option<u32>,
    pub backup_path: Option<PathBuf>,
    pub model_sha256: Option<String>,
    pub architecture: Option<String>,
    pub epochs_total: Option<u32>,
    pub model_size_mb: Option<f64>,
    pub stage_timings_ms: BTreeMap<String, f64>,
    pub halted_at: String,
    pub success: bool,
    pub failure: Option<String>,
}

impl RunSummary {
    pub fn apply_report(&mut self, report: TrainingReport) {
        self.metrics = Some(report.metrics);
        self.architecture = report.architecture;
        self.epochs_total = report.epochs_total;
        self.model_size_mb = report.model_size_mb;
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create summary directory: {}", parent.display())
            })?;
        }
        let file = File::create(path)
            .with_context(|| format!("Failed to create summary file: {}", path.display()))?;
        serde_json::to_writer_pretty(file, self)
            .with_context(|| format!("Failed to write summary JSON: {}", path.display()))?;
        Ok(())
    }
}

pub fn log_summary(summary: &RunSummary) {
    info!(
        success = summary.success,
        halted_at = summary.halted_at.as_str(),
        dataset = ?summary.dataset_used,
        model = ?summary.model_produced,
        deployed = summary.deployed,
        health_check = summary.health_check.map(HealthCheck::as_str).unwrap_or("skipped"),
        backup = ?summary.backup_path,
        log = ?summary.log_path,
        "Pipeline summary"
    );
    if let Some(metrics) = &summary.metrics {
        for (name, value) in metrics {
            info!(metric = name.as_str(), value, "Training metric");
        }
    }
    if summary.health_check == Some(HealthCheck::Timeout) {
        warn!("Model deployed but the service never reported healthy; inspect the service logs");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn report_reads_metrics_and_model_facts() {
        let temp = tempdir().unwrap();
        std::fs::write(
            temp.path().join("training_summary.json"),
            r#"{
                "metrics": {"map50": 0.91, "map50_95": 0.67, "precision": 0.88, "recall": 0.85},
                "architecture": "yolov8s",
                "epochs_total": 120,
                "model_size_mb": 21.5
            }"#,
        )
        .unwrap();

        let report = TrainingReport::load(temp.path(), "training_summary.json").unwrap();
        assert_eq!(report.metrics.get("map50"), Some(&0.91));
        assert_eq!(report.metrics.len(), 4);
        assert_eq!(report.architecture.as_deref(), Some("yolov8s"));
        assert_eq!(report.epochs_total, Some(120));
    }

    #[test]
    fn malformed_report_yields_no_metrics() {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join("training_summary.json"), "{not json").unwrap();
        assert!(TrainingReport::load(temp.path(), "training_summary.json").is_none());
        assert!(TrainingReport::load(temp.path(), "absent.json").is_none());
    }

    #[test]
    fn summary_serializes_health_as_snake_case() {
        let temp = tempdir().unwrap();
        let summary = RunSummary {
            deployed: true,
            health_check: Some(HealthCheck::Timeout),
            halted_at: "done".into(),
            success: true,
            ..Default::default()
        };
        let path = temp.path().join("out/summary.json");
        summary.write_json(&path).unwrap();
        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["health_check"], "timeout");
        assert_eq!(value["deployed"], true);
    }
}
