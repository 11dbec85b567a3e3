use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "DeviceRepr", into = "String")]
pub enum Device {
    Cpu,
    Gpu(u32),
}

impl Default for Device {
    fn default() -> Self {
        Device::Gpu(0)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Gpu(id) => write!(f, "{id}"),
        }
    }
}

impl FromStr for Device {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        if normalized == "cpu" {
            return Ok(Device::Cpu);
        }
        let id = normalized
            .strip_prefix("cuda:")
            .or_else(|| normalized.strip_prefix("gpu"))
            .unwrap_or(&normalized);
        id.parse::<u32>()
            .map(Device::Gpu)
            .map_err(|_| format!("invalid device '{s}': expected 'cpu' or a GPU index"))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DeviceRepr {
    Index(u32),
    Name(String),
}

impl TryFrom<DeviceRepr> for Device {
    type Error = String;

    fn try_from(value: DeviceRepr) -> Result<Self, Self::Error> {
        match value {
            DeviceRepr::Index(id) => Ok(Device::Gpu(id)),
            DeviceRepr::Name(name) => name.parse(),
        }
    }
}

impl From<Device> for String {
    fn from(value: Device) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ToolCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ServiceSpec {
    #[serde(default = "default_compose_file")]
    pub compose_file: PathBuf,
    #[serde(default = "default_service_name")]
    pub name: String,
    #[serde(default = "default_health_url")]
    pub health_url: String,
}

impl Default for ServiceSpec {
    fn default() -> Self {
        Self {
            compose_file: default_compose_file(),
            name: default_service_name(),
            health_url: default_health_url(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct HealthCheckSpec {
    #[serde(default = "default_health_attempts")]
    pub attempts: u32,
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,
}

impl Default for HealthCheckSpec {
    fn default() -> Self {
        Self {
            attempts: default_health_attempts(),
            interval_secs: default_health_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineFile {
    #[serde(default)]
    pub project_root: Option<PathBuf>,
    #[serde(default = "default_datasets_root")]
    pub datasets_root: PathBuf,
    #[serde(default = "default_runs_root")]
    pub runs_root: PathBuf,
    #[serde(default = "default_production_model")]
    pub production_model: PathBuf,
    #[serde(default)]
    pub backup_dir: Option<PathBuf>,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default = "default_dataset_prefix")]
    pub dataset_prefix: String,
    #[serde(default = "default_run_prefix")]
    pub run_prefix: String,
    #[serde(default = "default_manifest_name")]
    pub manifest_name: String,
    #[serde(default = "default_weights_extension")]
    pub weights_extension: String,
    #[serde(default = "default_training_summary")]
    pub training_summary: String,
    #[serde(default = "default_export_command")]
    pub export: ToolCommand,
    #[serde(default = "default_train_command")]
    pub train: ToolCommand,
    #[serde(default)]
    pub service: ServiceSpec,
    #[serde(default)]
    pub health_check: HealthCheckSpec,
    #[serde(default = "default_epochs")]
    pub epochs: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default)]
    pub device: Device,
    #[serde(default = "default_tail_lines")]
    pub tail_lines: usize,
}

impl Default for PipelineFile {
    fn default() -> Self {
        Self {
            project_root: None,
            datasets_root: default_datasets_root(),
            runs_root: default_runs_root(),
            production_model: default_production_model(),
            backup_dir: None,
            log_dir: default_log_dir(),
            dataset_prefix: default_dataset_prefix(),
            run_prefix: default_run_prefix(),
            manifest_name: default_manifest_name(),
            weights_extension: default_weights_extension(),
            training_summary: default_training_summary(),
            export: default_export_command(),
            train: default_train_command(),
            service: ServiceSpec::default(),
            health_check: HealthCheckSpec::default(),
            epochs: default_epochs(),
            batch_size: default_batch_size(),
            device: Device::default(),
            tail_lines: default_tail_lines(),
        }
    }
}

impl PipelineFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline config: {}", path.display()))?;
        let file: PipelineFile = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse pipeline config YAML: {}", path.display()))?;
        Ok(file)
    }
}

/// Command-line values layered over the file. `None` keeps the file value.
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub skip_export: bool,
    pub export_only: bool,
    pub skip_deploy: bool,
    pub epochs: Option<u32>,
    pub batch_size: Option<u32>,
    pub device: Option<Device>,
    pub project_root: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub health_attempts: Option<u32>,
    pub health_interval_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub skip_export: bool,
    pub export_only: bool,
    pub skip_deploy: bool,
    pub epochs: u32,
    pub batch_size: u32,
    pub device: Device,
    pub project_root: PathBuf,
    pub datasets_root: PathBuf,
    pub runs_root: PathBuf,
    pub production_model: PathBuf,
    pub backup_dir: PathBuf,
    pub log_dir: PathBuf,
    pub dataset_prefix: String,
    pub run_prefix: String,
    pub manifest_name: String,
    pub weights_extension: String,
    pub training_summary: String,
    pub export: ToolCommand,
    pub train: ToolCommand,
    pub service: ServiceSpec,
    pub health_attempts: u32,
    pub health_interval: Duration,
    pub tail_lines: usize,
}

impl PipelineConfig {
    pub fn load(path: Option<&Path>, overrides: RunOverrides) -> Result<Self> {
        let file = match path {
            Some(path) => PipelineFile::load(path)?,
            None => PipelineFile::default(),
        };
        let cwd = std::env::current_dir().context("Failed to determine current directory")?;
        let base = match path.and_then(Path::parent) {
            Some(parent) if !parent.as_os_str().is_empty() => absolutize(&cwd, parent.to_path_buf()),
            _ => cwd,
        };
        Self::resolve(file, overrides, &base)
    }

    /// Build the configuration from an already parsed file. Relative paths in
    /// the file resolve against `project_root`, which itself resolves against `base`.
    pub fn resolve(file: PipelineFile, overrides: RunOverrides, base: &Path) -> Result<Self> {
        let project_root = overrides
            .project_root
            .or(file.project_root)
            .map(|root| absolutize(base, root))
            .unwrap_or_else(|| base.to_path_buf());

        if file.weights_extension.trim().is_empty() {
            bail!("weights_extension cannot be empty");
        }

        let production_model = absolutize(&project_root, file.production_model);
        let backup_dir = match file.backup_dir {
            Some(dir) => absolutize(&project_root, dir),
            None => production_model
                .parent()
                .map(|p| p.join("backups"))
                .unwrap_or_else(|| project_root.join("backups")),
        };

        let mut service = file.service;
        service.compose_file = absolutize(&project_root, service.compose_file);

        Ok(Self {
            skip_export: overrides.skip_export,
            export_only: overrides.export_only,
            skip_deploy: overrides.skip_deploy,
            epochs: overrides.epochs.unwrap_or(file.epochs),
            batch_size: overrides.batch_size.unwrap_or(file.batch_size),
            device: overrides.device.unwrap_or(file.device),
            datasets_root: absolutize(&project_root, file.datasets_root),
            runs_root: absolutize(&project_root, file.runs_root),
            log_dir: absolutize(&project_root, overrides.log_dir.unwrap_or(file.log_dir)),
            production_model,
            backup_dir,
            dataset_prefix: file.dataset_prefix,
            run_prefix: file.run_prefix,
            manifest_name: file.manifest_name,
            weights_extension: file
                .weights_extension
                .trim()
                .trim_start_matches('.')
                .to_string(),
            training_summary: file.training_summary,
            export: file.export,
            train: file.train,
            service,
            health_attempts: overrides
                .health_attempts
                .unwrap_or(file.health_check.attempts),
            health_interval: Duration::from_secs(
                overrides
                    .health_interval_secs
                    .unwrap_or(file.health_check.interval_secs),
            ),
            tail_lines: file.tail_lines,
            project_root,
        })
    }

    pub fn training_args(&self, manifest: &Path) -> Vec<String> {
        vec![
            "--data".to_string(),
            manifest.to_string_lossy().to_string(),
            "--output".to_string(),
            self.runs_root.to_string_lossy().to_string(),
            "--epochs".to_string(),
            self.epochs.to_string(),
            "--batch".to_string(),
            self.batch_size.to_string(),
            "--device".to_string(),
            self.device.to_string(),
        ]
    }
}

fn absolutize(base: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

fn default_datasets_root() -> PathBuf {
    PathBuf::from("datasets")
}

fn default_runs_root() -> PathBuf {
    PathBuf::from("runs")
}

fn default_production_model() -> PathBuf {
    PathBuf::from("models/production/model.pt")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_dataset_prefix() -> String {
    "v2.0_".to_string()
}

fn default_run_prefix() -> String {
    "deer_v2".to_string()
}

fn default_manifest_name() -> String {
    "data.yaml".to_string()
}

fn default_weights_extension() -> String {
    "pt".to_string()
}

fn default_training_summary() -> String {
    "training_summary.json".to_string()
}

fn default_export_command() -> ToolCommand {
    ToolCommand::new("python", &["scripts/export_dataset.py"])
}

fn default_train_command() -> ToolCommand {
    ToolCommand::new("python", &["scripts/train.py"])
}

fn default_compose_file() -> PathBuf {
    PathBuf::from("docker-compose.yml")
}

fn default_service_name() -> String {
    "inference".to_string()
}

fn default_health_url() -> String {
    "http://127.0.0.1:8000/health".to_string()
}

fn default_health_attempts() -> u32 {
    30
}

fn default_health_interval() -> u64 {
    2
}

fn default_epochs() -> u32 {
    100
}

fn default_batch_size() -> u32 {
    16
}

fn default_tail_lines() -> usize {
    20
}
