use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use chrono::Local;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::digest::{compute_sha256, write_sidecar};
use crate::error::PipelineError;
use crate::lockfile;
use crate::service::ServiceController;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthCheckPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for HealthCheckPolicy {
    fn default() -> Self {
        Self {
            attempts: 30,
            interval: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthCheck {
    Healthy,
    Timeout,
    Skipped,
}

impl HealthCheck {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthCheck::Healthy => "healthy",
            HealthCheck::Timeout => "timeout",
            HealthCheck::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeployResult {
    pub installed: PathBuf,
    pub backup: Option<PathBuf>,
    pub sha256: String,
    pub health: HealthCheck,
    pub health_attempts: u32,
}

#[derive(Debug, Clone)]
pub struct DeploymentManager {
    backup_dir: PathBuf,
    policy: HealthCheckPolicy,
}

impl DeploymentManager {
    pub fn new(backup_dir: impl Into<PathBuf>, policy: HealthCheckPolicy) -> Self {
        Self {
            backup_dir: backup_dir.into(),
            policy,
        }
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Backup, install, rebuild, restart, health check. Stops at the first
    /// failure and never rolls back.
    pub fn deploy(
        &self,
        source: &Path,
        production: &Path,
        controller: &dyn ServiceController,
    ) -> Result<DeployResult, PipelineError> {
        if !source.is_file() {
            return Err(PipelineError::CopyFailed {
                source_path: source.to_path_buf(),
                production: production.to_path_buf(),
                reason: "source weight file does not exist".to_string(),
            });
        }

        let _lock = lockfile::acquire(production)?;

        let backup = if production.exists() {
            let backup = self.backup(production)?;
            info!(backup = %backup.display(), "Production model backed up");
            Some(backup)
        } else {
            info!(production = %production.display(), "No production model yet; skipping backup");
            None
        };

        let sha256 = install(source, production)?;
        info!(
            production = %production.display(),
            source = %source.display(),
            sha256 = sha256.as_str(),
            "New model installed"
        );

        controller
            .rebuild()
            .map_err(|err| PipelineError::ServiceControl {
                action: "rebuild",
                reason: format!("{err:#}"),
            })?;
        controller
            .restart()
            .map_err(|err| PipelineError::ServiceControl {
                action: "restart",
                reason: format!("{err:#}"),
            })?;

        let (health, health_attempts) = self.wait_healthy(controller);

        Ok(DeployResult {
            installed: production.to_path_buf(),
            backup,
            sha256,
            health,
            health_attempts,
        })
    }

    pub fn wait_healthy(&self, controller: &dyn ServiceController) -> (HealthCheck, u32) {
        for attempt in 1..=self.policy.attempts {
            match controller.probe() {
                Ok(()) => {
                    info!(attempt, "Service healthy");
                    return (HealthCheck::Healthy, attempt);
                }
                Err(err) => {
                    debug!(attempt, max = self.policy.attempts, error = %err, "Service not ready")
                }
            }
            if attempt < self.policy.attempts {
                thread::sleep(self.policy.interval);
            }
        }

        warn!(
            attempts = self.policy.attempts,
            "Health check timed out; the new model is live, inspect the service logs"
        );
        (HealthCheck::Timeout, self.policy.attempts)
    }

    fn backup(&self, production: &Path) -> Result<PathBuf, PipelineError> {
        let backup = next_backup_path(&self.backup_dir, production);
        let failed = |source: std::io::Error| PipelineError::BackupFailed {
            production: production.to_path_buf(),
            backup: backup.clone(),
            source,
        };

        fs::create_dir_all(&self.backup_dir).map_err(failed)?;
        fs::copy(production, &backup).map_err(failed)?;
        File::open(&backup)
            .and_then(|file| file.sync_all())
            .map_err(failed)?;

        let digest = compute_sha256(&backup).map_err(failed)?;
        if digest != compute_sha256(production).map_err(failed)? {
            return Err(failed(std::io::Error::other(
                "backup digest does not match production model",
            )));
        }
        write_sidecar(&backup, &digest).map_err(failed)?;
        Ok(backup)
    }
}

pub fn staging_path(production: &Path) -> PathBuf {
    let name = production
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "model".to_string());
    production.with_file_name(format!(".{name}.incoming-{}", std::process::id()))
}

pub fn next_backup_path(backup_dir: &Path, production: &Path) -> PathBuf {
    let stem = production
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "model".to_string());
    let extension = production
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let stamp = Local::now().format("%Y%m%d_%H%M%S");

    let mut candidate = backup_dir.join(format!("{stem}_{stamp}{extension}"));
    let mut counter = 1;
    while candidate.exists() {
        candidate = backup_dir.join(format!("{stem}_{stamp}_{counter}{extension}"));
        counter += 1;
    }
    candidate
}

fn install(source: &Path, production: &Path) -> Result<String, PipelineError> {
    let staging = staging_path(production);
    let failed = |reason: String| PipelineError::CopyFailed {
        source_path: source.to_path_buf(),
        production: production.to_path_buf(),
        reason,
    };

    let result = (|| -> Result<String, PipelineError> {
        if let Some(parent) = production.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .map_err(|err| failed(format!("cannot create {}: {err}", parent.display())))?;
        }
        let expected = compute_sha256(source)
            .map_err(|err| failed(format!("cannot hash source: {err}")))?;
        fs::copy(source, &staging)
            .map_err(|err| failed(format!("cannot write {}: {err}", staging.display())))?;
        File::open(&staging)
            .and_then(|file| file.sync_all())
            .map_err(|err| failed(format!("cannot sync {}: {err}", staging.display())))?;
        let actual = compute_sha256(&staging)
            .map_err(|err| failed(format!("cannot hash staged copy: {err}")))?;
        if actual != expected {
            return Err(failed(format!(
                "staged copy digest {actual} does not match source {expected}"
            )));
        }
        fs::rename(&staging, production)
            .map_err(|err| failed(format!("cannot rename into place: {err}")))?;
        Ok(expected)
    })();

    if result.is_err() && staging.is_file() {
        let _ = fs::remove_file(&staging);
    }
    result
}
