use std::path::PathBuf;

use thiserror::Error;

use crate::lockfile::LockError;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("stage '{stage}' exited with {}", describe_exit(.code))]
    StageFailed {
        stage: String,
        code: Option<i32>,
        tail: Vec<String>,
    },

    #[error("failed to launch '{program}' for stage '{stage}': {source}")]
    Spawn {
        stage: String,
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no {what} found under {}: {reason}", .root.display())]
    NotFound {
        what: &'static str,
        root: PathBuf,
        reason: String,
    },

    #[error("failed to back up {} to {}: {source}", .production.display(), .backup.display())]
    BackupFailed {
        production: PathBuf,
        backup: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to install {} as {}: {reason}", .source_path.display(), .production.display())]
    CopyFailed {
        source_path: PathBuf,
        production: PathBuf,
        reason: String,
    },

    #[error("service controller failed during {action}: {reason}")]
    ServiceControl { action: &'static str, reason: String },

    #[error(transparent)]
    DeployLocked(#[from] LockError),

    #[error("pipeline cancelled before {stage}")]
    Cancelled { stage: String },
}

impl PipelineError {
    pub fn tail(&self) -> &[String] {
        match self {
            PipelineError::StageFailed { tail, .. } => tail,
            _ => &[],
        }
    }
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "no exit code (terminated by signal)".to_string(),
    }
}
