use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Serialize, Deserialize)]
pub struct DeployLock {
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
    pub production: String,
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("another deployment holds {} ({holder})", .path.display())]
    Held { path: PathBuf, holder: String },
    #[error("failed to create deploy lock {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug)]
pub struct DeployLockGuard {
    path: PathBuf,
}

impl DeployLockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DeployLockGuard {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(lock = %self.path.display(), "Deploy lock released"),
            Err(err) => warn!(lock = %self.path.display(), error = %err, "Failed to remove deploy lock"),
        }
    }
}

pub fn lock_path(production: &Path) -> PathBuf {
    let name = production
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "model".to_string());
    production.with_file_name(format!(".{name}.deploy.lock"))
}

pub fn acquire(production: &Path) -> Result<DeployLockGuard, LockError> {
    let path = lock_path(production);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|source| LockError::Io {
            path: path.clone(),
            source,
        })?;
    }

    let mut file = match create_exclusive(&path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::AlreadyExists => match read_holder(&path) {
            Some(holder) if !is_process_alive(holder.pid) => {
                warn!(
                    lock = %path.display(),
                    pid = holder.pid,
                    since = %holder.acquired_at.to_rfc3339(),
                    "Taking over deploy lock left by a dead process"
                );
                take_over(&path)?
            }
            holder => {
                return Err(LockError::Held {
                    holder: describe_holder(holder.as_ref()),
                    path,
                });
            }
        },
        Err(source) => return Err(LockError::Io { path, source }),
    };

    let lock = DeployLock {
        pid: std::process::id(),
        acquired_at: Utc::now(),
        production: production.to_string_lossy().to_string(),
    };
    let guard = DeployLockGuard { path };
    // The guard owns the file from here on, so a failed write still removes it.
    let rendered = serde_yaml::to_string(&lock).unwrap_or_default();
    file.write_all(rendered.as_bytes())
        .and_then(|()| file.sync_all())
        .map_err(|source| LockError::Io {
            path: guard.path.clone(),
            source,
        })?;

    debug!(lock = %guard.path.display(), pid = lock.pid, "Deploy lock acquired");
    Ok(guard)
}

fn create_exclusive(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().write(true).create_new(true).open(path)
}

/// Move the stale lock aside, then race for a fresh one. Losing the race to
/// another process reports the lock as held.
fn take_over(path: &Path) -> Result<File, LockError> {
    let mut stale = path.as_os_str().to_owned();
    stale.push(format!(".stale-{}", std::process::id()));
    let stale = PathBuf::from(stale);
    match fs::rename(path, &stale) {
        Ok(()) => {
            let _ = fs::remove_file(&stale);
        }
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(source) => {
            return Err(LockError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    }

    create_exclusive(path).map_err(|source| {
        if source.kind() == ErrorKind::AlreadyExists {
            LockError::Held {
                path: path.to_path_buf(),
                holder: describe_holder(read_holder(path).as_ref()),
            }
        } else {
            LockError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    })
}

fn read_holder(path: &Path) -> Option<DeployLock> {
    fs::read_to_string(path)
        .ok()
        .and_then(|content| serde_yaml::from_str::<DeployLock>(&content).ok())
}

fn is_process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return false;
        };
        // SAFETY: signal 0 only checks that the process exists.
        if unsafe { libc::kill(pid, 0) } == 0 {
            return true;
        }
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}

fn describe_holder(holder: Option<&DeployLock>) -> String {
    holder
        .map(|lock| format!("pid {} since {}", lock.pid, lock.acquired_at.to_rfc3339()))
        .unwrap_or_else(|| "unknown holder".to_string())
}
