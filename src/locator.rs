use std::cmp::Ordering;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use glob::{Pattern, glob};
use tracing::{debug, warn};

use crate::error::PipelineError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub path: PathBuf,
    pub modified: SystemTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetArtifact {
    pub path: PathBuf,
    pub manifest: PathBuf,
    pub modified: SystemTime,
}

impl DatasetArtifact {
    pub fn name(&self) -> String {
        file_name(&self.path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightKind {
    Best,
    Last,
}

impl WeightKind {
    pub fn as_str(self) -> &'static str {
        match self {
            WeightKind::Best => "best",
            WeightKind::Last => "last",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedWeights {
    pub run_dir: PathBuf,
    pub path: PathBuf,
    pub kind: WeightKind,
}

pub fn order_candidates(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| match b.modified.cmp(&a.modified) {
        Ordering::Equal => b.path.cmp(&a.path),
        other => other,
    });
}

pub fn list_candidates(root: &Path, prefix: &str) -> Result<Vec<Candidate>, PipelineError> {
    if !root.is_dir() {
        return Err(PipelineError::NotFound {
            what: "directory",
            root: root.to_path_buf(),
            reason: "root directory does not exist".to_string(),
        });
    }

    let pattern = format!(
        "{}/{}*",
        Pattern::escape(&root.to_string_lossy()),
        Pattern::escape(prefix)
    );
    let entries = glob(&pattern).map_err(|err| PipelineError::NotFound {
        what: "directory",
        root: root.to_path_buf(),
        reason: format!("invalid search pattern '{pattern}': {err}"),
    })?;

    let mut candidates = Vec::new();
    for entry in entries {
        let path = match entry {
            Ok(path) => path,
            Err(err) => {
                warn!(error = %err, "Skipping unreadable candidate");
                continue;
            }
        };
        let metadata = match fs::metadata(&path) {
            Ok(metadata) if metadata.is_dir() => metadata,
            Ok(_) => continue,
            Err(err) => {
                warn!(candidate = %path.display(), error = %err, "Skipping candidate without metadata");
                continue;
            }
        };
        let modified = metadata
            .modified()
            .or_else(|_| metadata.created())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        candidates.push(Candidate { path, modified });
    }

    order_candidates(&mut candidates);
    Ok(candidates)
}

pub fn snapshot(root: &Path, prefix: &str) -> Result<HashSet<PathBuf>, PipelineError> {
    if !root.exists() {
        return Ok(HashSet::new());
    }
    Ok(list_candidates(root, prefix)?
        .into_iter()
        .map(|candidate| candidate.path)
        .collect())
}

/// Reject `resolved` when it was already on disk before the producing stage ran.
pub fn ensure_produced(
    what: &'static str,
    root: &Path,
    resolved: &Path,
    before: &HashSet<PathBuf>,
) -> Result<(), PipelineError> {
    if before.contains(resolved) {
        return Err(PipelineError::NotFound {
            what,
            root: root.to_path_buf(),
            reason: format!(
                "stage produced no new {what}; newest is the pre-existing {}",
                file_name(resolved)
            ),
        });
    }
    Ok(())
}

pub fn find_latest(root: &Path, prefix: &str) -> Result<PathBuf, PipelineError> {
    list_candidates(root, prefix)?
        .into_iter()
        .next()
        .map(|candidate| candidate.path)
        .ok_or_else(|| PipelineError::NotFound {
            what: "directory",
            root: root.to_path_buf(),
            reason: format!("no entry matches '{prefix}*'"),
        })
}

pub fn find_dataset(
    root: &Path,
    prefix: &str,
    manifest_name: &str,
) -> Result<DatasetArtifact, PipelineError> {
    let candidates = list_candidates(root, prefix)?;
    let total = candidates.len();
    for candidate in candidates {
        let manifest = candidate.path.join(manifest_name);
        if manifest.is_file() {
            debug!(dataset = %candidate.path.display(), "Dataset candidate accepted");
            return Ok(DatasetArtifact {
                path: candidate.path,
                manifest,
                modified: candidate.modified,
            });
        }
        warn!(
            dataset = %candidate.path.display(),
            manifest = manifest_name,
            "Skipping dataset without manifest"
        );
    }

    Err(PipelineError::NotFound {
        what: "dataset",
        root: root.to_path_buf(),
        reason: if total == 0 {
            format!("no directory matches '{prefix}*'")
        } else {
            format!("none of {total} candidate(s) contains {manifest_name}")
        },
    })
}

/// `best` over `last`, from the newest run only.
pub fn find_weights(
    runs_root: &Path,
    run_prefix: &str,
    extension: &str,
) -> Result<ResolvedWeights, PipelineError> {
    let run_dir = find_latest(runs_root, run_prefix).map_err(|err| match err {
        PipelineError::NotFound { reason, .. } => PipelineError::NotFound {
            what: "training run",
            root: runs_root.to_path_buf(),
            reason,
        },
        other => other,
    })?;

    let weights_dir = run_dir.join("weights");
    for kind in [WeightKind::Best, WeightKind::Last] {
        let path = weights_dir.join(format!("{}.{}", kind.as_str(), extension));
        if path.is_file() {
            return Ok(ResolvedWeights { run_dir, path, kind });
        }
    }

    Err(PipelineError::NotFound {
        what: "weight file",
        root: runs_root.to_path_buf(),
        reason: format!(
            "latest run {} has neither best.{extension} nor last.{extension}",
            file_name(&run_dir)
        ),
    })
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::Duration;
    use tempfile::tempdir;

    fn at(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn touch_dir(path: &Path, modified: SystemTime) {
        File::open(path).unwrap().set_modified(modified).unwrap();
    }

    #[test]
    fn ordering_prefers_recency_over_name() {
        let mut candidates = vec![
            Candidate {
                path: PathBuf::from("/d/v2.0_20260301"),
                modified: at(100),
            },
            Candidate {
                path: PathBuf::from("/d/v2.0_20251231"),
                modified: at(200),
            },
        ];
        order_candidates(&mut candidates);
        assert_eq!(candidates[0].path, PathBuf::from("/d/v2.0_20251231"));
    }

    #[test]
    fn ordering_breaks_ties_by_path() {
        let mut candidates = vec![
            Candidate {
                path: PathBuf::from("/d/v2.0_a"),
                modified: at(5),
            },
            Candidate {
                path: PathBuf::from("/d/v2.0_b"),
                modified: at(5),
            },
        ];
        order_candidates(&mut candidates);
        assert_eq!(candidates[0].path, PathBuf::from("/d/v2.0_b"));
    }

    #[test]
    fn find_latest_ignores_files_and_other_prefixes() {
        let temp = tempdir().unwrap();
        let root = temp.path();
        fs::create_dir(root.join("v2.0_old")).unwrap();
        fs::create_dir(root.join("v1.0_newer")).unwrap();
        File::create(root.join("v2.0_notes.txt")).unwrap();
        touch_dir(&root.join("v2.0_old"), at(1_000));
        touch_dir(&root.join("v1.0_newer"), at(2_000));

        let latest = find_latest(root, "v2.0_").unwrap();
        assert_eq!(latest, root.join("v2.0_old"));
    }

    #[test]
    fn find_latest_on_missing_root_is_not_found() {
        let temp = tempdir().unwrap();
        let err = find_latest(&temp.path().join("absent"), "v2.0_").unwrap_err();
        assert!(matches!(err, PipelineError::NotFound { .. }));
    }

    #[test]
    fn prefix_with_glob_metacharacters_is_literal() {
        let temp = tempdir().unwrap();
        let root = temp.path();
        fs::create_dir(root.join("run[1]_a")).unwrap();
        fs::create_dir(root.join("run1_b")).unwrap();
        let latest = find_latest(root, "run[1]").unwrap();
        assert_eq!(latest, root.join("run[1]_a"));
    }

    #[test]
    fn dataset_without_manifest_is_skipped_even_when_newest() {
        let temp = tempdir().unwrap();
        let root = temp.path();
        let valid = root.join("v2.0_20260115");
        let invalid = root.join("v2.0_20260116");
        fs::create_dir_all(valid.join("images/train")).unwrap();
        fs::write(valid.join("data.yaml"), "train: images/train\n").unwrap();
        fs::create_dir_all(invalid.join("images/train")).unwrap();
        touch_dir(&valid, at(1_000));
        touch_dir(&invalid, at(2_000));

        let dataset = find_dataset(root, "v2.0_", "data.yaml").unwrap();
        assert_eq!(dataset.path, valid);
        assert_eq!(dataset.manifest, valid.join("data.yaml"));
        assert_eq!(dataset.name(), "v2.0_20260115");
    }

    #[test]
    fn dataset_search_fails_when_no_manifest_anywhere() {
        let temp = tempdir().unwrap();
        fs::create_dir(temp.path().join("v2.0_1")).unwrap();
        let err = find_dataset(temp.path(), "v2.0_", "data.yaml").unwrap_err();
        match err {
            PipelineError::NotFound { what, reason, .. } => {
                assert_eq!(what, "dataset");
                assert!(reason.contains("1 candidate"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn snapshot_of_missing_root_is_empty() {
        let temp = tempdir().unwrap();
        assert!(snapshot(&temp.path().join("runs"), "deer_v2").unwrap().is_empty());
    }

    #[test]
    fn pre_existing_run_is_not_accepted_as_produced() {
        let temp = tempdir().unwrap();
        let old = temp.path().join("deer_v2_old");
        fs::create_dir(&old).unwrap();
        let before = snapshot(temp.path(), "deer_v2").unwrap();

        let err = ensure_produced("training run", temp.path(), &old, &before).unwrap_err();
        match err {
            PipelineError::NotFound { what, reason, .. } => {
                assert_eq!(what, "training run");
                assert!(reason.contains("deer_v2_old"));
            }
            other => panic!("unexpected error {other:?}"),
        }

        let fresh = temp.path().join("deer_v2_new");
        fs::create_dir(&fresh).unwrap();
        ensure_produced("training run", temp.path(), &fresh, &before).unwrap();
    }

    #[test]
    fn best_weights_win_over_last() {
        let temp = tempdir().unwrap();
        let weights = temp.path().join("deer_v2_A_phase2/weights");
        fs::create_dir_all(&weights).unwrap();
        fs::write(weights.join("best.pt"), b"best").unwrap();
        fs::write(weights.join("last.pt"), b"last").unwrap();

        let resolved = find_weights(temp.path(), "deer_v2", "pt").unwrap();
        assert_eq!(resolved.kind, WeightKind::Best);
        assert_eq!(resolved.path, weights.join("best.pt"));
    }

    #[test]
    fn last_weights_used_when_best_missing() {
        let temp = tempdir().unwrap();
        let weights = temp.path().join("deer_v2_B/weights");
        fs::create_dir_all(&weights).unwrap();
        fs::write(weights.join("last.pt"), b"last").unwrap();

        let resolved = find_weights(temp.path(), "deer_v2", "pt").unwrap();
        assert_eq!(resolved.kind, WeightKind::Last);
    }

    #[test]
    fn incomplete_latest_run_does_not_fall_back() {
        let temp = tempdir().unwrap();
        let root = temp.path();
        let complete = root.join("deer_v2_old");
        let incomplete = root.join("deer_v2_new");
        fs::create_dir_all(complete.join("weights")).unwrap();
        fs::write(complete.join("weights/best.pt"), b"w").unwrap();
        fs::create_dir_all(incomplete.join("weights")).unwrap();
        touch_dir(&complete, at(1_000));
        touch_dir(&incomplete, at(2_000));

        let err = find_weights(root, "deer_v2", "pt").unwrap_err();
        match err {
            PipelineError::NotFound { what, reason, .. } => {
                assert_eq!(what, "weight file");
                assert!(reason.contains("deer_v2_new"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn missing_runs_are_reported_as_training_run() {
        let temp = tempdir().unwrap();
        let err = find_weights(temp.path(), "deer_v2", "pt").unwrap_err();
        assert!(matches!(
            err,
            PipelineError::NotFound {
                what: "training run",
                ..
            }
        ));
    }
}
