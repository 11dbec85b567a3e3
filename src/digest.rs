use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

/// SHA256 of the file at `path` as lowercase hex.
pub fn compute_sha256(path: &Path) -> std::io::Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

pub fn sidecar_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".sha256");
    PathBuf::from(name)
}

/// Write `<digest>  <file name>` next to `path`, in `sha256sum` format.
pub fn write_sidecar(path: &Path, digest: &str) -> std::io::Result<PathBuf> {
    let sidecar = sidecar_path(path);
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let mut file = File::create(&sidecar)?;
    writeln!(file, "{digest}  {name}")?;
    file.sync_all()?;
    Ok(sidecar)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn digest_matches_sha256sum() {
        let temp = tempdir().unwrap();
        let file_path = temp.path().join("digest.bin");
        std::fs::write(&file_path, b"model-weights").unwrap();

        let digest = compute_sha256(&file_path).unwrap();
        assert_eq!(
            digest,
            "8e8ee3e16a9924b12f0fdef1212bf0355eb9cbea442da2479e60e2fd154240df"
        );
    }

    #[test]
    fn sidecar_uses_sha256sum_layout() {
        let temp = tempdir().unwrap();
        let model = temp.path().join("model_20260115_120000.pt");
        std::fs::write(&model, b"weights").unwrap();
        let digest = compute_sha256(&model).unwrap();

        let sidecar = write_sidecar(&model, &digest).unwrap();
        assert_eq!(sidecar, temp.path().join("model_20260115_120000.pt.sha256"));
        let content = std::fs::read_to_string(sidecar).unwrap();
        assert_eq!(content, format!("{digest}  model_20260115_120000.pt\n"));
    }
}
