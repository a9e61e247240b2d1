//! Packaging a model into a transferable artifact, and cleaning up the
//! packaged files once a run is done.
//!
//! `ArtifactRegistry` is owned by a single `Orchestrator` and cleaned up
//! when that orchestrator (or its `execute` call) is done — not a
//! process-global registry drained by an exit hook, so artifacts from
//! unrelated runs never share a cleanup list.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::warn;

/// Package `model_path` for transfer to a remote worker by copying it into
/// `artifact_dir`. Returns the path of the copy. Local workers never call
/// this: they share the model in-process.
pub fn package_model(model_path: &Path, artifact_dir: &Path) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(artifact_dir)?;
    let file_name = model_path
        .file_name()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "model path has no file name"))?;
    let dest = artifact_dir.join(file_name);
    std::fs::copy(model_path, &dest)?;
    Ok(dest)
}

/// Tracks artifacts packaged during one orchestrator's lifetime and removes
/// them on drop. Scoped to the orchestrator that created them, not global.
#[derive(Default)]
pub struct ArtifactRegistry {
    paths: Mutex<Vec<PathBuf>>,
}

impl ArtifactRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, path: PathBuf) {
        self.paths.lock().expect("poisoned ArtifactRegistry mutex").push(path);
    }

    /// Remove every registered artifact now, rather than waiting for drop.
    /// Failures are logged, never propagated: a leftover file should not
    /// fail an otherwise-successful run.
    pub fn cleanup(&self) {
        let mut paths = self.paths.lock().expect("poisoned ArtifactRegistry mutex");
        for path in paths.drain(..) {
            if let Err(err) = std::fs::remove_file(&path) {
                warn!(?path, "failed to remove packaged artifact: {err}");
            }
        }
    }
}

impl Drop for ArtifactRegistry {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packages_a_copy_into_the_artifact_dir() {
        let tmp = tempdir();
        let model_path = tmp.join("model.bin");
        std::fs::write(&model_path, b"weights").unwrap();
        let artifact_dir = tmp.join("artifacts");

        let packaged = package_model(&model_path, &artifact_dir).unwrap();
        assert_eq!(std::fs::read(&packaged).unwrap(), b"weights");

        std::fs::remove_dir_all(&tmp).ok();
    }

    #[test]
    fn registry_removes_files_on_cleanup() {
        let tmp = tempdir();
        let path = tmp.join("packaged.bin");
        std::fs::create_dir_all(&tmp).unwrap();
        std::fs::write(&path, b"x").unwrap();

        let registry = ArtifactRegistry::new();
        registry.register(path.clone());
        registry.cleanup();
        assert!(!path.exists());

        std::fs::remove_dir_all(&tmp).ok();
    }

    fn tempdir() -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("case-driver-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
