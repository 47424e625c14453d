//! Per-run scratch space. Downloads and unpacked archives live under one
//! `cbr_forms_*` temp directory which is removed when the run finishes,
//! whether it finished well or not.

use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, warn};

use crate::error::RunError;

pub struct ScratchDir {
    dir: TempDir,
}

impl ScratchDir {
    pub fn new() -> Result<ScratchDir, RunError> {
        let dir = tempfile::Builder::new()
            .prefix("cbr_forms_")
            .tempdir()
            .map_err(RunError::Scratch)?;
        debug!(path = %dir.path().display(), "scratch directory created");
        Ok(ScratchDir { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Where the downloaded archive for one report date is written.
    pub fn archive_path(&self, ymd: &str, ext: &str) -> PathBuf {
        self.dir.path().join(format!("tmp_{}.{}", ymd, ext))
    }

    /// Where that archive is unpacked.
    pub fn extract_dir(&self, ymd: &str) -> PathBuf {
        self.dir.path().join(format!("ex_{}", ymd))
    }

    /// Explicit removal with a logged outcome; dropping the value removes
    /// the directory too, just silently.
    pub fn cleanup(self) {
        let path = self.dir.path().to_path_buf();
        if let Err(e) = self.dir.close() {
            warn!(path = %path.display(), error = %e, "scratch directory not fully removed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn paths_follow_the_run_layout() {
        let scratch = ScratchDir::new().unwrap();
        let name = scratch
            .path()
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap()
            .to_owned();
        assert!(name.starts_with("cbr_forms_"), "got {}", name);
        assert!(scratch
            .archive_path("20240101", "rar")
            .ends_with("tmp_20240101.rar"));
        assert!(scratch.extract_dir("20240101").ends_with("ex_20240101"));
        scratch.cleanup();
    }

    #[test]
    fn cleanup_removes_everything() {
        let scratch = ScratchDir::new().unwrap();
        let kept = scratch.path().to_path_buf();
        fs::write(scratch.archive_path("20240101", "rar"), b"x").unwrap();
        fs::create_dir_all(scratch.extract_dir("20240101")).unwrap();
        scratch.cleanup();
        assert!(!kept.exists());
    }

    #[test]
    fn dropping_the_scratch_removes_it_as_well() {
        let kept;
        {
            let scratch = ScratchDir::new().unwrap();
            kept = scratch.path().to_path_buf();
            fs::write(kept.join("leftover"), b"x").unwrap();
        }
        assert!(!kept.exists());
    }
}
