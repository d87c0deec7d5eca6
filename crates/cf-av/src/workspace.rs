//! Per-job scratch directories.
//!
//! A [`Workspace`] owns a uniquely named temporary directory under the
//! worker's work dir. It holds the downloaded source and the encoded output
//! for one processing attempt, and is removed when dropped, so concurrent
//! jobs never share files and cleanup only ever touches this attempt's data.

use std::path::{Path, PathBuf};

use tempfile::TempDir;

use cf_core::{Error, JobId, Result};

pub struct Workspace {
    temp_dir: TempDir,
    input_ext: String,
}

impl Workspace {
    /// Create a scratch directory for `job_id` inside `parent`.
    ///
    /// `source_ref` only supplies the input file extension.
    pub fn new(parent: &Path, job_id: JobId, source_ref: &str) -> Result<Self> {
        std::fs::create_dir_all(parent)?;
        let temp_dir = tempfile::Builder::new()
            .prefix(&format!("{job_id}-"))
            .tempdir_in(parent)
            .map_err(|e| Error::Internal(format!("failed to create work dir in {}: {e}", parent.display())))?;

        let input_ext = Path::new(source_ref)
            .extension()
            .map(|e| e.to_string_lossy().to_string())
            .unwrap_or_else(|| "bin".to_string());

        Ok(Self { temp_dir, input_ext })
    }

    /// Path to the scratch directory.
    pub fn dir(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Where the source is downloaded to.
    pub fn input(&self) -> PathBuf {
        self.temp_dir.path().join(format!("input.{}", self.input_ext))
    }

    /// Where the engine writes its result.
    pub fn output(&self) -> PathBuf {
        self.temp_dir.path().join("output.mp4")
    }

    /// Remove the directory now, reporting failures instead of ignoring them.
    pub fn close(self) -> Result<()> {
        let path = self.temp_dir.path().to_path_buf();
        self.temp_dir
            .close()
            .map_err(|e| Error::Internal(format!("failed to remove {}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn paths_live_inside_workspace() {
        let parent = tempfile::tempdir().unwrap();
        let id = JobId::new();
        let ws = Workspace::new(parent.path(), id, "raw/abc.mov").unwrap();

        assert!(ws.dir().starts_with(parent.path()));
        assert!(ws
            .dir()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with(&id.to_string()));
        assert_eq!(ws.input().file_name().unwrap(), "input.mov");
        assert_eq!(ws.output().file_name().unwrap(), "output.mp4");
        assert!(ws.input().starts_with(ws.dir()));
    }

    #[test]
    fn missing_extension_defaults() {
        let parent = tempfile::tempdir().unwrap();
        let ws = Workspace::new(parent.path(), JobId::new(), "raw/abc").unwrap();
        assert_eq!(ws.input().file_name().unwrap(), "input.bin");
    }

    #[test]
    fn concurrent_jobs_get_separate_dirs() {
        let parent = tempfile::tempdir().unwrap();
        let id = JobId::new();
        let a = Workspace::new(parent.path(), id, "raw/x.mp4").unwrap();
        let b = Workspace::new(parent.path(), id, "raw/x.mp4").unwrap();
        assert_ne!(a.dir(), b.dir());
    }

    #[test]
    fn close_removes_only_own_dir() {
        let parent = tempfile::tempdir().unwrap();
        let keep = Workspace::new(parent.path(), JobId::new(), "raw/a.mp4").unwrap();
        let gone = Workspace::new(parent.path(), JobId::new(), "raw/b.mp4").unwrap();
        fs::write(keep.input(), b"a").unwrap();
        fs::write(gone.output(), b"b").unwrap();

        let gone_dir = gone.dir().to_path_buf();
        gone.close().unwrap();

        assert!(!gone_dir.exists());
        assert!(keep.input().exists());
    }

    #[test]
    fn drop_cleans_up() {
        let parent = tempfile::tempdir().unwrap();
        let dir = {
            let ws = Workspace::new(parent.path(), JobId::new(), "raw/a.mp4").unwrap();
            fs::write(ws.output(), b"partial").unwrap();
            ws.dir().to_path_buf()
        };
        assert!(!dir.exists());
    }
}
