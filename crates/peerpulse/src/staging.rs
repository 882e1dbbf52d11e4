//! Scoped on-disk staging for received payloads.
//!
//! Each payload gets its own directory: `{root}/peerpulse-XXXXXX/payload`. The
//! directory doubles as the child's working directory and is removed after the
//! execution, whatever its outcome.

use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

const DIR_PREFIX: &str = "peerpulse-";
const ARTIFACT_NAME: &str = "payload";

pub struct StagedPayload {
    dir: Option<TempDir>,
    workdir: PathBuf,
    artifact: PathBuf,
}

impl StagedPayload {
    /// Write `payload` into a fresh directory under `root` (system temp dir if `None`).
    pub fn create(payload: &[u8], root: Option<&Path>, executable: bool) -> io::Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(DIR_PREFIX);
        let dir = match root {
            Some(root) => builder.tempdir_in(root)?,
            None => builder.tempdir()?,
        };

        let artifact = dir.path().join(ARTIFACT_NAME);
        std::fs::write(&artifact, payload)?;

        #[cfg(unix)]
        if executable {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&artifact, std::fs::Permissions::from_mode(0o700))?;
        }
        #[cfg(not(unix))]
        let _ = executable;

        tracing::debug!(
            path = %artifact.display(),
            bytes = payload.len(),
            "Staged payload"
        );

        Ok(Self {
            workdir: dir.path().to_path_buf(),
            dir: Some(dir),
            artifact,
        })
    }

    pub fn artifact(&self) -> &Path {
        &self.artifact
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Remove the staging directory. Safe to call more than once.
    pub fn cleanup(&mut self) -> io::Result<()> {
        if let Some(dir) = self.dir.take() {
            tracing::debug!(dir = %self.workdir.display(), "Removing staged payload");
            dir.close()?;
        }
        Ok(())
    }
}

impl Drop for StagedPayload {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            tracing::warn!(error = %e, dir = %self.workdir.display(), "Failed to remove staged payload");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_payload_under_root() {
        let root = tempfile::tempdir().unwrap();

        let staged = StagedPayload::create(b"echo hi\n", Some(root.path()), false).unwrap();

        assert!(staged.artifact().starts_with(root.path()));
        assert_eq!(staged.artifact().parent(), Some(staged.workdir()));
        assert_eq!(std::fs::read(staged.artifact()).unwrap(), b"echo hi\n");
        let name = staged.workdir().file_name().unwrap().to_string_lossy();
        assert!(name.starts_with(DIR_PREFIX));
    }

    #[test]
    fn each_payload_gets_its_own_directory() {
        let root = tempfile::tempdir().unwrap();

        let a = StagedPayload::create(b"a", Some(root.path()), false).unwrap();
        let b = StagedPayload::create(b"b", Some(root.path()), false).unwrap();

        assert_ne!(a.workdir(), b.workdir());
    }

    #[test]
    fn cleanup_removes_directory_and_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let mut staged = StagedPayload::create(b"x", Some(root.path()), false).unwrap();
        let workdir = staged.workdir().to_path_buf();

        staged.cleanup().unwrap();
        staged.cleanup().unwrap();

        assert!(!workdir.exists());
    }

    #[test]
    fn drop_removes_directory() {
        let root = tempfile::tempdir().unwrap();
        let staged = StagedPayload::create(b"x", Some(root.path()), false).unwrap();
        let artifact = staged.artifact().to_path_buf();

        drop(staged);

        assert!(!artifact.exists());
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn executable_artifact_has_exec_bit() {
        use std::os::unix::fs::PermissionsExt;

        let root = tempfile::tempdir().unwrap();
        let staged = StagedPayload::create(b"#!/bin/sh\n", Some(root.path()), true).unwrap();

        let mode = std::fs::metadata(staged.artifact()).unwrap().permissions().mode();
        assert_eq!(mode & 0o700, 0o700);
    }

    #[test]
    fn missing_root_is_an_error() {
        let root = tempfile::tempdir().unwrap();
        let missing = root.path().join("does-not-exist");

        assert!(StagedPayload::create(b"x", Some(&missing), false).is_err());
    }
}
