// Per-run temporary workspace: creation under the temp root and careful teardown.
use super::*;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    run_id: String,
    path: PathBuf,
}

impl Workspace {
    pub fn create(temp_root: &Path) -> PipelineResult<Self> {
        Self::create_with_id(temp_root, &Uuid::new_v4().to_string())
    }

    // Re-creating an existing run directory is not an error.
    pub fn create_with_id(temp_root: &Path, run_id: &str) -> PipelineResult<Self> {
        let path = temp_root.join(format!("{RESOURCE_FOLDER_NAME}-{run_id}"));
        fs::create_dir_all(&path)?;
        debug!("Workspace ready at {}", path.display());
        Ok(Self {
            run_id: run_id.to_string(),
            path,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn teardown(self) -> PipelineResult<()> {
        teardown_with(&self.path, |file| fs::remove_file(file))
    }
}

// Deletes regular files one by one and only then the directory itself.
pub(super) fn teardown_with<F>(path: &Path, remove_file: F) -> PipelineResult<()>
where
    F: FnMut(&Path) -> std::io::Result<()>,
{
    if !path.exists() {
        return Ok(());
    }

    let remaining = match delete_files(path, remove_file) {
        Ok(remaining) => remaining,
        Err(error) => {
            warn!("Failed to list workspace {}: {error}", path.display());
            fs::read_dir(path)
                .map(|entries| entries.count())
                .unwrap_or(1)
                .max(1)
        }
    };

    if remaining > 0 {
        error!(
            "Workspace {} kept for manual cleanup ({remaining} entries left)",
            path.display()
        );
        return Err(PipelineError::WorkspaceCleanupFailed {
            path: path.to_path_buf(),
            remaining,
        });
    }

    if let Err(error) = fs::remove_dir(path) {
        error!("Failed to remove workspace {}: {error}", path.display());
        return Err(PipelineError::WorkspaceCleanupFailed {
            path: path.to_path_buf(),
            remaining: 0,
        });
    }
    debug!("Workspace {} removed", path.display());
    Ok(())
}

// Returns how many entries could not be deleted.
fn delete_files<F>(path: &Path, mut remove_file: F) -> std::io::Result<usize>
where
    F: FnMut(&Path) -> std::io::Result<()>,
{
    let mut remaining = 0_usize;
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let entry_path = entry.path();
        if !entry.file_type()?.is_file() {
            remaining += 1;
            continue;
        }
        if let Err(error) = remove_file(&entry_path) {
            warn!("Failed to delete {}: {error}", entry_path.display());
            remaining += 1;
        }
    }
    Ok(remaining)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_is_unique_and_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let first = Workspace::create(root.path()).unwrap();
        let second = Workspace::create(root.path()).unwrap();
        assert_ne!(first.path(), second.path());
        assert!(first.path().is_dir());

        fs::write(first.path().join("frame-0001.tga"), b"").unwrap();
        let again = Workspace::create_with_id(root.path(), first.run_id()).unwrap();
        assert_eq!(again.path(), first.path());
        assert!(again.path().join("frame-0001.tga").exists());
    }

    #[test]
    fn teardown_removes_files_then_directory() {
        let root = tempfile::tempdir().unwrap();
        let workspace = Workspace::create_with_id(root.path(), "run").unwrap();
        let path = workspace.path().to_path_buf();
        for name in ["clip-0001.png", "clip-0002.png", "clip.wav"] {
            fs::write(path.join(name), b"data").unwrap();
        }

        workspace.teardown().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn failed_file_deletion_keeps_directory() {
        let root = tempfile::tempdir().unwrap();
        let workspace = Workspace::create_with_id(root.path(), "run").unwrap();
        let path = workspace.path().to_path_buf();
        for name in ["clip-0001.png", "locked.png", "clip.wav"] {
            fs::write(path.join(name), b"data").unwrap();
        }

        let result = teardown_with(&path, |file| {
            if file.ends_with("locked.png") {
                Err(std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    "file is locked",
                ))
            } else {
                fs::remove_file(file)
            }
        });
        assert!(matches!(
            result,
            Err(PipelineError::WorkspaceCleanupFailed { remaining: 1, .. })
        ));
        assert!(path.is_dir());
        assert!(path.join("locked.png").exists());
        assert!(!path.join("clip.wav").exists());
    }

    #[test]
    fn nested_directory_is_never_force_removed() {
        let root = tempfile::tempdir().unwrap();
        let workspace = Workspace::create_with_id(root.path(), "run").unwrap();
        let path = workspace.path().to_path_buf();
        fs::create_dir(path.join("unexpected")).unwrap();
        fs::write(path.join("unexpected").join("keep.txt"), b"").unwrap();

        assert!(workspace.teardown().is_err());
        assert!(path.join("unexpected").join("keep.txt").exists());
    }

    #[test]
    fn unlistable_workspace_reports_cleanup_failure() {
        let root = tempfile::tempdir().unwrap();
        let not_a_dir = root.path().join("movie-import-run");
        fs::write(&not_a_dir, b"").unwrap();

        let result = teardown_with(&not_a_dir, |file| fs::remove_file(file));
        match result {
            Err(PipelineError::WorkspaceCleanupFailed { path, remaining }) => {
                assert_eq!(path, not_a_dir);
                assert!(remaining >= 1);
            }
            other => panic!("unexpected teardown result: {other:?}"),
        }
        assert!(not_a_dir.exists());
    }

    #[test]
    fn teardown_of_missing_workspace_succeeds() {
        let root = tempfile::tempdir().unwrap();
        assert!(teardown_with(&root.path().join("gone"), |file| fs::remove_file(file)).is_ok());
    }
}
