//! Shared test fixtures.

use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};

/// A scratch project with its own storage root, deleted on drop.
pub struct TempProject {
    _guard: tempfile::TempDir,
    pub project_root: PathBuf,
    pub storage_root: PathBuf,
}

impl TempProject {
    pub fn new() -> Result<Self> {
        let guard = tempfile::tempdir()?;
        let project_root = guard.path().join("project");
        let storage_root = guard.path().join("storage");
        fs::create_dir_all(&project_root)?;
        fs::create_dir_all(&storage_root)?;
        Ok(Self {
            _guard: guard,
            project_root,
            storage_root,
        })
    }

    /// Write a file relative to the project root, creating parents.
    pub fn write_file(&self, relative: &str, content: &str) -> Result<PathBuf> {
        let path = self.project_root.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, content)?;
        Ok(path)
    }

    pub fn read_file(&self, relative: &str) -> Result<String> {
        Ok(fs::read_to_string(self.project_root.join(relative))?)
    }

    pub fn file_exists(&self, relative: &str) -> bool {
        self.project_root.join(relative).exists()
    }

    pub fn path(&self) -> &Path {
        &self.project_root
    }
}
