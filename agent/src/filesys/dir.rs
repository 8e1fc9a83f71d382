//! Directory handles

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs;

use crate::errors::AgentError;
use crate::filesys::file::File;

/// A directory that may or may not exist yet
#[derive(Debug, Clone)]
pub struct Dir {
    path: PathBuf,
}

impl Dir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn exists(&self) -> bool {
        matches!(fs::metadata(&self.path).await, Ok(m) if m.is_dir())
    }

    /// Create the directory and any missing parents
    pub async fn create(&self) -> Result<(), AgentError> {
        fs::create_dir_all(&self.path).await?;
        Ok(())
    }

    /// Remove the directory tree; a missing directory is not an error
    pub async fn delete(&self) -> Result<(), AgentError> {
        match fs::remove_dir_all(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace whatever is at the path with an empty directory
    pub async fn reset(&self) -> Result<(), AgentError> {
        self.delete().await?;
        self.create().await
    }

    /// Whether a direct child (file or directory) exists
    pub async fn contains(&self, name: &str) -> bool {
        fs::try_exists(self.path.join(name)).await.unwrap_or(false)
    }

    pub fn file(&self, name: &str) -> File {
        File::new(self.path.join(name))
    }

    pub fn subdir(&self, name: &str) -> Dir {
        Dir::new(self.path.join(name))
    }
}
