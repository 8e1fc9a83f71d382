//! On-disk layout of the agent's state

use std::path::PathBuf;

use crate::errors::AgentError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;

const DEFAULT_BASE_DIR: &str = "/var/lib/rollout-agent";

const SETTINGS_FILE: &str = "settings.json";
const PORTS_FILE: &str = "ports.json";
const DEPLOYMENTS_DIR: &str = "deployments";
const LOGS_DIR: &str = "logs";

/// Where settings, port allocations and rollout work directories live
///
/// ```text
/// <base>/settings.json
/// <base>/ports.json
/// <base>/deployments/<deploymentId>/{.env, source/, backup/backup.json}
/// <base>/logs/
/// ```
#[derive(Debug, Clone)]
pub struct StorageLayout {
    pub base_dir: PathBuf,
}

impl StorageLayout {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn base(&self) -> Dir {
        Dir::new(&self.base_dir)
    }

    pub fn settings_file(&self) -> File {
        self.base().file(SETTINGS_FILE)
    }

    /// Persisted service → host port table
    pub fn ports_file(&self) -> File {
        self.base().file(PORTS_FILE)
    }

    /// Parent of the per-deployment working directories
    pub fn deployment_dir(&self) -> Dir {
        self.base().subdir(DEPLOYMENTS_DIR)
    }

    pub fn logs_dir(&self) -> Dir {
        self.base().subdir(LOGS_DIR)
    }

    /// Create the directories the agent writes into
    pub async fn setup(&self) -> Result<(), AgentError> {
        for dir in [self.deployment_dir(), self.logs_dir()] {
            dir.create().await?;
        }
        Ok(())
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DIR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_setup_creates_state_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(tmp.path());

        layout.setup().await.unwrap();

        assert!(layout.deployment_dir().exists().await);
        assert!(layout.logs_dir().exists().await);
        assert_eq!(layout.ports_file().path(), tmp.path().join("ports.json"));
    }
}
