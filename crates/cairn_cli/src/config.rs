//! Node configuration file.

use anyhow::{Context, Result};
use cairn_ha::HaConfig;
use cairn_persist::PersisterConfig;
use cairn_rebind::RebindConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Everything a management node needs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Directory of the shared store
    pub store_dir: PathBuf,
    /// HA settings
    pub ha: HaConfig,
    /// Persister settings
    pub persister: PersisterConfig,
    /// Rebind settings
    pub rebind: RebindConfig,
}

impl NodeConfig {
    /// Read a JSON config file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    /// Check every section
    pub fn validate(&self) -> Result<()> {
        self.ha.validate().context("invalid [ha] section")?;
        self.persister
            .validate()
            .context("invalid [persister] section")?;
        Ok(())
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from("cairn-store"),
            ha: HaConfig::default(),
            persister: PersisterConfig::default(),
            rebind: RebindConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_ha::HaMode;

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");
        std::fs::write(
            &path,
            r#"{"store_dir":"/srv/cairn","ha":{"node_id":"n1","priority":5,"mode":"standby"}}"#,
        )
        .unwrap();
        let config = NodeConfig::load(&path).unwrap();
        assert_eq!(config.store_dir, PathBuf::from("/srv/cairn"));
        assert_eq!(config.ha.node_id.as_str(), "n1");
        assert_eq!(config.ha.mode, HaMode::Standby);
        assert_eq!(config.persister, PersisterConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bad_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = NodeConfig::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("node.json"));
    }

    #[test]
    fn test_validate_rejects_bad_timings() {
        let mut config = NodeConfig::default();
        config.ha.failure_threshold_ms = 10;
        assert!(config.validate().is_err());
    }
}
