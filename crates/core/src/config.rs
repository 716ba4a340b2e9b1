use std::path::{Path, PathBuf};
use std::time::Duration;

use config::builder::{ConfigBuilder, DefaultState};
use config::{Config, Environment, File as ConfigFile};
use serde::Deserialize;

use crate::error::Result;

pub const DEFAULT_CZKAWKA_BIN: &str = "/usr/local/bin/czkawka_cli";
pub const CONFIG_FILE_NAME: &str = "czkawka-web";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub czkawka_bin: PathBuf,
    pub config_dir: PathBuf,
    #[serde(default)]
    pub results_dir: Option<PathBuf>,
    pub heartbeat_secs: u64,
    pub cancel_grace_secs: u64,
    pub port: u16,
}

/// Runtime knobs of the orchestrator.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub czkawka_bin: PathBuf,
    /// Where per-job results files are written while a scan runs.
    pub results_dir: PathBuf,
    pub heartbeat_interval: Duration,
    pub cancel_grace: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            czkawka_bin: PathBuf::from(DEFAULT_CZKAWKA_BIN),
            results_dir: std::env::temp_dir(),
            heartbeat_interval: crate::relay::DEFAULT_HEARTBEAT,
            cancel_grace: crate::runner::DEFAULT_CANCEL_GRACE,
        }
    }
}

impl Settings {
    /// Defaults, then `czkawka-web.toml` in the working directory, then the
    /// environment (`CZKAWKA_BIN`, `CONFIG_DIR`, `PORT`, ...).
    pub fn load(default_config_dir: &Path) -> Result<Self> {
        Self::load_from(default_config_dir, Some(CONFIG_FILE_NAME))
    }

    /// Environment names are unprefixed (`CZKAWKA_BIN`, `CONFIG_DIR`, `PORT`)
    /// to match the variables deployments already set.
    pub fn load_from(default_config_dir: &Path, file: Option<&str>) -> Result<Self> {
        let builder = Self::builder(default_config_dir, file)?
            .add_source(Environment::default().try_parsing(true));
        Self::build(builder)
    }

    fn builder(
        default_config_dir: &Path,
        file: Option<&str>,
    ) -> Result<ConfigBuilder<DefaultState>> {
        let mut builder = Config::builder()
            .set_default("czkawka_bin", DEFAULT_CZKAWKA_BIN)?
            .set_default("config_dir", default_config_dir.to_string_lossy().into_owned())?
            .set_default("heartbeat_secs", 5)?
            .set_default("cancel_grace_secs", 5)?
            .set_default("port", 8080)?;
        if let Some(file) = file {
            builder = builder.add_source(ConfigFile::with_name(file).required(false));
        }
        Ok(builder)
    }

    fn build(builder: ConfigBuilder<DefaultState>) -> Result<Self> {
        Ok(builder.build()?.try_deserialize::<Settings>()?)
    }

    pub fn database_path(&self) -> PathBuf {
        self.config_dir.join("scans.sqlite3")
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            czkawka_bin: self.czkawka_bin.clone(),
            results_dir: self
                .results_dir
                .clone()
                .unwrap_or_else(std::env::temp_dir),
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs.max(1)),
            cancel_grace: Duration::from_secs(self.cancel_grace_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_sources() {
        let settings = Settings::build(Settings::builder(Path::new("/config"), None).unwrap()).unwrap();
        assert_eq!(settings.config_dir, PathBuf::from("/config"));
        assert_eq!(settings.database_path(), PathBuf::from("/config/scans.sqlite3"));

        let manager = settings.manager_config();
        assert_eq!(manager.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(manager.cancel_grace, Duration::from_secs(5));
        assert_eq!(settings.port, 8080);
        assert_eq!(settings.czkawka_bin, PathBuf::from(DEFAULT_CZKAWKA_BIN));
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("settings.toml");
        std::fs::write(
            &file,
            "czkawka_bin = \"/opt/czkawka_cli\"\nheartbeat_secs = 2\nresults_dir = \"/scratch\"\n",
        )
        .unwrap();

        let builder = Settings::builder(Path::new("/config"), Some(file.to_str().unwrap())).unwrap();
        let settings = Settings::build(builder).unwrap();
        assert_eq!(settings.czkawka_bin, PathBuf::from("/opt/czkawka_cli"));
        let manager = settings.manager_config();
        assert_eq!(manager.heartbeat_interval, Duration::from_secs(2));
        assert_eq!(manager.results_dir, PathBuf::from("/scratch"));
    }
}
