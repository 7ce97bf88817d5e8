use crate::orchestrator::{
    OrchestratorSettings, DEFAULT_LOADER_ARCHIVE_ROOT, DEFAULT_LOADER_PACKAGE_ID, DEFAULT_LOADER_URL,
};
use crate::source::{FetchTimeouts, THUNDERSTORE_URL};
use anyhow::{Context, Result};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

const MAX_WORKERS: usize = 16;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppConfig {
    /// Game directory; auto-detected from Steam libraries when unset.
    #[serde(default)]
    pub game_root: Option<PathBuf>,
    #[serde(default = "default_catalog_url")]
    pub catalog_url: String,
    #[serde(default = "default_loader_url")]
    pub loader_url: String,
    #[serde(default = "default_loader_archive_root")]
    pub loader_archive_root: Option<String>,
    #[serde(default = "default_loader_package_ids")]
    pub loader_package_ids: Vec<String>,
    /// Curated archive unpacked into the loader directory by `install-modpack`.
    #[serde(default)]
    pub modpack_url: Option<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    /// Cap on a whole download, however steadily the server trickles bytes.
    #[serde(default = "default_transfer_timeout")]
    pub transfer_timeout_secs: u64,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_true")]
    pub confirm_dependencies: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            game_root: None,
            catalog_url: default_catalog_url(),
            loader_url: default_loader_url(),
            loader_archive_root: default_loader_archive_root(),
            loader_package_ids: default_loader_package_ids(),
            modpack_url: None,
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
            transfer_timeout_secs: default_transfer_timeout(),
            workers: default_workers(),
            confirm_dependencies: true,
        }
    }
}

impl AppConfig {
    pub fn load_or_create() -> Result<Self> {
        Self::load_or_create_at(&config_path()?)
    }

    pub fn load_or_create_at(path: &Path) -> Result<Self> {
        if path.exists() {
            let raw = fs::read_to_string(path).context("read app config")?;
            let mut config: AppConfig = serde_json::from_str(&raw).context("parse app config")?;
            let clamped = config.workers.clamp(1, MAX_WORKERS);
            if clamped != config.workers {
                config.workers = clamped;
                config.save_to(path)?;
            }
            return Ok(config);
        }

        let config = AppConfig::default();
        config.save_to(path)?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("create app data dir")?;
        }
        let raw = serde_json::to_string_pretty(self).context("serialize app config")?;
        fs::write(path, raw).context("write app config")?;
        Ok(())
    }

    pub fn timeouts(&self) -> FetchTimeouts {
        FetchTimeouts {
            connect: Duration::from_secs(self.connect_timeout_secs.max(1)),
            read: Duration::from_secs(self.read_timeout_secs.max(1)),
            total: Duration::from_secs(self.transfer_timeout_secs.max(1)),
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            loader_url: self.loader_url.clone(),
            loader_archive_root: self
                .loader_archive_root
                .clone()
                .filter(|root| !root.trim().is_empty()),
            loader_package_ids: self.loader_package_ids.clone(),
            modpack_url: self
                .modpack_url
                .clone()
                .filter(|url| !url.trim().is_empty()),
            workers: self.workers.clamp(1, MAX_WORKERS),
        }
    }
}

pub fn config_path() -> Result<PathBuf> {
    Ok(base_data_dir()?.join("config.json"))
}

fn base_data_dir() -> Result<PathBuf> {
    let base = BaseDirs::new().context("resolve home dir")?;
    Ok(base.data_local_dir().join("modpack"))
}

fn default_true() -> bool {
    true
}

fn default_catalog_url() -> String {
    THUNDERSTORE_URL.to_string()
}

fn default_loader_url() -> String {
    DEFAULT_LOADER_URL.to_string()
}

fn default_loader_archive_root() -> Option<String> {
    Some(DEFAULT_LOADER_ARCHIVE_ROOT.to_string())
}

fn default_loader_package_ids() -> Vec<String> {
    vec![DEFAULT_LOADER_PACKAGE_ID.to_string()]
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_read_timeout() -> u64 {
    60
}

fn default_transfer_timeout() -> u64 {
    600
}

fn default_workers() -> usize {
    1
}
