use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

pub const MANIFEST_VERSION: u32 = 1;

/// What each installed package placed under the plugins directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstalledManifest {
    pub version: u32,
    #[serde(default)]
    pub packages: BTreeMap<String, InstalledPackage>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstalledPackage {
    pub version: String,
    /// Paths relative to the plugins directory, `/`-separated.
    pub files: Vec<String>,
    #[serde(default)]
    pub sha256: Option<String>,
    pub installed_at: i64,
}

impl Default for InstalledManifest {
    fn default() -> Self {
        Self {
            version: MANIFEST_VERSION,
            packages: BTreeMap::new(),
        }
    }
}

impl InstalledManifest {
    /// Missing file means nothing installed yet. An unreadable or foreign
    /// manifest is an error; it is never replaced with an empty one.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path).context("read install manifest")?;
        let manifest: InstalledManifest = serde_json::from_str(&raw)
            .with_context(|| format!("parse install manifest {}", path.display()))?;
        if manifest.version != MANIFEST_VERSION {
            bail!(
                "install manifest {} has unsupported version {}",
                path.display(),
                manifest.version
            );
        }
        Ok(manifest)
    }

    /// Writes through a temp file and rename so a crash never leaves a
    /// half-written manifest behind.
    pub fn save(&self, path: &Path) -> Result<()> {
        let parent = path.parent().context("install manifest parent")?;
        fs::create_dir_all(parent).context("create install state dir")?;

        let raw = serde_json::to_string_pretty(self).context("serialize install manifest")?;
        let temp = path.with_extension("json.tmp");
        fs::write(&temp, raw).context("write install manifest temp")?;
        fs::rename(&temp, path).context("finalize install manifest")?;
        Ok(())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.packages.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&InstalledPackage> {
        self.packages.get(id)
    }

    pub fn record(&mut self, id: &str, version: &str, files: &[PathBuf], sha256: Option<String>) {
        let mut files: Vec<String> = files.iter().map(|path| portable_path(path)).collect();
        files.sort();
        files.dedup();
        self.packages.insert(
            id.to_string(),
            InstalledPackage {
                version: version.to_string(),
                files,
                sha256,
                installed_at: now_timestamp(),
            },
        );
    }

    pub fn remove(&mut self, id: &str) -> Option<InstalledPackage> {
        self.packages.remove(id)
    }

    /// True when some package other than `except` also placed `file`.
    pub fn claimed_by_other(&self, file: &str, except: &str) -> bool {
        self.packages
            .iter()
            .any(|(id, package)| id != except && package.files.iter().any(|f| f == file))
    }
}

fn portable_path(path: &Path) -> String {
    path.components()
        .map(|component| component.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn now_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or_default()
}
