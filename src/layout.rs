use anyhow::{bail, Context, Result};
use std::{
    fs,
    path::{Path, PathBuf},
};

pub const GAME_NAME: &str = "Lethal Company";
const GAME_EXE: &str = "Lethal Company.exe";

pub const LOADER_DIR: &str = "BepInEx";
pub const PLUGINS_DIR: &str = "plugins";
pub const COMPANION_FILES: [&str; 2] = ["doorstop_config.ini", "winhttp.dll"];
const STATE_DIR: &str = ".modpack";

/// On-disk convention for a modded game directory.
#[derive(Debug, Clone)]
pub struct TargetLayout {
    pub root: PathBuf,
    pub loader_dir: PathBuf,
    pub plugins_dir: PathBuf,
    pub companion_files: Vec<PathBuf>,
    pub state_dir: PathBuf,
}

impl TargetLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let loader_dir = root.join(LOADER_DIR);
        let plugins_dir = loader_dir.join(PLUGINS_DIR);
        let companion_files = COMPANION_FILES.iter().map(|name| root.join(name)).collect();
        let state_dir = root.join(STATE_DIR);
        Self {
            root,
            loader_dir,
            plugins_dir,
            companion_files,
            state_dir,
        }
    }

    pub fn loader_installed(&self) -> bool {
        self.loader_dir.is_dir()
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.state_dir.join("tmp")
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.state_dir.join("manifest.json")
    }

    /// Every path a full uninstall removes, relative order irrelevant.
    pub fn removable_paths(&self) -> Vec<PathBuf> {
        let mut paths = vec![self.loader_dir.clone()];
        paths.extend(self.companion_files.iter().cloned());
        paths.push(self.state_dir.clone());
        paths
    }
}

pub fn resolve_root(root_override: Option<&Path>) -> Result<PathBuf> {
    let root = match root_override {
        Some(path) => path.to_path_buf(),
        None => find_game_root().context("locate Lethal Company game directory")?,
    };
    if !root.is_dir() {
        bail!("game directory does not exist: {}", root.display());
    }
    Ok(root)
}

pub fn looks_like_game_root(path: &Path) -> bool {
    path.join(GAME_EXE).is_file() || path.join("Lethal Company_Data").is_dir()
}

fn find_game_root() -> Option<PathBuf> {
    let mut candidates = Vec::new();

    if let Some(home) = dirs_home() {
        candidates.push(home.join(".local/share/Steam"));
        candidates.push(home.join(".steam/steam"));
    }
    candidates.push(PathBuf::from("C:\\Program Files (x86)\\Steam"));

    let mut libraries = Vec::new();
    for base in candidates {
        let vdf = base.join("steamapps/libraryfolders.vdf");
        if vdf.exists() {
            if let Ok(paths) = parse_steam_library_paths(&vdf) {
                libraries.extend(paths);
            }
        }
        libraries.push(base);
    }

    libraries
        .into_iter()
        .map(|lib| lib.join("steamapps/common").join(GAME_NAME))
        .find(|candidate| looks_like_game_root(candidate))
}

fn parse_steam_library_paths(path: &Path) -> Result<Vec<PathBuf>> {
    let raw = fs::read_to_string(path).context("read libraryfolders.vdf")?;
    Ok(library_paths_from_vdf(&raw))
}

fn library_paths_from_vdf(raw: &str) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if !line.contains("\"path\"") {
            continue;
        }

        let parts: Vec<&str> = line.split('"').collect();
        if parts.len() >= 4 {
            let path = parts[3].replace("\\\\", "\\");
            paths.push(PathBuf::from(path));
        }
    }
    paths
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_places_plugins_under_loader() {
        let layout = TargetLayout::new("/games/lc");
        assert_eq!(layout.plugins_dir, PathBuf::from("/games/lc/BepInEx/plugins"));
        assert_eq!(layout.manifest_path(), PathBuf::from("/games/lc/.modpack/manifest.json"));
        assert_eq!(layout.removable_paths().len(), 4);
    }

    #[test]
    fn vdf_paths_are_extracted() {
        let raw = r#"
"libraryfolders"
{
    "0"
    {
        "path"		"/home/me/.local/share/Steam"
    }
    "1"
    {
        "path"		"D:\\SteamLibrary"
    }
}
"#;
        let paths = library_paths_from_vdf(raw);
        assert_eq!(
            paths,
            vec![
                PathBuf::from("/home/me/.local/share/Steam"),
                PathBuf::from("D:\\SteamLibrary"),
            ]
        );
    }

    #[test]
    fn resolve_root_rejects_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(resolve_root(Some(&missing)).is_err());
        assert_eq!(resolve_root(Some(dir.path())).unwrap(), dir.path());
    }
}
