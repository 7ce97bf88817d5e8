use crate::archive::contained_join;
use crate::layout::TargetLayout;
use crate::manifest::InstalledManifest;
use anyhow::{Context, Result};
use serde::Serialize;
use std::{
    collections::BTreeSet,
    ffi::OsString,
    fs, io,
    path::{Component, Path, PathBuf},
};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalStatus {
    Removed,
    Absent,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemovalOutcome {
    pub path: PathBuf,
    pub status: RemovalStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageRemoval {
    NotInstalled,
    Removed {
        removed: usize,
        /// Files left in place because another installed package also placed them.
        kept_shared: usize,
        failed: Vec<String>,
    },
}

/// Removes the loader, its companion files and the engine state from
/// `target_root`. Every path is attempted regardless of the others.
pub fn uninstall(target_root: &Path) -> Vec<RemovalOutcome> {
    let layout = TargetLayout::new(target_root);
    let outcomes: Vec<RemovalOutcome> = layout.removable_paths().into_iter().map(remove_path).collect();

    let removed = outcomes
        .iter()
        .filter(|outcome| outcome.status == RemovalStatus::Removed)
        .count();
    info!(root = %target_root.display(), removed, "uninstall finished");
    outcomes
}

fn remove_path(path: PathBuf) -> RemovalOutcome {
    let result = match fs::symlink_metadata(&path) {
        Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(&path),
        Ok(_) => fs::remove_file(&path),
        Err(err) => Err(err),
    };
    let status = match result {
        Ok(()) => {
            debug!(path = %path.display(), "removed");
            RemovalStatus::Removed
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => RemovalStatus::Absent,
        Err(err) => {
            warn!(path = %path.display(), %err, "failed to remove");
            RemovalStatus::Failed(err.to_string())
        }
    };
    RemovalOutcome { path, status }
}

/// Removes the files the install manifest records for `id`. Files another
/// package also placed stay. Entries that could not be removed stay recorded.
pub fn uninstall_package(target_root: &Path, id: &str) -> Result<PackageRemoval> {
    let layout = TargetLayout::new(target_root);
    let manifest_path = layout.manifest_path();
    let mut manifest = InstalledManifest::load(&manifest_path)?;
    let Some(package) = manifest.get(id).cloned() else {
        return Ok(PackageRemoval::NotInstalled);
    };

    let mut removed = 0;
    let mut kept_shared = 0;
    let mut failed = Vec::new();
    let mut remaining = Vec::new();
    let mut top_dirs: BTreeSet<OsString> = BTreeSet::new();

    for file in &package.files {
        if manifest.claimed_by_other(file, id) {
            kept_shared += 1;
            continue;
        }
        let Some(path) = contained_join(&layout.plugins_dir, Path::new(file)) else {
            warn!(%id, %file, "manifest entry escapes the plugins directory; ignoring");
            failed.push(format!("{file}: outside the plugins directory"));
            continue;
        };
        match fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(path = %path.display(), %err, "failed to remove");
                failed.push(format!("{file}: {err}"));
                remaining.push(file.clone());
                continue;
            }
        }
        if let Some(Component::Normal(first)) = Path::new(file).components().next() {
            if Path::new(file).components().count() > 1 {
                top_dirs.insert(first.to_os_string());
            }
        }
    }

    for dir in &top_dirs {
        prune_empty_dirs(&layout.plugins_dir.join(dir));
    }

    if remaining.is_empty() {
        manifest.remove(id);
    } else if let Some(entry) = manifest.packages.get_mut(id) {
        entry.files = remaining;
    }
    manifest.save(&manifest_path).context("update install manifest")?;

    info!(%id, removed, kept_shared, failed = failed.len(), "package uninstalled");
    Ok(PackageRemoval::Removed {
        removed,
        kept_shared,
        failed,
    })
}

/// Deletes `root` and any directories below it that are left empty.
fn prune_empty_dirs(root: &Path) {
    for entry in WalkDir::new(root).follow_links(false).contents_first(true) {
        let Ok(entry) = entry else {
            continue;
        };
        if entry.file_type().is_dir() {
            // Non-empty directories fail here and stay.
            let _ = fs::remove_dir(entry.path());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn modded_root() -> (tempfile::TempDir, TargetLayout) {
        let dir = tempfile::tempdir().unwrap();
        let layout = TargetLayout::new(dir.path());
        fs::create_dir_all(layout.plugins_dir.join("Some.Mod")).unwrap();
        fs::write(layout.plugins_dir.join("Some.Mod/Some.Mod.dll"), b"MZ").unwrap();
        fs::write(layout.root.join("winhttp.dll"), b"dll").unwrap();
        fs::write(layout.root.join("doorstop_config.ini"), b"[General]").unwrap();
        fs::create_dir_all(layout.tmp_dir()).unwrap();
        (dir, layout)
    }

    /// Every path under `root` with file contents, sorted.
    fn snapshot(root: &Path) -> Vec<(PathBuf, Option<Vec<u8>>)> {
        let mut entries: Vec<_> = WalkDir::new(root)
            .into_iter()
            .map(|entry| entry.unwrap())
            .map(|entry| {
                let contents = entry.file_type().is_file().then(|| fs::read(entry.path()).unwrap());
                (entry.path().strip_prefix(root).unwrap().to_path_buf(), contents)
            })
            .collect();
        entries.sort();
        entries
    }

    #[test]
    fn uninstall_removes_everything_and_is_idempotent() {
        let (_dir, layout) = modded_root();
        fs::write(layout.root.join("Lethal Company.exe"), b"game").unwrap();

        let first = uninstall(&layout.root);
        assert_eq!(first.len(), 4);
        assert!(first.iter().all(|o| o.status == RemovalStatus::Removed));
        assert!(!layout.loader_dir.exists());
        assert!(!layout.state_dir.exists());
        assert!(layout.root.join("Lethal Company.exe").is_file());

        let after_first = snapshot(&layout.root);
        let second = uninstall(&layout.root);
        assert!(second.iter().all(|o| o.status == RemovalStatus::Absent));
        assert_eq!(snapshot(&layout.root), after_first);
        assert_eq!(
            after_first,
            vec![
                (PathBuf::new(), None),
                (PathBuf::from("Lethal Company.exe"), Some(b"game".to_vec())),
            ]
        );
    }

    #[test]
    fn partial_installs_report_absent_paths() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("winhttp.dll"), b"dll").unwrap();
        let outcomes = uninstall(dir.path());
        let removed: Vec<_> = outcomes
            .iter()
            .filter(|o| o.status == RemovalStatus::Removed)
            .map(|o| o.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(removed, vec!["winhttp.dll"]);
        assert_eq!(
            outcomes.iter().filter(|o| o.status == RemovalStatus::Absent).count(),
            3
        );
    }

    #[test]
    fn package_uninstall_keeps_shared_and_foreign_files() {
        let (_dir, layout) = modded_root();
        let plugins = &layout.plugins_dir;
        fs::create_dir_all(plugins.join("LethalLib/lib")).unwrap();
        fs::write(plugins.join("LethalLib/lib/LethalLib.dll"), b"lib").unwrap();
        fs::write(plugins.join("manifest.json"), b"{}").unwrap();

        let mut manifest = InstalledManifest::default();
        manifest.record(
            "Evaisa-LethalLib",
            "0.16.0",
            &[PathBuf::from("LethalLib/lib/LethalLib.dll"), PathBuf::from("manifest.json")],
            None,
        );
        manifest.record("x753-More_Suits", "1.4.3", &[PathBuf::from("manifest.json")], None);
        manifest.save(&layout.manifest_path()).unwrap();

        let result = uninstall_package(&layout.root, "Evaisa-LethalLib").unwrap();
        assert_eq!(
            result,
            PackageRemoval::Removed {
                removed: 1,
                kept_shared: 1,
                failed: Vec::new()
            }
        );
        assert!(!plugins.join("LethalLib").exists());
        assert!(plugins.join("manifest.json").is_file());
        assert!(plugins.join("Some.Mod/Some.Mod.dll").is_file());

        let manifest = InstalledManifest::load(&layout.manifest_path()).unwrap();
        assert!(!manifest.contains("Evaisa-LethalLib"));
        assert!(manifest.contains("x753-More_Suits"));

        assert_eq!(
            uninstall_package(&layout.root, "Evaisa-LethalLib").unwrap(),
            PackageRemoval::NotInstalled
        );
    }

    #[test]
    fn escaping_manifest_entries_are_not_followed() {
        let (_dir, layout) = modded_root();
        let mut manifest = InstalledManifest::default();
        manifest.packages.insert(
            "evil-Mod".to_string(),
            crate::manifest::InstalledPackage {
                version: "1".to_string(),
                files: vec!["../../winhttp.dll".to_string()],
                sha256: None,
                installed_at: 0,
            },
        );
        manifest.save(&layout.manifest_path()).unwrap();

        let PackageRemoval::Removed { removed, failed, .. } =
            uninstall_package(&layout.root, "evil-Mod").unwrap()
        else {
            panic!("expected a removal");
        };
        assert_eq!(removed, 0);
        assert_eq!(failed.len(), 1);
        assert!(layout.root.join("winhttp.dll").is_file());
    }
}
