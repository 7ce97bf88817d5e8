use crate::error::ArchiveError;
use filetime::{set_file_mtime, FileTime};
use std::{
    fs, io,
    path::{Component, Path, PathBuf},
    sync::atomic::{AtomicUsize, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};
use time::{Date, Month, PrimitiveDateTime, Time as TimeOfDay};
use tracing::{debug, warn};

static TEMP_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Removes a scratch file or directory when dropped.
pub(crate) struct StagingGuard {
    path: PathBuf,
}

impl StagingGuard {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagingGuard {
    fn drop(&mut self) {
        if !self.path.exists() {
            return;
        }
        let result = if self.path.is_dir() {
            fs::remove_dir_all(&self.path)
        } else {
            fs::remove_file(&self.path)
        };
        if let Err(err) = result {
            warn!(path = %self.path.display(), %err, "failed to remove scratch path");
        }
    }
}

/// Unique scratch path under `tmp_root`; nothing is created.
pub(crate) fn make_temp_path(tmp_root: &Path, label: &str) -> io::Result<PathBuf> {
    fs::create_dir_all(tmp_root)?;
    let counter = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    Ok(tmp_root.join(format!("{nanos}-{counter}-{}", sanitize_label(label))))
}

fn sanitize_label(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "item".to_string()
    } else {
        cleaned
    }
}

/// Checks that the file is a readable zip whose every entry decompresses with
/// a matching CRC. Returns the entry count.
pub fn validate(path: &Path) -> Result<usize, ArchiveError> {
    let file = fs::File::open(path)
        .map_err(|err| ArchiveError::extraction(format!("open downloaded archive: {err}")))?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|err| ArchiveError::corrupt(format!("not a zip archive: {err}")))?;
    if archive.len() == 0 {
        return Err(ArchiveError::corrupt("archive has no entries"));
    }

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| ArchiveError::corrupt(format!("zip entry #{i}: {err}")))?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        io::copy(&mut entry, &mut io::sink())
            .map_err(|err| ArchiveError::corrupt(format!("zip entry {name}: {err}")))?;
    }

    Ok(archive.len())
}

/// Unpacks `archive_path` into `dest`, returning the relative paths of every
/// file written. With `strip_prefix`, only entries under that folder are kept
/// and the folder itself is removed from their paths.
pub fn extract_zip(
    archive_path: &Path,
    dest: &Path,
    strip_prefix: Option<&str>,
) -> Result<Vec<PathBuf>, ArchiveError> {
    let file = fs::File::open(archive_path)
        .map_err(|err| ArchiveError::extraction(format!("open archive: {err}")))?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|err| ArchiveError::corrupt(format!("read zip: {err}")))?;
    let prefix = strip_prefix
        .map(|value| value.trim_matches('/'))
        .filter(|value| !value.is_empty())
        .map(PathBuf::from);

    let mut written = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| ArchiveError::corrupt(format!("zip entry #{i}: {err}")))?;
        let Some(enclosed) = entry.enclosed_name() else {
            return Err(ArchiveError::extraction(format!(
                "entry {} escapes the destination",
                entry.name()
            )));
        };
        let relative = match &prefix {
            Some(prefix) => match enclosed.strip_prefix(prefix) {
                Ok(rest) => rest.to_path_buf(),
                Err(_) => continue,
            },
            None => enclosed.to_path_buf(),
        };
        if relative.as_os_str().is_empty() {
            continue;
        }

        let out_path = dest.join(&relative);
        if entry.is_dir() {
            fs::create_dir_all(&out_path)
                .map_err(|err| ArchiveError::extraction(format!("create {}: {err}", relative.display())))?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| ArchiveError::extraction(format!("create {}: {err}", parent.display())))?;
        }
        let mut out_file = fs::File::create(&out_path)
            .map_err(|err| ArchiveError::extraction(format!("write {}: {err}", relative.display())))?;
        io::copy(&mut entry, &mut out_file)
            .map_err(|err| ArchiveError::extraction(format!("extract {}: {err}", relative.display())))?;
        if let Some(dt) = entry.last_modified() {
            if let Some(mtime) = zip_time_to_unix(dt) {
                if let Err(err) = set_file_mtime(&out_path, FileTime::from_unix_time(mtime, 0)) {
                    debug!(path = %out_path.display(), %err, "could not preserve mtime");
                }
            }
        }
        written.push(relative);
    }

    Ok(written)
}

fn zip_time_to_unix(dt: zip::DateTime) -> Option<i64> {
    let month = Month::try_from(dt.month()).ok()?;
    let date = Date::from_calendar_date(dt.year() as i32, month, dt.day()).ok()?;
    let time = TimeOfDay::from_hms(dt.hour(), dt.minute(), dt.second()).ok()?;
    let datetime = PrimitiveDateTime::new(date, time).assume_utc();
    Some(datetime.unix_timestamp())
}

/// Undo log for a commit in progress.
#[derive(Default)]
struct CommitJournal {
    created_dirs: Vec<PathBuf>,
    created: Vec<PathBuf>,
    replaced: Vec<(PathBuf, PathBuf)>,
}

impl CommitJournal {
    fn rollback(self) {
        for path in self.created.iter().rev() {
            if let Err(err) = fs::remove_file(path) {
                warn!(path = %path.display(), %err, "rollback: could not remove file");
            }
        }
        for (dest, backup) in self.replaced.iter().rev() {
            if let Err(err) = move_file(backup, dest) {
                warn!(path = %dest.display(), %err, "rollback: could not restore file");
            }
        }
        for dir in self.created_dirs.iter().rev() {
            let _ = fs::remove_dir(dir);
        }
    }
}

/// Moves staged `files` (relative to `staging`) into `dest_root`. Files that
/// already exist are parked in `backup_root` so that a failed commit can put
/// them back; on error everything this call placed is removed again.
pub fn commit_staged(
    staging: &Path,
    files: &[PathBuf],
    dest_root: &Path,
    backup_root: &Path,
) -> Result<(), ArchiveError> {
    let mut journal = CommitJournal::default();
    for relative in files {
        if let Err(err) = commit_one(staging, relative, dest_root, backup_root, &mut journal) {
            journal.rollback();
            return Err(err);
        }
    }
    debug!(files = files.len(), dest = %dest_root.display(), "commit complete");
    Ok(())
}

fn commit_one(
    staging: &Path,
    relative: &Path,
    dest_root: &Path,
    backup_root: &Path,
    journal: &mut CommitJournal,
) -> Result<(), ArchiveError> {
    let source = staging.join(relative);
    let dest = dest_root.join(relative);
    let context = |err: io::Error| ArchiveError::extraction(format!("commit {}: {err}", relative.display()));

    if let Some(parent) = dest.parent() {
        create_dirs_logged(parent, journal).map_err(context)?;
    }

    if dest.is_dir() {
        return Err(ArchiveError::extraction(format!(
            "commit {}: a directory is in the way",
            relative.display()
        )));
    }

    if dest.exists() {
        let backup = backup_root.join(relative);
        if let Some(parent) = backup.parent() {
            fs::create_dir_all(parent).map_err(context)?;
        }
        move_file(&dest, &backup).map_err(context)?;
        journal.replaced.push((dest.clone(), backup));
    }

    move_file(&source, &dest).map_err(context)?;
    journal.created.push(dest);
    Ok(())
}

fn create_dirs_logged(dir: &Path, journal: &mut CommitJournal) -> io::Result<()> {
    let mut missing = Vec::new();
    let mut cursor = Some(dir);
    while let Some(path) = cursor {
        if path.exists() {
            break;
        }
        missing.push(path.to_path_buf());
        cursor = path.parent();
    }
    fs::create_dir_all(dir)?;
    journal.created_dirs.extend(missing.into_iter().rev());
    Ok(())
}

fn move_file(source: &Path, dest: &Path) -> io::Result<()> {
    fs::rename(source, dest).or_else(|_| {
        fs::copy(source, dest)?;
        fs::remove_file(source)
    })
}

/// Lexically joins `relative` onto `root`, refusing anything that would climb
/// out of it. Manifest paths are data from disk, so they are checked again.
pub fn contained_join(root: &Path, relative: &Path) -> Option<PathBuf> {
    let mut out = root.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(out)
}
