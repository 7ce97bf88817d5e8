use crate::archive::{self, make_temp_path, StagingGuard};
use crate::catalog::PackageDescriptor;
use crate::error::{FetchError, InstallError, InstallFailure};
use crate::layout::{TargetLayout, LOADER_DIR};
use crate::manifest::InstalledManifest;
use crate::resolver::InstallPlan;
use crate::source::ArchiveFetcher;
use sha2::{Digest, Sha256};
use std::{
    fs,
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallStage {
    Fetching,
    Validating,
    Extracting,
    Committing,
}

impl InstallStage {
    pub fn label(self) -> &'static str {
        match self {
            InstallStage::Fetching => "Downloading",
            InstallStage::Validating => "Validating",
            InstallStage::Extracting => "Extracting",
            InstallStage::Committing => "Installing",
        }
    }
}

#[derive(Debug, Clone)]
pub struct InstallProgress {
    pub id: String,
    pub unit_index: usize,
    pub unit_count: usize,
    pub stage: InstallStage,
}

pub type ProgressCallback = Arc<dyn Fn(InstallProgress) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallStatus {
    Installed,
    Failed(InstallFailure),
    SkippedAlreadyInstalled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOutcome {
    pub id: String,
    pub version: String,
    pub status: InstallStatus,
}

#[derive(Debug, Clone, Default)]
pub struct InstallReport {
    pub outcomes: Vec<InstallOutcome>,
    /// Set when the batch stopped early; remaining plan items were not attempted.
    pub cancelled: bool,
    pub warnings: Vec<String>,
}

impl InstallReport {
    fn count(&self, pred: impl Fn(&InstallStatus) -> bool) -> usize {
        self.outcomes.iter().filter(|outcome| pred(&outcome.status)).count()
    }

    pub fn installed_count(&self) -> usize {
        self.count(|status| matches!(status, InstallStatus::Installed))
    }

    pub fn failed_count(&self) -> usize {
        self.count(|status| matches!(status, InstallStatus::Failed(_)))
    }

    pub fn skipped_count(&self) -> usize {
        self.count(|status| matches!(status, InstallStatus::SkippedAlreadyInstalled))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderOutcome {
    Installed { files: usize },
    AlreadyInstalled,
}

/// Shared stop flag; checked before each plan item (or window of items).
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

enum Prepared {
    Skip,
    Staged(StagedPackage),
    Failed(InstallFailure),
}

struct StagedPackage {
    staging: StagingGuard,
    files: Vec<PathBuf>,
    sha256: String,
}

impl StagedPackage {
    fn files_root(&self) -> PathBuf {
        self.staging.path().join("files")
    }

    fn backup_root(&self) -> PathBuf {
        self.staging.path().join("replaced")
    }
}

struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.hasher.update(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

pub struct InstallPipeline {
    fetcher: Arc<dyn ArchiveFetcher>,
    layout: TargetLayout,
    workers: usize,
    cancel: CancelToken,
    progress: Option<ProgressCallback>,
}

impl InstallPipeline {
    pub fn new(fetcher: Arc<dyn ArchiveFetcher>, layout: TargetLayout) -> Self {
        Self {
            fetcher,
            layout,
            workers: 1,
            cancel: CancelToken::default(),
            progress: None,
        }
    }

    /// Number of packages fetched and staged concurrently. Commits always
    /// happen one at a time in plan order.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn install<P>(&self, plan: &InstallPlan, already_installed: P) -> Result<InstallReport, InstallError>
    where
        P: Fn(&str) -> bool + Sync,
    {
        if !self.layout.loader_installed() {
            return Err(InstallError::MissingPrerequisite(self.layout.loader_dir.clone()));
        }
        let manifest_path = self.layout.manifest_path();
        let mut manifest = InstalledManifest::load(&manifest_path)
            .map_err(|err| InstallError::State(format!("{err:#}")))?;

        let count = plan.packages.len();
        let mut report = InstallReport::default();
        info!(packages = count, workers = self.workers, root = %self.layout.root.display(), "install started");

        let mut offset = 0;
        for window in plan.packages.chunks(self.workers) {
            if self.cancel.is_cancelled() {
                info!(remaining = count - offset, "install cancelled");
                report.cancelled = true;
                break;
            }

            let prepared = self.prepare_window(window, offset, count, &already_installed);
            for (position, (package, prepared)) in window.iter().zip(prepared).enumerate() {
                let status = self.finish(package, prepared, offset + position, count, &mut manifest, &mut report.warnings);
                report.outcomes.push(InstallOutcome {
                    id: package.id.clone(),
                    version: package.version.clone(),
                    status,
                });
            }
            offset += window.len();
        }

        info!(
            installed = report.installed_count(),
            failed = report.failed_count(),
            skipped = report.skipped_count(),
            "install finished"
        );
        Ok(report)
    }

    /// Installs the loader archive into the target root itself. A root that
    /// already has the loader directory is left untouched.
    pub fn install_single_archive(
        &self,
        url: &str,
        strip_prefix: Option<&str>,
    ) -> Result<LoaderOutcome, InstallError> {
        if self.layout.loader_installed() {
            info!(dir = %self.layout.loader_dir.display(), "loader already installed");
            return Ok(LoaderOutcome::AlreadyInstalled);
        }
        if !self.layout.root.is_dir() {
            return Err(InstallError::State(format!(
                "target root {} does not exist",
                self.layout.root.display()
            )));
        }

        let files = self.unpack_archive(url, "loader", strip_prefix, &self.layout.root, |files| {
            if files.iter().any(|file| file.starts_with(LOADER_DIR)) {
                Ok(())
            } else {
                Err(InstallError::CorruptArchive(format!(
                    "archive does not contain a {LOADER_DIR}/ directory"
                )))
            }
        })?;
        info!(files, root = %self.layout.root.display(), "loader installed");
        Ok(LoaderOutcome::Installed { files })
    }

    /// Unpacks a curated modpack archive into the loader directory, which
    /// must already exist. Returns the number of files written.
    pub fn install_into_loader(&self, url: &str, strip_prefix: Option<&str>) -> Result<usize, InstallError> {
        if !self.layout.loader_installed() {
            return Err(InstallError::MissingPrerequisite(self.layout.loader_dir.clone()));
        }
        let files = self.unpack_archive(url, "modpack", strip_prefix, &self.layout.loader_dir, |_| Ok(()))?;
        info!(files, dir = %self.layout.loader_dir.display(), "modpack installed");
        Ok(files)
    }

    /// Download, validate, stage and commit one archive into `dest`. `check`
    /// sees the staged file list and can refuse it before anything is committed.
    fn unpack_archive(
        &self,
        url: &str,
        label: &str,
        strip_prefix: Option<&str>,
        dest: &Path,
        check: impl FnOnce(&[PathBuf]) -> Result<(), InstallError>,
    ) -> Result<usize, InstallError> {
        let (archive_file, _) = self.download(url, label)?;
        archive::validate(archive_file.path())?;

        let staging = self.new_staging(label).map_err(|err| InstallError::State(err.to_string()))?;
        let files_root = staging.path().join("files");
        let files = archive::extract_zip(archive_file.path(), &files_root, strip_prefix)?;
        drop(archive_file);

        check(&files)?;
        archive::commit_staged(&files_root, &files, dest, &staging.path().join("replaced"))?;
        Ok(files.len())
    }

    fn prepare_window<P>(
        &self,
        window: &[PackageDescriptor],
        offset: usize,
        count: usize,
        already_installed: &P,
    ) -> Vec<Prepared>
    where
        P: Fn(&str) -> bool + Sync,
    {
        if window.len() == 1 {
            return vec![self.prepare(&window[0], offset, count, already_installed)];
        }

        thread::scope(|scope| {
            let handles: Vec<_> = window
                .iter()
                .enumerate()
                .map(|(position, package)| {
                    scope.spawn(move || self.prepare(package, offset + position, count, already_installed))
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle.join().unwrap_or_else(|_| {
                        Prepared::Failed(InstallFailure::Extraction("install worker panicked".to_string()))
                    })
                })
                .collect()
        })
    }

    /// Fetch, validate and stage one package. Touches nothing outside the
    /// private temp area.
    fn prepare<P>(&self, package: &PackageDescriptor, index: usize, count: usize, already_installed: &P) -> Prepared
    where
        P: Fn(&str) -> bool,
    {
        if already_installed(&package.id) {
            debug!(id = %package.id, "already installed, skipping");
            return Prepared::Skip;
        }

        self.report(package, index, count, InstallStage::Fetching);
        let (archive_file, sha256) = match self.download(&package.download_url, &package.id) {
            Ok(downloaded) => downloaded,
            Err(err) => return Prepared::Failed(err.into()),
        };

        self.report(package, index, count, InstallStage::Validating);
        if let Err(err) = archive::validate(archive_file.path()) {
            return Prepared::Failed(err.into());
        }

        self.report(package, index, count, InstallStage::Extracting);
        let staging = match self.new_staging(&package.id) {
            Ok(staging) => staging,
            Err(err) => {
                return Prepared::Failed(InstallFailure::Extraction(format!("create staging dir: {err}")))
            }
        };
        let mut files = match archive::extract_zip(archive_file.path(), &staging.path().join("files"), None) {
            Ok(files) => files,
            Err(err) => return Prepared::Failed(err.into()),
        };
        files.sort();
        files.dedup();

        Prepared::Staged(StagedPackage {
            staging,
            files,
            sha256,
        })
    }

    fn finish(
        &self,
        package: &PackageDescriptor,
        prepared: Prepared,
        index: usize,
        count: usize,
        manifest: &mut InstalledManifest,
        warnings: &mut Vec<String>,
    ) -> InstallStatus {
        let staged = match prepared {
            Prepared::Skip => return InstallStatus::SkippedAlreadyInstalled,
            Prepared::Failed(failure) => {
                warn!(id = %package.id, %failure, "package failed");
                return InstallStatus::Failed(failure);
            }
            Prepared::Staged(staged) => staged,
        };

        self.report(package, index, count, InstallStage::Committing);
        if let Err(err) = archive::commit_staged(
            &staged.files_root(),
            &staged.files,
            &self.layout.plugins_dir,
            &staged.backup_root(),
        ) {
            let failure = InstallFailure::from(err);
            warn!(id = %package.id, %failure, "package failed");
            return InstallStatus::Failed(failure);
        }

        manifest.record(&package.id, &package.version, &staged.files, Some(staged.sha256.clone()));
        if let Err(err) = manifest.save(&self.layout.manifest_path()) {
            let message = format!("{}: installed but not recorded: {err:#}", package.id);
            warn!("{message}");
            warnings.push(message);
        }

        info!(id = %package.id, version = %package.version, files = staged.files.len(), "installed");
        InstallStatus::Installed
    }

    /// Streams `url` into a fresh temp file. The returned guard deletes the
    /// file when dropped, on success and failure alike.
    fn download(&self, url: &str, label: &str) -> Result<(StagingGuard, String), FetchError> {
        let io_error = |source: io::Error| FetchError::Io {
            url: url.to_string(),
            source,
        };
        let path = make_temp_path(&self.layout.tmp_dir(), &format!("{label}.zip")).map_err(io_error)?;
        let guard = StagingGuard::new(path);
        let file = fs::File::create(guard.path()).map_err(io_error)?;

        let mut sink = HashingWriter {
            inner: BufWriter::new(file),
            hasher: Sha256::new(),
        };
        let bytes = self.fetcher.fetch(url, &mut sink)?;
        sink.flush().map_err(io_error)?;
        debug!(%url, bytes, "download complete");

        let digest = format!("{:x}", sink.hasher.finalize());
        Ok((guard, digest))
    }

    fn new_staging(&self, label: &str) -> io::Result<StagingGuard> {
        let path = make_temp_path(&self.layout.tmp_dir(), &format!("{label}-stage"))?;
        fs::create_dir_all(&path)?;
        Ok(StagingGuard::new(path))
    }

    fn report(&self, package: &PackageDescriptor, index: usize, count: usize, stage: InstallStage) {
        let Some(callback) = &self.progress else {
            return;
        };
        callback(InstallProgress {
            id: package.id.clone(),
            unit_index: index + 1,
            unit_count: count,
            stage,
        });
    }
}
