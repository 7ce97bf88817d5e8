//! Wires selection, resolution, confirmation and installation together.
//!
//! Front ends drive it with [`Intent`] values and read back [`IntentResult`]s;
//! nothing here knows how results are presented.

use crate::catalog::{CatalogIndex, PackageDescriptor};
use crate::error::InstallError;
use crate::layout::TargetLayout;
use crate::manifest::InstalledManifest;
use crate::pipeline::{
    CancelToken, InstallPipeline, InstallProgress, InstallReport, LoaderOutcome, ProgressCallback,
};
use crate::resolver::{DependencyResolver, InstallPlan};
use crate::source::ArchiveFetcher;
use crate::uninstall::{self, PackageRemoval, RemovalOutcome};
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver},
        Arc,
    },
    thread::{self, JoinHandle},
};
use tracing::{debug, info, warn};

pub const DEFAULT_LOADER_URL: &str = "https://thunderstore.io/package/download/BepInEx/BepInExPack/5.4.2100/";
pub const DEFAULT_LOADER_ARCHIVE_ROOT: &str = "BepInExPack";
pub const DEFAULT_LOADER_PACKAGE_ID: &str = "BepInEx-BepInExPack";

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub loader_url: String,
    pub loader_archive_root: Option<String>,
    /// Catalog ids the loader install already provides.
    pub loader_package_ids: Vec<String>,
    /// Curated archive unpacked into the loader directory.
    pub modpack_url: Option<String>,
    pub workers: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            loader_url: DEFAULT_LOADER_URL.to_string(),
            loader_archive_root: Some(DEFAULT_LOADER_ARCHIVE_ROOT.to_string()),
            loader_package_ids: vec![DEFAULT_LOADER_PACKAGE_ID.to_string()],
            modpack_url: None,
            workers: 1,
        }
    }
}

/// Ids the user picked, in the order they were picked.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionState {
    ids: Vec<String>,
}

impl SelectionState {
    /// Returns false when the id was already selected.
    pub fn select(&mut self, id: &str) -> bool {
        let id = id.trim();
        if id.is_empty() || self.contains(id) {
            return false;
        }
        self.ids.push(id.to_string());
        true
    }

    pub fn deselect(&mut self, id: &str) -> bool {
        let before = self.ids.len();
        self.ids.retain(|selected| selected != id.trim());
        self.ids.len() != before
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.iter().any(|selected| selected == id)
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }
}

#[derive(Debug, Clone)]
pub enum Intent {
    Select(String),
    Deselect(String),
    Search(String),
    Confirm,
    Cancel,
}

/// What the caller must agree to before anything is installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    pub plan: InstallPlan,
    pub added_dependencies: Vec<PackageDescriptor>,
    pub unresolved: Vec<String>,
}

impl Confirmation {
    /// The plan that will run for the given answer to "install dependencies too?".
    pub fn plan_for(&self, include_dependencies: bool) -> InstallPlan {
        if include_dependencies {
            self.plan.clone()
        } else {
            self.plan.only_requested()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntentResult {
    Selection { selected: Vec<String>, known: bool },
    SearchResults(Vec<PackageDescriptor>),
    Confirm(Confirmation),
    NothingSelected,
    Cancelled { stopped_install: bool },
}

pub enum InstallMessage {
    Progress(InstallProgress),
    Finished(Result<InstallReport, InstallError>),
}

/// A batch running on a worker thread.
pub struct InstallHandle {
    pub messages: Receiver<InstallMessage>,
    cancel: CancelToken,
    thread: JoinHandle<()>,
}

impl InstallHandle {
    /// A token that stops the batch before its next item, usable after the
    /// handle has been moved into [`InstallHandle::wait_with`].
    pub fn canceller(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Blocks until the batch finishes, passing progress to `on_progress`.
    pub fn wait_with(self, mut on_progress: impl FnMut(InstallProgress)) -> Result<InstallReport, InstallError> {
        let mut finished = None;
        for message in self.messages.iter() {
            match message {
                InstallMessage::Progress(progress) => on_progress(progress),
                InstallMessage::Finished(result) => {
                    finished = Some(result);
                    break;
                }
            }
        }
        if self.thread.join().is_err() {
            warn!("install worker panicked");
        }
        finished.unwrap_or_else(|| Err(InstallError::State("install worker exited without a result".to_string())))
    }
}

/// Holds the busy flag for one operation against the target root.
struct BusyGuard(Arc<AtomicBool>);

impl BusyGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Result<Self, InstallError> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| InstallError::Busy)?;
        Ok(Self(flag.clone()))
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct Orchestrator {
    catalog: CatalogIndex,
    fetcher: Arc<dyn ArchiveFetcher>,
    layout: Option<TargetLayout>,
    settings: OrchestratorSettings,
    selection: SelectionState,
    busy: Arc<AtomicBool>,
    running: Option<CancelToken>,
}

impl Orchestrator {
    /// `layout` may be `None` when no game directory is known; selection and
    /// search still work, anything touching the disk fails with `NoTarget`.
    pub fn new(
        catalog: CatalogIndex,
        fetcher: Arc<dyn ArchiveFetcher>,
        layout: Option<TargetLayout>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            catalog,
            fetcher,
            layout,
            settings,
            selection: SelectionState::default(),
            busy: Arc::new(AtomicBool::new(false)),
            running: None,
        }
    }

    pub fn layout(&self) -> Option<&TargetLayout> {
        self.layout.as_ref()
    }

    fn target(&self) -> Result<&TargetLayout, InstallError> {
        self.layout.as_ref().ok_or(InstallError::NoTarget)
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn handle(&mut self, intent: Intent) -> IntentResult {
        match intent {
            Intent::Select(id) => {
                let known = self.catalog.lookup_by_id(id.trim()).is_some();
                if self.selection.select(&id) {
                    debug!(%id, known, "selected");
                }
                IntentResult::Selection {
                    selected: self.selection.ids().to_vec(),
                    known,
                }
            }
            Intent::Deselect(id) => {
                self.selection.deselect(&id);
                IntentResult::Selection {
                    selected: self.selection.ids().to_vec(),
                    known: self.catalog.lookup_by_id(id.trim()).is_some(),
                }
            }
            Intent::Search(query) => IntentResult::SearchResults(self.catalog.search(&query).cloned().collect()),
            Intent::Confirm => match self.confirm() {
                Some(confirmation) => IntentResult::Confirm(confirmation),
                None => IntentResult::NothingSelected,
            },
            Intent::Cancel => {
                self.selection.clear();
                let stopped_install = match self.running.take() {
                    Some(cancel) if self.is_busy() => {
                        cancel.cancel();
                        true
                    }
                    _ => false,
                };
                IntentResult::Cancelled { stopped_install }
            }
        }
    }

    /// Resolves the current selection without touching the disk.
    pub fn confirm(&self) -> Option<Confirmation> {
        if self.selection.is_empty() {
            return None;
        }
        let plan = DependencyResolver::new(&self.catalog).resolve(self.selection.ids());
        Some(Confirmation {
            added_dependencies: plan.added_dependencies().into_iter().cloned().collect(),
            unresolved: plan.unresolved.clone(),
            plan,
        })
    }

    /// Runs the confirmed batch on the calling thread.
    pub fn install(
        &mut self,
        confirmation: &Confirmation,
        include_dependencies: bool,
    ) -> Result<InstallReport, InstallError> {
        self.install_with_progress(confirmation, include_dependencies, None)
    }

    pub fn install_with_progress(
        &mut self,
        confirmation: &Confirmation,
        include_dependencies: bool,
        progress: Option<ProgressCallback>,
    ) -> Result<InstallReport, InstallError> {
        let _busy = BusyGuard::acquire(&self.busy)?;
        let plan = confirmation.plan_for(include_dependencies);
        let installed = self.installed_ids()?;
        let cancel = CancelToken::default();
        self.running = Some(cancel.clone());

        let mut pipeline = self.pipeline(cancel)?;
        if let Some(progress) = progress {
            pipeline = pipeline.with_progress(progress);
        }
        let report = pipeline.install(&plan, |id| installed.contains(id));
        self.running = None;
        if report.is_ok() {
            self.selection.clear();
        }
        report
    }

    /// Starts the confirmed batch on a worker thread. Only one batch runs at a
    /// time; a second call while one is in flight fails with `Busy`.
    pub fn spawn_install(
        &mut self,
        confirmation: &Confirmation,
        include_dependencies: bool,
    ) -> Result<InstallHandle, InstallError> {
        let busy = BusyGuard::acquire(&self.busy)?;
        let plan = confirmation.plan_for(include_dependencies);
        let installed = self.installed_ids()?;
        let cancel = CancelToken::default();
        self.running = Some(cancel.clone());

        let (tx, rx) = mpsc::channel();
        let progress_tx = tx.clone();
        let pipeline = self
            .pipeline(cancel.clone())?
            .with_progress(Arc::new(move |progress: InstallProgress| {
                let _ = progress_tx.send(InstallMessage::Progress(progress));
            }));

        let thread = thread::spawn(move || {
            let _busy = busy;
            let result = pipeline.install(&plan, |id| installed.contains(id));
            let _ = tx.send(InstallMessage::Finished(result));
        });
        self.selection.clear();

        Ok(InstallHandle {
            messages: rx,
            cancel,
            thread,
        })
    }

    pub fn install_loader(&self) -> Result<LoaderOutcome, InstallError> {
        let _busy = BusyGuard::acquire(&self.busy)?;
        self.pipeline(CancelToken::default())?
            .install_single_archive(&self.settings.loader_url, self.settings.loader_archive_root.as_deref())
    }

    /// Unpacks the configured modpack archive into the loader directory.
    pub fn install_modpack(&self) -> Result<usize, InstallError> {
        let _busy = BusyGuard::acquire(&self.busy)?;
        let url = self
            .settings
            .modpack_url
            .as_deref()
            .ok_or_else(|| InstallError::State("no modpack_url is configured".to_string()))?;
        self.pipeline(CancelToken::default())?.install_into_loader(url, None)
    }

    pub fn uninstall(&self) -> Result<Vec<RemovalOutcome>, InstallError> {
        let _busy = BusyGuard::acquire(&self.busy)?;
        let layout = self.target()?;
        info!(root = %layout.root.display(), "uninstalling loader and mods");
        Ok(uninstall::uninstall(&layout.root))
    }

    pub fn uninstall_package(&self, id: &str) -> Result<PackageRemoval, InstallError> {
        let _busy = BusyGuard::acquire(&self.busy)?;
        uninstall::uninstall_package(&self.target()?.root, id).map_err(|err| InstallError::State(format!("{err:#}")))
    }

    pub fn installed(&self) -> Result<InstalledManifest, InstallError> {
        InstalledManifest::load(&self.target()?.manifest_path()).map_err(|err| InstallError::State(format!("{err:#}")))
    }

    /// Everything the next batch should skip: recorded packages, plus the
    /// loader's own catalog ids when the loader is present.
    fn installed_ids(&self) -> Result<HashSet<String>, InstallError> {
        let mut ids: HashSet<String> = self.installed()?.packages.into_keys().collect();
        if self.target()?.loader_installed() {
            ids.extend(self.settings.loader_package_ids.iter().cloned());
        }
        Ok(ids)
    }

    fn pipeline(&self, cancel: CancelToken) -> Result<InstallPipeline, InstallError> {
        Ok(InstallPipeline::new(self.fetcher.clone(), self.target()?.clone())
            .with_workers(self.settings.workers)
            .with_cancel(cancel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::tests::build_zip;
    use crate::catalog::tests::record;
    use crate::error::FetchError;
    use crate::pipeline::InstallStatus;
    use crate::source::tests::StaticFetcher;
    use crate::uninstall::RemovalStatus;
    use std::{
        fs,
        io::Write,
        sync::{mpsc::Sender, Mutex},
    };

    fn url(id: &str) -> String {
        format!("https://example.test/{id}.zip")
    }

    /// Holds every fetch until the test sends a release (or drops the sender).
    struct GatedFetcher {
        inner: StaticFetcher,
        entered: Mutex<Sender<String>>,
        release: Mutex<Receiver<()>>,
    }

    impl ArchiveFetcher for GatedFetcher {
        fn fetch(&self, url: &str, sink: &mut dyn Write) -> Result<u64, FetchError> {
            let _ = self.entered.lock().unwrap().send(url.to_string());
            let _ = self.release.lock().unwrap().recv();
            self.inner.fetch(url, sink)
        }
    }

    fn setup(with_loader: bool) -> (tempfile::TempDir, StaticFetcher, Orchestrator) {
        let (dir, layout) = game_dir(with_loader);
        let (catalog, fetcher) = seeded_catalog();
        let orchestrator = Orchestrator::new(
            catalog,
            Arc::new(fetcher.clone()),
            Some(layout),
            OrchestratorSettings {
                loader_url: "https://example.test/loader.zip".to_string(),
                ..OrchestratorSettings::default()
            },
        );
        (dir, fetcher, orchestrator)
    }

    fn setup_gated() -> (tempfile::TempDir, Orchestrator, Receiver<String>, Sender<()>) {
        let (dir, layout) = game_dir(true);
        let (catalog, inner) = seeded_catalog();
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let fetcher = GatedFetcher {
            inner,
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        };
        let orchestrator = Orchestrator::new(catalog, Arc::new(fetcher), Some(layout), OrchestratorSettings::default());
        (dir, orchestrator, entered_rx, release_tx)
    }

    fn game_dir(with_loader: bool) -> (tempfile::TempDir, TargetLayout) {
        let dir = tempfile::tempdir().unwrap();
        let layout = TargetLayout::new(dir.path());
        if with_loader {
            fs::create_dir_all(&layout.plugins_dir).unwrap();
        }
        (dir, layout)
    }

    fn seeded_catalog() -> (CatalogIndex, StaticFetcher) {
        let catalog = CatalogIndex::load(vec![
            record("x753-More_Suits", &["Evaisa-LethalLib", "BepInEx-BepInExPack"]),
            record("Evaisa-LethalLib", &["BepInEx-BepInExPack", "Evaisa-HookGenPatcher"]),
            record("Evaisa-HookGenPatcher", &[]),
            record("BepInEx-BepInExPack", &[]),
            record("notnotnotswipez-MoreCompany", &["BepInEx-BepInExPack"]),
        ])
        .unwrap();
        let fetcher = StaticFetcher::default();
        for package in catalog.search("") {
            let body = format!("{} payload", package.id);
            fetcher.serve(
                &url(&package.id),
                build_zip(&[(&format!("{}/{}.dll", package.display_name, package.display_name), body.as_bytes())]),
            );
        }
        (catalog, fetcher)
    }

    fn statuses(report: &InstallReport) -> Vec<(&str, &InstallStatus)> {
        report.outcomes.iter().map(|o| (o.id.as_str(), &o.status)).collect()
    }

    #[test]
    fn selection_is_ordered_and_deduplicated() {
        let mut selection = SelectionState::default();
        assert!(selection.select("b"));
        assert!(selection.select("a"));
        assert!(!selection.select("b"));
        assert_eq!(selection.ids(), ["b".to_string(), "a".to_string()]);
        assert!(selection.deselect("b"));
        assert!(!selection.deselect("b"));
        assert_eq!(selection.ids().len(), 1);
    }

    #[test]
    fn intents_drive_selection_and_confirmation() {
        let (_dir, _fetcher, mut orchestrator) = setup(true);
        assert_eq!(orchestrator.handle(Intent::Confirm), IntentResult::NothingSelected);

        let IntentResult::SearchResults(found) = orchestrator.handle(Intent::Search("suits".into())) else {
            panic!("expected search results");
        };
        assert_eq!(found.len(), 1);

        orchestrator.handle(Intent::Select("x753-More_Suits".into()));
        let result = orchestrator.handle(Intent::Select("ghost-Mod".into()));
        assert!(matches!(result, IntentResult::Selection { known: false, .. }));

        let IntentResult::Confirm(confirmation) = orchestrator.handle(Intent::Confirm) else {
            panic!("expected a confirmation");
        };
        let added: Vec<&str> = confirmation.added_dependencies.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(
            added,
            vec!["BepInEx-BepInExPack", "Evaisa-HookGenPatcher", "Evaisa-LethalLib"]
        );
        assert_eq!(confirmation.unresolved, vec!["ghost-Mod".to_string()]);

        assert_eq!(
            orchestrator.handle(Intent::Cancel),
            IntentResult::Cancelled { stopped_install: false }
        );
        assert!(orchestrator.selection.is_empty());
    }

    #[test]
    fn deselect_drops_an_id_from_the_plan() {
        let (_dir, _fetcher, mut orchestrator) = setup(true);
        orchestrator.handle(Intent::Select("x753-More_Suits".into()));
        orchestrator.handle(Intent::Select("notnotnotswipez-MoreCompany".into()));

        let result = orchestrator.handle(Intent::Deselect(" x753-More_Suits ".into()));
        assert_eq!(
            result,
            IntentResult::Selection {
                selected: vec!["notnotnotswipez-MoreCompany".to_string()],
                known: true,
            }
        );

        let confirmation = orchestrator.confirm().unwrap();
        let planned: Vec<&str> = confirmation.plan.packages.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(planned, vec!["BepInEx-BepInExPack", "notnotnotswipez-MoreCompany"]);
        assert!(confirmation.added_dependencies.iter().all(|p| p.id != "Evaisa-LethalLib"));
    }

    #[test]
    fn install_skips_loader_package_and_records_manifest() {
        let (_dir, fetcher, mut orchestrator) = setup(true);
        orchestrator.handle(Intent::Select("x753-More_Suits".into()));
        let confirmation = orchestrator.confirm().unwrap();
        let report = orchestrator.install(&confirmation, true).unwrap();

        assert_eq!(
            statuses(&report),
            vec![
                ("BepInEx-BepInExPack", &InstallStatus::SkippedAlreadyInstalled),
                ("Evaisa-HookGenPatcher", &InstallStatus::Installed),
                ("Evaisa-LethalLib", &InstallStatus::Installed),
                ("x753-More_Suits", &InstallStatus::Installed),
            ]
        );
        assert!(!fetcher.requested().contains(&url("BepInEx-BepInExPack")));
        assert!(orchestrator.selection.is_empty());

        let manifest = orchestrator.installed().unwrap();
        assert_eq!(manifest.packages.len(), 3);

        // A second run finds everything recorded and fetches nothing new.
        let before = fetcher.requested().len();
        let again = orchestrator.install(&confirmation, true).unwrap();
        assert_eq!(again.skipped_count(), 4);
        assert_eq!(fetcher.requested().len(), before);
    }

    #[test]
    fn declining_dependencies_installs_only_the_selection() {
        let (_dir, fetcher, mut orchestrator) = setup(true);
        orchestrator.handle(Intent::Select("x753-More_Suits".into()));
        let confirmation = orchestrator.confirm().unwrap();
        let report = orchestrator.install(&confirmation, false).unwrap();
        assert_eq!(statuses(&report), vec![("x753-More_Suits", &InstallStatus::Installed)]);
        assert_eq!(fetcher.requested(), vec![url("x753-More_Suits")]);
    }

    #[test]
    fn install_without_loader_is_refused() {
        let (_dir, _fetcher, mut orchestrator) = setup(false);
        orchestrator.handle(Intent::Select("Evaisa-HookGenPatcher".into()));
        let confirmation = orchestrator.confirm().unwrap();
        let err = orchestrator.install(&confirmation, true).unwrap_err();
        assert!(matches!(err, InstallError::MissingPrerequisite(_)));
        assert!(!orchestrator.is_busy());
    }

    #[test]
    fn spawned_install_reports_progress_and_blocks_a_second_batch() {
        let (_dir, _fetcher, mut orchestrator) = setup(true);
        orchestrator.handle(Intent::Select("notnotnotswipez-MoreCompany".into()));
        let confirmation = orchestrator.confirm().unwrap();

        let handle = orchestrator.spawn_install(&confirmation, true).unwrap();
        // The worker holds the busy flag until it finishes, or has already
        // released it; either way a finished handle must free the root.
        let second = orchestrator.spawn_install(&confirmation, true);
        if let Err(err) = &second {
            assert!(matches!(err, InstallError::Busy));
        }

        let mut events = 0;
        let report = handle.wait_with(|_| events += 1).unwrap();
        assert_eq!(report.installed_count(), 1);
        assert!(events > 0);
        if let Ok(second) = second {
            second.wait_with(|_| {}).unwrap();
        }
        assert!(!orchestrator.is_busy());
    }

    #[test]
    fn cancel_intent_stops_a_running_batch() {
        let (_dir, mut orchestrator, entered, release) = setup_gated();
        orchestrator.handle(Intent::Select("x753-More_Suits".into()));
        let confirmation = orchestrator.confirm().unwrap();
        let handle = orchestrator.spawn_install(&confirmation, true).unwrap();

        // The loader package is skipped; the worker is now inside the first fetch.
        assert_eq!(entered.recv().unwrap(), url("Evaisa-HookGenPatcher"));
        assert_eq!(
            orchestrator.handle(Intent::Cancel),
            IntentResult::Cancelled { stopped_install: true }
        );
        release.send(()).unwrap();
        drop(release);

        let report = handle.wait_with(|_| {}).unwrap();
        assert!(report.cancelled);
        assert_eq!(
            statuses(&report),
            vec![
                ("BepInEx-BepInExPack", &InstallStatus::SkippedAlreadyInstalled),
                ("Evaisa-HookGenPatcher", &InstallStatus::Installed),
            ]
        );
        assert!(!orchestrator.is_busy());
        assert!(orchestrator
            .layout()
            .unwrap()
            .plugins_dir
            .join("HookGenPatcher/HookGenPatcher.dll")
            .is_file());
        assert!(!orchestrator.layout().unwrap().plugins_dir.join("LethalLib").exists());
    }

    #[test]
    fn handle_canceller_stops_after_the_current_package() {
        let (_dir, mut orchestrator, entered, release) = setup_gated();
        orchestrator.handle(Intent::Select("x753-More_Suits".into()));
        let confirmation = orchestrator.confirm().unwrap();
        let handle = orchestrator.spawn_install(&confirmation, true).unwrap();
        let canceller = handle.canceller();

        entered.recv().unwrap();
        canceller.cancel();
        drop(release);

        let report = handle.wait_with(|_| {}).unwrap();
        assert!(report.cancelled);
        assert_eq!(report.installed_count(), 1);
        assert_eq!(report.outcomes.len(), 2);
    }

    #[test]
    fn modpack_needs_a_url_and_the_loader() {
        let (_dir, fetcher, mut orchestrator) = setup(false);
        assert!(matches!(orchestrator.install_modpack(), Err(InstallError::State(_))));

        orchestrator.settings.modpack_url = Some("https://example.test/pack.zip".to_string());
        fetcher.serve(
            "https://example.test/pack.zip",
            build_zip(&[("plugins/Pack/Pack.dll", b"pack"), ("config/pack.cfg", b"x")]),
        );
        assert!(matches!(
            orchestrator.install_modpack(),
            Err(InstallError::MissingPrerequisite(_))
        ));

        fs::create_dir_all(&orchestrator.layout().unwrap().loader_dir).unwrap();
        assert_eq!(orchestrator.install_modpack().unwrap(), 2);
        let loader_dir = &orchestrator.layout().unwrap().loader_dir;
        assert!(loader_dir.join("plugins/Pack/Pack.dll").is_file());
        assert!(loader_dir.join("config/pack.cfg").is_file());
    }

    #[test]
    fn catalog_only_orchestrator_refuses_disk_work() {
        let (catalog, fetcher) = seeded_catalog();
        let mut orchestrator = Orchestrator::new(catalog, Arc::new(fetcher), None, OrchestratorSettings::default());
        let IntentResult::SearchResults(found) = orchestrator.handle(Intent::Search("lethal".into())) else {
            panic!("expected search results");
        };
        assert_eq!(found.len(), 1);

        orchestrator.handle(Intent::Select("Evaisa-LethalLib".into()));
        let confirmation = orchestrator.confirm().unwrap();
        assert!(matches!(orchestrator.install(&confirmation, true), Err(InstallError::NoTarget)));
        assert!(matches!(orchestrator.uninstall(), Err(InstallError::NoTarget)));
        assert!(matches!(orchestrator.installed(), Err(InstallError::NoTarget)));
        assert!(!orchestrator.is_busy());
    }

    #[test]
    fn busy_root_refuses_other_operations() {
        let (_dir, _fetcher, orchestrator) = setup(true);
        let _held = BusyGuard::acquire(&orchestrator.busy).unwrap();
        assert!(matches!(orchestrator.uninstall(), Err(InstallError::Busy)));
        assert!(matches!(orchestrator.install_loader(), Err(InstallError::Busy)));
        assert!(matches!(orchestrator.install_modpack(), Err(InstallError::Busy)));
    }

    #[test]
    fn loader_then_uninstall_round_trip() {
        let (_dir, fetcher, orchestrator) = setup(false);
        fetcher.serve(
            "https://example.test/loader.zip",
            build_zip(&[
                ("BepInExPack/winhttp.dll", b"dll"),
                ("BepInExPack/BepInEx/core/BepInEx.dll", b"core"),
            ]),
        );
        assert!(matches!(orchestrator.install_loader().unwrap(), LoaderOutcome::Installed { .. }));
        assert_eq!(orchestrator.install_loader().unwrap(), LoaderOutcome::AlreadyInstalled);

        let outcomes = orchestrator.uninstall().unwrap();
        assert!(outcomes
            .iter()
            .any(|o| o.path.ends_with("BepInEx") && o.status == RemovalStatus::Removed));
        assert!(!orchestrator.layout().unwrap().loader_installed());
    }
}
