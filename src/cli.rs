use crate::{
    catalog::CatalogIndex,
    config::{self, AppConfig},
    layout::{self, TargetLayout},
    manifest::InstalledManifest,
    orchestrator::{Confirmation, Intent, IntentResult, Orchestrator},
    pipeline::{CancelToken, InstallReport, InstallStatus, LoaderOutcome},
    source::{CatalogSource, FileCatalogSource, HttpFetcher, ThunderstoreSource},
    uninstall::{PackageRemoval, RemovalOutcome, RemovalStatus},
};
use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use std::{
    io::{self, BufRead, IsTerminal, Write},
    path::PathBuf,
    sync::Arc,
    thread,
};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "json" => Some(OutputFormat::Json),
            "text" => Some(OutputFormat::Text),
            _ => None,
        }
    }
}

#[derive(Debug, PartialEq)]
struct GlobalOptions {
    format: OutputFormat,
    root: Option<PathBuf>,
    catalog: Option<String>,
    workers: Option<usize>,
    verbosity: u8,
}

impl Default for GlobalOptions {
    fn default() -> Self {
        Self {
            format: OutputFormat::Text,
            root: None,
            catalog: None,
            workers: None,
            verbosity: 0,
        }
    }
}

#[derive(Debug, PartialEq)]
enum CliCommand {
    Search(String),
    Resolve(Vec<String>),
    Install {
        ids: Vec<String>,
        yes: bool,
        no_deps: bool,
    },
    InstallLoader,
    InstallModpack,
    Uninstall(Option<String>),
    Installed,
    Paths,
    Help,
    Version,
}

#[derive(Debug, PartialEq)]
pub struct CliAction {
    command: CliCommand,
    global: GlobalOptions,
}

impl CliAction {
    pub fn verbosity(&self) -> u8 {
        self.global.verbosity
    }
}

pub fn parse_args(args: &[String]) -> Result<CliAction> {
    let (global, tokens) = parse_global_options(args)?;
    let command = parse_subcommand(&tokens)?;
    Ok(CliAction { command, global })
}

fn parse_global_options(args: &[String]) -> Result<(GlobalOptions, Vec<String>)> {
    let mut global = GlobalOptions::default();
    let mut tokens = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let (flag, inline) = match arg.split_once('=') {
            Some((flag, value)) if flag.starts_with("--") => (flag, Some(value.to_string())),
            _ => (arg.as_str(), None),
        };
        let mut value = |name: &str| -> Result<String> {
            match inline.clone().or_else(|| iter.next().cloned()) {
                Some(value) => Ok(value),
                None => bail!("{name} requires a value"),
            }
        };
        match flag {
            "--format" => {
                let raw = value("--format")?;
                global.format =
                    OutputFormat::parse(&raw).ok_or_else(|| anyhow!("Unknown format: {raw} (use 'text' or 'json')"))?;
            }
            "--root" => global.root = Some(PathBuf::from(value("--root")?)),
            "--catalog" => global.catalog = Some(value("--catalog")?),
            "--workers" => {
                let raw = value("--workers")?;
                let workers: usize = raw.parse().with_context(|| format!("invalid --workers value: {raw}"))?;
                global.workers = Some(workers.max(1));
            }
            "--verbose" => global.verbosity = global.verbosity.max(1),
            _ if arg.starts_with("-v") && !arg.starts_with("--") && arg[1..].chars().all(|ch| ch == 'v') => {
                global.verbosity = (arg.len() - 1).min(2) as u8;
            }
            _ => tokens.push(arg.to_string()),
        }
    }
    Ok((global, tokens))
}

fn parse_subcommand(tokens: &[String]) -> Result<CliCommand> {
    let Some(head) = tokens.first() else {
        return Ok(CliCommand::Help);
    };
    let rest = tokens.get(1..).unwrap_or(&[]);
    match head.as_str() {
        "help" | "--help" | "-h" => Ok(CliCommand::Help),
        "version" | "--version" | "-V" => Ok(CliCommand::Version),
        "search" => Ok(CliCommand::Search(rest.join(" "))),
        "resolve" => {
            if rest.is_empty() {
                bail!("resolve requires one or more package ids");
            }
            Ok(CliCommand::Resolve(rest.to_vec()))
        }
        "install" => {
            let mut ids = Vec::new();
            let mut yes = false;
            let mut no_deps = false;
            for arg in rest {
                match arg.as_str() {
                    "--yes" | "-y" => yes = true,
                    "--no-deps" => no_deps = true,
                    value if value.starts_with('-') => bail!("Unknown install option: {value}"),
                    value => ids.push(value.to_string()),
                }
            }
            if ids.is_empty() {
                bail!("install requires one or more package ids");
            }
            Ok(CliCommand::Install { ids, yes, no_deps })
        }
        "install-loader" => Ok(CliCommand::InstallLoader),
        "install-modpack" => Ok(CliCommand::InstallModpack),
        "uninstall" => Ok(CliCommand::Uninstall(rest.first().cloned())),
        "installed" => Ok(CliCommand::Installed),
        "paths" => Ok(CliCommand::Paths),
        other => bail!("Unknown command: {other} (see 'modpack help')"),
    }
}

pub fn execute(action: CliAction) -> Result<()> {
    let CliAction { command, global } = action;
    match command {
        CliCommand::Help => {
            print_help();
            return Ok(());
        }
        CliCommand::Version => {
            println!("modpack v{}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        _ => {}
    }

    let mut config = AppConfig::load_or_create()?;
    if let Some(catalog) = &global.catalog {
        config.catalog_url = catalog.clone();
    }
    if let Some(workers) = global.workers {
        config.workers = workers;
    }
    let context = CommandContext { config, global };

    match command {
        CliCommand::Search(query) => context.search(&query),
        CliCommand::Resolve(ids) => context.resolve(&ids),
        CliCommand::Install { ids, yes, no_deps } => context.install(&ids, yes, no_deps),
        CliCommand::InstallLoader => context.install_loader(),
        CliCommand::InstallModpack => context.install_modpack(),
        CliCommand::Uninstall(id) => context.uninstall(id.as_deref()),
        CliCommand::Installed => context.installed(),
        CliCommand::Paths => context.paths(),
        CliCommand::Help | CliCommand::Version => Ok(()),
    }
}

struct CommandContext {
    config: AppConfig,
    global: GlobalOptions,
}

impl CommandContext {
    fn format(&self) -> OutputFormat {
        self.global.format
    }

    fn target_root(&self) -> Result<PathBuf> {
        let configured = self.global.root.as_deref().or(self.config.game_root.as_deref());
        layout::resolve_root(configured)
    }

    fn load_catalog(&self) -> Result<CatalogIndex> {
        let location = self.config.catalog_url.as_str();
        let records = if location.starts_with("http://") || location.starts_with("https://") {
            ThunderstoreSource::new(location, self.config.timeouts()).fetch_records()?
        } else {
            FileCatalogSource::new(location).fetch_records()?
        };
        let catalog = CatalogIndex::load(records).context("load catalog")?;
        if catalog.is_empty() {
            warn!(catalog = %location, "catalog has no packages");
        }
        debug!(packages = catalog.len(), "catalog loaded");
        Ok(catalog)
    }

    /// Commands that only touch the disk run without fetching the catalog.
    fn orchestrator(&self, catalog: CatalogIndex) -> Result<Orchestrator> {
        let root = self.target_root()?;
        Ok(self.orchestrator_at(catalog, Some(TargetLayout::new(root))))
    }

    /// Search and resolve never touch the game directory, so a missing one is fine.
    fn catalog_orchestrator(&self) -> Result<Orchestrator> {
        let catalog = self.load_catalog()?;
        let layout = match self.target_root() {
            Ok(root) => Some(TargetLayout::new(root)),
            Err(err) => {
                debug!("no game directory: {err:#}");
                None
            }
        };
        Ok(self.orchestrator_at(catalog, layout))
    }

    fn orchestrator_at(&self, catalog: CatalogIndex, layout: Option<TargetLayout>) -> Orchestrator {
        Orchestrator::new(
            catalog,
            Arc::new(HttpFetcher::new(self.config.timeouts())),
            layout,
            self.config.orchestrator_settings(),
        )
    }

    fn search(&self, query: &str) -> Result<()> {
        let mut orchestrator = self.catalog_orchestrator()?;
        let IntentResult::SearchResults(found) = orchestrator.handle(Intent::Search(query.to_string())) else {
            bail!("search did not return results");
        };
        let items: Vec<PackageItem> = found
            .iter()
            .map(|package| PackageItem {
                id: package.id.clone(),
                name: package.display_name.clone(),
                version: package.version.clone(),
                dependency: false,
            })
            .collect();

        match self.format() {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&items)?),
            OutputFormat::Text => {
                if items.is_empty() {
                    println!("No packages match '{query}'.");
                }
                for item in items {
                    println!("{:<48} {:<12} {}", item.id, item.version, item.name);
                }
            }
        }
        Ok(())
    }

    fn resolve(&self, ids: &[String]) -> Result<()> {
        let mut orchestrator = self.catalog_orchestrator()?;
        let confirmation = confirm_selection(&mut orchestrator, ids, false)?;
        self.print_plan(&confirmation)
    }

    fn install(&self, ids: &[String], yes: bool, no_deps: bool) -> Result<()> {
        let catalog = self.load_catalog()?;
        let mut orchestrator = self.orchestrator(catalog)?;
        let confirmation = confirm_selection(&mut orchestrator, ids, true)?;
        for id in &confirmation.unresolved {
            eprintln!("warning: dependency {id} is not in the catalog and will not be installed");
        }

        let include_dependencies = if no_deps {
            false
        } else if yes || !self.config.confirm_dependencies || confirmation.added_dependencies.is_empty() {
            true
        } else {
            let names: Vec<&str> = confirmation
                .added_dependencies
                .iter()
                .map(|package| package.id.as_str())
                .collect();
            prompt_yes_no(&format!(
                "Also install {} dependencies ({})?",
                names.len(),
                names.join(", ")
            ))?
        };

        // JSON output has no progress lines, so the batch runs on this thread.
        let report = if self.format() == OutputFormat::Json {
            orchestrator.install(&confirmation, include_dependencies)?
        } else {
            let handle = orchestrator.spawn_install(&confirmation, include_dependencies)?;
            if io::stdin().is_terminal() {
                eprintln!("Type q and press Enter to stop after the current package.");
                let canceller = handle.canceller();
                thread::spawn(move || watch_for_quit(canceller));
            }
            handle.wait_with(|progress| {
                eprintln!(
                    "[{}/{}] {} {}",
                    progress.unit_index,
                    progress.unit_count,
                    progress.stage.label(),
                    progress.id
                );
            })?
        };

        self.print_report(&report)?;
        let failed = report.failed_count();
        if failed > 0 {
            bail!("{failed} package(s) failed to install");
        }
        Ok(())
    }

    fn install_loader(&self) -> Result<()> {
        let orchestrator = self.orchestrator(CatalogIndex::default())?;
        let outcome = orchestrator.install_loader()?;
        match self.format() {
            OutputFormat::Json => {
                let (status, files) = match outcome {
                    LoaderOutcome::Installed { files } => ("installed", files),
                    LoaderOutcome::AlreadyInstalled => ("already_installed", 0),
                };
                println!("{}", serde_json::json!({ "status": status, "files": files }));
            }
            OutputFormat::Text => match outcome {
                LoaderOutcome::Installed { files } => println!("Loader installed ({files} files)."),
                LoaderOutcome::AlreadyInstalled => println!("Loader already installed."),
            },
        }
        Ok(())
    }

    fn install_modpack(&self) -> Result<()> {
        let orchestrator = self.orchestrator(CatalogIndex::default())?;
        let files = orchestrator.install_modpack()?;
        match self.format() {
            OutputFormat::Json => println!("{}", serde_json::json!({ "status": "installed", "files": files })),
            OutputFormat::Text => println!("Modpack installed ({files} files)."),
        }
        Ok(())
    }

    fn uninstall(&self, id: Option<&str>) -> Result<()> {
        let orchestrator = self.orchestrator(CatalogIndex::default())?;
        let Some(id) = id else {
            let outcomes = orchestrator.uninstall()?;
            return self.print_removals(&outcomes);
        };

        let removal = orchestrator.uninstall_package(id)?;
        match (self.format(), &removal) {
            (OutputFormat::Json, PackageRemoval::NotInstalled) => {
                println!("{}", serde_json::json!({ "id": id, "status": "not_installed" }));
            }
            (
                OutputFormat::Json,
                PackageRemoval::Removed {
                    removed,
                    kept_shared,
                    failed,
                },
            ) => {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "id": id,
                        "status": "removed",
                        "removed": removed,
                        "kept_shared": kept_shared,
                        "failed": failed,
                    }))?
                );
            }
            (OutputFormat::Text, PackageRemoval::NotInstalled) => println!("{id} is not installed."),
            (
                OutputFormat::Text,
                PackageRemoval::Removed {
                    removed,
                    kept_shared,
                    failed,
                },
            ) => {
                println!("Removed {id}: {removed} file(s), {kept_shared} shared file(s) kept.");
                for failure in failed {
                    println!("  failed: {failure}");
                }
            }
        }
        Ok(())
    }

    fn installed(&self) -> Result<()> {
        let orchestrator = self.orchestrator(CatalogIndex::default())?;
        let manifest = orchestrator.installed()?;
        let loader = orchestrator
            .layout()
            .is_some_and(|layout| layout.loader_installed());
        let items = installed_items(&manifest);

        match self.format() {
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "loader_installed": loader,
                        "packages": items,
                    }))?
                );
            }
            OutputFormat::Text => {
                println!("Loader: {}", if loader { "installed" } else { "not installed" });
                if items.is_empty() {
                    println!("No packages installed.");
                }
                for item in items {
                    println!(
                        "{:<48} {:<12} {:>4} files  {}",
                        item.id,
                        item.version,
                        item.files,
                        format_date_cell(item.installed_at)
                    );
                }
            }
        }
        Ok(())
    }

    fn paths(&self) -> Result<()> {
        let root = self.target_root();
        let layout = root.as_ref().ok().map(TargetLayout::new);
        let config_path = config::config_path().ok();
        let output = PathsOutput {
            game_root: layout.as_ref().map(|layout| layout.root.clone()),
            loader_dir: layout.as_ref().map(|layout| layout.loader_dir.clone()),
            plugins_dir: layout.as_ref().map(|layout| layout.plugins_dir.clone()),
            state_dir: layout.as_ref().map(|layout| layout.state_dir.clone()),
            config_path,
            catalog: self.config.catalog_url.clone(),
        };

        match self.format() {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&output)?),
            OutputFormat::Text => {
                if let Err(err) = &root {
                    warn!("{err:#}");
                }
                println!("Game root:   {}", display_path(output.game_root.as_ref()));
                println!("Loader dir:  {}", display_path(output.loader_dir.as_ref()));
                println!("Plugins dir: {}", display_path(output.plugins_dir.as_ref()));
                println!("State dir:   {}", display_path(output.state_dir.as_ref()));
                println!("Config:      {}", display_path(output.config_path.as_ref()));
                println!("Catalog:     {}", output.catalog);
            }
        }
        Ok(())
    }

    fn print_plan(&self, confirmation: &Confirmation) -> Result<()> {
        let items: Vec<PackageItem> = confirmation
            .plan
            .packages
            .iter()
            .map(|package| PackageItem {
                id: package.id.clone(),
                name: package.display_name.clone(),
                version: package.version.clone(),
                dependency: !confirmation.plan.requested.contains(&package.id),
            })
            .collect();

        match self.format() {
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "packages": items,
                        "unresolved": confirmation.unresolved,
                    }))?
                );
            }
            OutputFormat::Text => {
                for (index, item) in items.iter().enumerate() {
                    let marker = if item.dependency { " (dependency)" } else { "" };
                    println!("{:>3}. {} {}{marker}", index + 1, item.id, item.version);
                }
                for id in &confirmation.unresolved {
                    println!("  unresolved: {id}");
                }
            }
        }
        Ok(())
    }

    fn print_report(&self, report: &InstallReport) -> Result<()> {
        let items: Vec<OutcomeItem> = report
            .outcomes
            .iter()
            .map(|outcome| {
                let (status, reason) = match &outcome.status {
                    InstallStatus::Installed => ("installed", None),
                    InstallStatus::SkippedAlreadyInstalled => ("skipped", None),
                    InstallStatus::Failed(failure) => ("failed", Some(failure.to_string())),
                };
                OutcomeItem {
                    id: outcome.id.clone(),
                    version: outcome.version.clone(),
                    status,
                    reason,
                }
            })
            .collect();

        match self.format() {
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "outcomes": items,
                        "cancelled": report.cancelled,
                        "warnings": report.warnings,
                    }))?
                );
            }
            OutputFormat::Text => {
                for item in &items {
                    match &item.reason {
                        Some(reason) => println!("{:<10} {} ({reason})", item.status, item.id),
                        None => println!("{:<10} {} {}", item.status, item.id, item.version),
                    }
                }
                for warning in &report.warnings {
                    println!("warning: {warning}");
                }
                if report.cancelled {
                    println!("Install cancelled before all packages were attempted.");
                }
                println!(
                    "{} installed, {} skipped, {} failed.",
                    report.installed_count(),
                    report.skipped_count(),
                    report.failed_count()
                );
            }
        }
        Ok(())
    }

    fn print_removals(&self, outcomes: &[RemovalOutcome]) -> Result<()> {
        match self.format() {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(outcomes)?),
            OutputFormat::Text => {
                for outcome in outcomes {
                    let label = match &outcome.status {
                        RemovalStatus::Removed => "removed".to_string(),
                        RemovalStatus::Absent => "absent".to_string(),
                        RemovalStatus::Failed(reason) => format!("failed: {reason}"),
                    };
                    println!("{:<10} {}", label, outcome.path.display());
                }
            }
        }
        Ok(())
    }
}

/// Selects `ids` and resolves them. With `drop_unknown`, ids missing from
/// the catalog are warned about and deselected instead of reported as unresolved.
fn confirm_selection(orchestrator: &mut Orchestrator, ids: &[String], drop_unknown: bool) -> Result<Confirmation> {
    for id in ids {
        if let IntentResult::Selection { known: false, .. } = orchestrator.handle(Intent::Select(id.clone())) {
            if drop_unknown {
                warn!(%id, "not in the catalog, skipping");
                orchestrator.handle(Intent::Deselect(id.clone()));
            } else {
                debug!(%id, "selected id is not in the catalog");
            }
        }
    }
    match orchestrator.handle(Intent::Confirm) {
        IntentResult::Confirm(confirmation) => Ok(confirmation),
        _ => bail!("no packages selected"),
    }
}

fn prompt_yes_no(question: &str) -> Result<bool> {
    let stdin = io::stdin();
    let mut stderr = io::stderr();
    write!(stderr, "{question} [Y/n] ")?;
    stderr.flush()?;
    let mut answer = String::new();
    stdin.lock().read_line(&mut answer).context("read answer")?;
    Ok(parse_answer(&answer))
}

/// Cancels the running batch once the user types `q`. The thread is left
/// blocked on stdin and ends with the process.
fn watch_for_quit(canceller: CancelToken) {
    for line in io::stdin().lock().lines() {
        let Ok(line) = line else {
            return;
        };
        if is_quit(&line) {
            warn!("stopping after the current package");
            canceller.cancel();
            return;
        }
    }
}

fn is_quit(line: &str) -> bool {
    matches!(line.trim().to_ascii_lowercase().as_str(), "q" | "quit")
}

fn parse_answer(answer: &str) -> bool {
    !matches!(answer.trim().to_ascii_lowercase().as_str(), "n" | "no")
}

#[derive(Serialize)]
struct PackageItem {
    id: String,
    name: String,
    version: String,
    dependency: bool,
}

#[derive(Serialize)]
struct OutcomeItem {
    id: String,
    version: String,
    status: &'static str,
    reason: Option<String>,
}

#[derive(Serialize)]
struct InstalledItem {
    id: String,
    version: String,
    files: usize,
    installed_at: i64,
}

#[derive(Serialize)]
struct PathsOutput {
    game_root: Option<PathBuf>,
    loader_dir: Option<PathBuf>,
    plugins_dir: Option<PathBuf>,
    state_dir: Option<PathBuf>,
    config_path: Option<PathBuf>,
    catalog: String,
}

fn installed_items(manifest: &InstalledManifest) -> Vec<InstalledItem> {
    manifest
        .packages
        .iter()
        .map(|(id, package)| InstalledItem {
            id: id.clone(),
            version: package.version.clone(),
            files: package.files.len(),
            installed_at: package.installed_at,
        })
        .collect()
}

fn display_path(path: Option<&PathBuf>) -> String {
    path.map(|path| path.display().to_string())
        .unwrap_or_else(|| "(not found)".to_string())
}

fn print_help() {
    println!("modpack v{}", env!("CARGO_PKG_VERSION"));
    println!("Usage:");
    println!("  modpack search <query>              Search the catalog by name");
    println!("  modpack resolve <id>...             Show the install plan for packages");
    println!("  modpack install <id>...             Install packages and their dependencies");
    println!("  modpack install-loader              Install BepInEx into the game directory");
    println!("  modpack install-modpack             Unpack the configured modpack into BepInEx/");
    println!("  modpack uninstall                   Remove BepInEx, all mods and modpack state");
    println!("  modpack uninstall <id>              Remove the files one package installed");
    println!("  modpack installed                   List installed packages");
    println!("  modpack paths                       Show detected paths");
    println!();
    println!("Global options:");
    println!("  --root <dir>                        Game directory (default: config, then Steam)");
    println!("  --catalog <file|url>                Catalog location");
    println!("  --format <json|text>                Output format");
    println!("  --workers <n>                       Packages downloaded in parallel");
    println!("  -v, -vv                             Increase log verbosity");
    println!("  -h, --help                          Show help");
    println!("  -V, --version                       Show version");
    println!();
    println!("Install options:");
    println!("  -y, --yes                           Install dependencies without asking");
    println!("  --no-deps                           Install only the named packages");
}

fn format_date_cell(value: i64) -> String {
    format_short_date(value).unwrap_or_else(|| "----------".to_string())
}

fn format_short_date(timestamp: i64) -> Option<String> {
    if timestamp <= 0 {
        return None;
    }
    let date = time::OffsetDateTime::from_unix_timestamp(timestamp).ok()?;
    let format = time::macros::format_description!("[year]-[month]-[day] [hour]:[minute]");
    date.format(&format).ok()
}
