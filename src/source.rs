use crate::catalog::CatalogRecord;
use crate::error::{CatalogFormatError, FetchError};
use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::{
    fs,
    io::{self, Read, Write},
    path::PathBuf,
    time::Duration,
};
use tracing::{debug, info};

pub const THUNDERSTORE_URL: &str = "https://thunderstore.io/c/lethal-company/api/v1/package/";
const USER_AGENT: &str = "modpack";
const COPY_BUFFER: usize = 64 * 1024;

/// Anything that can hand over the raw catalog records.
pub trait CatalogSource {
    fn fetch_records(&self) -> Result<Vec<CatalogRecord>>;
}

/// Streams an archive into `sink`. Implementations treat a transfer as
/// all-or-nothing; partial writes are the caller's temporary file to discard.
pub trait ArchiveFetcher: Send + Sync {
    fn fetch(&self, url: &str, sink: &mut dyn Write) -> Result<u64, FetchError>;
}

#[derive(Debug, Clone, Copy)]
pub struct FetchTimeouts {
    pub connect: Duration,
    /// Longest silence allowed between two reads.
    pub read: Duration,
    /// Upper bound on a whole request, body included.
    pub total: Duration,
}

impl Default for FetchTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(5),
            read: Duration::from_secs(60),
            total: Duration::from_secs(600),
        }
    }
}

fn build_agent(timeouts: FetchTimeouts) -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout_connect(timeouts.connect)
        .timeout_read(timeouts.read)
        .timeout_write(timeouts.read)
        .timeout(timeouts.total)
        .build()
}

#[derive(Debug, Deserialize)]
struct ThunderstorePackage {
    #[serde(default)]
    full_name: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    versions: Vec<ThunderstoreVersion>,
}

#[derive(Debug, Deserialize)]
struct ThunderstoreVersion {
    #[serde(default)]
    version_number: Option<String>,
    #[serde(default)]
    download_url: Option<String>,
    #[serde(default)]
    dependencies: Vec<String>,
}

impl From<ThunderstorePackage> for CatalogRecord {
    fn from(package: ThunderstorePackage) -> Self {
        // Versions are listed newest first.
        let latest = package.versions.into_iter().next();
        let (version, download_url, dependencies) = match latest {
            Some(latest) => (
                latest.version_number,
                latest.download_url,
                latest
                    .dependencies
                    .iter()
                    .map(|raw| dependency_id(raw).to_string())
                    .collect(),
            ),
            None => (None, None, Vec::new()),
        };
        CatalogRecord {
            id: package.full_name,
            name: package.name,
            version,
            download_url,
            dependencies,
        }
    }
}

/// Thunderstore dependency strings pin a version (`Owner-Name-1.2.3`);
/// the catalog is keyed by `Owner-Name`.
pub fn dependency_id(raw: &str) -> &str {
    let raw = raw.trim();
    match raw.rsplit_once('-') {
        Some((head, tail))
            if !head.is_empty()
                && !tail.is_empty()
                && tail.chars().all(|ch| ch.is_ascii_digit() || ch == '.') =>
        {
            head
        }
        _ => raw,
    }
}

/// Accepts either the Thunderstore package listing or a flat array of
/// [`CatalogRecord`]s.
pub fn records_from_json(raw: &str) -> Result<Vec<CatalogRecord>, CatalogFormatError> {
    let value: Value = serde_json::from_str(raw)?;
    let thunderstore_shape = value
        .as_array()
        .and_then(|items| items.first())
        .map(|first| first.get("versions").is_some())
        .unwrap_or(false);
    if thunderstore_shape {
        let packages: Vec<ThunderstorePackage> = serde_json::from_value(value)?;
        Ok(packages.into_iter().map(CatalogRecord::from).collect())
    } else {
        Ok(serde_json::from_value(value)?)
    }
}

pub struct ThunderstoreSource {
    url: String,
    agent: ureq::Agent,
}

impl ThunderstoreSource {
    pub fn new(url: impl Into<String>, timeouts: FetchTimeouts) -> Self {
        Self {
            url: url.into(),
            agent: build_agent(timeouts),
        }
    }
}

impl CatalogSource for ThunderstoreSource {
    fn fetch_records(&self) -> Result<Vec<CatalogRecord>> {
        info!(url = %self.url, "fetching catalog");
        let response = self
            .agent
            .get(&self.url)
            .set("User-Agent", USER_AGENT)
            .call()
            .map_err(|err| classify_ureq_error(&self.url, err))
            .context("fetch catalog")?;
        // The listing is far larger than ureq's in-memory string limit.
        let packages: Vec<ThunderstorePackage> = serde_json::from_reader(response.into_reader())
            .map_err(CatalogFormatError::from)
            .context("decode catalog")?;
        Ok(packages.into_iter().map(CatalogRecord::from).collect())
    }
}

pub struct FileCatalogSource {
    path: PathBuf,
}

impl FileCatalogSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CatalogSource for FileCatalogSource {
    fn fetch_records(&self) -> Result<Vec<CatalogRecord>> {
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("read catalog {}", self.path.display()))?;
        let records = records_from_json(&raw).context("parse catalog file")?;
        Ok(records)
    }
}

pub struct HttpFetcher {
    agent: ureq::Agent,
}

impl HttpFetcher {
    pub fn new(timeouts: FetchTimeouts) -> Self {
        Self {
            agent: build_agent(timeouts),
        }
    }
}

impl ArchiveFetcher for HttpFetcher {
    fn fetch(&self, url: &str, sink: &mut dyn Write) -> Result<u64, FetchError> {
        debug!(%url, "downloading archive");
        let response = self
            .agent
            .get(url)
            .set("User-Agent", USER_AGENT)
            .call()
            .map_err(|err| classify_ureq_error(url, err))?;
        let mut reader = response.into_reader();
        copy_stream(url, &mut reader, sink)
    }
}

fn classify_ureq_error(url: &str, err: ureq::Error) -> FetchError {
    match err {
        ureq::Error::Status(status, _) => FetchError::Http {
            url: url.to_string(),
            status,
        },
        ureq::Error::Transport(transport) => {
            if transport_timed_out(&transport) {
                FetchError::Timeout {
                    url: url.to_string(),
                }
            } else {
                FetchError::Connection {
                    url: url.to_string(),
                    message: transport.to_string(),
                }
            }
        }
    }
}

fn transport_timed_out(transport: &ureq::Transport) -> bool {
    let mut source = std::error::Error::source(transport);
    while let Some(err) = source {
        if let Some(io_err) = err.downcast_ref::<io::Error>() {
            if is_timeout_kind(io_err.kind()) {
                return true;
            }
        }
        source = err.source();
    }
    transport.to_string().contains("timed out")
}

fn is_timeout_kind(kind: io::ErrorKind) -> bool {
    matches!(kind, io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
}

/// Like `io::copy`, but keeps read-side (network) and write-side (disk)
/// failures apart.
pub(crate) fn copy_stream(
    url: &str,
    reader: &mut dyn Read,
    sink: &mut dyn Write,
) -> Result<u64, FetchError> {
    let mut buffer = vec![0u8; COPY_BUFFER];
    let mut total = 0u64;
    loop {
        let read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) if is_timeout_kind(err.kind()) => {
                return Err(FetchError::Timeout {
                    url: url.to_string(),
                })
            }
            Err(err) => {
                return Err(FetchError::Connection {
                    url: url.to_string(),
                    message: err.to_string(),
                })
            }
        };
        sink.write_all(&buffer[..read])
            .map_err(|source| FetchError::Io {
                url: url.to_string(),
                source,
            })?;
        total += read as u64;
    }
    sink.flush().map_err(|source| FetchError::Io {
        url: url.to_string(),
        source,
    })?;
    Ok(total)
}
