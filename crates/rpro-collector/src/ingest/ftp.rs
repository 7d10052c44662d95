//! FTP access to IHM export directories
//!
//! Each IHM exposes its CSV exports over plain FTP. A collection pass opens
//! one session per endpoint, lists the export directory, downloads every CSV
//! into a per-endpoint temp directory and hashes it. Files whose hash the
//! collector already knows are deleted straight away.
//!
//! `suppaftp`'s blocking client runs inside `spawn_blocking`, one session per
//! call, bounded by [`FtpTimeouts`] so a stalled terminal never holds up the
//! async runtime or the collection cycle.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use std::collections::HashSet;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use suppaftp::types::FileType;
use suppaftp::{FtpStream, Mode};
use tracing::{debug, info, trace, warn};

use rpro_common::checksum::sha256_hex;

use super::config::IhmEndpoint;
use super::models::{CollectedFile, FlowRole};

/// Time limits for one FTP session
///
/// `io` bounds every read and write on the control socket. `session` bounds
/// the whole blocking session, data transfers included, as seen from the
/// async side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FtpTimeouts {
    pub connect: Duration,
    pub io: Duration,
    pub session: Duration,
}

impl FtpTimeouts {
    /// Collection passes: list and download every export
    pub const COLLECTION: Self = Self {
        connect: Duration::from_secs(10),
        io: Duration::from_secs(30),
        session: Duration::from_secs(300),
    };

    /// Connection tests: connect, login and change directory
    pub const CONNECTION_TEST: Self = Self {
        connect: Duration::from_secs(5),
        io: Duration::from_secs(5),
        session: Duration::from_secs(15),
    };
}

/// Outcome of a connection test; never an error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionCheck {
    pub ok: bool,
    pub message: String,
}

impl ConnectionCheck {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
        }
    }
}

/// A remote directory that yields new export files
#[async_trait]
pub trait FileSource: Send + Sync {
    /// Endpoint name used in logs and results
    fn identifier(&self) -> &str;

    /// Default flow role of rows from this source
    fn role(&self) -> Option<FlowRole>;

    async fn test_connection(&self) -> ConnectionCheck;

    /// Download every CSV whose content hash is not in `known_hashes`
    ///
    /// Fails only when the endpoint cannot be reached or listed. Individual
    /// download failures are logged and skipped.
    async fn find_new_files(&self, known_hashes: HashSet<String>) -> Result<Vec<CollectedFile>>;
}

/// Builds the source used for an endpoint
pub trait SourceProvider: Send + Sync {
    fn source_for(&self, endpoint: &IhmEndpoint, temp_root: &Path) -> Box<dyn FileSource>;
}

/// Provider backed by real FTP connections
#[derive(Debug, Clone, Copy, Default)]
pub struct FtpSourceProvider;

impl SourceProvider for FtpSourceProvider {
    fn source_for(&self, endpoint: &IhmEndpoint, temp_root: &Path) -> Box<dyn FileSource> {
        Box::new(IhmFtpSource::new(endpoint.clone(), temp_root))
    }
}

/// Parsed FTP directory entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtpEntry {
    pub name: String,
    pub is_directory: bool,
    pub size: Option<u64>,
    pub modified: Option<DateTime<Utc>>,
}

impl FtpEntry {
    /// Parse a LIST line in POSIX or DOS format
    pub fn parse(line: &str) -> Option<Self> {
        if line.trim().is_empty() {
            return None;
        }

        match suppaftp::list::File::from_str(line) {
            Ok(file) => Some(Self {
                name: file.name().to_string(),
                is_directory: file.is_directory(),
                size: Some(file.size() as u64),
                modified: Some(DateTime::<Utc>::from(file.modified())),
            }),
            Err(e) => {
                trace!(line, error = ?e, "Unparseable LIST line");
                None
            },
        }
    }

    pub fn is_csv(&self) -> bool {
        !self.is_directory && self.name.to_lowercase().ends_with(".csv")
    }
}

/// Keep CSV files only, newest modification first
pub fn select_csv_entries(entries: impl IntoIterator<Item = FtpEntry>) -> Vec<FtpEntry> {
    let mut csv: Vec<FtpEntry> = entries.into_iter().filter(FtpEntry::is_csv).collect();
    csv.sort_by(|a, b| b.modified.cmp(&a.modified));
    csv
}

/// `<root>/ihm_<host with dots replaced by underscores>`
pub fn temp_dir_for(temp_root: &Path, host: &str) -> PathBuf {
    temp_root.join(format!("ihm_{}", host.replace('.', "_")))
}

/// Join a remote directory and a file name
pub fn remote_file_path(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Write downloaded bytes to a timestamp-prefixed temp file and describe it
pub fn stage_local_copy(
    temp_dir: &Path,
    entry: &FtpEntry,
    remote_path: &str,
    bytes: &[u8],
    source: &str,
) -> Result<CollectedFile> {
    std::fs::create_dir_all(temp_dir)
        .with_context(|| format!("Failed to create temp directory {}", temp_dir.display()))?;

    let local_name = format!("{}_{}", Local::now().format("%Y%m%d_%H%M%S"), entry.name);
    let local_path = temp_dir.join(local_name);
    std::fs::write(&local_path, bytes)
        .with_context(|| format!("Failed to write {}", local_path.display()))?;

    Ok(CollectedFile {
        name: entry.name.clone(),
        local_path,
        remote_path: remote_path.to_string(),
        modified: entry.modified,
        size: entry.size.unwrap_or(bytes.len() as u64),
        hash: sha256_hex(bytes),
        source: source.to_string(),
    })
}

/// Pass the file through unless its hash is known, deleting the temp copy if it is
pub fn keep_if_new(file: CollectedFile, known_hashes: &HashSet<String>) -> Option<CollectedFile> {
    if !known_hashes.contains(&file.hash) {
        return Some(file);
    }

    debug!(file = %file.name, hash = %file.hash, "File already processed, discarding");
    if let Err(e) = std::fs::remove_file(&file.local_path) {
        warn!(path = %file.local_path.display(), error = %e, "Failed to delete temp file");
    }
    None
}

/// One IHM reached over FTP
#[derive(Debug, Clone)]
pub struct IhmFtpSource {
    endpoint: IhmEndpoint,
    temp_dir: PathBuf,
    timeouts: FtpTimeouts,
    test_timeouts: FtpTimeouts,
}

impl IhmFtpSource {
    pub fn new(endpoint: IhmEndpoint, temp_root: &Path) -> Self {
        let temp_dir = temp_dir_for(temp_root, &endpoint.host);
        Self {
            endpoint,
            temp_dir,
            timeouts: FtpTimeouts::COLLECTION,
            test_timeouts: FtpTimeouts::CONNECTION_TEST,
        }
    }

    /// Override the collection and connection-test time limits
    pub fn with_timeouts(mut self, collection: FtpTimeouts, connection_test: FtpTimeouts) -> Self {
        self.timeouts = collection;
        self.test_timeouts = connection_test;
        self
    }

    pub fn endpoint(&self) -> &IhmEndpoint {
        &self.endpoint
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    /// List the CSV exports, newest first
    pub async fn list_csv_files(&self) -> Result<Vec<FtpEntry>> {
        let endpoint = self.endpoint.clone();
        let timeouts = self.timeouts;

        run_session("LIST", timeouts.session, move || {
            let mut stream = connect(&endpoint, &timeouts)?;
            let listed = list_csv(&mut stream, &endpoint.remote_path);
            disconnect(stream);
            listed
        })
        .await
    }

    /// Download one listed file into the temp directory
    pub async fn download_file(&self, entry: &FtpEntry) -> Result<CollectedFile> {
        let endpoint = self.endpoint.clone();
        let temp_dir = self.temp_dir.clone();
        let entry = entry.clone();
        let timeouts = self.timeouts;

        run_session("download", timeouts.session, move || {
            let mut stream = connect(&endpoint, &timeouts)?;
            let downloaded = download(&mut stream, &endpoint, &temp_dir, &entry);
            disconnect(stream);
            downloaded
        })
        .await
    }
}

#[async_trait]
impl FileSource for IhmFtpSource {
    fn identifier(&self) -> &str {
        &self.endpoint.identifier
    }

    fn role(&self) -> Option<FlowRole> {
        self.endpoint.role
    }

    async fn test_connection(&self) -> ConnectionCheck {
        let endpoint = self.endpoint.clone();
        let timeouts = self.test_timeouts;

        match run_session("connection test", timeouts.session, move || {
            Ok(check_connection(&endpoint, &timeouts))
        })
        .await
        {
            Ok(check) => check,
            Err(e) => ConnectionCheck::failed(format!("Error: {:#}", e)),
        }
    }

    async fn find_new_files(&self, known_hashes: HashSet<String>) -> Result<Vec<CollectedFile>> {
        let endpoint = self.endpoint.clone();
        let temp_dir = self.temp_dir.clone();
        let timeouts = self.timeouts;

        let files = run_session("collection", timeouts.session, move || {
            let mut stream = connect(&endpoint, &timeouts)?;
            let collected = collect_new(&mut stream, &endpoint, &temp_dir, known_hashes);
            disconnect(stream);
            collected
        })
        .await?;

        info!(
            ihm = %self.endpoint.identifier,
            new_files = files.len(),
            "Finished FTP collection pass"
        );
        Ok(files)
    }
}

/// Run a blocking FTP session, giving up once `limit` has elapsed
///
/// A session that overruns keeps its blocking thread until the socket
/// timeouts release it; the caller gets an error straight away.
async fn run_session<T, F>(operation: &str, limit: Duration, session: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    match tokio::time::timeout(limit, tokio::task::spawn_blocking(session)).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => Err(anyhow::anyhow!("FTP {} task panicked: {}", operation, e)),
        Err(_) => anyhow::bail!("FTP {} timed out after {:?}", operation, limit),
    }
}

fn connect(endpoint: &IhmEndpoint, timeouts: &FtpTimeouts) -> Result<FtpStream> {
    debug!(ihm = %endpoint.identifier, address = %endpoint.address(), "Connecting to IHM");

    let addr = (endpoint.host.as_str(), endpoint.port)
        .to_socket_addrs()
        .with_context(|| format!("Failed to resolve {}", endpoint.address()))?
        .next()
        .with_context(|| format!("No address found for {}", endpoint.address()))?;

    let socket = TcpStream::connect_timeout(&addr, timeouts.connect)
        .with_context(|| format!("Failed to connect to {}", endpoint.address()))?;

    // the greeting is read with these limits already in place
    socket
        .set_read_timeout(Some(timeouts.io))
        .and_then(|_| socket.set_write_timeout(Some(timeouts.io)))
        .context("Failed to set FTP socket timeouts")?;

    let mut stream = FtpStream::connect_with_stream(socket)
        .with_context(|| format!("No FTP greeting from {}", endpoint.address()))?;

    // embedded IHM servers answer PASV but not always EPSV
    stream.set_mode(Mode::Passive);

    stream
        .login(&endpoint.user, &endpoint.password)
        .with_context(|| format!("FTP login failed for {}", endpoint.user))?;

    stream
        .transfer_type(FileType::Binary)
        .context("Failed to set binary mode")?;

    Ok(stream)
}

fn disconnect(mut stream: FtpStream) {
    if let Err(e) = stream.quit() {
        warn!("Failed to quit FTP session gracefully: {}", e);
    }
}

fn list_csv(stream: &mut FtpStream, remote_dir: &str) -> Result<Vec<FtpEntry>> {
    let lines = stream
        .list(Some(remote_dir))
        .with_context(|| format!("Failed to list directory: {}", remote_dir))?;

    let entries = select_csv_entries(lines.iter().filter_map(|line| FtpEntry::parse(line)));
    debug!(directory = remote_dir, listed = lines.len(), csv = entries.len(), "Listed exports");
    Ok(entries)
}

fn download(
    stream: &mut FtpStream,
    endpoint: &IhmEndpoint,
    temp_dir: &Path,
    entry: &FtpEntry,
) -> Result<CollectedFile> {
    let remote_path = remote_file_path(&endpoint.remote_path, &entry.name);
    let buffer = stream
        .retr_as_buffer(&remote_path)
        .with_context(|| format!("Failed to download file: {}", remote_path))?;

    let bytes = buffer.into_inner();
    debug!(file = %entry.name, bytes = bytes.len(), "Downloaded export");
    stage_local_copy(temp_dir, entry, &remote_path, &bytes, &endpoint.identifier)
}

fn collect_new(
    stream: &mut FtpStream,
    endpoint: &IhmEndpoint,
    temp_dir: &Path,
    mut known_hashes: HashSet<String>,
) -> Result<Vec<CollectedFile>> {
    let entries = list_csv(stream, &endpoint.remote_path)?;
    let mut files = Vec::new();

    for entry in &entries {
        match download(stream, endpoint, temp_dir, entry) {
            Ok(file) => {
                if let Some(file) = keep_if_new(file, &known_hashes) {
                    known_hashes.insert(file.hash.clone());
                    files.push(file);
                }
            },
            Err(e) => {
                warn!(ihm = %endpoint.identifier, file = %entry.name, "Download failed: {:#}", e);
            },
        }
    }

    Ok(files)
}

fn check_connection(endpoint: &IhmEndpoint, timeouts: &FtpTimeouts) -> ConnectionCheck {
    let mut stream = match connect(endpoint, timeouts) {
        Ok(stream) => stream,
        Err(e) => return ConnectionCheck::failed(format!("Error: {:#}", e)),
    };

    let found = stream.cwd(&endpoint.remote_path).is_ok();
    disconnect(stream);

    if found {
        ConnectionCheck::ok(format!(
            "Connection OK. Directory '{}' found.",
            endpoint.remote_path
        ))
    } else {
        ConnectionCheck::failed(format!(
            "Connected, but directory '{}' not found.",
            endpoint.remote_path
        ))
    }
}
