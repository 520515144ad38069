//! Remote object storage: destination naming, write modes and the upload
//! client that forwards ingested files to a backend.

pub mod dropbox;
pub mod memory;

use chrono::{DateTime, Utc};
use filetime::FileTime;
use serde::{Deserialize, Serialize};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

use crate::timing::TransferTimer;

pub use dropbox::DropboxStorage;
pub use memory::MemoryStorage;

/// Conflict policy for an upload whose destination may already exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    /// Fail if an object already exists at the destination
    #[default]
    Add,
    /// Replace whatever is at the destination
    Overwrite,
}

impl WriteMode {
    pub fn from_overwrite(overwrite: bool) -> Self {
        if overwrite {
            WriteMode::Overwrite
        } else {
            WriteMode::Add
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WriteMode::Add => "add",
            WriteMode::Overwrite => "overwrite",
        }
    }
}

/// Collapse every run of `/` into a single `/`. Idempotent.
pub fn collapse_separators(path: &str) -> String {
    let mut out = path.to_string();
    while out.contains("//") {
        out = out.replace("//", "/");
    }
    out
}

/// Where an ingested file lands in remote storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDestination {
    pub folder: String,
    pub name: String,
}

impl RemoteDestination {
    pub fn new(folder: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            folder: folder.into(),
            name: name.into(),
        }
    }

    /// Absolute remote path, never containing a doubled separator.
    pub fn path(&self) -> String {
        collapse_separators(&format!("/{}/{}", self.folder, self.name))
    }
}

/// Modification time truncated to whole seconds (sub-second part dropped,
/// never rounded).
pub fn truncate_to_seconds(mtime: FileTime) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(mtime.unix_seconds(), 0).unwrap_or_default()
}

pub fn client_modified_for(metadata: &std::fs::Metadata) -> DateTime<Utc> {
    truncate_to_seconds(FileTime::from_last_modification_time(metadata))
}

/// One backend call.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub data: Vec<u8>,
    pub path: String,
    pub mode: WriteMode,
    pub client_modified: DateTime<Utc>,
    pub mute: bool,
}

/// What the backend reports for a stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub name: String,
    #[serde(default)]
    pub path_display: Option<String>,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub client_modified: Option<DateTime<Utc>>,
    #[serde(default)]
    pub rev: Option<String>,
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("path/conflict: an object already exists at {path}")]
    Conflict { path: String },

    #[error("API error {status}: {summary}")]
    Api { status: u16, summary: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid remote configuration: {0}")]
    Config(String),

    #[error("failed to read {}: {source}", path.display())]
    LocalIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl RemoteError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, RemoteError::Conflict { .. })
    }
}

/// A remote object store that can take a whole file in one call.
pub trait RemoteStorage: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    fn upload(&self, request: &UploadRequest) -> Result<FileMetadata, RemoteError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct UploadResult {
    pub remote_name: String,
    pub remote_path: String,
    pub size: u64,
    pub client_modified: DateTime<Utc>,
    pub elapsed_seconds: f64,
}

/// Uploads local files to a [`RemoteStorage`] backend. Failures are logged
/// here and handed back as `Err`; nothing is retried.
#[derive(Clone)]
pub struct RemoteStorageClient {
    backend: Arc<dyn RemoteStorage>,
}

impl RemoteStorageClient {
    pub fn new(backend: Arc<dyn RemoteStorage>) -> Self {
        Self { backend }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn upload(
        &self,
        local_path: &Path,
        folder: &str,
        name: &str,
        overwrite: bool,
    ) -> Result<UploadResult, RemoteError> {
        match std::fs::File::open(local_path) {
            Ok(content) => self.upload_from(&content, local_path, folder, name, overwrite),
            Err(source) => {
                let path = RemoteDestination::new(folder, name).path();
                Err(local_failure(&path, local_path, source))
            }
        }
    }

    /// Upload the whole of an already open file. The content and mtime come
    /// from the handle, so a later upload replacing `local_path` on disk
    /// does not change what is sent.
    pub fn upload_from(
        &self,
        content: &std::fs::File,
        local_path: &Path,
        folder: &str,
        name: &str,
        overwrite: bool,
    ) -> Result<UploadResult, RemoteError> {
        let path = RemoteDestination::new(folder, name).path();
        let mode = WriteMode::from_overwrite(overwrite);

        let local_err = |source| local_failure(&path, local_path, source);
        let metadata = content.metadata().map_err(local_err)?;
        let client_modified = client_modified_for(&metadata);
        let mut data = Vec::with_capacity(metadata.len() as usize);
        let mut reader = content;
        reader.seek(SeekFrom::Start(0)).map_err(local_err)?;
        reader.read_to_end(&mut data).map_err(local_err)?;
        let size = data.len() as u64;

        let request = UploadRequest {
            data,
            path: path.clone(),
            mode,
            client_modified,
            mute: true,
        };

        let timer = TransferTimer::start(format!("upload {} bytes", size));
        let outcome = self.backend.upload(&request);
        let elapsed_seconds = timer.finish();

        match outcome {
            Ok(meta) => {
                info!(backend = self.backend.name(), path = %path, "uploaded as {:?}", meta.name);
                Ok(UploadResult {
                    remote_path: meta.path_display.clone().unwrap_or_else(|| path.clone()),
                    remote_name: meta.name,
                    size,
                    client_modified,
                    elapsed_seconds,
                })
            }
            Err(err) => {
                error!(backend = self.backend.name(), path = %path, mode = mode.as_str(), "*** API error {}", err);
                Err(err)
            }
        }
    }
}

fn local_failure(remote_path: &str, local_path: &Path, source: std::io::Error) -> RemoteError {
    let err = RemoteError::LocalIo {
        path: local_path.to_path_buf(),
        source,
    };
    error!(path = %remote_path, "*** API error {}", err);
    err
}
