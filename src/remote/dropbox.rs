//! Dropbox API v2 backend (`files/upload` content endpoint).
//!
//! One request per upload. The commit arguments travel as JSON in the
//! `Dropbox-API-Arg` header and the body is the raw file. Rate limits and
//! server errors are reported, not retried.

use reqwest::blocking::Client;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use std::time::Duration;

use super::{FileMetadata, RemoteError, RemoteStorage, UploadRequest};

const CONTENT_BASE: &str = "https://content.dropboxapi.com/2";
const UPLOAD_ROUTE: &str = "files/upload";
const REQUEST_TIMEOUT_SECS: u64 = 120;

/// Dropbox's `client_modified` wire format (UTC, whole seconds).
const CLIENT_MODIFIED_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

#[derive(Debug, Deserialize)]
struct ApiErrorEnvelope {
    #[serde(default)]
    error_summary: Option<String>,
}

pub struct DropboxStorage {
    http: Client,
    access_token: String,
    content_base: String,
}

impl std::fmt::Debug for DropboxStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DropboxStorage")
            .field("content_base", &self.content_base)
            .field("token", &self.masked_token())
            .finish()
    }
}

impl DropboxStorage {
    pub fn new(access_token: &str) -> Result<Self, RemoteError> {
        let token = access_token.trim();
        if token.is_empty() {
            return Err(RemoteError::Config("Dropbox access token must not be empty".into()));
        }
        let http = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| RemoteError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            access_token: token.to_string(),
            content_base: CONTENT_BASE.to_string(),
        })
    }

    /// Point the client at a different content host (proxies, test servers).
    pub fn with_content_base(mut self, base: &str) -> Self {
        self.content_base = base.trim_end_matches('/').to_string();
        self
    }

    pub fn masked_token(&self) -> String {
        let chars: Vec<char> = self.access_token.chars().collect();
        if chars.len() <= 8 {
            "****".into()
        } else {
            let head: String = chars[..4].iter().collect();
            let tail: String = chars[chars.len() - 4..].iter().collect();
            format!("{head}…{tail}")
        }
    }
}

/// The `Dropbox-API-Arg` header for a plain upload.
pub(crate) fn upload_arg(request: &UploadRequest) -> serde_json::Value {
    serde_json::json!({
        "path": request.path,
        "mode": request.mode.as_str(),
        "autorename": false,
        "client_modified": request.client_modified.format(CLIENT_MODIFIED_FORMAT).to_string(),
        "mute": request.mute,
        "strict_conflict": false,
    })
}

/// HTTP header values must be ASCII, so non-ASCII characters in the JSON
/// argument are sent as `\uXXXX` escapes (UTF-16, surrogate pairs included).
pub(crate) fn header_safe_json(json: &str) -> String {
    let mut out = String::with_capacity(json.len());
    for c in json.chars() {
        if c.is_ascii() {
            out.push(c);
        } else {
            let mut units = [0u16; 2];
            for unit in c.encode_utf16(&mut units) {
                out.push_str(&format!("\\u{:04x}", unit));
            }
        }
    }
    out
}

/// Map a non-2xx response to a typed error. `path/conflict/...` on a 409 is
/// the add-mode collision.
pub(crate) fn classify_error(status: u16, body: &str, path: &str) -> RemoteError {
    let summary = serde_json::from_str::<ApiErrorEnvelope>(body)
        .ok()
        .and_then(|e| e.error_summary)
        .unwrap_or_else(|| body.trim().to_string());
    if status == 409 && summary.contains("path/conflict") {
        return RemoteError::Conflict {
            path: path.to_string(),
        };
    }
    RemoteError::Api { status, summary }
}

impl RemoteStorage for DropboxStorage {
    fn name(&self) -> &str {
        "dropbox"
    }

    fn upload(&self, request: &UploadRequest) -> Result<FileMetadata, RemoteError> {
        let url = format!("{}/{}", self.content_base, UPLOAD_ROUTE);
        let arg = header_safe_json(&upload_arg(request).to_string());

        let resp = self
            .http
            .post(&url)
            .header(AUTHORIZATION, format!("Bearer {}", self.access_token))
            .header(CONTENT_TYPE, "application/octet-stream")
            .header("Dropbox-API-Arg", arg)
            .body(request.data.clone())
            .send()
            .map_err(|e| RemoteError::Transport(format!("upload to {url} failed: {e}")))?;

        let status = resp.status();
        let body = resp
            .text()
            .map_err(|e| RemoteError::Transport(format!("reading response from {url}: {e}")))?;

        if status.is_success() {
            return serde_json::from_str(&body).map_err(|e| RemoteError::Api {
                status: status.as_u16(),
                summary: format!("unparseable upload response: {e}"),
            });
        }
        Err(classify_error(status.as_u16(), &body, &request.path))
    }
}
