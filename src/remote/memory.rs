//! In-process object store with the same add/overwrite rules as the real
//! backend. Backs `--dry-run` and the test suite.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;

use super::{FileMetadata, RemoteError, RemoteStorage, UploadRequest, WriteMode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub path: String,
    pub data: Vec<u8>,
    pub client_modified: DateTime<Utc>,
    pub muted: bool,
    pub rev: u64,
}

#[derive(Debug, Default)]
pub struct MemoryStorage {
    // Keyed by lowercased path; remote paths are case-insensitive
    objects: Mutex<BTreeMap<String, StoredObject>>,
    next_rev: Mutex<u64>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<StoredObject> {
        self.objects.lock().get(&path.to_lowercase()).cloned()
    }

    pub fn paths(&self) -> Vec<String> {
        self.objects.lock().values().map(|o| o.path.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RemoteStorage for MemoryStorage {
    fn name(&self) -> &str {
        "memory"
    }

    fn upload(&self, request: &UploadRequest) -> Result<FileMetadata, RemoteError> {
        let key = request.path.to_lowercase();
        let mut objects = self.objects.lock();
        if request.mode == WriteMode::Add && objects.contains_key(&key) {
            return Err(RemoteError::Conflict {
                path: request.path.clone(),
            });
        }

        let rev = {
            let mut next = self.next_rev.lock();
            *next += 1;
            *next
        };
        let name = request
            .path
            .rsplit('/')
            .next()
            .unwrap_or(request.path.as_str())
            .to_string();
        objects.insert(
            key,
            StoredObject {
                path: request.path.clone(),
                data: request.data.clone(),
                client_modified: request.client_modified,
                muted: request.mute,
                rev,
            },
        );

        Ok(FileMetadata {
            name,
            path_display: Some(request.path.clone()),
            size: request.data.len() as u64,
            client_modified: Some(request.client_modified),
            rev: Some(format!("{:x}", rev)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(path: &str, mode: WriteMode, data: &[u8]) -> UploadRequest {
        UploadRequest {
            data: data.to_vec(),
            path: path.to_string(),
            mode,
            client_modified: DateTime::<Utc>::from_timestamp(1_600_000_000, 0).unwrap(),
            mute: true,
        }
    }

    #[test]
    fn test_add_rejects_existing_path_case_insensitively() {
        let store = MemoryStorage::new();
        store.upload(&request("/in/Scan.pdf", WriteMode::Add, b"one")).unwrap();
        let err = store
            .upload(&request("/in/scan.PDF", WriteMode::Add, b"two"))
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.get("/in/scan.pdf").unwrap().data, b"one");
    }

    #[test]
    fn test_overwrite_replaces_and_bumps_rev() {
        let store = MemoryStorage::new();
        let first = store.upload(&request("/a.txt", WriteMode::Overwrite, b"1")).unwrap();
        let second = store.upload(&request("/a.txt", WriteMode::Overwrite, b"22")).unwrap();
        assert_ne!(first.rev, second.rev);
        assert_eq!(second.size, 2);
        assert_eq!(second.name, "a.txt");
        assert_eq!(store.len(), 1);
        assert_eq!(store.paths(), vec!["/a.txt".to_string()]);
    }
}
