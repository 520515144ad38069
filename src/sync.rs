//! Bridges listener arrivals to remote uploads.
//!
//! Arrival events are queued (FIFO) to a single `sync-worker` thread which
//! runs the registered upload function one call at a time. The listener
//! only ever pushes onto the queue, so a slow or failing backend never
//! stalls an FTP session. Each event holds the arrived file open, so a
//! later upload under the same name cannot change what an earlier event
//! sends.

use parking_lot::RwLock;
use std::fs::File;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::ftp::{FileHandler, IngestedFile};
use crate::remote::{RemoteError, RemoteStorageClient};

/// The upload step run for every arrival. `Err` carries a message for the log.
pub type UploadFn = Arc<dyn Fn(&Arrival) -> Result<(), String> + Send + Sync>;

/// One completed upload waiting for its turn on the worker.
#[derive(Debug)]
pub struct Arrival {
    pub file: IngestedFile,
    pub folder: String,
    pub name: String,
    content: File,
}

impl Arrival {
    /// Open handle on the file exactly as it was when it arrived.
    pub fn content(&self) -> &File {
        &self.content
    }
}

#[derive(Default)]
struct Counters {
    attempted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSnapshot {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
}

struct Shared {
    upload: RwLock<Option<UploadFn>>,
    counters: Counters,
}

pub struct SyncCoordinator {
    shared: Arc<Shared>,
    sender: parking_lot::Mutex<Option<mpsc::Sender<Arrival>>>,
    worker: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl SyncCoordinator {
    pub fn new() -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            upload: RwLock::new(None),
            counters: Counters::default(),
        });
        let (tx, rx) = mpsc::channel::<Arrival>();
        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name("sync-worker".into())
            .spawn(move || {
                for event in rx {
                    process(&worker_shared, &event);
                }
                debug!("sync worker drained");
            })?;
        Ok(Self {
            shared,
            sender: parking_lot::Mutex::new(Some(tx)),
            worker: parking_lot::Mutex::new(Some(worker)),
        })
    }

    /// Install the upload function, replacing any previous one.
    pub fn register<F>(&self, upload: F)
    where
        F: Fn(&Arrival) -> Result<(), String> + Send + Sync + 'static,
    {
        *self.shared.upload.write() = Some(Arc::new(upload));
    }

    /// Register uploads through `client` into `remote_root/<folder>/<name>`.
    pub fn register_client(&self, client: RemoteStorageClient, remote_root: &str, overwrite: bool) {
        let remote_root = remote_root.to_string();
        self.register(move |arrival| {
            let destination = format!("{}/{}", remote_root, arrival.folder);
            client
                .upload_from(arrival.content(), &arrival.file.local_path, &destination, &arrival.name, overwrite)
                .map(|_| ())
                .map_err(|e: RemoteError| e.to_string())
        });
    }

    /// A listener handler that queues every completed upload here.
    pub fn file_handler(self: &Arc<Self>) -> FileHandler {
        let me = Arc::clone(self);
        Arc::new(move |file: &IngestedFile, folder: &str, name: &str| me.enqueue(file, folder, name))
    }

    /// Queue an arrival. The file is opened here, on the caller's thread,
    /// so the upload sends this arrival's content even if it runs later.
    pub fn enqueue(&self, file: &IngestedFile, folder: &str, name: &str) {
        if self.shared.upload.read().is_none() {
            debug!(path = %file.local_path.display(), "no upload function registered, keeping file locally");
            return;
        }
        let content = match File::open(&file.local_path) {
            Ok(f) => f,
            Err(e) => {
                let c = &self.shared.counters;
                c.attempted.fetch_add(1, Ordering::SeqCst);
                c.failed.fetch_add(1, Ordering::SeqCst);
                error!(path = %file.local_path.display(), error = %e, "arrived file cannot be opened");
                return;
            }
        };
        let arrival = Arrival {
            file: file.clone(),
            folder: folder.to_string(),
            name: name.to_string(),
            content,
        };
        match self.sender.lock().as_ref() {
            Some(tx) => {
                if tx.send(arrival).is_err() {
                    warn!(name, "sync worker is gone, arrival dropped");
                }
            }
            None => warn!(name, "coordinator shut down, arrival dropped"),
        }
    }

    pub fn stats(&self) -> SyncSnapshot {
        let c = &self.shared.counters;
        SyncSnapshot {
            attempted: c.attempted.load(Ordering::SeqCst),
            succeeded: c.succeeded.load(Ordering::SeqCst),
            failed: c.failed.load(Ordering::SeqCst),
        }
    }

    /// Stop accepting arrivals, finish everything already queued and join
    /// the worker. Safe to call more than once.
    pub fn shutdown(&self) {
        drop(self.sender.lock().take());
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                error!("sync worker panicked");
            }
        }
    }
}

impl Drop for SyncCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn process(shared: &Shared, event: &Arrival) {
    let Some(upload) = shared.upload.read().clone() else {
        debug!(path = %event.file.local_path.display(), "no upload function registered, keeping file locally");
        return;
    };
    let c = &shared.counters;
    c.attempted.fetch_add(1, Ordering::SeqCst);
    let result = catch_unwind(AssertUnwindSafe(|| upload(event)));
    match result {
        Ok(Ok(())) => {
            c.succeeded.fetch_add(1, Ordering::SeqCst);
            info!(name = %event.name, size = event.file.size, "synced");
        }
        Ok(Err(msg)) => {
            c.failed.fetch_add(1, Ordering::SeqCst);
            error!(name = %event.name, error = %msg, "upload failed");
        }
        Err(_) => {
            c.failed.fetch_add(1, Ordering::SeqCst);
            error!(name = %event.name, "upload function panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use parking_lot::Mutex;
    use std::io::Read;
    use std::path::Path;
    use std::time::Duration;

    fn arrive(dir: &Path, name: &str, data: &[u8]) -> IngestedFile {
        let local_path = dir.join(name);
        std::fs::write(&local_path, data).unwrap();
        IngestedFile {
            local_path,
            size: data.len() as u64,
            modified_time: Utc::now(),
            received_at: Utc::now(),
        }
    }

    #[test]
    fn test_uploads_run_in_arrival_order() {
        let tmp = tempfile::tempdir().unwrap();
        let coord = SyncCoordinator::new().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        coord.register(move |arrival| {
            s.lock().push(arrival.name.clone());
            Ok(())
        });
        for n in ["a", "b", "c", "a"] {
            coord.enqueue(&arrive(tmp.path(), n, b"abc"), "/", n);
        }
        coord.shutdown();
        assert_eq!(*seen.lock(), vec!["a", "b", "c", "a"]);
        assert_eq!(
            coord.stats(),
            SyncSnapshot {
                attempted: 4,
                succeeded: 4,
                failed: 0
            }
        );
    }

    #[test]
    fn test_queued_arrival_keeps_its_own_content() {
        let tmp = tempfile::tempdir().unwrap();
        let coord = SyncCoordinator::new().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        coord.register(move |arrival| {
            // Hold the worker so the second arrival lands before this runs
            if s.lock().is_empty() {
                std::thread::sleep(Duration::from_millis(200));
            }
            let mut body = String::new();
            let mut content = arrival.content();
            content.read_to_string(&mut body).map_err(|e| e.to_string())?;
            s.lock().push((arrival.file.size, body));
            Ok(())
        });

        let first = arrive(tmp.path(), "a.txt", b"first");
        coord.enqueue(&first, "/", "a.txt");
        // Same name again, replaced on disk the way the listener does it
        let staged = arrive(tmp.path(), "a.txt.part", b"second!!");
        std::fs::rename(&staged.local_path, &first.local_path).unwrap();
        let second = IngestedFile {
            local_path: first.local_path.clone(),
            ..staged
        };
        coord.enqueue(&second, "/", "a.txt");
        coord.shutdown();

        assert_eq!(
            *seen.lock(),
            vec![(5, "first".to_string()), (8, "second!!".to_string())]
        );
    }

    #[test]
    fn test_failures_and_panics_are_contained() {
        let tmp = tempfile::tempdir().unwrap();
        let coord = SyncCoordinator::new().unwrap();
        coord.register(|arrival| match arrival.name.as_str() {
            "bad" => Err("nope".into()),
            "boom" => panic!("backend exploded"),
            _ => Ok(()),
        });
        for n in ["ok", "bad", "boom", "ok2"] {
            coord.enqueue(&arrive(tmp.path(), n, b"x"), "/", n);
        }
        coord.shutdown();
        let s = coord.stats();
        assert_eq!(s.attempted, 4);
        assert_eq!(s.succeeded, 2);
        assert_eq!(s.failed, 2);
    }

    #[test]
    fn test_vanished_file_counts_as_failed() {
        let tmp = tempfile::tempdir().unwrap();
        let coord = SyncCoordinator::new().unwrap();
        coord.register(|_| Ok(()));
        let gone = arrive(tmp.path(), "gone.pdf", b"x");
        std::fs::remove_file(&gone.local_path).unwrap();
        coord.enqueue(&gone, "/", "gone.pdf");
        coord.shutdown();
        assert_eq!(
            coord.stats(),
            SyncSnapshot {
                attempted: 1,
                succeeded: 0,
                failed: 1
            }
        );
    }

    #[test]
    fn test_default_is_noop_and_not_counted() {
        let tmp = tempfile::tempdir().unwrap();
        let coord = SyncCoordinator::new().unwrap();
        coord.enqueue(&arrive(tmp.path(), "x", b"x"), "/", "x");
        coord.shutdown();
        assert_eq!(coord.stats(), SyncSnapshot::default());
        // After shutdown, arrivals are dropped quietly
        coord.register(|_| Ok(()));
        coord.enqueue(&arrive(tmp.path(), "y", b"y"), "/", "y");
        assert_eq!(coord.stats(), SyncSnapshot::default());
    }

    #[test]
    fn test_register_replaces_previous() {
        let tmp = tempfile::tempdir().unwrap();
        let coord = SyncCoordinator::new().unwrap();
        let hits = Arc::new(Mutex::new((0, 0)));
        let h1 = hits.clone();
        coord.register(move |_| {
            h1.lock().0 += 1;
            Ok(())
        });
        let h2 = hits.clone();
        coord.register(move |_| {
            h2.lock().1 += 1;
            Ok(())
        });
        coord.enqueue(&arrive(tmp.path(), "x", b"x"), "/", "x");
        coord.shutdown();
        assert_eq!(*hits.lock(), (0, 1));
    }

    #[test]
    fn test_register_client_joins_remote_root_and_folder() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(crate::remote::MemoryStorage::new());
        let coord = SyncCoordinator::new().unwrap();
        coord.register_client(RemoteStorageClient::new(store.clone()), "scandocs", false);

        let f = arrive(tmp.path(), "scan.pdf", b"pdf");
        coord.enqueue(&f, "/inbox", "scan.pdf");
        coord.enqueue(&f, "/inbox", "scan.pdf");
        coord.shutdown();

        assert!(store.get("/scandocs/inbox/scan.pdf").is_some());
        assert_eq!(coord.stats().succeeded, 1);
        assert_eq!(coord.stats().failed, 1);
    }
}
