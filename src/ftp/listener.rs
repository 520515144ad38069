//! The always-on FTP acceptance service.
//!
//! The listener socket is bound synchronously by [`IngestionListener::start`]
//! so a busy port is reported to the caller immediately. Serving then moves
//! to a dedicated `ftp-listener` thread hosting a current-thread Tokio
//! runtime; every control connection is a task on that runtime.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use super::auth::{AuthPolicy, PasswordDb};
use super::session::{self, SessionContext};
use crate::config::ListenerConfig;

/// A file that finished uploading and now sits under its final name.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestedFile {
    pub local_path: PathBuf,
    pub size: u64,
    pub modified_time: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}

/// Called once per completed upload with the file, its virtual folder and
/// its name. Runs on the listener thread, so it must return quickly.
pub type FileHandler = Arc<dyn Fn(&IngestedFile, &str, &str) + Send + Sync>;

pub struct IngestionListener {
    host: String,
    port: u16,
    root: PathBuf,
    auth: AuthPolicy,
    handler: Option<FileHandler>,
}

impl std::fmt::Debug for IngestionListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionListener")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("root", &self.root)
            .field("auth", &self.auth)
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

impl IngestionListener {
    pub fn new(config: &ListenerConfig) -> Result<Self> {
        let root = config
            .root
            .canonicalize()
            .with_context(|| format!("root directory {} is not accessible", config.root.display()))?;
        if !root.is_dir() {
            anyhow::bail!("root path is not a directory: {}", root.display());
        }
        let passwords = config
            .password_file
            .as_deref()
            .map(PasswordDb::load)
            .transpose()?;
        if !config.allow_anonymous && passwords.is_none() {
            anyhow::bail!("anonymous login is disabled and no password file was given");
        }

        Ok(Self {
            host: config.host.clone(),
            port: config.port,
            root,
            auth: AuthPolicy {
                allow_anonymous: config.allow_anonymous,
                passwords,
            },
            handler: None,
        })
    }

    /// Register the completed-upload handler, replacing any previous one.
    pub fn on_file_received<F>(&mut self, handler: F)
    where
        F: Fn(&IngestedFile, &str, &str) + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(handler));
    }

    pub fn set_handler(&mut self, handler: FileHandler) {
        self.handler = Some(handler);
    }

    pub fn start(self) -> Result<ListenerHandle> {
        let bind = crate::client::host_port(&self.host, self.port);
        let std_listener = std::net::TcpListener::bind(bind.as_str())
            .with_context(|| format!("failed to bind FTP listener on {}", bind))?;
        std_listener
            .set_nonblocking(true)
            .context("failed to make listener non-blocking")?;
        let local_addr = std_listener.local_addr()?;

        let ctx = Arc::new(SessionContext {
            root: self.root,
            auth: self.auth,
            handler: self.handler,
        });
        let (stop_tx, stop_rx) = oneshot::channel();
        let root_display = ctx.root.display().to_string();
        let thread = std::thread::Builder::new()
            .name("ftp-listener".into())
            .spawn(move || serve_on_thread(std_listener, ctx, stop_rx))
            .context("failed to spawn ftp-listener thread")?;

        info!(addr = %local_addr, root = %root_display, "started ftp server");
        Ok(ListenerHandle {
            local_addr,
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }
}

fn serve_on_thread(
    std_listener: std::net::TcpListener,
    ctx: Arc<SessionContext>,
    stop_rx: oneshot::Receiver<()>,
) -> Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build listener runtime")?;
    // Dropping the runtime at the end cancels every open session
    rt.block_on(async move {
        let listener = TcpListener::from_std(std_listener)?;
        accept_loop(listener, ctx, stop_rx).await
    })
}

async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<SessionContext>,
    mut stop_rx: oneshot::Receiver<()>,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = &mut stop_rx => {
                info!("ftp listener stopping");
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    let span = info_span!("session", id = %Uuid::new_v4(), %peer);
                    let ctx = ctx.clone();
                    tokio::spawn(
                        async move {
                            info!("connection accepted");
                            match session::run(stream, peer, ctx).await {
                                Ok(()) => info!("session closed"),
                                Err(e) => warn!(error = %format!("{:#}", e), "session closed with error"),
                            }
                        }
                        .instrument(span),
                    );
                }
                Err(e) => {
                    // Typically fd exhaustion; back off instead of spinning
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

/// Control over a running listener. Dropping the handle stops it.
#[derive(Debug)]
pub struct ListenerHandle {
    local_addr: SocketAddr,
    stop: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<Result<()>>>,
}

impl ListenerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Signal the listener to stop, then wait for its thread. The port is
    /// released when this returns.
    pub fn shutdown(mut self) -> Result<()> {
        self.stop_and_join()
    }

    fn stop_and_join(&mut self) -> Result<()> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.join_thread()
    }

    fn join_thread(&mut self) -> Result<()> {
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| anyhow::anyhow!("ftp-listener thread panicked"))?,
            None => Ok(()),
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        if let Err(e) = self.stop_and_join() {
            warn!(error = %e, "listener did not stop cleanly");
        }
    }
}
