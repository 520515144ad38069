//! Dropbridge serve daemon
//!
//! Starts the FTP listener, wires completed uploads into the sync queue and
//! runs until Ctrl-C.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

use dropbridge::cli::ServeOpts;
use dropbridge::client::{run_probe, ConsoleReport};
use dropbridge::config::{BridgeConfig, ClientConfig};
use dropbridge::ftp::IngestionListener;
use dropbridge::logging;
use dropbridge::remote::{DropboxStorage, MemoryStorage, RemoteStorage, RemoteStorageClient, WriteMode};
use dropbridge::sync::SyncCoordinator;

fn main() -> ExitCode {
    let opts = ServeOpts::parse();
    let code = match run(opts) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    };
    println!("Bye");
    code
}

fn run(opts: ServeOpts) -> Result<()> {
    let debug = opts.debug.saturating_add(1);
    let log_file = opts.log_file.clone();
    let self_check = opts.self_check;
    logging::init(debug, log_file.as_deref())?;
    let config = opts.into_config().context("invalid configuration")?;
    info!(?config, "configuration loaded");

    // The blocking HTTP client must be created outside any Tokio runtime
    let backend = build_backend(&config)?;
    let client = RemoteStorageClient::new(backend);
    info!(backend = client.backend_name(), folder = %config.remote.folder, mode = config.remote.mode.as_str(), "remote storage ready");

    let coordinator = Arc::new(SyncCoordinator::new().context("failed to start sync worker")?);
    coordinator.register_client(
        client,
        &config.remote.folder,
        config.remote.mode == WriteMode::Overwrite,
    );

    let mut listener = IngestionListener::new(&config.listener)?;
    listener.set_handler(coordinator.file_handler());
    let handle = listener.start()?;
    println!("Listening for FTP on {}", handle.local_addr());
    if self_check {
        spawn_self_check(handle.local_addr())?;
    }

    wait_for_interrupt()?;
    println!("interrupted");
    info!("shutting down");

    handle.shutdown().context("listener did not stop cleanly")?;
    coordinator.shutdown();
    let stats = coordinator.stats();
    info!(
        attempted = stats.attempted,
        succeeded = stats.succeeded,
        failed = stats.failed,
        "uploads"
    );
    Ok(())
}

fn build_backend(config: &BridgeConfig) -> Result<Arc<dyn RemoteStorage>> {
    if config.remote.dry_run {
        info!("dry run: uploads are kept in memory");
        return Ok(Arc::new(MemoryStorage::new()));
    }
    let token = config
        .remote
        .token
        .as_deref()
        .context("a Dropbox access token is required")?;
    let storage = DropboxStorage::new(token).context("failed to set up Dropbox client")?;
    Ok(Arc::new(storage))
}

/// Probe our own listener from a background thread, the way an operator
/// would with `dropbridge-probe --passive`.
fn spawn_self_check(addr: SocketAddr) -> Result<()> {
    let ip = if addr.ip().is_unspecified() {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    } else {
        addr.ip()
    };
    let config = ClientConfig {
        host: ip.to_string(),
        port: addr.port(),
        passive: true,
        ..ClientConfig::default()
    };
    std::thread::Builder::new()
        .name("ftp-probe".into())
        .spawn(move || match run_probe(&config, &mut ConsoleReport) {
            Ok(report) if report.all_succeeded() => info!("self-check passed"),
            Ok(report) => warn!(failed = ?report.failed, "self-check finished with failures"),
            Err(e) => warn!("self-check could not connect: {:#}", e),
        })
        .context("failed to spawn self-check thread")?;
    Ok(())
}

/// Block the main thread until SIGINT / Ctrl-C.
fn wait_for_interrupt() -> Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build signal runtime")?;
    rt.block_on(tokio::signal::ctrl_c())
        .context("failed to listen for Ctrl-C")
}
