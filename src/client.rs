//! FTP client and the probe sequence used to check a running listener.
//!
//! The control connection is a blocking `suppaftp` stream. The async
//! [`probe`] drives it from the blocking pool one step at a time so the
//! observer sees every outcome as it happens.

use chrono::{DateTime, Utc};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;
use suppaftp::list::File as RemoteFile;
use suppaftp::types::FileType;
use suppaftp::{FtpStream, Mode};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::ftp::listing::format_date;
use crate::protocol::timeouts::CONNECT_MS;

#[derive(Debug, Error)]
pub enum FtpError {
    #[error("could not resolve {addr}: {source}")]
    Resolve {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("could not connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: suppaftp::FtpError,
    },

    #[error("login failed for {user}: {source}")]
    Auth {
        user: String,
        #[source]
        source: suppaftp::FtpError,
    },

    #[error(transparent)]
    Ftp(#[from] suppaftp::FtpError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("client task failed: {0}")]
    Worker(String),
}

impl FtpError {
    /// The server reply code behind this error, when the server sent one.
    pub fn reply_code(&self) -> Option<u32> {
        match self {
            FtpError::Connect { source, .. } | FtpError::Auth { source, .. } | FtpError::Ftp(source) => {
                reply_code_of(source)
            }
            _ => None,
        }
    }
}

fn reply_code_of(err: &suppaftp::FtpError) -> Option<u32> {
    match err {
        suppaftp::FtpError::UnexpectedResponse(response) => Some(response.status.code()),
        _ => None,
    }
}

fn mode_for(passive: bool) -> Mode {
    if passive {
        Mode::Passive
    } else {
        Mode::Active
    }
}

/// One parsed line of a LIST reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    pub filename: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub is_dir: bool,
}

impl ListEntry {
    /// `None` for lines that are not entries, such as `total 12`.
    pub fn parse(line: &str) -> Option<Self> {
        let file = line.parse::<RemoteFile>().ok()?;
        Some(Self {
            filename: file.name().to_string(),
            size: file.size() as u64,
            modified: DateTime::<Utc>::from(file.modified()),
            is_dir: file.is_directory(),
        })
    }
}

/// Blocking FTP client over a single control connection.
pub struct FtpClient {
    stream: FtpStream,
    peer: SocketAddr,
}

impl FtpClient {
    /// Open the control connection and consume the `220` greeting.
    pub fn connect(host: &str, port: u16, passive: bool) -> Result<Self, FtpError> {
        let addr = host_port(host, port);
        let peer = addr
            .to_socket_addrs()
            .and_then(|mut found| {
                found
                    .next()
                    .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address found"))
            })
            .map_err(|source| FtpError::Resolve {
                addr: addr.clone(),
                source,
            })?;
        let mut stream = FtpStream::connect_timeout(peer, Duration::from_millis(CONNECT_MS))
            .map_err(|source| FtpError::Connect { addr, source })?;
        stream.set_mode(mode_for(passive));
        debug!(server = %peer, passive, "control connection open");
        Ok(Self { stream, peer })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn set_passive(&mut self, passive: bool) {
        self.stream.set_mode(mode_for(passive));
    }

    /// USER/PASS, then switch to binary transfers.
    pub fn login(&mut self, user: &str, password: &str) -> Result<(), FtpError> {
        self.stream
            .login(user, password)
            .map_err(|source| FtpError::Auth {
                user: user.to_string(),
                source,
            })?;
        self.stream.transfer_type(FileType::Binary)?;
        Ok(())
    }

    /// Send any command line and return the reply code, whatever it is.
    pub fn command(&mut self, line: &str) -> Result<u32, FtpError> {
        match self.stream.custom_command(line, &[]) {
            Ok(response) => Ok(response.status.code()),
            Err(suppaftp::FtpError::UnexpectedResponse(response)) => Ok(response.status.code()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn pwd(&mut self) -> Result<String, FtpError> {
        Ok(self.stream.pwd()?)
    }

    pub fn cwd(&mut self, path: &str) -> Result<(), FtpError> {
        Ok(self.stream.cwd(path)?)
    }

    pub fn cdup(&mut self) -> Result<(), FtpError> {
        Ok(self.stream.cdup()?)
    }

    pub fn mkdir(&mut self, path: &str) -> Result<(), FtpError> {
        Ok(self.stream.mkdir(path)?)
    }

    pub fn remove(&mut self, path: &str) -> Result<(), FtpError> {
        Ok(self.stream.rm(path)?)
    }

    pub fn size(&mut self, path: &str) -> Result<u64, FtpError> {
        Ok(self.stream.size(path)? as u64)
    }

    pub fn list(&mut self, path: Option<&str>) -> Result<Vec<ListEntry>, FtpError> {
        let lines = self.stream.list(path)?;
        Ok(lines
            .iter()
            .filter_map(|line| {
                let entry = ListEntry::parse(line);
                if entry.is_none() {
                    debug!(line = %line, "skipping listing line");
                }
                entry
            })
            .collect())
    }

    pub fn nlst(&mut self, path: Option<&str>) -> Result<Vec<String>, FtpError> {
        Ok(self.stream.nlst(path)?)
    }

    pub fn retrieve(&mut self, path: &str) -> Result<Vec<u8>, FtpError> {
        Ok(self.stream.retr_as_buffer(path)?.into_inner())
    }

    /// Upload `data` as `name` and wait for the transfer-complete reply.
    pub fn store(&mut self, name: &str, data: &[u8]) -> Result<u64, FtpError> {
        let mut reader = data;
        Ok(self.stream.put_file(name, &mut reader)?)
    }

    /// Start a STOR and hand back the open data connection without
    /// completing it.
    pub fn begin_store(&mut self, name: &str) -> Result<impl Read + Write, FtpError> {
        Ok(self.stream.put_with_stream(name)?)
    }

    /// Close a [`begin_store`](Self::begin_store) data connection and wait
    /// for the `226`.
    pub fn finish_store(&mut self, data: impl Write) -> Result<(), FtpError> {
        Ok(self.stream.finalize_put_stream(data)?)
    }

    /// ABOR the transfer running on `data`; expects `426` then `226`.
    pub fn abort(&mut self, data: impl Read + 'static) -> Result<(), FtpError> {
        Ok(self.stream.abort(data)?)
    }

    pub fn quit(&mut self) -> Result<(), FtpError> {
        Ok(self.stream.quit()?)
    }
}

/// `host:port`, bracketing bare IPv6 literals.
pub fn host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStep {
    Pwd,
    List,
    Cdup,
    Nlst,
    Quit,
}

impl ProbeStep {
    pub const ALL: [ProbeStep; 5] = [
        ProbeStep::Pwd,
        ProbeStep::List,
        ProbeStep::Cdup,
        ProbeStep::Nlst,
        ProbeStep::Quit,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ProbeStep::Pwd => "PWD",
            ProbeStep::List => "LIST",
            ProbeStep::Cdup => "CDUP",
            ProbeStep::Nlst => "NLST",
            ProbeStep::Quit => "QUIT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutput {
    Response(Option<String>),
    Listing(Vec<ListEntry>),
    Names(Vec<String>),
}

/// Receives the outcome of every probe step as it happens.
pub trait ProbeObserver {
    fn connection_failed(&mut self, error: &FtpError);
    fn step_succeeded(&mut self, step: ProbeStep, output: &StepOutput);
    fn step_failed(&mut self, step: ProbeStep, error: &FtpError);
}

/// Prints each step to stdout.
#[derive(Debug, Default)]
pub struct ConsoleReport;

impl ProbeObserver for ConsoleReport {
    fn connection_failed(&mut self, error: &FtpError) {
        println!("Connection Failed: {}", error);
    }

    fn step_succeeded(&mut self, _step: ProbeStep, output: &StepOutput) {
        match output {
            StepOutput::Response(text) => {
                println!("Success!  Got response:");
                println!("---");
                println!("{}", text.as_deref().unwrap_or("None"));
                println!("---");
            }
            StepOutput::Listing(entries) => {
                let now = Utc::now();
                println!("Processed file listing:");
                for e in entries {
                    println!("    {}: {} bytes, {}", e.filename, e.size, format_date(e.modified, now));
                }
                println!("Total: {} files", entries.len());
            }
            StepOutput::Names(names) => {
                println!("Got data:");
                for name in names {
                    println!("{}", name);
                }
            }
        }
    }

    fn step_failed(&mut self, _step: ProbeStep, error: &FtpError) {
        println!("Failed.  Error was:");
        println!("{}", error);
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ProbeReport {
    pub succeeded: Vec<ProbeStep>,
    pub failed: Vec<(ProbeStep, String)>,
    pub pwd: Option<String>,
    pub listing: Vec<ListEntry>,
    pub names: Vec<String>,
}

impl ProbeReport {
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty() && self.succeeded.len() == ProbeStep::ALL.len()
    }
}

fn run_step(client: &mut FtpClient, step: ProbeStep) -> Result<StepOutput, FtpError> {
    match step {
        ProbeStep::Pwd => client.pwd().map(|path| StepOutput::Response(Some(path))),
        ProbeStep::List => client.list(None).map(StepOutput::Listing),
        ProbeStep::Cdup => client.cdup().map(|()| StepOutput::Response(None)),
        ProbeStep::Nlst => client.nlst(None).map(StepOutput::Names),
        ProbeStep::Quit => client.quit().map(|()| StepOutput::Response(None)),
    }
}

fn worker_failed(e: tokio::task::JoinError) -> FtpError {
    FtpError::Worker(e.to_string())
}

/// Connect, log in and run PWD, LIST, CDUP, NLST and QUIT in that order.
/// A failing step is reported and the next one still runs; a failed
/// connection or login runs no steps at all.
pub async fn probe<O>(config: &ClientConfig, observer: &mut O) -> Result<ProbeReport, FtpError>
where
    O: ProbeObserver + ?Sized,
{
    let cfg = config.clone();
    let connected = tokio::task::spawn_blocking(move || {
        let mut client = FtpClient::connect(&cfg.host, cfg.port, cfg.passive)?;
        client.login(&cfg.username, &cfg.password)?;
        Ok::<_, FtpError>(client)
    })
    .await
    .map_err(worker_failed)
    .and_then(|r| r);
    let mut client = match connected {
        Ok(c) => c,
        Err(e) => {
            warn!(host = %config.host, port = config.port, error = %e, "connection failed");
            observer.connection_failed(&e);
            return Err(e);
        }
    };
    info!(server = %client.peer_addr(), passive = config.passive, "connected");

    let mut report = ProbeReport::default();
    for step in ProbeStep::ALL {
        let (returned, outcome) = tokio::task::spawn_blocking(move || {
            let outcome = run_step(&mut client, step);
            (client, outcome)
        })
        .await
        .map_err(worker_failed)?;
        client = returned;

        match outcome {
            Ok(output) => {
                debug!(step = step.name(), "step succeeded");
                match &output {
                    StepOutput::Response(Some(path)) if step == ProbeStep::Pwd => report.pwd = Some(path.clone()),
                    StepOutput::Listing(entries) => report.listing = entries.clone(),
                    StepOutput::Names(names) => report.names = names.clone(),
                    _ => {}
                }
                observer.step_succeeded(step, &output);
                report.succeeded.push(step);
            }
            Err(e) => {
                warn!(step = step.name(), error = %e, "step failed");
                observer.step_failed(step, &e);
                report.failed.push((step, e.to_string()));
            }
        }
    }
    Ok(report)
}

/// Run [`probe`] on a private current-thread runtime that is torn down as
/// soon as the sequence ends.
pub fn run_probe<O>(config: &ClientConfig, observer: &mut O) -> anyhow::Result<ProbeReport>
where
    O: ProbeObserver + ?Sized,
{
    use anyhow::Context;
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build probe runtime")?;
    let report = rt
        .block_on(probe(config, observer))
        .with_context(|| format!("probe of {}:{} failed", config.host, config.port))?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        connection_failures: usize,
        steps: Vec<(ProbeStep, bool)>,
    }

    impl ProbeObserver for Recorder {
        fn connection_failed(&mut self, _error: &FtpError) {
            self.connection_failures += 1;
        }
        fn step_succeeded(&mut self, step: ProbeStep, _output: &StepOutput) {
            self.steps.push((step, true));
        }
        fn step_failed(&mut self, step: ProbeStep, _error: &FtpError) {
            self.steps.push((step, false));
        }
    }

    #[test]
    fn test_host_port() {
        assert_eq!(host_port("localhost", 21), "localhost:21");
        assert_eq!(host_port("::1", 2121), "[::1]:2121");
        assert_eq!(host_port("[::1]", 21), "[::1]:21");
    }

    #[test]
    fn test_step_order() {
        let names: Vec<_> = ProbeStep::ALL.iter().map(|s| s.name()).collect();
        assert_eq!(names, ["PWD", "LIST", "CDUP", "NLST", "QUIT"]);
    }

    #[test]
    fn test_list_entry_parse() {
        let e = ListEntry::parse("-rw-r--r-- 1 ftp ftp           10 Jun 01 09:05 scan01.pdf").unwrap();
        assert_eq!(e.filename, "scan01.pdf");
        assert_eq!(e.size, 10);
        assert!(!e.is_dir);

        let d = ListEntry::parse("drwxr-xr-x 1 ftp ftp            0 Mar 07  2022 inbox").unwrap();
        assert!(d.is_dir);
        assert_eq!(d.filename, "inbox");

        assert_eq!(ListEntry::parse("total 12"), None);
    }

    #[tokio::test]
    async fn test_connection_refused_runs_no_steps() {
        // Grab a free port and release it so nothing is listening there
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let config = ClientConfig {
            host: "127.0.0.1".into(),
            port,
            ..ClientConfig::default()
        };
        let mut rec = Recorder::default();
        let err = probe(&config, &mut rec).await.unwrap_err();
        assert!(matches!(err, FtpError::Connect { .. }));
        assert_eq!(rec.connection_failures, 1);
        assert!(rec.steps.is_empty());
    }

    #[test]
    fn test_greeting_other_than_220_is_rejected() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            let (mut s, _) = listener.accept().unwrap();
            s.write_all(b"421 Too many users\r\n").unwrap();
        });
        let err = FtpClient::connect("127.0.0.1", port, true).err().unwrap();
        assert!(matches!(err, FtpError::Connect { .. }));
        assert_eq!(err.reply_code(), Some(421));
        server.join().unwrap();
    }
}
