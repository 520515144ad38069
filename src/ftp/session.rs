//! One FTP control connection.
//!
//! A session moves Connecting → Authenticated → Idle ↔ Transferring → Closed.
//! Uploads land in `<name>.<id>.part` and are renamed only when the data
//! stream ends cleanly before the control connection is lost or the client
//! sends ABOR; anything else leaves the `.part` file behind and the handler
//! is never told.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::error::Elapsed;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::auth::{AuthPolicy, Identity};
use super::command::{encode_host_port, Command, CommandError};
use super::listener::{FileHandler, IngestedFile};
use super::listing::format_list_line;
use crate::protocol::timeouts::{CONTROL_IDLE_SECS, DATA_CONNECT_MS};
use crate::protocol::{code, read_line, write_reply, Reply};
use crate::vpath::{join_virtual, normalize_under_root, split_virtual};

const PART_SUFFIX: &str = ".part";
const DATA_BUF_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticated,
    Idle,
    Transferring,
    Closed,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connecting, Authenticated)
                | (Authenticated, Idle)
                | (Idle, Transferring)
                | (Transferring, Idle)
                | (Connecting | Authenticated | Idle | Transferring, Closed)
        )
    }
}

/// Shared, read-only state for every session of one listener.
pub(crate) struct SessionContext {
    pub root: PathBuf,
    pub auth: AuthPolicy,
    pub handler: Option<FileHandler>,
}

enum DataChannel {
    None,
    Passive(TcpListener),
    Active(SocketAddr),
}

/// How an upload's data phase ended.
enum UploadOutcome {
    Complete(u64),
    Aborted(u64),
    ControlLost(u64),
    Failed(io::Error),
}

/// A staging name unique to one upload, `<name>.<id>.part`, so concurrent
/// uploads of the same file never share a staging file.
pub fn part_path_for(final_path: &Path) -> PathBuf {
    let mut name = final_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".{}{}", Uuid::new_v4().simple(), PART_SUFFIX));
    final_path.with_file_name(name)
}

pub(crate) async fn run(stream: TcpStream, peer: SocketAddr, ctx: Arc<SessionContext>) -> Result<()> {
    let local_ip = stream.local_addr()?.ip();
    let (read_half, write_half) = stream.into_split();
    let mut session = Session {
        peer,
        local_ip,
        reader: BufReader::new(read_half),
        writer: write_half,
        ctx,
        state: SessionState::Connecting,
        pending_user: None,
        identity: None,
        cwd: "/".to_string(),
        data: DataChannel::None,
    };
    let result = session.serve().await;
    session.set_state(SessionState::Closed);
    result
}

struct Session {
    peer: SocketAddr,
    local_ip: IpAddr,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    ctx: Arc<SessionContext>,
    state: SessionState,
    pending_user: Option<String>,
    identity: Option<Identity>,
    cwd: String,
    data: DataChannel,
}

impl Session {
    fn set_state(&mut self, next: SessionState) {
        if self.state == next {
            return;
        }
        if !self.state.can_transition_to(next) {
            warn!(from = ?self.state, to = ?next, "unexpected session state change");
        }
        debug!(from = ?self.state, to = ?next, "state");
        self.state = next;
    }

    async fn reply(&mut self, code: u16, text: impl Into<String>) -> io::Result<()> {
        write_reply(&mut self.writer, &Reply::new(code, text)).await
    }

    async fn serve(&mut self) -> Result<()> {
        self.reply(code::READY, "dropbridge FTP ready").await?;
        loop {
            let idle = Duration::from_secs(CONTROL_IDLE_SECS);
            let line = match timeout(idle, read_line(&mut self.reader)).await {
                Err(_) => {
                    info!("idle timeout");
                    let _ = self.reply(code::SERVICE_UNAVAILABLE, "Idle timeout, closing").await;
                    return Ok(());
                }
                Ok(Err(e)) => return Err(e.into()),
                Ok(Ok(None)) => {
                    debug!("peer closed control connection");
                    return Ok(());
                }
                Ok(Ok(Some(line))) => line,
            };

            let cmd = match Command::parse(strip_telnet(&line)) {
                Ok(cmd) => cmd,
                Err(CommandError::Empty) => {
                    self.reply(code::SYNTAX_ERROR, "Empty command").await?;
                    continue;
                }
                Err(e) => {
                    self.reply(code::BAD_ARGUMENTS, e.to_string()).await?;
                    continue;
                }
            };
            // Arguments are left out so passwords never reach the log
            debug!(command = cmd.verb(), "received");

            if self.identity.is_none() && !cmd.allowed_before_login() {
                self.reply(code::NOT_LOGGED_IN, "Please login with USER and PASS").await?;
                continue;
            }
            if !self.dispatch(cmd).await? {
                return Ok(());
            }
        }
    }

    /// Returns `false` when the session should end.
    async fn dispatch(&mut self, cmd: Command) -> Result<bool> {
        match cmd {
            Command::User(user) => self.user(user).await?,
            Command::Pass(pass) => self.pass(&pass).await?,
            Command::Quit => {
                self.reply(code::CLOSING, "Goodbye").await?;
                return Ok(false);
            }
            Command::Noop => self.reply(code::OK, "NOOP ok").await?,
            Command::Syst => self.reply(code::SYSTEM_TYPE, "UNIX Type: L8").await?,
            Command::Feat => {
                let reply = Reply {
                    code: code::FEATURES,
                    lines: ["Features:", " EPSV", " MDTM", " PASV", " SIZE", " UTF8", "End"]
                        .iter()
                        .map(|s| s.to_string())
                        .collect(),
                };
                write_reply(&mut self.writer, &reply).await?;
            }
            Command::Opts(opt) => {
                if opt.to_ascii_uppercase().starts_with("UTF8") {
                    self.reply(code::OK, "UTF8 mode is always on").await?
                } else {
                    self.reply(code::BAD_ARGUMENTS, "Option not understood").await?
                }
            }
            Command::Type(t) => {
                let t = t.to_ascii_uppercase();
                // Data is always moved as-is; ASCII is accepted for compatibility
                if matches!(t.as_str(), "I" | "L 8" | "A" | "A N") {
                    self.reply(code::OK, format!("Type set to {}", t)).await?
                } else {
                    self.reply(code::NOT_IMPLEMENTED_PARAM, "Type not supported").await?
                }
            }
            Command::Mode(m) => self.only_accept(&m, "S", "Mode").await?,
            Command::Stru(s) => self.only_accept(&s, "F", "Structure").await?,
            Command::Pwd => {
                let quoted = self.cwd.replace('"', "\"\"");
                self.reply(code::PATH_CREATED, format!("\"{}\" is the current directory", quoted))
                    .await?
            }
            Command::Cwd(path) => self.change_dir(&path).await?,
            Command::Cdup => self.change_dir("..").await?,
            Command::Pasv => self.passive(false).await?,
            Command::Epsv => self.passive(true).await?,
            Command::Port(addr) => {
                if addr.ip() != self.peer.ip() {
                    warn!(addr = %addr, "PORT to a foreign host refused");
                    self.reply(code::BAD_ARGUMENTS, "PORT must point at the client").await?
                } else {
                    self.data = DataChannel::Active(addr);
                    self.reply(code::OK, "PORT command successful").await?
                }
            }
            Command::List(path) => self.list(path.as_deref(), true).await?,
            Command::Nlst(path) => self.list(path.as_deref(), false).await?,
            Command::Retr(path) => self.retrieve(&path).await?,
            Command::Stor(path) => return self.store(&path).await,
            Command::Size(path) => {
                if let Some((_, meta)) = self.resolve_file(&path).await? {
                    self.reply(code::FILE_STATUS, meta.len().to_string()).await?
                }
            }
            Command::Mdtm(path) => {
                if let Some((_, meta)) = self.resolve_file(&path).await? {
                    let when = meta.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now());
                    self.reply(code::FILE_STATUS, when.format("%Y%m%d%H%M%S").to_string())
                        .await?
                }
            }
            Command::Dele(path) => {
                if let Some((real, _)) = self.resolve_file(&path).await? {
                    match tokio::fs::remove_file(&real).await {
                        Ok(()) => {
                            info!(path = %real.display(), "deleted");
                            self.reply(code::FILE_ACTION_OK, "File deleted").await?
                        }
                        Err(e) => self.reply(code::FILE_UNAVAILABLE, format!("Delete failed: {}", e)).await?,
                    }
                }
            }
            Command::Mkd(path) => {
                if let Some((virt, real)) = self.resolve(&path).await? {
                    match tokio::fs::create_dir(&real).await {
                        Ok(()) => {
                            let quoted = virt.replace('"', "\"\"");
                            self.reply(code::PATH_CREATED, format!("\"{}\" created", quoted)).await?
                        }
                        Err(e) => self.reply(code::FILE_UNAVAILABLE, format!("Cannot create directory: {}", e)).await?,
                    }
                }
            }
            Command::Rmd(path) => {
                if let Some((virt, real)) = self.resolve(&path).await? {
                    if virt == "/" {
                        self.reply(code::FILE_UNAVAILABLE, "Cannot remove the root").await?
                    } else {
                        match tokio::fs::remove_dir(&real).await {
                            Ok(()) => self.reply(code::FILE_ACTION_OK, "Directory removed").await?,
                            Err(e) => self.reply(code::FILE_UNAVAILABLE, format!("Cannot remove directory: {}", e)).await?,
                        }
                    }
                }
            }
            Command::Abor => self.reply(code::TRANSFER_COMPLETE, "No transfer to abort").await?,
            Command::Unknown(verb) => {
                debug!(verb = %verb, "unsupported command");
                self.reply(code::NOT_IMPLEMENTED, format!("{} not implemented", verb)).await?
            }
        }
        Ok(true)
    }

    async fn only_accept(&mut self, got: &str, supported: &str, what: &str) -> io::Result<()> {
        if got.eq_ignore_ascii_case(supported) {
            self.reply(code::OK, format!("{} set to {}", what, supported)).await
        } else {
            self.reply(code::NOT_IMPLEMENTED_PARAM, format!("{} not supported", what)).await
        }
    }

    async fn user(&mut self, user: String) -> io::Result<()> {
        if self.identity.is_some() {
            return self.reply(code::BAD_SEQUENCE, "Already logged in").await;
        }
        let prompt = if AuthPolicy::is_anonymous_user(&user) {
            "Guest login ok, send your email address as password".to_string()
        } else {
            format!("Password required for {}", user)
        };
        self.pending_user = Some(user);
        self.reply(code::NEED_PASSWORD, prompt).await
    }

    async fn pass(&mut self, pass: &str) -> io::Result<()> {
        if self.identity.is_some() {
            return self.reply(code::BAD_SEQUENCE, "Already logged in").await;
        }
        let Some(user) = self.pending_user.take() else {
            return self.reply(code::BAD_SEQUENCE, "Login with USER first").await;
        };
        match self.ctx.auth.authenticate(&user, pass) {
            Some(identity) => {
                info!(user = identity.name(), "logged in");
                self.identity = Some(identity);
                self.set_state(SessionState::Authenticated);
                self.set_state(SessionState::Idle);
                self.reply(code::LOGGED_IN, "Login successful").await
            }
            None => {
                warn!(user = %user, "login refused");
                self.reply(code::NOT_LOGGED_IN, "Login incorrect").await
            }
        }
    }

    /// Map a client path to its virtual and real form. Replies `550` and
    /// returns `None` if the path is unusable.
    async fn resolve(&mut self, arg: &str) -> io::Result<Option<(String, PathBuf)>> {
        let mapped = join_virtual(&self.cwd, arg)
            .and_then(|virt| normalize_under_root(&self.ctx.root, &virt).map(|real| (virt, real)));
        match mapped {
            Ok(pair) => Ok(Some(pair)),
            Err(e) => {
                debug!(path = %arg, error = %e, "path refused");
                self.reply(code::FILE_UNAVAILABLE, "Permission denied").await?;
                Ok(None)
            }
        }
    }

    async fn resolve_file(&mut self, arg: &str) -> io::Result<Option<(PathBuf, std::fs::Metadata)>> {
        let Some((_, real)) = self.resolve(arg).await? else {
            return Ok(None);
        };
        match tokio::fs::metadata(&real).await {
            Ok(meta) if meta.is_file() => Ok(Some((real, meta))),
            _ => {
                self.reply(code::FILE_UNAVAILABLE, "No such file").await?;
                Ok(None)
            }
        }
    }

    async fn change_dir(&mut self, arg: &str) -> io::Result<()> {
        let Some((virt, real)) = self.resolve(arg).await? else {
            return Ok(());
        };
        if real.is_dir() {
            self.cwd = virt;
            self.reply(code::FILE_ACTION_OK, format!("Directory changed to {}", self.cwd)).await
        } else {
            self.reply(code::FILE_UNAVAILABLE, "No such directory").await
        }
    }

    async fn passive(&mut self, extended: bool) -> io::Result<()> {
        let listener = match TcpListener::bind(SocketAddr::new(self.local_ip, 0)).await {
            Ok(l) => l,
            Err(e) => {
                warn!(error = %e, "cannot open passive port");
                return self.reply(code::CANT_OPEN_DATA, "Cannot open passive connection").await;
            }
        };
        let port = listener.local_addr()?.port();
        let text = if extended {
            format!("Entering Extended Passive Mode (|||{}|)", port)
        } else {
            match self.local_ip {
                IpAddr::V4(ip) => format!(
                    "Entering Passive Mode ({})",
                    encode_host_port(std::net::SocketAddrV4::new(ip, port))
                ),
                IpAddr::V6(_) => {
                    return self.reply(code::CANT_OPEN_DATA, "PASV needs IPv4, use EPSV").await;
                }
            }
        };
        self.data = DataChannel::Passive(listener);
        let reply_code = if extended { code::EXTENDED_PASSIVE } else { code::PASSIVE };
        self.reply(reply_code, text).await
    }

    /// Consume the prepared data channel and connect it.
    async fn open_data(&mut self) -> io::Result<TcpStream> {
        let wait = Duration::from_millis(DATA_CONNECT_MS);
        let timed_out = || io::Error::new(io::ErrorKind::TimedOut, "data connection timed out");
        let stream = match std::mem::replace(&mut self.data, DataChannel::None) {
            DataChannel::None => {
                return Err(io::Error::new(io::ErrorKind::NotConnected, "use PASV or PORT first"))
            }
            DataChannel::Passive(listener) => {
                let (stream, from) = timeout(wait, listener.accept()).await.map_err(|_| timed_out())??;
                if from.ip() != self.peer.ip() {
                    return Err(io::Error::new(
                        io::ErrorKind::PermissionDenied,
                        format!("data connection from unexpected host {}", from.ip()),
                    ));
                }
                stream
            }
            DataChannel::Active(addr) => timeout(wait, TcpStream::connect(addr)).await.map_err(|_| timed_out())??,
        };
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }

    /// Send a preliminary reply, open the data connection and hand it back.
    /// Replies `425` and returns `None` if the connection cannot be made.
    async fn begin_transfer(&mut self, what: &str) -> io::Result<Option<TcpStream>> {
        if matches!(self.data, DataChannel::None) {
            self.reply(code::CANT_OPEN_DATA, "Use PASV or PORT first").await?;
            return Ok(None);
        }
        self.reply(code::DATA_OPENING, format!("Opening data connection for {}", what)).await?;
        match self.open_data().await {
            Ok(stream) => {
                self.set_state(SessionState::Transferring);
                Ok(Some(stream))
            }
            Err(e) => {
                warn!(error = %e, "data connection failed");
                self.reply(code::CANT_OPEN_DATA, "Cannot open data connection").await?;
                Ok(None)
            }
        }
    }

    async fn list(&mut self, arg: Option<&str>, long: bool) -> io::Result<()> {
        let Some((virt, real)) = self.resolve(arg.unwrap_or(".")).await? else {
            return Ok(());
        };
        let body = match build_listing(&real, long) {
            Ok(body) => body,
            Err(e) => {
                debug!(path = %virt, error = %e, "listing failed");
                return self.reply(code::FILE_UNAVAILABLE, "No such file or directory").await;
            }
        };
        let Some(mut data) = self.begin_transfer(&virt).await? else {
            return Ok(());
        };
        let sent = async {
            data.write_all(body.as_bytes()).await?;
            data.shutdown().await
        }
        .await;
        self.set_state(SessionState::Idle);
        match sent {
            Ok(()) => self.reply(code::TRANSFER_COMPLETE, "Transfer complete").await,
            Err(e) => {
                warn!(error = %e, "listing transfer failed");
                self.reply(code::TRANSFER_ABORTED, "Connection closed, transfer aborted").await
            }
        }
    }

    async fn retrieve(&mut self, arg: &str) -> io::Result<()> {
        let Some((real, _)) = self.resolve_file(arg).await? else {
            return Ok(());
        };
        let mut file = match tokio::fs::File::open(&real).await {
            Ok(f) => f,
            Err(e) => return self.reply(code::FILE_UNAVAILABLE, format!("Cannot open file: {}", e)).await,
        };
        let Some(mut data) = self.begin_transfer(arg).await? else {
            return Ok(());
        };
        let sent = async {
            let n = tokio::io::copy(&mut file, &mut data).await?;
            data.shutdown().await?;
            Ok::<u64, io::Error>(n)
        }
        .await;
        self.set_state(SessionState::Idle);
        match sent {
            Ok(n) => {
                info!(path = %real.display(), bytes = n, "sent");
                self.reply(code::TRANSFER_COMPLETE, "Transfer complete").await
            }
            Err(e) => {
                warn!(error = %e, "download failed");
                self.reply(code::TRANSFER_ABORTED, "Connection closed, transfer aborted").await
            }
        }
    }

    /// Returns `false` if the control connection was lost mid-transfer.
    async fn store(&mut self, arg: &str) -> Result<bool> {
        let Some((virt, final_path)) = self.resolve(arg).await? else {
            return Ok(true);
        };
        let (folder, name) = split_virtual(&virt);
        if name.is_empty() || final_path.is_dir() {
            self.reply(code::FILE_UNAVAILABLE, "Not a file name").await?;
            return Ok(true);
        }
        if matches!(self.data, DataChannel::None) {
            self.reply(code::CANT_OPEN_DATA, "Use PASV or PORT first").await?;
            return Ok(true);
        }

        let part_path = part_path_for(&final_path);
        let mut file = match tokio::fs::File::create(&part_path).await {
            Ok(f) => f,
            Err(e) => {
                warn!(path = %part_path.display(), error = %e, "cannot create upload file");
                self.reply(code::FILE_UNAVAILABLE, "Cannot create file").await?;
                return Ok(true);
            }
        };
        let Some(mut data) = self.begin_transfer(&name).await? else {
            drop(file);
            let _ = tokio::fs::remove_file(&part_path).await;
            return Ok(true);
        };

        let outcome = receive_upload(&mut self.reader, &mut self.writer, &mut data, &mut file).await;
        drop(data);
        let flushed = file.flush().await;

        match outcome {
            UploadOutcome::Complete(bytes) => {
                let finished = async {
                    flushed?;
                    file.sync_all().await?;
                    drop(file);
                    tokio::fs::rename(&part_path, &final_path).await
                }
                .await;
                self.set_state(SessionState::Idle);
                if let Err(e) = finished {
                    error!(path = %part_path.display(), error = %e, "could not finalize upload");
                    self.reply(code::LOCAL_ERROR, "Could not store file").await?;
                    return Ok(true);
                }
                info!(path = %final_path.display(), bytes, "received");
                self.notify(&final_path, bytes, &folder, &name).await;
                self.reply(code::TRANSFER_COMPLETE, "Transfer complete").await?;
                Ok(true)
            }
            UploadOutcome::Aborted(bytes) => {
                self.set_state(SessionState::Idle);
                warn!(path = %part_path.display(), bytes, "upload aborted by client, partial file kept");
                self.reply(code::TRANSFER_ABORTED, "Transfer aborted").await?;
                self.reply(code::TRANSFER_COMPLETE, "ABOR command successful").await?;
                Ok(true)
            }
            UploadOutcome::ControlLost(bytes) => {
                warn!(path = %part_path.display(), bytes, "control connection lost during upload, partial file kept");
                Ok(false)
            }
            UploadOutcome::Failed(e) => {
                self.set_state(SessionState::Idle);
                warn!(path = %part_path.display(), error = %e, "upload failed, partial file kept");
                self.reply(code::TRANSFER_ABORTED, "Transfer failed").await?;
                Ok(true)
            }
        }
    }

    async fn notify(&self, local_path: &Path, size: u64, folder: &str, name: &str) {
        let Some(handler) = self.ctx.handler.clone() else {
            return;
        };
        let modified_time = tokio::fs::metadata(local_path)
            .await
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        let file = IngestedFile {
            local_path: local_path.to_path_buf(),
            size,
            modified_time,
            received_at: Utc::now(),
        };
        let called = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(&file, folder, name)));
        if called.is_err() {
            error!(path = %local_path.display(), "file handler panicked");
        }
    }
}

enum Ready {
    Data(Result<io::Result<usize>, Elapsed>),
    Control { closed: bool },
}

/// Copy the data stream into `file` while watching the control connection
/// for ABOR or a hang-up.
async fn receive_upload(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    data: &mut TcpStream,
    file: &mut tokio::fs::File,
) -> UploadOutcome {
    let mut buf = vec![0u8; DATA_BUF_SIZE];
    let mut total = 0u64;
    let idle = Duration::from_secs(CONTROL_IDLE_SECS);
    loop {
        // Data is polled first: a client that sends its last bytes and
        // hangs up straight away has still completed the upload
        let ready = tokio::select! {
            biased;
            read = timeout(idle, data.read(&mut buf)) => Ready::Data(read),
            ctl = reader.fill_buf() => Ready::Control {
                closed: ctl.map(|pending| pending.is_empty()).unwrap_or(true),
            },
        };
        match ready {
            Ready::Data(Err(_)) => {
                return UploadOutcome::Failed(io::Error::new(io::ErrorKind::TimedOut, "data connection stalled"))
            }
            Ready::Data(Ok(Err(e))) => return UploadOutcome::Failed(e),
            Ready::Data(Ok(Ok(0))) => {
                return if take_pending_abort(reader).await {
                    UploadOutcome::Aborted(total)
                } else {
                    UploadOutcome::Complete(total)
                };
            }
            Ready::Data(Ok(Ok(n))) => {
                if let Err(e) = file.write_all(&buf[..n]).await {
                    return UploadOutcome::Failed(e);
                }
                total += n as u64;
                continue;
            }
            Ready::Control { closed: true } => return UploadOutcome::ControlLost(total),
            Ready::Control { closed: false } => {}
        }

        let line = match read_line(reader).await {
            Ok(Some(line)) => line,
            Ok(None) | Err(_) => return UploadOutcome::ControlLost(total),
        };
        match Command::parse(strip_telnet(&line)) {
            Ok(Command::Abor) => return UploadOutcome::Aborted(total),
            Ok(Command::Quit) => return UploadOutcome::ControlLost(total),
            _ => {
                let busy = Reply::new(code::BAD_SEQUENCE, "Transfer in progress");
                if write_reply(writer, &busy).await.is_err() {
                    return UploadOutcome::ControlLost(total);
                }
            }
        }
    }
}

/// Clients send ABOR and then close the data connection, so both can be
/// ready together. Consumes the ABOR line if one is already buffered.
async fn take_pending_abort(reader: &mut BufReader<OwnedReadHalf>) -> bool {
    let is_abor = match timeout(Duration::ZERO, reader.fill_buf()).await {
        Ok(Ok(pending)) => {
            let text = String::from_utf8_lossy(pending);
            strip_telnet(&text)
                .get(..4)
                .is_some_and(|verb| verb.eq_ignore_ascii_case("ABOR"))
        }
        _ => false,
    };
    if is_abor {
        let _ = read_line(reader).await;
    }
    is_abor
}

/// Clients may prefix urgent commands with Telnet IP/Synch bytes.
fn strip_telnet(line: &str) -> &str {
    line.trim_start_matches(|c: char| !c.is_ascii_alphabetic())
}

fn build_listing(real: &Path, long: bool) -> io::Result<String> {
    let meta = std::fs::metadata(real)?;
    let mut entries: Vec<(String, std::fs::Metadata)> = Vec::new();
    if meta.is_dir() {
        for entry in std::fs::read_dir(real)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Ok(m) = entry.metadata() {
                entries.push((name, m));
            }
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
    } else {
        let name = real
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        entries.push((name, meta));
    }
    let mut out = String::new();
    for (name, m) in &entries {
        if long {
            out.push_str(&format_list_line(name, m));
        } else {
            out.push_str(name);
        }
        out.push_str("\r\n");
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        use SessionState::*;
        assert!(Connecting.can_transition_to(Authenticated));
        assert!(Authenticated.can_transition_to(Idle));
        assert!(Idle.can_transition_to(Transferring));
        assert!(Transferring.can_transition_to(Idle));
        for s in [Connecting, Authenticated, Idle, Transferring] {
            assert!(s.can_transition_to(Closed));
        }
        assert!(!Connecting.can_transition_to(Transferring));
        assert!(!Closed.can_transition_to(Idle));
        assert!(!Idle.can_transition_to(Authenticated));
    }

    #[test]
    fn test_part_path_is_unique_per_upload() {
        let first = part_path_for(Path::new("/srv/in/a.pdf"));
        let second = part_path_for(Path::new("/srv/in/a.pdf"));
        assert_ne!(first, second);
        for p in [&first, &second] {
            assert_eq!(p.parent(), Some(Path::new("/srv/in")));
            let name = p.file_name().unwrap().to_string_lossy();
            assert!(name.starts_with("a.pdf."));
            assert!(name.ends_with(".part"));
        }
        let bare = part_path_for(Path::new("noext"));
        assert!(bare.to_string_lossy().starts_with("noext."));
    }

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    async fn staging_file(dir: &Path) -> tokio::fs::File {
        tokio::fs::File::create(dir.join("upload.part")).await.unwrap()
    }

    #[tokio::test]
    async fn test_finished_data_beats_control_hangup() {
        let (mut data_client, mut data_server) = socket_pair().await;
        let (control_client, control_server) = socket_pair().await;
        data_client.write_all(b"payload").await.unwrap();
        data_client.shutdown().await.unwrap();
        drop(data_client);
        drop(control_client);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let tmp = tempfile::tempdir().unwrap();
        let mut file = staging_file(tmp.path()).await;
        let (r, mut w) = control_server.into_split();
        let mut reader = BufReader::new(r);
        let outcome = receive_upload(&mut reader, &mut w, &mut data_server, &mut file).await;
        assert!(matches!(outcome, UploadOutcome::Complete(7)));
    }

    #[tokio::test]
    async fn test_abor_sent_before_data_close_is_an_abort() {
        let (mut data_client, mut data_server) = socket_pair().await;
        let (mut control_client, control_server) = socket_pair().await;
        data_client.write_all(b"part").await.unwrap();
        control_client.write_all(b"ABOR\r\n").await.unwrap();
        data_client.shutdown().await.unwrap();
        drop(data_client);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let tmp = tempfile::tempdir().unwrap();
        let mut file = staging_file(tmp.path()).await;
        let (r, mut w) = control_server.into_split();
        let mut reader = BufReader::new(r);
        let outcome = receive_upload(&mut reader, &mut w, &mut data_server, &mut file).await;
        assert!(matches!(outcome, UploadOutcome::Aborted(4)));
        // The ABOR line is consumed, not left for the command loop
        assert!(reader.buffer().is_empty());
        drop(control_client);
    }

    #[tokio::test]
    async fn test_control_hangup_mid_transfer_loses_upload() {
        let (mut data_client, mut data_server) = socket_pair().await;
        let (control_client, control_server) = socket_pair().await;
        data_client.write_all(b"half").await.unwrap();
        drop(control_client);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let tmp = tempfile::tempdir().unwrap();
        let mut file = staging_file(tmp.path()).await;
        let (r, mut w) = control_server.into_split();
        let mut reader = BufReader::new(r);
        let outcome = receive_upload(&mut reader, &mut w, &mut data_server, &mut file).await;
        assert!(matches!(outcome, UploadOutcome::ControlLost(_)));
        drop(data_client);
    }

    #[test]
    fn test_strip_telnet() {
        assert_eq!(strip_telnet("\u{fffd}\u{fffd}ABOR"), "ABOR");
        assert_eq!(strip_telnet("NOOP"), "NOOP");
    }

    #[test]
    fn test_build_listing_sorted() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("b.txt"), b"bb").unwrap();
        std::fs::write(tmp.path().join("a.txt"), b"a").unwrap();
        let names = build_listing(tmp.path(), false).unwrap();
        assert_eq!(names, "a.txt\r\nb.txt\r\n");
        let long = build_listing(&tmp.path().join("b.txt"), true).unwrap();
        assert!(long.starts_with("-rw-r--r--"));
        assert!(long.trim_end().ends_with(" b.txt"));
    }
}
