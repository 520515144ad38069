//! FTP control-channel definitions shared by the listener's sessions

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

// Longest command line we accept from a peer. RFC 959 has no limit but
// anything past this is garbage or abuse.
pub const MAX_LINE_LEN: usize = 8 * 1024;

// Reply codes sent by the listener (RFC 959 §4.2)
pub mod code {
    pub const DATA_OPENING: u16 = 150;
    pub const OK: u16 = 200;
    pub const FEATURES: u16 = 211;
    pub const FILE_STATUS: u16 = 213;
    pub const SYSTEM_TYPE: u16 = 215;
    pub const READY: u16 = 220;
    pub const CLOSING: u16 = 221;
    pub const TRANSFER_COMPLETE: u16 = 226;
    pub const PASSIVE: u16 = 227;
    pub const EXTENDED_PASSIVE: u16 = 229;
    pub const LOGGED_IN: u16 = 230;
    pub const FILE_ACTION_OK: u16 = 250;
    pub const PATH_CREATED: u16 = 257;
    pub const NEED_PASSWORD: u16 = 331;
    pub const SERVICE_UNAVAILABLE: u16 = 421;
    pub const CANT_OPEN_DATA: u16 = 425;
    pub const TRANSFER_ABORTED: u16 = 426;
    pub const LOCAL_ERROR: u16 = 451;
    pub const SYNTAX_ERROR: u16 = 500;
    pub const BAD_ARGUMENTS: u16 = 501;
    pub const NOT_IMPLEMENTED: u16 = 502;
    pub const BAD_SEQUENCE: u16 = 503;
    pub const NOT_IMPLEMENTED_PARAM: u16 = 504;
    pub const NOT_LOGGED_IN: u16 = 530;
    pub const FILE_UNAVAILABLE: u16 = 550;
}

// Centralized timeout constants for the listener and the client
pub mod timeouts {
    // Idle control connection before the listener hangs up (s)
    pub const CONTROL_IDLE_SECS: u64 = 300;

    // Waiting for the peer to open/accept a data connection (ms)
    pub const DATA_CONNECT_MS: u64 = 10_000;

    // Client connection establishment (ms)
    pub const CONNECT_MS: u64 = 5_000;
}

/// A complete (possibly multi-line) FTP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            lines: vec![text.into()],
        }
    }

    /// Wire encoding, CRLF terminated. Multi-line replies use `NNN-` on
    /// every line but the last.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        let last = self.lines.len().saturating_sub(1);
        for (i, line) in self.lines.iter().enumerate() {
            let sep = if i == last { ' ' } else { '-' };
            out.push_str(&format!("{}{}{}\r\n", self.code, sep, line));
        }
        if self.lines.is_empty() {
            out.push_str(&format!("{} \r\n", self.code));
        }
        out
    }
}

/// Read one CRLF (or bare LF) terminated line. `Ok(None)` on clean EOF.
pub async fn read_line<R>(reader: &mut R) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let mut limited = (&mut *reader).take(MAX_LINE_LEN as u64 + 1);
    let n = limited.read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Ok(None);
    }
    if buf.len() > MAX_LINE_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("control line too long ({} bytes)", buf.len()),
        ));
    }
    while matches!(buf.last(), Some(b'\n' | b'\r')) {
        buf.pop();
    }
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}

pub async fn write_reply<W>(writer: &mut W, reply: &Reply) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(reply.encode().as_bytes()).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[test]
    fn test_encode_single_and_multi_line() {
        assert_eq!(Reply::new(220, "ready").encode(), "220 ready\r\n");
        let multi = Reply {
            code: 211,
            lines: vec!["Features:".into(), " PASV".into(), "End".into()],
        };
        assert_eq!(multi.encode(), "211-Features:\r\n211- PASV\r\n211 End\r\n");
    }

    #[tokio::test]
    async fn test_read_line_strips_terminators() {
        let mut reader = BufReader::new(&b"USER bob\r\nPASS x\n"[..]);
        assert_eq!(read_line(&mut reader).await.unwrap().as_deref(), Some("USER bob"));
        assert_eq!(read_line(&mut reader).await.unwrap().as_deref(), Some("PASS x"));
        assert_eq!(read_line(&mut reader).await.unwrap(), None);
    }
}
