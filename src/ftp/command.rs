//! Control-channel command parsing and the host/port encoding used by
//! PORT and PASV.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    User(String),
    Pass(String),
    Quit,
    Noop,
    Syst,
    Feat,
    Opts(String),
    Type(String),
    Mode(String),
    Stru(String),
    Pwd,
    Cwd(String),
    Cdup,
    Pasv,
    Epsv,
    Port(SocketAddr),
    List(Option<String>),
    Nlst(Option<String>),
    Retr(String),
    Stor(String),
    Size(String),
    Mdtm(String),
    Dele(String),
    Mkd(String),
    Rmd(String),
    Abor,
    Unknown(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("empty command line")]
    Empty,
    #[error("{0} requires an argument")]
    MissingArgument(&'static str),
    #[error("malformed PORT argument {0:?}")]
    BadPort(String),
}

impl Command {
    pub fn parse(line: &str) -> Result<Command, CommandError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (verb, rest) = match line.split_once(' ') {
            Some((v, r)) => (v, r.trim()),
            None => (line, ""),
        };
        if verb.is_empty() {
            return Err(CommandError::Empty);
        }
        let arg = || -> Option<String> {
            if rest.is_empty() {
                None
            } else {
                Some(rest.to_string())
            }
        };
        let required = |name: &'static str| arg().ok_or(CommandError::MissingArgument(name));

        let cmd = match verb.to_ascii_uppercase().as_str() {
            "USER" => Command::User(required("USER")?),
            // An empty password is legal
            "PASS" => Command::Pass(rest.to_string()),
            "QUIT" => Command::Quit,
            "NOOP" => Command::Noop,
            "SYST" => Command::Syst,
            "FEAT" => Command::Feat,
            "OPTS" => Command::Opts(required("OPTS")?),
            "TYPE" => Command::Type(required("TYPE")?),
            "MODE" => Command::Mode(required("MODE")?),
            "STRU" => Command::Stru(required("STRU")?),
            "PWD" | "XPWD" => Command::Pwd,
            "CWD" | "XCWD" => Command::Cwd(required("CWD")?),
            "CDUP" | "XCUP" => Command::Cdup,
            "PASV" => Command::Pasv,
            "EPSV" => Command::Epsv,
            "PORT" => {
                let a = required("PORT")?;
                let addr = decode_host_port(&a).ok_or(CommandError::BadPort(a))?;
                Command::Port(SocketAddr::V4(addr))
            }
            "LIST" => Command::List(listing_target(rest)),
            "NLST" => Command::Nlst(listing_target(rest)),
            "RETR" => Command::Retr(required("RETR")?),
            "STOR" => Command::Stor(required("STOR")?),
            "SIZE" => Command::Size(required("SIZE")?),
            "MDTM" => Command::Mdtm(required("MDTM")?),
            "DELE" => Command::Dele(required("DELE")?),
            "MKD" | "XMKD" => Command::Mkd(required("MKD")?),
            "RMD" | "XRMD" => Command::Rmd(required("RMD")?),
            "ABOR" => Command::Abor,
            other => Command::Unknown(other.to_string()),
        };
        Ok(cmd)
    }

    pub fn verb(&self) -> &str {
        match self {
            Command::User(_) => "USER",
            Command::Pass(_) => "PASS",
            Command::Quit => "QUIT",
            Command::Noop => "NOOP",
            Command::Syst => "SYST",
            Command::Feat => "FEAT",
            Command::Opts(_) => "OPTS",
            Command::Type(_) => "TYPE",
            Command::Mode(_) => "MODE",
            Command::Stru(_) => "STRU",
            Command::Pwd => "PWD",
            Command::Cwd(_) => "CWD",
            Command::Cdup => "CDUP",
            Command::Pasv => "PASV",
            Command::Epsv => "EPSV",
            Command::Port(_) => "PORT",
            Command::List(_) => "LIST",
            Command::Nlst(_) => "NLST",
            Command::Retr(_) => "RETR",
            Command::Stor(_) => "STOR",
            Command::Size(_) => "SIZE",
            Command::Mdtm(_) => "MDTM",
            Command::Dele(_) => "DELE",
            Command::Mkd(_) => "MKD",
            Command::Rmd(_) => "RMD",
            Command::Abor => "ABOR",
            Command::Unknown(v) => v,
        }
    }

    /// Commands allowed before login completes.
    pub fn allowed_before_login(&self) -> bool {
        matches!(
            self,
            Command::User(_)
                | Command::Pass(_)
                | Command::Quit
                | Command::Noop
                | Command::Syst
                | Command::Feat
                | Command::Opts(_)
        )
    }
}

/// LIST/NLST take an optional path, and many clients slip `ls` flags in
/// front of it (`LIST -la`). Flags are dropped.
fn listing_target(rest: &str) -> Option<String> {
    let path: Vec<&str> = rest
        .split_whitespace()
        .skip_while(|w| w.starts_with('-'))
        .collect();
    if path.is_empty() {
        None
    } else {
        Some(path.join(" "))
    }
}

/// `h1,h2,h3,h4,p1,p2` → socket address.
pub fn decode_host_port(s: &str) -> Option<SocketAddrV4> {
    let nums: Vec<u8> = s
        .trim()
        .split(',')
        .map(|p| p.trim().parse::<u8>())
        .collect::<Result<_, _>>()
        .ok()?;
    if nums.len() != 6 {
        return None;
    }
    let ip = Ipv4Addr::new(nums[0], nums[1], nums[2], nums[3]);
    let port = u16::from(nums[4]) << 8 | u16::from(nums[5]);
    Some(SocketAddrV4::new(ip, port))
}

pub fn encode_host_port(addr: SocketAddrV4) -> String {
    let [a, b, c, d] = addr.ip().octets();
    let port = addr.port();
    format!("{},{},{},{},{},{}", a, b, c, d, port >> 8, port & 0xff)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic_commands() {
        assert_eq!(Command::parse("USER anonymous\r\n").unwrap(), Command::User("anonymous".into()));
        assert_eq!(Command::parse("pass ").unwrap(), Command::Pass(String::new()));
        assert_eq!(Command::parse("XPWD").unwrap(), Command::Pwd);
        assert_eq!(Command::parse("stor my file.txt").unwrap(), Command::Stor("my file.txt".into()));
        assert_eq!(Command::parse("SITE CHMOD").unwrap(), Command::Unknown("SITE".into()));
    }

    #[test]
    fn test_parse_missing_argument() {
        assert_eq!(Command::parse("STOR").unwrap_err(), CommandError::MissingArgument("STOR"));
        assert_eq!(Command::parse("CWD   ").unwrap_err(), CommandError::MissingArgument("CWD"));
        assert_eq!(Command::parse("").unwrap_err(), CommandError::Empty);
    }

    #[test]
    fn test_listing_flags_are_dropped() {
        assert_eq!(Command::parse("LIST -la").unwrap(), Command::List(None));
        assert_eq!(Command::parse("LIST -l sub dir").unwrap(), Command::List(Some("sub dir".into())));
        assert_eq!(Command::parse("NLST .").unwrap(), Command::Nlst(Some(".".into())));
    }

    #[test]
    fn test_port_round_trip_and_rejects() {
        let addr = SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 20), 50_123);
        let encoded = encode_host_port(addr);
        assert_eq!(encoded, "192,168,1,20,195,203");
        assert_eq!(Command::parse(&format!("PORT {}", encoded)).unwrap(), Command::Port(SocketAddr::V4(addr)));
        assert!(matches!(Command::parse("PORT 1,2,3"), Err(CommandError::BadPort(_))));
        assert!(matches!(Command::parse("PORT 1,2,3,4,5,300"), Err(CommandError::BadPort(_))));
    }

    #[test]
    fn test_allowed_before_login() {
        assert!(Command::User("x".into()).allowed_before_login());
        assert!(!Command::Stor("x".into()).allowed_before_login());
        assert!(!Command::Pwd.allowed_before_login());
    }
}
