//! Login policy: anonymous access plus an optional flat credential file.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::Path;

/// Usernames that count as anonymous (case-insensitive).
const ANONYMOUS_USERS: [&str; 2] = ["anonymous", "ftp"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    Anonymous,
    User(String),
}

impl Identity {
    pub fn name(&self) -> &str {
        match self {
            Identity::Anonymous => "anonymous",
            Identity::User(u) => u,
        }
    }
}

/// `user:password` per line; blank lines and `#` comments are skipped.
#[derive(Default, Clone)]
pub struct PasswordDb {
    entries: HashMap<String, String>,
}

impl std::fmt::Debug for PasswordDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordDb")
            .field("users", &self.entries.len())
            .finish()
    }
}

impl PasswordDb {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading password file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing password file {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut entries = HashMap::new();
        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (user, pass) = line
                .split_once(':')
                .with_context(|| format!("line {}: expected user:password", lineno + 1))?;
            let user = user.trim();
            if user.is_empty() {
                anyhow::bail!("line {}: empty user name", lineno + 1);
            }
            entries.insert(user.to_string(), pass.to_string());
        }
        Ok(Self { entries })
    }

    pub fn check(&self, user: &str, pass: &str) -> bool {
        self.entries.get(user).is_some_and(|p| p == pass)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct AuthPolicy {
    pub allow_anonymous: bool,
    pub passwords: Option<PasswordDb>,
}

impl AuthPolicy {
    pub fn is_anonymous_user(user: &str) -> bool {
        ANONYMOUS_USERS.iter().any(|a| a.eq_ignore_ascii_case(user))
    }

    /// `None` means the login is refused.
    pub fn authenticate(&self, user: &str, pass: &str) -> Option<Identity> {
        if Self::is_anonymous_user(user) {
            return self.allow_anonymous.then_some(Identity::Anonymous);
        }
        match &self.passwords {
            Some(db) if db.check(user, pass) => Some(Identity::User(user.to_string())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DB: &str = "# scanners\n\nscanner:s3cret\n  office : pa:ss\n";

    #[test]
    fn test_parse_skips_comments_and_blank_lines() {
        let db = PasswordDb::parse(DB).unwrap();
        assert_eq!(db.len(), 2);
        assert!(db.check("scanner", "s3cret"));
        // Only the first colon separates; the password keeps the rest verbatim
        assert!(db.check("office", " pa:ss"));
        assert!(!db.check("scanner", "wrong"));
        assert!(PasswordDb::parse("no-colon-here").is_err());
    }

    #[test]
    fn test_anonymous_any_password_when_allowed() {
        let policy = AuthPolicy {
            allow_anonymous: true,
            passwords: None,
        };
        assert_eq!(policy.authenticate("anonymous", ""), Some(Identity::Anonymous));
        assert_eq!(policy.authenticate("FTP", "me@example.com"), Some(Identity::Anonymous));
        assert_eq!(policy.authenticate("scanner", "s3cret"), None);
    }

    #[test]
    fn test_credentials_only() {
        let policy = AuthPolicy {
            allow_anonymous: false,
            passwords: Some(PasswordDb::parse(DB).unwrap()),
        };
        assert_eq!(policy.authenticate("anonymous", "x"), None);
        assert_eq!(
            policy.authenticate("scanner", "s3cret"),
            Some(Identity::User("scanner".into()))
        );
        assert_eq!(policy.authenticate("scanner", "nope"), None);
    }

    #[test]
    fn test_load_missing_file_errors() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(PasswordDb::load(&tmp.path().join("missing")).is_err());
    }
}
