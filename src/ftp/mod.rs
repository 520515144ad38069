//! FTP ingestion: command parsing, login policy, listings, per-connection
//! sessions and the listener that hosts them.

pub mod auth;
pub mod command;
pub mod listener;
pub mod listing;
mod session;

pub use listener::{FileHandler, IngestedFile, IngestionListener, ListenerHandle};
pub use session::{part_path_for, SessionState};
