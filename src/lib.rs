//! Dropbridge: an FTP drop box whose uploads are forwarded to Dropbox.
//!
//! Scanners and other devices that can only speak FTP push files to the
//! [`ftp::IngestionListener`]; every completed file is queued on the
//! [`sync::SyncCoordinator`] and uploaded through a
//! [`remote::RemoteStorageClient`].

pub mod cli;
pub mod client;
pub mod config;
pub mod ftp;
pub mod logging;
pub mod protocol;
pub mod remote;
pub mod sync;
pub mod timing;
pub mod vpath;
