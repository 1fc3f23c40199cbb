//! # Warden SFTP
//!
//! Public-key only SFTP server that confines every customer to their own
//! home directory.
//!
//! Built on:
//! - RFC 4251-4254: SSH protocol (transport provided by `russh`)
//! - draft-ietf-secsh-filexfer-02: SSH File Transfer Protocol, version 3
//!
//! ## Features
//!
//! - Fixed customer registry loaded from TOML
//! - Authentication against the first line of each customer's key file
//! - Chroot-style sandbox enforced in the server, not by the OS
//! - List, stat, open, read and write inside the sandbox
//! - Configurable policy for remove/rename/mkdir/rmdir/setstat/symlink
//!   (inert by default: reported as successful, nothing changes)

pub mod auth;
pub mod config;
pub mod error;
pub mod filesystem;
pub mod protocol;
pub mod registry;
pub mod sandbox;
pub mod server;
pub mod sftp;

pub use auth::{AuthOutcome, AuthenticationPolicy, ChannelDecision, ChannelKind, KeyFileGate};
pub use config::{Config, CustomerConfig, LogFormat, LoggingConfig, MutationPolicy};
pub use error::{Error, Result};
pub use filesystem::{FileAccessHandler, OpenFileHandle, SandboxFs};
pub use registry::{CustomerRecord, CustomerRegistry};
pub use server::Server;
pub use sftp::SftpSession;
