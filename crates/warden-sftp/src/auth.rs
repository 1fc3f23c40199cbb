//! Authentication and Authorization Module
//!
//! NIST 800-53: AC-2 (Account Management), IA-2 (Identification and Authentication)
//! Implementation: Decides which auth methods are offered, which channel kinds
//! are admitted, and whether a presented public key belongs to the customer.

use crate::registry::{CustomerRecord, CustomerRegistry};
use crate::{Error, Result};
use async_trait::async_trait;
use russh::keys::ssh_key::PublicKey;
use russh::{MethodKind, MethodSet};
use std::path::Path;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

/// Kind of channel a peer asks to open
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelKind {
    /// `session`
    Session,
    /// `direct-tcpip` (local port forwarding)
    DirectTcpip,
    /// `forwarded-tcpip` (remote port forwarding)
    ForwardedTcpip,
    /// `x11`
    X11,
    /// Any other type name
    Other(String),
}

impl ChannelKind {
    /// Map an RFC 4254 channel type name
    pub fn from_name(name: &str) -> Self {
        match name {
            "session" => Self::Session,
            "direct-tcpip" => Self::DirectTcpip,
            "forwarded-tcpip" => Self::ForwardedTcpip,
            "x11" => Self::X11,
            other => Self::Other(other.to_string()),
        }
    }
}

/// Answer to a channel open request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelDecision {
    /// Open the channel
    Accept,
    /// Refused with SSH_OPEN_ADMINISTRATIVELY_PROHIBITED
    AdministrativelyProhibited,
}

/// Result of public key verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Key matched; the record is bound to the session
    Success(Arc<CustomerRecord>),
    /// Rejected; the reason is only logged
    Failure,
}

impl AuthOutcome {
    /// `true` for [`AuthOutcome::Success`]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

/// Authentication policy consulted by the session supervisor
#[async_trait]
pub trait AuthenticationPolicy: Send + Sync {
    /// Methods advertised to the peer for `username`
    fn offered_auth_methods(&self, username: &str) -> MethodSet;

    /// Whether a channel of `kind` may be opened
    fn check_channel_request(&self, kind: &ChannelKind) -> ChannelDecision;

    /// Verify that `presented` is the registered key of `username`.
    ///
    /// Must fail closed: every problem is reported as [`AuthOutcome::Failure`].
    async fn verify_public_key(&self, username: &str, presented: &PublicKey) -> AuthOutcome;
}

/// Gate that checks presented keys against each customer's key file
///
/// NIST 800-53: IA-2, AC-3 (Access Enforcement)
/// Implementation: Key files are re-read on every attempt, so a key rotated on
/// disk takes effect on the next login without a restart.
pub struct KeyFileGate {
    registry: Arc<CustomerRegistry>,
}

impl KeyFileGate {
    /// Gate checking keys of the customers in `registry`
    pub const fn new(registry: Arc<CustomerRegistry>) -> Self {
        Self { registry }
    }

    /// Customers this gate admits
    pub fn registry(&self) -> &CustomerRegistry {
        &self.registry
    }

    async fn check(&self, username: &str, presented: &PublicKey) -> Result<Arc<CustomerRecord>> {
        let customer = self.registry.lookup(username)?;
        let expected = read_authorized_key(&customer.authorized_key_file).await?;

        if keys_match(&expected, presented) {
            Ok(customer)
        } else {
            Err(Error::Authentication(format!("key mismatch for {username}")))
        }
    }
}

#[async_trait]
impl AuthenticationPolicy for KeyFileGate {
    fn offered_auth_methods(&self, _username: &str) -> MethodSet {
        MethodSet::from(&[MethodKind::PublicKey][..])
    }

    fn check_channel_request(&self, kind: &ChannelKind) -> ChannelDecision {
        if *kind == ChannelKind::Session {
            ChannelDecision::Accept
        } else {
            debug!(?kind, "Refusing non-session channel");
            ChannelDecision::AdministrativelyProhibited
        }
    }

    async fn verify_public_key(&self, username: &str, presented: &PublicKey) -> AuthOutcome {
        match self.check(username, presented).await {
            Ok(customer) => {
                info!(
                    event = "auth_success",
                    user = %username,
                    home = ?customer.home_directory,
                    "Public key authentication succeeded"
                );
                AuthOutcome::Success(customer)
            }
            Err(e) => {
                // The reason stays in the server log; the peer sees a plain rejection.
                warn!(event = "auth_failure", user = %username, "Public key authentication failed");
                debug!(user = %username, reason = %e, "Authentication failure detail");
                AuthOutcome::Failure
            }
        }
    }
}

/// Read the key on the first line of an authorized key file.
///
/// The line has the `<key-type> <base64-key-material> [comment]` layout; the
/// second field is decoded. Later lines are ignored.
pub async fn read_authorized_key(path: &Path) -> Result<PublicKey> {
    let file = File::open(path).await?;
    let first_line = BufReader::new(file)
        .lines()
        .next_line()
        .await?
        .ok_or_else(|| Error::Authentication("empty authorized key file".into()))?;

    parse_key_line(&first_line)
}

/// Parse one `<key-type> <base64-key-material> [comment]` line
pub fn parse_key_line(line: &str) -> Result<PublicKey> {
    let material = line.split_whitespace().nth(1).ok_or_else(|| {
        Error::Authentication("invalid key format: expected <type> <key>".into())
    })?;

    Ok(russh::keys::parse_public_key_base64(material)?)
}

/// Algorithm and key material must both match; comments are ignored.
pub fn keys_match(expected: &PublicKey, presented: &PublicKey) -> bool {
    expected.key_data() == presented.key_data()
}
