//! SFTP Server Implementation
//!
//! Connection acceptor and per-connection session supervisor. The acceptor
//! owns the listening socket and spawns one task per connection; each task
//! runs an SSH session (RFC 4251-4254) whose authentication is delegated to
//! an [`AuthenticationPolicy`] and whose `sftp` subsystem is served by an
//! [`SftpSession`] over a [`SandboxFs`].

use crate::auth::{AuthOutcome, AuthenticationPolicy, ChannelDecision, ChannelKind, KeyFileGate};
use crate::config::MutationPolicy;
use crate::filesystem::SandboxFs;
use crate::registry::{CustomerRecord, CustomerRegistry};
use crate::sftp::SftpSession;
use crate::{Config, Error, Result};
use russh::keys::ssh_key::PublicKey;
use russh::keys::PrivateKey;
use russh::server::{Auth, Msg, Session};
use russh::{Channel, ChannelId, MethodKind, MethodSet};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// Name of the only subsystem served
pub const SFTP_SUBSYSTEM: &str = "sftp";

/// SFTP Server
pub struct Server {
    config: Arc<Config>,
    gate: Arc<dyn AuthenticationPolicy>,
    ssh_config: Arc<russh::server::Config>,
}

impl Server {
    /// Create a server from configuration: validates it, builds the customer
    /// registry and loads the host key once.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an invalid configuration or host key.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let host_key = load_host_key(&config.host_key_path)?;
        let registry = Arc::new(CustomerRegistry::from_config(&config));

        info!(
            event = "customers_loaded",
            count = registry.len(),
            users = ?registry.usernames(),
            "Customer registry ready"
        );

        Ok(Self::with_parts(
            config,
            Arc::new(KeyFileGate::new(registry)),
            host_key,
        ))
    }

    /// Assemble a server from an already built policy and host key
    pub fn with_parts(
        config: Config,
        gate: Arc<dyn AuthenticationPolicy>,
        host_key: PrivateKey,
    ) -> Self {
        let ssh_config = russh::server::Config {
            inactivity_timeout: Some(Duration::from_secs(config.timeout_secs)),
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            methods: MethodSet::from(&[MethodKind::PublicKey][..]),
            keys: vec![host_key],
            ..Default::default()
        };

        Self {
            config: Arc::new(config),
            gate,
            ssh_config: Arc::new(ssh_config),
        }
    }

    /// Bind the configured address and serve forever.
    ///
    /// # Errors
    ///
    /// A bind failure is returned immediately as [`Error::Connection`] so the
    /// process can refuse to start.
    pub async fn run(self) -> Result<()> {
        let addr = self.config.listen_address();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::Connection(format!("Failed to bind {addr}: {e}")))?;

        info!(event = "listening", address = %addr, "SFTP server listening");
        self.serve(listener).await
    }

    /// Accept loop on an existing listener
    ///
    /// NIST 800-53: SC-5 (Denial of Service Protection)
    /// Implementation: Each connection runs in its own task; a failing
    /// connection or a failed accept never stops the loop.
    ///
    /// # Errors
    ///
    /// Never returns under normal operation; the `Result` matches [`run`](Self::run).
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(event = "accept_failed", error = %e, "Failed to accept connection");
                    continue;
                }
            };

            debug!(peer = %peer, "Accepted connection");
            let handler = SessionHandler::new(self.gate.clone(), self.config.mutations, Some(peer));
            tokio::spawn(supervise(self.ssh_config.clone(), stream, handler, peer));
        }
    }
}

/// Run one SSH session to completion, containing every error it raises
async fn supervise(
    ssh_config: Arc<russh::server::Config>,
    stream: TcpStream,
    handler: SessionHandler,
    peer: SocketAddr,
) {
    info!(event = "connection_open", peer = %peer, "Connection opened");

    let outcome = match russh::server::run_stream(ssh_config, stream, handler).await {
        Ok(session) => session.await,
        Err(e) => Err(e),
    };

    match outcome {
        Ok(()) => info!(event = "connection_closed", peer = %peer, "Connection closed"),
        Err(e) => error!(
            event = "session_error",
            peer = %peer,
            error = %e,
            "Session ended with error"
        ),
    }
}

/// Per-connection handler plugged into russh
///
/// NIST 800-53: IA-2 (Identification and Authentication), AC-3 (Access Enforcement)
/// Implementation: Binds the authenticated customer and serves only the
/// `sftp` subsystem on session channels.
pub struct SessionHandler {
    gate: Arc<dyn AuthenticationPolicy>,
    mutations: MutationPolicy,
    peer: Option<SocketAddr>,
    customer: Option<Arc<CustomerRecord>>,
    channels: HashMap<ChannelId, Channel<Msg>>,
}

impl SessionHandler {
    /// Handler for one connection from `peer`, not yet authenticated
    pub fn new(
        gate: Arc<dyn AuthenticationPolicy>,
        mutations: MutationPolicy,
        peer: Option<SocketAddr>,
    ) -> Self {
        Self {
            gate,
            mutations,
            peer,
            customer: None,
            channels: HashMap::new(),
        }
    }

    /// Customer bound by a successful authentication
    pub fn customer(&self) -> Option<&CustomerRecord> {
        self.customer.as_deref()
    }

    /// Customer to serve subsystem `name` for; only `sftp`, only after
    /// authentication.
    fn sftp_customer(&self, name: &str) -> Option<Arc<CustomerRecord>> {
        match (&self.customer, name) {
            (Some(customer), SFTP_SUBSYSTEM) => Some(customer.clone()),
            _ => None,
        }
    }

    fn reject(&self, username: &str) -> Auth {
        Auth::Reject {
            proceed_with_methods: Some(self.gate.offered_auth_methods(username)),
            partial_success: false,
        }
    }

    fn peer_label(&self) -> String {
        self.peer.map_or_else(|| "unknown".to_string(), |p| p.to_string())
    }
}

impl russh::server::Handler for SessionHandler {
    type Error = Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth> {
        Ok(self.reject(user))
    }

    async fn auth_password(&mut self, user: &str, _password: &str) -> Result<Auth> {
        warn!(event = "password_auth_rejected", peer = %self.peer_label(), user = %user, "Password authentication is not offered");
        Ok(self.reject(user))
    }

    async fn auth_publickey(&mut self, user: &str, public_key: &PublicKey) -> Result<Auth> {
        match self.gate.verify_public_key(user, public_key).await {
            AuthOutcome::Success(customer) => {
                self.customer = Some(customer);
                Ok(Auth::Accept)
            }
            AuthOutcome::Failure => {
                warn!(event = "auth_rejected", peer = %self.peer_label(), user = %user, "Rejecting public key");
                Ok(self.reject(user))
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool> {
        if self.gate.check_channel_request(&ChannelKind::Session) != ChannelDecision::Accept {
            return Ok(false);
        }

        debug!(peer = %self.peer_label(), channel = ?channel.id(), "Session channel opened");
        self.channels.insert(channel.id(), channel);
        Ok(true)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        _channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool> {
        let decision = self.gate.check_channel_request(&ChannelKind::DirectTcpip);
        warn!(
            event = "channel_rejected",
            peer = %self.peer_label(),
            target = %format!("{host_to_connect}:{port_to_connect}"),
            "Refusing port forwarding"
        );
        Ok(decision == ChannelDecision::Accept)
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<()> {
        let Some(customer) = self.sftp_customer(name) else {
            warn!(event = "subsystem_rejected", peer = %self.peer_label(), subsystem = %name, "Unsupported subsystem");
            session.channel_failure(channel_id)?;
            return Ok(());
        };

        let Some(channel) = self.channels.remove(&channel_id) else {
            session.channel_failure(channel_id)?;
            return Ok(());
        };

        session.channel_success(channel_id)?;

        info!(
            event = "sftp_subsystem_start",
            peer = %self.peer_label(),
            user = %customer.username,
            "Starting SFTP subsystem"
        );

        let user = customer.username.clone();
        let sftp = SftpSession::new(SandboxFs::new(customer, self.mutations), user.clone());
        tokio::spawn(async move {
            if let Err(e) = sftp.run(channel.into_stream()).await {
                warn!(event = "sftp_session_error", user = %user, error = %e, "SFTP session failed");
            }
        });

        Ok(())
    }

    async fn shell_request(&mut self, channel: ChannelId, session: &mut Session) -> Result<()> {
        session.channel_failure(channel)?;
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        _data: &[u8],
        session: &mut Session,
    ) -> Result<()> {
        session.channel_failure(channel)?;
        Ok(())
    }

    async fn channel_close(&mut self, channel: ChannelId, _session: &mut Session) -> Result<()> {
        self.channels.remove(&channel);
        Ok(())
    }
}

/// Load the server's host key
///
/// NIST 800-53: IA-3 (Device Identification and Authentication)
///
/// # Errors
///
/// Returns [`Error::Config`] if the file is missing, unreadable or not a
/// private key russh understands.
pub fn load_host_key(path: &Path) -> Result<PrivateKey> {
    russh::keys::load_secret_key(path, None)
        .map_err(|e| Error::Config(format!("Failed to load host key {}: {e}", path.display())))
}
