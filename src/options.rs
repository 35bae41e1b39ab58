use crate::{Error, Result, util};

use std::time::Duration;

/// Default path of systemd's private manager socket.
pub const DEFAULT_REMOTE_SOCKET: &str = "/var/run/systemd/private";

/// How the forwarded socket is exposed locally.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum RendezvousKind {
    /// A socket file inside a private temporary directory.
    #[default]
    Unix,
    /// An ephemeral TCP port on `127.0.0.1`.
    Tcp,
}

/// SASL identity presented to the remote manager.
///
/// Usernames are never resolved; only numeric uids are sent.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum AuthMode {
    /// `EXTERNAL` with a fixed uid. The remote side compares it against the uid of the process
    /// holding its end of the socket (sshd), so `0` is what works for `root` logins.
    External { uid: u32 },
    /// `EXTERNAL` with the effective uid of this process.
    CurrentUser,
}

impl Default for AuthMode {
    fn default() -> Self {
        AuthMode::External { uid: 0 }
    }
}

impl AuthMode {
    pub(crate) fn uid(&self) -> u32 {
        match self {
            AuthMode::External { uid } => *uid,
            AuthMode::CurrentUser => nix::unistd::geteuid().as_raw(),
        }
    }
}

/// Respawn policy for an `ssh` process that exits before the tunnel becomes ready.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub struct BackoffPolicy {
    pub min_delay: Duration,
    pub max_delay: Duration,
    /// Total number of spawn attempts, including the first one.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            max_attempts: 3,
        }
    }
}

impl BackoffPolicy {
    pub fn new(min_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            min_delay,
            max_delay,
            max_attempts,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.min_delay.is_zero() {
            return Err(Error::invalid_input("backoff min delay must be > 0"));
        }
        if self.min_delay > self.max_delay {
            return Err(Error::invalid_input(format!(
                "backoff min delay {:?} exceeds max delay {:?}",
                self.min_delay, self.max_delay
            )));
        }
        if self.max_attempts == 0 {
            return Err(Error::invalid_input("backoff max attempts must be > 0"));
        }
        Ok(())
    }
}

/// Everything needed to reach the remote manager socket over SSH.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct TunnelConfig {
    pub remote_host: String,
    /// Default: `root`.
    pub remote_user: String,
    /// Default: `22`.
    pub remote_port: u16,
    /// Default: `/var/run/systemd/private`.
    pub remote_socket_path: String,
    pub auth: AuthMode,
    /// Number of `-v` flags passed to `ssh`.
    pub verbosity: u8,
    pub backoff: Option<BackoffPolicy>,
    pub rendezvous: RendezvousKind,
    /// Upper bound for the local end to become connectable. Default: 30s.
    pub ready_timeout: Duration,
    /// D-Bus method call timeout on connections made through the tunnel.
    pub dbus_call_timeout: Duration,
    /// Default: `ssh` (looked up in `PATH`).
    pub ssh_program: String,
    /// Extra `-o` options, e.g. `StrictHostKeyChecking=accept-new`.
    pub ssh_options: Vec<String>,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            remote_host: String::new(),
            remote_user: "root".to_string(),
            remote_port: 22,
            remote_socket_path: DEFAULT_REMOTE_SOCKET.to_string(),
            auth: AuthMode::default(),
            verbosity: 0,
            backoff: None,
            rendezvous: RendezvousKind::default(),
            ready_timeout: Duration::from_secs(30),
            dbus_call_timeout: Duration::from_secs(25),
            ssh_program: "ssh".to_string(),
            ssh_options: Vec::new(),
        }
    }
}

impl TunnelConfig {
    pub fn new(remote_host: impl Into<String>) -> Self {
        Self {
            remote_host: remote_host.into(),
            ..Self::default()
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        util::validate_no_control("ssh host", &self.remote_host)?;
        util::validate_no_control("ssh user", &self.remote_user)?;
        util::validate_no_control("remote socket path", &self.remote_socket_path)?;
        if self.remote_host.trim().is_empty() {
            return Err(Error::invalid_input("ssh host must not be empty"));
        }
        if self.remote_host.starts_with('-') || self.remote_user.starts_with('-') {
            return Err(Error::invalid_input(
                "ssh host and user must not start with '-'",
            ));
        }
        if self.remote_user.trim().is_empty() {
            return Err(Error::invalid_input("ssh user must not be empty"));
        }
        if self.remote_port == 0 {
            return Err(Error::invalid_input("ssh port must be > 0"));
        }
        if !self.remote_socket_path.starts_with('/') {
            return Err(Error::invalid_input(
                "remote socket path must be absolute",
            ));
        }
        if self.ready_timeout.is_zero() {
            return Err(Error::invalid_input("ready timeout must be > 0"));
        }
        for opt in &self.ssh_options {
            util::validate_no_control("ssh option", opt)?;
        }
        if let Some(backoff) = &self.backoff {
            backoff.validate()?;
        }
        Ok(())
    }
}
