use crate::options::AuthMode;
use crate::{CancelScope, Error, Result, UnitAction, runtime};

use std::fmt;
use std::net::{SocketAddr, TcpStream};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

use async_io::Async;
use zbus::zvariant::OwnedObjectPath;

pub(crate) const SYSTEMD_DESTINATION: &str = "org.freedesktop.systemd1";
pub(crate) const SYSTEMD_MANAGER_PATH: &str = "/org/freedesktop/systemd1";
pub(crate) const SYSTEMD_MANAGER_INTERFACE: &str = "org.freedesktop.systemd1.Manager";

const DBUS_INTROSPECTABLE_INTERFACE: &str = "org.freedesktop.DBus.Introspectable";

const DEFAULT_DBUS_CALL_TIMEOUT: Duration = Duration::from_secs(25);

pub(crate) type ListUnitItem = (
    String,
    String,
    String,
    String,
    String,
    String,
    OwnedObjectPath,
    u32,
    String,
    OwnedObjectPath,
);

/// Where a [`ConnectionFactory`] dials.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum Endpoint {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
            Endpoint::Tcp(addr) => write!(f, "tcp:{addr}"),
        }
    }
}

/// Opens authenticated peer-to-peer D-Bus connections to a systemd manager socket.
///
/// Every call to [`ConnectionFactory::connect`] dials a new connection; nothing is cached. Clones
/// dial the same endpoint and share the cancellation scope.
#[derive(Clone, Debug)]
pub struct ConnectionFactory {
    endpoint: Endpoint,
    auth: AuthMode,
    dbus_call_timeout: Duration,
    scope: CancelScope,
}

impl ConnectionFactory {
    pub(crate) fn new(
        endpoint: Endpoint,
        auth: AuthMode,
        dbus_call_timeout: Duration,
        scope: CancelScope,
    ) -> Self {
        Self {
            endpoint,
            auth,
            dbus_call_timeout,
            scope,
        }
    }

    /// A factory for a manager socket reachable on this host, e.g. `/run/systemd/private`.
    ///
    /// Authenticates as the current user.
    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self::new(
            Endpoint::Unix(path.into()),
            AuthMode::CurrentUser,
            DEFAULT_DBUS_CALL_TIMEOUT,
            CancelScope::new(),
        )
    }

    pub fn with_auth(mut self, auth: AuthMode) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_dbus_call_timeout(mut self, timeout: Duration) -> Self {
        self.dbus_call_timeout = timeout;
        self
    }

    pub fn with_scope(mut self, scope: CancelScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn scope(&self) -> &CancelScope {
        &self.scope
    }

    /// Dial, authenticate and return a fresh [`Bus`].
    ///
    /// Bounded by the D-Bus call timeout; aborted when the scope is cancelled.
    pub async fn connect(&self) -> Result<Bus> {
        if self.scope.is_cancelled() {
            return Err(Error::Cancelled {
                context: format!("connect to {}", self.endpoint),
            });
        }

        let timeout = self.dbus_call_timeout;
        let timed_out = async {
            runtime::sleep(timeout).await;
            Err(Error::Timeout {
                action: "dbus_connect",
                timeout,
            })
        };
        let cancelled = async {
            self.scope.cancelled().await;
            Err(Error::Cancelled {
                context: format!("connect to {}", self.endpoint),
            })
        };

        let conn = futures_lite::future::or(
            self.dial(),
            futures_lite::future::or(cancelled, timed_out),
        )
        .await?;

        #[cfg(feature = "tracing")]
        tracing::debug!(endpoint = %self.endpoint, "dbus connection established");

        Ok(Bus {
            conn,
            dbus_call_timeout: self.dbus_call_timeout,
            scope: self.scope.clone(),
        })
    }

    async fn dial(&self) -> Result<zbus::Connection> {
        match &self.endpoint {
            Endpoint::Unix(path) => {
                let stream = Async::<UnixStream>::connect(path)
                    .await
                    .map_err(|e| Error::IoError {
                        context: format!("connect {}: {e}", path.display()),
                    })?;
                self.build(zbus::connection::Builder::socket(stream)).await
            }
            Endpoint::Tcp(addr) => {
                let stream = Async::<TcpStream>::connect(*addr)
                    .await
                    .map_err(|e| Error::IoError {
                        context: format!("connect {addr}: {e}"),
                    })?;
                self.build(zbus::connection::Builder::socket(stream)).await
            }
        }
    }

    /// Authenticate with `EXTERNAL` as the configured uid, whatever the peer credentials say.
    async fn build(&self, builder: zbus::connection::Builder<'_>) -> Result<zbus::Connection> {
        builder
            .auth_mechanism(zbus::AuthMechanism::External)
            .user_id(self.auth.uid())
            .p2p()
            .method_timeout(self.dbus_call_timeout)
            .build()
            .await
            .map_err(map_zbus_error)
    }
}

/// An authenticated connection to a systemd manager.
#[derive(Clone, Debug)]
pub struct Bus {
    conn: zbus::Connection,
    dbus_call_timeout: Duration,
    scope: CancelScope,
}

impl Bus {
    pub fn scope(&self) -> &CancelScope {
        &self.scope
    }

    pub(crate) async fn manager_proxy(&self) -> Result<zbus::Proxy<'static>> {
        zbus::Proxy::new(
            &self.conn,
            SYSTEMD_DESTINATION,
            SYSTEMD_MANAGER_PATH,
            SYSTEMD_MANAGER_INTERFACE,
        )
        .await
        .map_err(map_zbus_error)
    }

    /// Raw introspection XML of the manager object.
    pub(crate) async fn introspect(&self) -> Result<String> {
        let proxy = zbus::Proxy::new(
            &self.conn,
            SYSTEMD_DESTINATION,
            SYSTEMD_MANAGER_PATH,
            DBUS_INTROSPECTABLE_INTERFACE,
        )
        .await
        .map_err(map_zbus_error)?;
        proxy
            .call("Introspect", &())
            .await
            .map_err(|e| map_zbus_method_error("introspect", self.dbus_call_timeout, e, None))
    }

    /// Ask the manager to deliver job signals to this connection.
    pub(crate) async fn subscribe(&self) -> Result<()> {
        let proxy = self.manager_proxy().await?;
        proxy
            .call::<_, _, ()>("Subscribe", &())
            .await
            .map_err(|e| map_zbus_method_error("subscribe", self.dbus_call_timeout, e, None))
    }

    pub(crate) async fn job_removed_signals(&self) -> Result<zbus::proxy::SignalStream<'static>> {
        let proxy = self.manager_proxy().await?;
        proxy
            .receive_signal("JobRemoved")
            .await
            .map_err(map_zbus_error)
    }

    /// Queue a job for `unit` and return its object path.
    pub(crate) async fn invoke(
        &self,
        action: UnitAction,
        unit: &str,
        mode: &str,
    ) -> Result<OwnedObjectPath> {
        let proxy = self.manager_proxy().await?;
        proxy
            .call(action.dbus_method(), &(unit, mode))
            .await
            .map_err(|e| {
                map_zbus_method_error(action.error_action(), self.dbus_call_timeout, e, Some(unit))
            })
    }

    pub(crate) async fn list_units(&self) -> Result<Vec<ListUnitItem>> {
        let proxy = self.manager_proxy().await?;
        proxy
            .call("ListUnits", &())
            .await
            .map_err(|e| map_zbus_method_error("list_units", self.dbus_call_timeout, e, None))
    }

    pub(crate) async fn list_units_filtered(&self, states: &[&str]) -> Result<Vec<ListUnitItem>> {
        let proxy = self.manager_proxy().await?;
        proxy
            .call("ListUnitsFiltered", &(states))
            .await
            .map_err(|e| {
                map_zbus_method_error("list_units_filtered", self.dbus_call_timeout, e, None)
            })
    }

    pub(crate) async fn list_units_by_patterns(
        &self,
        states: &[&str],
        patterns: &[&str],
    ) -> Result<Vec<ListUnitItem>> {
        let proxy = self.manager_proxy().await?;
        proxy
            .call("ListUnitsByPatterns", &(states, patterns))
            .await
            .map_err(|e| {
                map_zbus_method_error("list_units_by_patterns", self.dbus_call_timeout, e, None)
            })
    }
}

fn map_zbus_method_error(
    action: &'static str,
    timeout: Duration,
    err: zbus::Error,
    unit: Option<&str>,
) -> Error {
    match &err {
        zbus::Error::MethodError(name, detail, _reply) => {
            let name = name.to_string();
            let message = detail.clone().unwrap_or_default();

            if (name.contains("NoSuchUnit") || name.contains("UnknownUnit"))
                && let Some(unit) = unit
            {
                return Error::UnitNotFound {
                    unit: unit.to_string(),
                };
            }

            if name.contains("AccessDenied")
                || name.contains("PermissionDenied")
                || name.contains("PolicyKit")
                || name.contains("InteractiveAuthorizationRequired")
            {
                return Error::PermissionDenied {
                    action,
                    detail: format!("{name}: {message}"),
                };
            }

            Error::DbusError { name, message }
        }
        zbus::Error::InputOutput(e) if e.kind() == std::io::ErrorKind::TimedOut => {
            Error::Timeout { action, timeout }
        }
        _ => map_zbus_error(err),
    }
}

fn map_zbus_error(err: zbus::Error) -> Error {
    match err {
        zbus::Error::MethodError(name, detail, _reply) => Error::DbusError {
            name: name.to_string(),
            message: detail.unwrap_or_default(),
        },
        zbus::Error::InputOutput(e) => Error::IoError {
            context: format!("dbus io error: {e}"),
        },
        zbus::Error::Handshake(detail) => Error::AuthFailed { detail },
        other => Error::IoError {
            context: format!("dbus error: {other}"),
        },
    }
}
