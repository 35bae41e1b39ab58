//! SSH-forwarded path to a remote manager socket.
//!
//! A [`Tunnel`] owns an `ssh -N -L <local>:<remote socket>` child process and the local end of the
//! forward. The local end is either `dbus.sock` inside a fresh private temporary directory (the
//! default) or a loopback TCP port. New authenticated connections through the tunnel are made with
//! the [`ConnectionFactory`] returned by [`Tunnel::connection_factory`].
//!
//! The tunnel is released exactly once: by [`Tunnel::close`], or by `Drop` as a fallback that
//! SIGKILLs the forwarder's process group without waiting.

mod forwarder;
mod rendezvous;

use crate::backoff::Backoff;
use crate::bus::{ConnectionFactory, Endpoint};
use crate::options::TunnelConfig;
use crate::{CancelScope, Error, Result, runtime};

use self::forwarder::Forwarder;
use self::rendezvous::Rendezvous;

use futures_util::FutureExt;

use std::path::Path;

/// An open SSH forward to a remote systemd manager socket.
#[derive(Debug)]
pub struct Tunnel {
    config: TunnelConfig,
    scope: CancelScope,
    endpoint: Endpoint,
    rendezvous: Option<Rendezvous>,
    forwarder: Option<Forwarder>,
    closed: bool,
}

enum ReadyWait {
    Ready(Result<()>),
    Exited(Error),
    TimedOut,
    Cancelled,
}

impl Tunnel {
    /// Spawn the forwarder and wait until the local end accepts connections.
    ///
    /// The tunnel runs in a child scope of `scope`. On any error everything acquired so far is
    /// released before returning.
    pub async fn open(scope: &CancelScope, config: TunnelConfig) -> Result<Self> {
        config.validate()?;

        let rendezvous = Rendezvous::create(config.rendezvous)?;
        let mut tunnel = Tunnel {
            scope: scope.child(),
            endpoint: rendezvous.endpoint(),
            rendezvous: Some(rendezvous),
            forwarder: None,
            closed: false,
            config,
        };

        #[cfg(feature = "tracing")]
        tracing::info!(
            host = %tunnel.config.remote_host,
            port = tunnel.config.remote_port,
            user = %tunnel.config.remote_user,
            local = %tunnel.endpoint,
            "opening ssh tunnel"
        );

        match tunnel.start_forwarder().await {
            Ok(forwarder) => {
                #[cfg(feature = "tracing")]
                tracing::info!(pid = forwarder.pid(), local = %tunnel.endpoint, "ssh tunnel ready");

                tunnel.forwarder = Some(forwarder);
                Ok(tunnel)
            }
            Err(err) => {
                if let Err(_cleanup) = tunnel.shutdown().await {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(error = %_cleanup, "cleanup after failed tunnel open");
                }
                Err(err)
            }
        }
    }

    async fn start_forwarder(&self) -> Result<Forwarder> {
        let Some(rendezvous) = self.rendezvous.as_ref() else {
            return Err(Error::tunnel("tunnel is closed"));
        };
        let local = rendezvous.forward_spec();
        let timeout = self.config.ready_timeout;

        let max_attempts = self.config.backoff.as_ref().map_or(1, |p| p.max_attempts);
        let mut backoff = self
            .config
            .backoff
            .as_ref()
            .map(|p| Backoff::new(p.min_delay, p.max_delay, &self.config.remote_host));

        let mut attempt = 1;
        loop {
            let mut forwarder = Forwarder::spawn(&self.config, &local)?;

            let outcome = {
                let ready = rendezvous.wait_ready().fuse();
                let exited = forwarder.exited().fuse();
                let cancelled = self.scope.cancelled().fuse();
                let mut deadline = runtime::sleep(timeout).fuse();
                futures_util::pin_mut!(ready, exited, cancelled);
                futures_util::select! {
                    r = ready => ReadyWait::Ready(r),
                    e = exited => ReadyWait::Exited(e),
                    _ = deadline => ReadyWait::TimedOut,
                    _ = cancelled => ReadyWait::Cancelled,
                }
            };

            let err = match outcome {
                ReadyWait::Ready(Ok(())) => return Ok(forwarder),
                ReadyWait::Ready(Err(e)) => e,
                ReadyWait::TimedOut => Error::Timeout {
                    action: "tunnel_ready",
                    timeout,
                },
                ReadyWait::Cancelled => Error::Cancelled {
                    context: format!("opening tunnel to {}", self.config.remote_host),
                },
                ReadyWait::Exited(e) => {
                    let Some(backoff) = backoff.as_mut().filter(|_| attempt < max_attempts)
                    else {
                        return Err(e);
                    };
                    let delay = backoff.next_delay();

                    #[cfg(feature = "tracing")]
                    tracing::warn!(
                        attempt,
                        max_attempts,
                        ?delay,
                        error = %e,
                        "ssh exited before the tunnel was ready; retrying"
                    );

                    let cancelled = futures_lite::future::or(
                        async {
                            self.scope.cancelled().await;
                            true
                        },
                        async {
                            runtime::sleep(delay).await;
                            false
                        },
                    )
                    .await;
                    if cancelled {
                        return Err(Error::Cancelled {
                            context: format!("opening tunnel to {}", self.config.remote_host),
                        });
                    }
                    attempt += 1;
                    continue;
                }
            };

            if let Err(_cleanup) = forwarder.terminate().await {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %_cleanup, "terminate ssh after failed readiness wait");
            }
            return Err(err);
        }
    }

    /// A factory for new authenticated connections through this tunnel.
    pub fn connection_factory(&self) -> ConnectionFactory {
        ConnectionFactory::new(
            self.endpoint.clone(),
            self.config.auth,
            self.config.dbus_call_timeout,
            self.scope.clone(),
        )
    }

    pub fn scope(&self) -> &CancelScope {
        &self.scope
    }

    /// Path of the local socket, for the unix rendezvous.
    pub fn local_socket(&self) -> Option<&Path> {
        self.rendezvous.as_ref().and_then(Rendezvous::socket_path)
    }

    /// Pid of the `ssh` process; also its process group id.
    pub fn forwarder_pid(&self) -> Option<u32> {
        self.forwarder.as_ref().map(Forwarder::pid)
    }

    /// Resolves when the forwarder exits, with the fatal error for the run.
    ///
    /// Cancels the tunnel scope before returning, so in-flight waits on connections from this
    /// tunnel stop as well. Never resolves while the forwarder is alive.
    pub async fn watch(&mut self) -> Error {
        let Some(forwarder) = self.forwarder.as_mut() else {
            return Error::tunnel("tunnel is closed");
        };
        let exit = forwarder.exited().await;
        self.scope.cancel();

        #[cfg(feature = "tracing")]
        tracing::error!(error = %exit, "ssh forwarder died");

        Error::tunnel(format!("ssh forwarder exited: {exit}"))
    }

    /// Terminate the forwarder, cancel the scope and remove the temporary directory.
    ///
    /// Every step runs even if an earlier one fails; all failures are returned together as
    /// [`Error::Cleanup`].
    pub async fn close(mut self) -> Result<()> {
        self.shutdown().await
    }

    async fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut errors = Vec::new();
        if let Some(mut forwarder) = self.forwarder.take()
            && let Err(e) = forwarder.terminate().await
        {
            errors.push(e);
        }
        self.scope.cancel();
        if let Some(rendezvous) = self.rendezvous.take()
            && let Err(e) = rendezvous.release()
        {
            errors.push(e);
        }

        #[cfg(feature = "tracing")]
        tracing::info!(
            host = %self.config.remote_host,
            errors = errors.len(),
            "ssh tunnel closed"
        );

        if errors.is_empty() {
            return Ok(());
        }
        Err(Error::Cleanup { errors })
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        #[cfg(feature = "tracing")]
        tracing::warn!(host = %self.config.remote_host, "tunnel dropped without close");

        self.scope.cancel();
        // Forwarder and rendezvous release themselves on drop.
        drop(self.forwarder.take());
        drop(self.rendezvous.take());
    }
}
