use crate::backoff::Backoff;
use crate::bus::Endpoint;
use crate::options::RendezvousKind;
use crate::{Error, Result, runtime};

use async_io::Async;
use futures_util::StreamExt;
use notify::{RecursiveMode, Watcher};

use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

const SOCKET_NAME: &str = "dbus.sock";
const PROBE_MIN: Duration = Duration::from_millis(20);
const PROBE_MAX: Duration = Duration::from_millis(500);

/// The local end of the forward.
#[derive(Debug)]
pub(crate) enum Rendezvous {
    /// `dbus.sock` inside a private (0700) temporary directory.
    Unix {
        dir: tempfile::TempDir,
        socket: PathBuf,
    },
    /// A loopback port that was free when the rendezvous was created.
    Tcp { addr: SocketAddr },
}

impl Rendezvous {
    pub(crate) fn create(kind: RendezvousKind) -> Result<Self> {
        match kind {
            RendezvousKind::Unix => {
                let dir = tempfile::Builder::new()
                    .prefix("unitrelay-")
                    .permissions(std::fs::Permissions::from_mode(0o700))
                    .tempdir()
                    .map_err(|e| Error::IoError {
                        context: format!("create rendezvous directory: {e}"),
                    })?;
                let socket = dir.path().join(SOCKET_NAME);
                Ok(Rendezvous::Unix { dir, socket })
            }
            RendezvousKind::Tcp => {
                // ssh binds the port itself; only reserve a free one here.
                let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).map_err(|e| {
                    Error::IoError {
                        context: format!("reserve loopback port: {e}"),
                    }
                })?;
                let addr = listener.local_addr().map_err(|e| Error::IoError {
                    context: format!("reserve loopback port: {e}"),
                })?;
                Ok(Rendezvous::Tcp { addr })
            }
        }
    }

    /// The local half of ssh's `-L local:remote` argument.
    pub(crate) fn forward_spec(&self) -> String {
        match self {
            Rendezvous::Unix { socket, .. } => socket.display().to_string(),
            Rendezvous::Tcp { addr } => addr.to_string(),
        }
    }

    pub(crate) fn endpoint(&self) -> Endpoint {
        match self {
            Rendezvous::Unix { socket, .. } => Endpoint::Unix(socket.clone()),
            Rendezvous::Tcp { addr } => Endpoint::Tcp(*addr),
        }
    }

    pub(crate) fn socket_path(&self) -> Option<&Path> {
        match self {
            Rendezvous::Unix { socket, .. } => Some(socket),
            Rendezvous::Tcp { .. } => None,
        }
    }

    /// Resolves once the forwarder is listening on the local end. Unbounded; callers race it
    /// against a deadline.
    pub(crate) async fn wait_ready(&self) -> Result<()> {
        match self {
            Rendezvous::Unix { dir, socket } => wait_for_socket(dir.path(), socket).await,
            Rendezvous::Tcp { addr } => {
                wait_for_port(*addr).await;
                Ok(())
            }
        }
    }

    /// Remove the temporary directory, if any.
    pub(crate) fn release(self) -> Result<()> {
        match self {
            Rendezvous::Unix { dir, .. } => {
                let path = dir.path().to_path_buf();
                dir.close().map_err(|e| Error::IoError {
                    context: format!("remove {}: {e}", path.display()),
                })
            }
            Rendezvous::Tcp { .. } => Ok(()),
        }
    }
}

async fn wait_for_socket(dir: &Path, socket: &Path) -> Result<()> {
    let (tx, mut rx) = futures_channel::mpsc::unbounded();
    let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
        let _ = tx.unbounded_send(event.map(|_| ()));
    })
    .map_err(|e| Error::IoError {
        context: format!("watch {}: {e}", dir.display()),
    })?;
    watcher
        .watch(dir, RecursiveMode::NonRecursive)
        .map_err(|e| Error::IoError {
            context: format!("watch {}: {e}", dir.display()),
        })?;

    // The socket may have appeared before the watch was installed.
    if socket.exists() {
        return Ok(());
    }

    while let Some(event) = rx.next().await {
        if let Err(e) = event {
            return Err(Error::IoError {
                context: format!("watch {}: {e}", dir.display()),
            });
        }
        if socket.exists() {
            return Ok(());
        }
    }

    Err(Error::IoError {
        context: format!("watcher for {} stopped", dir.display()),
    })
}

async fn wait_for_port(addr: SocketAddr) {
    let mut backoff = Backoff::new(PROBE_MIN, PROBE_MAX, &addr.to_string());
    loop {
        if Async::<TcpStream>::connect(addr).await.is_ok() {
            return;
        }
        runtime::sleep(backoff.next_delay()).await;
    }
}
