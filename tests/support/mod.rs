//! Test doubles: an in-process systemd manager served over a private unix socket, and a fake
//! `ssh` that "forwards" by symlinking the local end to the remote socket path, or by reporting a
//! loopback port that `relay_tcp_forward` serves.

#![allow(dead_code)]
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

use std::collections::BTreeSet;
use std::io::Write;
use std::net::{Ipv4Addr, TcpListener};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use unitrelay::ConnectionFactory;
use zbus::object_server::SignalEmitter;
use zbus::zvariant::OwnedObjectPath;

pub const MANAGER_PATH: &str = "/org/freedesktop/systemd1";

pub type Row = (
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

#[derive(Debug, zbus::DBusError)]
#[zbus(prefix = "org.freedesktop.systemd1")]
enum ManagerError {
    #[zbus(error)]
    ZBus(zbus::Error),
    NoSuchUnit(String),
}

/// What the fake host knows and what it was asked.
pub struct State {
    // (name, load, active, sub)
    units: Vec<(&'static str, &'static str, &'static str, &'static str)>,
    failing: BTreeSet<&'static str>,
    // Jobs for these units are queued but never finish.
    stuck: BTreeSet<&'static str>,
    next_job: AtomicU32,
    calls: Mutex<Vec<String>>,
}

impl State {
    pub fn new(units: &[(&'static str, &'static str, &'static str, &'static str)]) -> Self {
        Self {
            units: units.to_vec(),
            failing: BTreeSet::new(),
            stuck: BTreeSet::new(),
            next_job: AtomicU32::new(100),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(mut self, unit: &'static str) -> Self {
        self.failing.insert(unit);
        self
    }

    pub fn stuck(mut self, unit: &'static str) -> Self {
        self.stuck.insert(unit);
        self
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn rows(&self, keep: impl Fn(&str, &str, &str, &str) -> bool) -> Vec<Row> {
        let root = OwnedObjectPath::try_from("/").unwrap();
        self.units
            .iter()
            .filter(|(name, load, active, sub)| keep(name, load, active, sub))
            .map(|(name, load, active, sub)| {
                (
                    name.to_string(),
                    String::new(),
                    load.to_string(),
                    active.to_string(),
                    sub.to_string(),
                    String::new(),
                    OwnedObjectPath::try_from(format!("{MANAGER_PATH}/unit/x")).unwrap(),
                    0,
                    String::new(),
                    root.clone(),
                )
            })
            .collect()
    }

    async fn queue(
        &self,
        method: &str,
        name: &str,
        mode: &str,
        emitter: &SignalEmitter<'_>,
    ) -> Result<OwnedObjectPath, ManagerError> {
        self.record(format!("{method} {name} {mode}"));
        if !self.units.iter().any(|(n, ..)| *n == name) {
            return Err(ManagerError::NoSuchUnit(format!("Unit {name} not loaded.")));
        }

        let id = self.next_job.fetch_add(1, Ordering::SeqCst);
        let job = OwnedObjectPath::try_from(format!("{MANAGER_PATH}/job/{id}")).unwrap();
        if !self.stuck.contains(name) {
            let result = if self.failing.contains(name) {
                "failed"
            } else {
                "done"
            };
            emit_job_removed(emitter, id, &job, name, result).await?;
        }
        Ok(job)
    }
}

async fn emit_job_removed(
    emitter: &SignalEmitter<'_>,
    id: u32,
    job: &OwnedObjectPath,
    unit: &str,
    result: &str,
) -> zbus::Result<()> {
    emitter
        .emit(
            "org.freedesktop.systemd1.Manager",
            "JobRemoved",
            &(id, job, unit, result),
        )
        .await
}

fn glob_match(patterns: &[String], name: &str) -> bool {
    patterns
        .iter()
        .any(|p| glob::Pattern::new(p).is_ok_and(|p| p.matches(name)))
}

/// Current manager: every listing method.
pub struct Manager(pub Arc<State>);

#[zbus::interface(name = "org.freedesktop.systemd1.Manager")]
impl Manager {
    async fn subscribe(&self) {
        self.0.record("Subscribe");
    }

    async fn list_units(&self) -> Vec<Row> {
        self.0.record("ListUnits");
        self.0.rows(|_, _, _, _| true)
    }

    async fn list_units_filtered(&self, states: Vec<String>) -> Vec<Row> {
        self.0.record("ListUnitsFiltered");
        self.0.rows(|_, load, active, sub| {
            states.is_empty() || states.iter().any(|s| s == load || s == active || s == sub)
        })
    }

    async fn list_units_by_patterns(
        &self,
        states: Vec<String>,
        patterns: Vec<String>,
    ) -> Vec<Row> {
        self.0.record("ListUnitsByPatterns");
        self.0.rows(|name, load, active, sub| {
            (states.is_empty() || states.iter().any(|s| s == load || s == active || s == sub))
                && (patterns.is_empty() || glob_match(&patterns, name))
        })
    }

    async fn start_unit(
        &self,
        name: &str,
        mode: &str,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> Result<OwnedObjectPath, ManagerError> {
        self.0.queue("StartUnit", name, mode, &emitter).await
    }

    async fn stop_unit(
        &self,
        name: &str,
        mode: &str,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> Result<OwnedObjectPath, ManagerError> {
        self.0.queue("StopUnit", name, mode, &emitter).await
    }

    async fn restart_unit(
        &self,
        name: &str,
        mode: &str,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> Result<OwnedObjectPath, ManagerError> {
        self.0.queue("RestartUnit", name, mode, &emitter).await
    }
}

/// Old manager: unfiltered `ListUnits` only.
pub struct LegacyManager(pub Arc<State>);

#[zbus::interface(name = "org.freedesktop.systemd1.Manager")]
impl LegacyManager {
    async fn subscribe(&self) {
        self.0.record("Subscribe");
    }

    async fn list_units(&self) -> Vec<Row> {
        self.0.record("ListUnits");
        self.0.rows(|_, _, _, _| true)
    }

    async fn restart_unit(
        &self,
        name: &str,
        mode: &str,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> Result<OwnedObjectPath, ManagerError> {
        self.0.queue("RestartUnit", name, mode, &emitter).await
    }
}

/// A manager that cannot list units at all.
pub struct ActionsOnly(pub Arc<State>);

#[zbus::interface(name = "org.freedesktop.systemd1.Manager")]
impl ActionsOnly {
    async fn restart_unit(
        &self,
        name: &str,
        mode: &str,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> Result<OwnedObjectPath, ManagerError> {
        self.0.queue("RestartUnit", name, mode, &emitter).await
    }
}

pub struct FakeHost {
    _dir: tempfile::TempDir,
    pub socket: PathBuf,
    pub state: Arc<State>,
}

impl FakeHost {
    pub fn factory(&self) -> ConnectionFactory {
        ConnectionFactory::local(&self.socket).with_dbus_call_timeout(Duration::from_secs(5))
    }
}

pub fn serve<I, F>(state: State, make: F) -> FakeHost
where
    I: zbus::object_server::Interface,
    F: Fn(Arc<State>) -> I + Send + 'static,
{
    let dir = tempfile::tempdir().expect("tempdir");
    let socket = dir.path().join("private");
    let listener = UnixListener::bind(&socket).expect("bind fake manager socket");
    let state = Arc::new(state);

    let shared = state.clone();
    std::thread::spawn(move || {
        // Server connections run on zbus' own executor thread; keep them alive here.
        let mut live = Vec::new();
        for stream in listener.incoming() {
            let Ok(stream) = stream else { break };
            let iface = make(shared.clone());
            let conn = smol::block_on(async {
                zbus::connection::Builder::unix_stream(stream)
                    .server(zbus::Guid::generate())?
                    .p2p()
                    .serve_at(MANAGER_PATH, iface)?
                    .build()
                    .await
            });
            match conn {
                Ok(conn) => live.push(conn),
                Err(e) => eprintln!("fake manager: {e}"),
            }
        }
    });

    FakeHost {
        _dir: dir,
        socket,
        state,
    }
}

pub const UNITS: &[(&str, &str, &str, &str)] = &[
    ("nginx.service", "loaded", "active", "running"),
    ("nginx-cache.service", "loaded", "inactive", "dead"),
    ("redis.service", "loaded", "active", "running"),
    ("postgres.service", "loaded", "active", "running"),
    ("a.service", "loaded", "active", "running"),
    ("b.service", "loaded", "active", "running"),
];

// Control knobs arrive as `-o` options so tests never touch the process environment:
// `PidFile=<path>` appends the pid, `FakeExit=<code>` fails like a refused connection,
// `FakeNoSocket=yes` stays up without ever creating the local end, `PortFile=<path>` reports a
// loopback forward as "<port> <remote socket>" for `relay_tcp_forward` to serve.
const FAKE_SSH: &str = r#"#!/bin/sh
local=""
remote=""
port=""
portfile=""
pidfile=""
code=""
nosock=""
while [ $# -gt 0 ]; do
    case "$1" in
        -L)
            case "$2" in
                127.0.0.1:*) rest="${2#127.0.0.1:}"; port="${rest%%:*}"; remote="${rest#*:}" ;;
                *) local="${2%%:*}"; remote="${2#*:}" ;;
            esac
            shift 2 ;;
        -o)
            case "$2" in
                PidFile=*) pidfile="${2#PidFile=}" ;;
                FakeExit=*) code="${2#FakeExit=}" ;;
                FakeNoSocket=yes) nosock=1 ;;
                PortFile=*) portfile="${2#PortFile=}" ;;
            esac
            shift 2 ;;
        --) shift; break ;;
        *) shift ;;
    esac
done
[ -n "$pidfile" ] && echo $$ >> "$pidfile"
if [ -n "$code" ]; then
    echo "ssh: connect to host $1 port 22: Connection refused" >&2
    exit "$code"
fi
if [ -z "$nosock" ] && [ -n "$local" ]; then
    if [ -e "$remote" ]; then ln -s "$remote" "$local"; else : > "$local"; fi
fi
if [ -n "$port" ] && [ -n "$portfile" ]; then
    echo "$port $remote" > "$portfile.tmp" && mv "$portfile.tmp" "$portfile"
fi
exec sleep 600
"#;

/// Path of the fake `ssh`, written once per test binary.
pub fn fake_ssh() -> &'static Path {
    static SCRIPT: OnceLock<(tempfile::TempDir, PathBuf)> = OnceLock::new();
    let (_, path) = SCRIPT.get_or_init(|| {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ssh");
        std::fs::write(&path, FAKE_SSH).expect("write fake ssh");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("chmod fake ssh");
        (dir, path)
    });
    path
}

/// Pids the fake `ssh` recorded in `pidfile`, one per spawn.
pub fn recorded_pids(pidfile: &Path) -> Vec<i32> {
    std::fs::read_to_string(pidfile)
        .unwrap_or_default()
        .lines()
        .filter_map(|l| l.trim().parse().ok())
        .collect()
}

/// True while a process with `pid` exists (zombies included).
pub fn process_alive(pid: i32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

/// Play the ssh side of a loopback forward: once the fake `ssh` reports its port in `portfile`,
/// listen there and pipe every connection to the remote socket it named.
pub fn relay_tcp_forward(portfile: PathBuf) {
    std::thread::spawn(move || {
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        let report = loop {
            if let Ok(report) = std::fs::read_to_string(&portfile) {
                break report;
            }
            if std::time::Instant::now() > deadline {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        };
        let Some((port, remote)) = report.trim().split_once(' ') else {
            return;
        };
        let port: u16 = port.parse().expect("port");
        let remote = PathBuf::from(remote);
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port)).expect("bind forwarded port");

        for tcp in listener.incoming() {
            let Ok(tcp) = tcp else { break };
            let Ok(unix) = UnixStream::connect(&remote) else {
                continue;
            };
            pipe(tcp.try_clone().expect("clone"), unix.try_clone().expect("clone"));
            pipe(unix, tcp);
        }
    });
}

fn pipe(mut from: impl std::io::Read + Send + 'static, mut to: impl Write + Send + 'static) {
    std::thread::spawn(move || {
        let _ = std::io::copy(&mut from, &mut to);
        let _ = to.flush();
    });
}
