use clap::{ArgAction, Parser};
use serde::Deserialize;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing_subscriber::EnvFilter;
use unitrelay::{
    ActionRequest, AuthMode, BackoffPolicy, CancelScope, Error, JobMode, RendezvousKind,
    RunConfig, TunnelConfig, UnitAction, parse_duration,
};

use std::io::Read;
use std::process::ExitCode;

/// Start/stop/restart systemd units on a remote host over an SSH-forwarded D-Bus socket.
///
/// Exit status: 0 on success, 1 if nothing could be dispatched, 2 if some unit actions failed.
#[derive(Parser, Debug)]
#[command(name = "unitrelay", version, about)]
struct Cli {
    /// Systemd unit names or patterns to act on
    #[arg(
        short = 's',
        long = "unit",
        env = "SYSTEMD_UNIT",
        value_delimiter = ',',
        required = true
    )]
    units: Vec<String>,

    /// Treat units as glob patterns and match them against the remote unit list
    #[arg(short = 'm', long = "match", env = "SYSTEMD_MATCH_UNITS")]
    match_units: bool,

    /// Only match units in one of these load/active/sub states (requires --match)
    #[arg(long = "state", value_delimiter = ',')]
    states: Vec<String>,

    /// Action: start, stop, restart, reload, try-restart, reload-or-restart, reload-or-try-restart
    #[arg(short = 'a', long, env = "SYSTEMD_ACTION", default_value = "restart")]
    action: String,

    /// Job mode: replace, fail, isolate, ignore-dependencies, ignore-requirements
    #[arg(short = 'M', long, env = "SYSTEMD_MODE", default_value = "replace")]
    mode: String,

    /// SSH host (default: entity.system.hostname of the --event-stdin event)
    #[arg(short = 'H', long)]
    ssh_host: Option<String>,

    #[arg(short = 'u', long, default_value = "root")]
    ssh_user: String,

    #[arg(short = 'p', long, default_value_t = 22)]
    ssh_port: u16,

    /// Minimum delay before respawning an ssh that exited early
    #[arg(long, default_value = "250ms")]
    ssh_min_delay: String,

    /// Maximum delay before respawning an ssh that exited early
    #[arg(long, default_value = "10s")]
    ssh_max_delay: String,

    /// Total ssh spawn attempts
    #[arg(long, default_value_t = 3)]
    ssh_max_attempts: u32,

    /// Extra ssh -o option (repeatable)
    #[arg(short = 'o', long = "ssh-option")]
    ssh_options: Vec<String>,

    #[arg(long, default_value = "ssh")]
    ssh_program: String,

    /// Remote D-Bus socket path
    #[arg(long, default_value = unitrelay::DEFAULT_REMOTE_SOCKET)]
    dbus_socket: String,

    /// Numeric uid presented in the SASL EXTERNAL handshake
    #[arg(long, default_value_t = 0)]
    auth_uid: u32,

    /// Forward to a loopback TCP port instead of a private unix socket
    #[arg(long)]
    tcp: bool,

    /// How long to wait for the forward to come up
    #[arg(long, default_value = "30s")]
    ready_timeout: String,

    /// Per-unit job deadline; "0" waits indefinitely
    #[arg(long, default_value = "5m")]
    job_timeout: String,

    /// Increase ssh verbosity (-v, -vv, -vvv)
    #[arg(short = 'v', action = ArgAction::Count)]
    verbose: u8,

    /// Read a monitoring event (JSON) from stdin and take the host from entity.system.hostname
    #[arg(long)]
    event_stdin: bool,
}

#[derive(Deserialize)]
struct Event {
    entity: Entity,
}

#[derive(Deserialize)]
struct Entity {
    system: EntitySystem,
}

#[derive(Deserialize)]
struct EntitySystem {
    hostname: String,
}

fn event_hostname(raw: &str) -> unitrelay::Result<String> {
    let event: Event = serde_json::from_str(raw).map_err(|e| Error::ParseError {
        context: format!("event json: {e}"),
        sample: raw.chars().take(512).collect(),
    })?;
    let hostname = event.entity.system.hostname.trim().to_string();
    if hostname.is_empty() {
        return Err(Error::InvalidInput {
            context: "event entity.system.hostname is empty".to_string(),
        });
    }
    Ok(hostname)
}

fn build_config(cli: Cli, event: Option<&str>) -> unitrelay::Result<RunConfig> {
    let action: UnitAction = cli.action.parse()?;
    let mode: JobMode = cli.mode.parse()?;

    let host = match (cli.ssh_host, event) {
        (Some(host), _) => host,
        (None, Some(raw)) => event_hostname(raw)?,
        (None, None) => {
            return Err(Error::InvalidInput {
                context: "--ssh-host is required without --event-stdin".to_string(),
            });
        }
    };

    let job_timeout = parse_duration(&cli.job_timeout)?;

    let mut tunnel = TunnelConfig::new(host);
    tunnel.remote_user = cli.ssh_user;
    tunnel.remote_port = cli.ssh_port;
    tunnel.remote_socket_path = cli.dbus_socket;
    tunnel.auth = AuthMode::External { uid: cli.auth_uid };
    tunnel.verbosity = cli.verbose;
    tunnel.backoff = Some(BackoffPolicy::new(
        parse_duration(&cli.ssh_min_delay)?,
        parse_duration(&cli.ssh_max_delay)?,
        cli.ssh_max_attempts,
    ));
    tunnel.rendezvous = if cli.tcp {
        RendezvousKind::Tcp
    } else {
        RendezvousKind::Unix
    };
    tunnel.ready_timeout = parse_duration(&cli.ready_timeout)?;
    tunnel.ssh_program = cli.ssh_program;
    tunnel.ssh_options = cli.ssh_options;

    let request = ActionRequest::new(cli.units)
        .matching(cli.match_units)
        .with_states(cli.states)
        .with_action(action)
        .with_mode(mode)
        .with_job_timeout((!job_timeout.is_zero()).then_some(job_timeout));

    let config = RunConfig::new(tunnel, request);
    config.validate()?;
    Ok(config)
}

fn exit_code(err: &Error) -> ExitCode {
    if err.is_setup_failure() {
        ExitCode::from(1)
    } else {
        ExitCode::from(2)
    }
}

/// Cancel `scope` on SIGINT or SIGTERM so the run closes its tunnel before the process exits.
fn cancel_on_signal(scope: &CancelScope) -> std::io::Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    let scope = scope.clone();
    std::thread::spawn(move || {
        for signal in signals.forever() {
            tracing::warn!(signal, "interrupted; closing the tunnel");
            scope.cancel();
        }
    });
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let event = if cli.event_stdin {
        let mut raw = String::new();
        if let Err(e) = std::io::stdin().read_to_string(&mut raw) {
            tracing::error!(error = %e, "failed to read event from stdin");
            return ExitCode::from(1);
        }
        Some(raw)
    } else {
        None
    };

    let config = match build_config(cli, event.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            return exit_code(&e);
        }
    };

    let scope = CancelScope::new();
    if let Err(e) = cancel_on_signal(&scope) {
        tracing::warn!(
            error = %e,
            "cannot install signal handler; an interrupt will leak the tunnel"
        );
    }
    match unitrelay::block_on(unitrelay::run(&scope, &config)) {
        Ok(completed) => {
            tracing::info!(units = completed.len(), "all unit actions succeeded");
            ExitCode::SUCCESS
        }
        Err(Error::Dispatch(err)) => {
            for (unit, error) in err.iter() {
                tracing::error!(%unit, %error, "unit action failed");
            }
            tracing::error!(
                failed = err.len(),
                succeeded = err.completed.len(),
                "some unit actions failed"
            );
            ExitCode::from(2)
        }
        Err(e) => {
            tracing::error!(error = %e, "run failed");
            exit_code(&e)
        }
    }
}
