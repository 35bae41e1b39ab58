use crate::options::TunnelConfig;
use crate::{Error, Result, runtime, util};

use futures_lite::io::{AsyncBufReadExt, BufReader};
use futures_util::FutureExt;
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;

use std::os::unix::process::CommandExt;
use std::process::Stdio;
use std::time::Duration;

const STDERR_MAX_BYTES: usize = 8 * 1024;
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// `ssh` arguments forwarding `local` to the remote manager socket.
pub(crate) fn ssh_args(cfg: &TunnelConfig, local: &str) -> Vec<String> {
    let mut args: Vec<String> = [
        "-N",
        "-T",
        "-o",
        "ExitOnForwardFailure=yes",
        "-o",
        "BatchMode=yes",
        "-o",
        "StreamLocalBindUnlink=yes",
        "-o",
        "ServerAliveInterval=30",
    ]
    .into_iter()
    .map(str::to_string)
    .collect();

    args.push("-p".to_string());
    args.push(cfg.remote_port.to_string());
    args.push("-l".to_string());
    args.push(cfg.remote_user.clone());

    if cfg.verbosity > 0 {
        let level = usize::from(cfg.verbosity.min(3));
        args.push(format!("-{}", "v".repeat(level)));
    }

    for opt in &cfg.ssh_options {
        args.push("-o".to_string());
        args.push(opt.clone());
    }

    args.push("-L".to_string());
    args.push(format!("{local}:{}", cfg.remote_socket_path));
    args.push("--".to_string());
    args.push(cfg.remote_host.clone());
    args
}

/// A running `ssh -N -L ...` process, leader of its own process group.
#[derive(Debug)]
pub(crate) struct Forwarder {
    program: String,
    child: async_process::Child,
    pid: u32,
    stderr: Option<BufReader<async_process::ChildStderr>>,
    pending: Vec<u8>,
    stderr_buf: Vec<u8>,
    reaped: bool,
}

impl Forwarder {
    pub(crate) fn spawn(cfg: &TunnelConfig, local: &str) -> Result<Self> {
        let args = ssh_args(cfg, local);

        #[cfg(feature = "tracing")]
        tracing::debug!(program = %cfg.ssh_program, args = ?args, "spawn ssh forwarder");

        let mut std_cmd = std::process::Command::new(&cfg.ssh_program);
        std_cmd.args(&args).process_group(0);

        let mut cmd = async_process::Command::from(std_cmd);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                return Error::tunnel(format!("ssh program not found: {}", cfg.ssh_program));
            }
            Error::IoError {
                context: format!("spawn {} failed: {e}", cfg.ssh_program),
            }
        })?;

        let pid = child.id();
        let stderr = child.stderr.take().map(BufReader::new);

        Ok(Self {
            program: cfg.ssh_program.clone(),
            child,
            pid,
            stderr,
            pending: Vec::new(),
            stderr_buf: Vec::new(),
            reaped: false,
        })
    }

    pub(crate) fn pid(&self) -> u32 {
        self.pid
    }

    /// Resolves once the process has exited, with the error describing the exit.
    ///
    /// Drains and logs stderr meanwhile. Dropping the future before completion loses nothing;
    /// calling it again picks up where it stopped.
    pub(crate) async fn exited(&mut self) -> Error {
        while let Some(reader) = self.stderr.as_mut() {
            let read = reader.read_until(b'\n', &mut self.pending).await;
            self.flush_pending();
            if !matches!(read, Ok(n) if n > 0) {
                self.stderr = None;
            }
        }

        let status = self.child.status().await;
        self.reaped = true;
        let stderr = String::from_utf8_lossy(&self.stderr_buf);
        match status {
            Ok(status) => Error::process_error(&self.program, status.code(), stderr.trim_end()),
            Err(e) => Error::IoError {
                context: format!("wait {}: {e}", self.program),
            },
        }
    }

    fn flush_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let line = String::from_utf8_lossy(&self.pending);
        let line = line.trim_end();
        if !line.is_empty() {
            #[cfg(feature = "tracing")]
            tracing::debug!(pid = self.pid, %line, "ssh stderr");

            util::push_limited(&mut self.stderr_buf, line.as_bytes(), STDERR_MAX_BYTES);
            util::push_limited(&mut self.stderr_buf, b"\n", STDERR_MAX_BYTES);
        }
        self.pending.clear();
    }

    /// SIGTERM the process group, SIGKILL it after a grace period, then reap the child.
    pub(crate) async fn terminate(&mut self) -> Result<()> {
        if self.reaped {
            return Ok(());
        }

        signal_group(self.pid, Signal::SIGTERM)?;

        let exited = {
            let status = self.child.status().fuse();
            let grace = runtime::sleep(TERMINATE_GRACE).fuse();
            futures_util::pin_mut!(status, grace);
            futures_util::select! {
                status = status => Some(status),
                _ = grace => None,
            }
        };

        let status = match exited {
            Some(status) => status,
            None => {
                #[cfg(feature = "tracing")]
                tracing::warn!(pid = self.pid, "ssh ignored SIGTERM; sending SIGKILL");

                signal_group(self.pid, Signal::SIGKILL)?;
                self.child.status().await
            }
        };
        self.reaped = true;

        status.map(|_| ()).map_err(|e| Error::IoError {
            context: format!("reap {} (pid {}): {e}", self.program, self.pid),
        })
    }
}

impl Drop for Forwarder {
    fn drop(&mut self) {
        if !self.reaped {
            let _ = signal_group(self.pid, Signal::SIGKILL);
        }
    }
}

fn signal_group(pid: u32, signal: Signal) -> Result<()> {
    let pgid = i32::try_from(pid).map_err(|_| Error::IoError {
        context: format!("pid {pid} out of range"),
    })?;
    match killpg(Pid::from_raw(pgid), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(Error::IoError {
            context: format!("signal {signal} to process group {pgid}: {e}"),
        }),
    }
}
