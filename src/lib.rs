//! unitrelay triggers systemd unit actions (start/stop/restart/reload and friends) on a remote
//! host by forwarding the host's private systemd socket over SSH and talking D-Bus to it
//! directly. Units can be named verbatim or matched by glob pattern; the action is applied to all
//! of them concurrently and per-unit results are aggregated into one outcome.
//!
//! Runtime requires a unix host with an OpenSSH client; the remote side needs systemd and an SSH
//! login allowed to reach `/var/run/systemd/private` (usually `root`).
//!
//! ## Quick start
//! ```no_run
//! use unitrelay::{ActionRequest, CancelScope, RunConfig, TunnelConfig, UnitAction};
//!
//! async fn restart_web() -> Result<(), unitrelay::Error> {
//!     let request = ActionRequest::new(["nginx*", "redis"])
//!         .matching(true)
//!         .with_action(UnitAction::Restart);
//!     let config = RunConfig::new(TunnelConfig::new("web-1.example.com"), request);
//!
//!     for done in unitrelay::run(&CancelScope::new(), &config).await? {
//!         println!("{}: job {} {}", done.unit, done.job_id, done.result);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Unit name rules
//! - Verbatim names may omit the type suffix: `"nginx"` becomes `"nginx.service"`.
//! - With pattern matching, globs (`*`, `?`, `[...]`) are kept as-is; plain names are
//!   canonicalized the same way as verbatim names.
//! - Names containing path separators or control characters are rejected as `Error::InvalidInput`.
//!
//! ## Unit listing
//! Pattern matching uses the best listing method the remote manager offers
//! (`ListUnitsByPatterns`, then `ListUnitsFiltered`, then `ListUnits`), filtering locally where the
//! manager cannot. See [`FetchCapability`].

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]
#![deny(clippy::dbg_macro)]

#[cfg(not(unix))]
compile_error!("unitrelay requires a unix platform (process groups, unix sockets).");

mod backoff;
mod bus;
mod dispatch;
mod error;
mod introspect;
mod options;
mod pattern;
mod runner;
mod runtime;
mod scope;
mod tunnel;
mod types;
mod util;

pub use crate::types::dispatch::{DispatchReport, UnitCompletion};
pub use crate::types::unit::{
    ActiveState, JobMode, JobResult, LoadState, UnitAction, UnitDescriptor,
};

pub use crate::bus::{Bus, ConnectionFactory};
pub use crate::dispatch::{DEFAULT_JOB_TIMEOUT, Dispatcher};
pub use crate::error::{DispatchError, Error, Result, UnitFailure};
pub use crate::introspect::{FetchCapability, UnitFetcher, resolve as resolve_fetcher};
pub use crate::options::{
    AuthMode, BackoffPolicy, DEFAULT_REMOTE_SOCKET, RendezvousKind, TunnelConfig,
};
pub use crate::pattern::{PatternSet, match_units};
pub use crate::runner::{ActionRequest, RunConfig, run};
pub use crate::runtime::block_on;
pub use crate::scope::CancelScope;
pub use crate::tunnel::Tunnel;
pub use crate::util::parse_duration;
