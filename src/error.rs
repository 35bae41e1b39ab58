use crate::UnitCompletion;

use std::fmt;
use std::time::Duration;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Error returned by unitrelay APIs.
///
/// Variants fall into the phases of a run:
/// - **configuration** (`InvalidInput`), checked before any connection attempt,
/// - **tunnel** (`Tunnel`, `ProcessError`, `Timeout`, `AuthFailed`, `IoError`),
/// - **resolution** (`Capability`, `InvalidPattern`, `ParseError`),
/// - **per-unit actions** (`UnitNotFound`, `PermissionDenied`, `DbusError`, `JobFailed`,
///   `JobTimeout`, `Cancelled`), which are collected into `Dispatch`.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration/input validation failure (empty unit list, unknown action, bad duration).
    #[error("invalid input: {context}")]
    InvalidInput { context: String },

    /// The forwarded path could not be set up or died.
    #[error("tunnel error: {detail}")]
    Tunnel { detail: String },

    /// The remote endpoint rejected the SASL handshake.
    #[error("authentication failed: {detail}")]
    AuthFailed { detail: String },

    /// The remote manager exposes none of the known unit listing methods.
    #[error("no supported unit listing method; discovered: {methods:?}")]
    Capability { methods: Vec<String> },

    /// A unit pattern could not be compiled.
    #[error("invalid unit pattern {pattern:?}: {detail}")]
    InvalidPattern { pattern: String, detail: String },

    /// The remote process is not allowed to perform an action (D-Bus policy, polkit).
    #[error("permission denied for {action}: {detail}")]
    PermissionDenied {
        action: &'static str,
        detail: String,
    },

    /// The requested unit does not exist (best-effort mapping from D-Bus error names).
    #[error("unit not found: {unit}")]
    UnitNotFound { unit: String },

    /// A systemd job finished with a result other than `done`/`skipped`.
    #[error("job {job_id} for {unit} finished with result {result:?}")]
    JobFailed {
        unit: String,
        job_id: u32,
        result: String,
    },

    /// Timed out while waiting for a systemd job to complete.
    #[error("job timeout for {unit}: {timeout:?}")]
    JobTimeout { unit: String, timeout: Duration },

    /// Timed out while performing an operation (D-Bus call, tunnel readiness).
    #[error("timeout for {action}: {timeout:?}")]
    Timeout {
        action: &'static str,
        timeout: Duration,
    },

    /// The owning cancellation scope was cancelled.
    #[error("cancelled: {context}")]
    Cancelled { context: String },

    /// Raw D-Bus error that did not match a more specific classification.
    #[error("dbus error {name}: {message}")]
    DbusError { name: String, message: String },

    /// Generic I/O or runtime error with context.
    #[error("io error: {context}")]
    IoError { context: String },

    /// Failed to parse an external payload (introspection XML, event JSON).
    ///
    /// `sample` is truncated to avoid unbounded output.
    #[error("parse error: {context}; sample={sample}")]
    ParseError { context: String, sample: String },

    /// A subprocess failed (non-zero exit or other failure mode).
    ///
    /// `stderr` is truncated to avoid unbounded output.
    #[error("process error: {command} (exit={exit_code:?}): {stderr}")]
    ProcessError {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    /// One or more per-unit actions failed.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// Releasing tunnel resources failed; every sub-failure is kept.
    #[error("cleanup failed: {}", join_errors(.errors))]
    Cleanup { errors: Vec<Error> },
}

impl Error {
    pub(crate) fn invalid_input(context: impl Into<String>) -> Self {
        Self::InvalidInput {
            context: context.into(),
        }
    }

    pub(crate) fn tunnel(detail: impl Into<String>) -> Self {
        Self::Tunnel {
            detail: detail.into(),
        }
    }

    pub(crate) fn parse_error(context: impl Into<String>, sample: impl AsRef<str>) -> Self {
        Self::ParseError {
            context: context.into(),
            sample: truncate_for_error(sample.as_ref(), 512).into_owned(),
        }
    }

    pub(crate) fn process_error(
        command: impl Into<String>,
        exit_code: Option<i32>,
        stderr: impl AsRef<str>,
    ) -> Self {
        Self::ProcessError {
            command: command.into(),
            exit_code,
            stderr: truncate_for_error(stderr.as_ref(), 8 * 1024).into_owned(),
        }
    }

    /// Returns true if this error happened before any unit action was dispatched.
    pub fn is_setup_failure(&self) -> bool {
        !matches!(self, Error::Dispatch(_))
    }
}

/// A unit whose action failed, with the error that failed it.
#[derive(Debug)]
#[non_exhaustive]
pub struct UnitFailure {
    pub unit: String,
    pub error: Error,
}

/// Aggregate of every per-unit failure from one dispatch.
///
/// Constituent errors are kept as typed values, in unit order; the units that completed are kept
/// alongside so callers can report both.
#[derive(Debug, Default)]
#[non_exhaustive]
pub struct DispatchError {
    pub failures: Vec<UnitFailure>,
    pub completed: Vec<UnitCompletion>,
}

impl DispatchError {
    /// Number of failed units.
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// Iterate over the failed units and their errors.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Error)> {
        self.failures.iter().map(|f| (f.unit.as_str(), &f.error))
    }
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total = self.failures.len() + self.completed.len();
        write!(f, "{} of {} unit actions failed", self.failures.len(), total)?;
        for failure in &self.failures {
            write!(f, "; {}: {}", failure.unit, failure.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.failures
            .first()
            .map(|f| &f.error as &(dyn std::error::Error + 'static))
    }
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

fn truncate_for_error(input: &str, max_bytes: usize) -> std::borrow::Cow<'_, str> {
    if input.len() <= max_bytes {
        return std::borrow::Cow::Borrowed(input);
    }
    let mut end = max_bytes;
    while end > 0 && !input.is_char_boundary(end) {
        end -= 1;
    }
    std::borrow::Cow::Owned(input[..end].to_string())
}
