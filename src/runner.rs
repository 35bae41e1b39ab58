//! End-to-end run: open the tunnel, resolve units, dispatch, close.

use crate::bus::{Bus, ConnectionFactory};
use crate::dispatch::{DEFAULT_JOB_TIMEOUT, Dispatcher};
use crate::options::TunnelConfig;
use crate::{
    CancelScope, DispatchReport, Error, JobMode, PatternSet, Result, Tunnel, UnitAction,
    UnitCompletion, introspect, util,
};

use futures_util::future::{Either, select};

use std::pin::pin;
use std::time::Duration;

/// What to do to which units.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ActionRequest {
    /// Unit names, or glob patterns when `match_units` is set.
    pub units: Vec<String>,
    pub match_units: bool,
    /// Only with `match_units`: keep units whose load, active or sub state is one of these.
    pub states: Vec<String>,
    pub action: UnitAction,
    pub mode: JobMode,
    pub job_timeout: Option<Duration>,
}

impl ActionRequest {
    pub fn new<I, S>(units: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            units: units.into_iter().map(Into::into).collect(),
            match_units: false,
            states: Vec::new(),
            action: UnitAction::default(),
            mode: JobMode::default(),
            job_timeout: Some(DEFAULT_JOB_TIMEOUT),
        }
    }

    pub fn matching(mut self, match_units: bool) -> Self {
        self.match_units = match_units;
        self
    }

    pub fn with_states<I, S>(mut self, states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.states = states.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_action(mut self, action: UnitAction) -> Self {
        self.action = action;
        self
    }

    pub fn with_mode(mut self, mode: JobMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_job_timeout(mut self, job_timeout: Option<Duration>) -> Self {
        self.job_timeout = job_timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.canonical_units().map(|_| ())
    }

    /// Canonical names (or patterns), deduplicated, in input order.
    fn canonical_units(&self) -> Result<Vec<String>> {
        if self.units.is_empty() {
            return Err(Error::invalid_input("at least one unit is required"));
        }
        if !self.match_units && !self.states.is_empty() {
            return Err(Error::invalid_input(
                "a state filter requires unit pattern matching",
            ));
        }
        for state in &self.states {
            util::validate_no_control("unit state", state)?;
        }

        let mut out: Vec<String> = Vec::with_capacity(self.units.len());
        for unit in &self.units {
            let canonical = if self.match_units {
                util::canonicalize_unit_pattern(unit)?
            } else {
                util::canonicalize_unit_name(unit)?
            };
            if !out.contains(&canonical) {
                out.push(canonical);
            }
        }
        if self.match_units {
            PatternSet::compile(&out)?;
        }
        Ok(out)
    }

    /// The unit names this request applies to, as seen by the manager behind `bus`.
    pub async fn resolve(&self, bus: &Bus) -> Result<Vec<String>> {
        let units = self.canonical_units()?;
        if !self.match_units {
            #[cfg(feature = "tracing")]
            tracing::info!(units = units.len(), "using unit names as given");
            return Ok(units);
        }

        let patterns = PatternSet::compile(&units)?;
        let fetcher = introspect::resolve(bus).await?;
        let matched = fetcher.fetch(bus, &self.states, &patterns).await?;

        #[cfg(feature = "tracing")]
        tracing::info!(
            patterns = ?units,
            matched = matched.len(),
            method = fetcher.capability().method_name(),
            "matched unit patterns"
        );

        Ok(matched.into_iter().map(|u| u.name).collect())
    }

    /// Resolve and dispatch over a fresh connection from `factory`.
    ///
    /// `Err` means nothing was dispatched; per-unit failures are in the report.
    pub async fn execute(&self, factory: &ConnectionFactory) -> Result<DispatchReport> {
        self.validate()?;

        let bus = factory.connect().await?;
        let units = self.resolve(&bus).await?;
        if units.is_empty() {
            #[cfg(feature = "tracing")]
            tracing::warn!(units = ?self.units, "no units matched; nothing to do");
            return Ok(DispatchReport::default());
        }

        let report = Dispatcher::new(self.action, self.mode)
            .with_job_timeout(self.job_timeout)
            .dispatch(&bus, &units)
            .await;
        Ok(report)
    }
}

/// Everything one run needs.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct RunConfig {
    pub tunnel: TunnelConfig,
    pub request: ActionRequest,
}

impl RunConfig {
    pub fn new(tunnel: TunnelConfig, request: ActionRequest) -> Self {
        Self { tunnel, request }
    }

    /// Every configuration check, before any process is spawned.
    pub fn validate(&self) -> Result<()> {
        self.tunnel.validate()?;
        self.request.validate()
    }
}

/// Open a tunnel, apply the request through it and close it again.
///
/// If the forwarder dies mid-run, in-flight work is abandoned and the tunnel error is returned.
/// Cancelling `scope` abandons in-flight work the same way and returns [`Error::Cancelled`]; the
/// tunnel is closed in every case.
/// Per-unit failures are returned as [`Error::Dispatch`]; they take precedence over cleanup
/// failures, which are reported only when every unit succeeded.
pub async fn run(scope: &CancelScope, config: &RunConfig) -> Result<Vec<UnitCompletion>> {
    config.validate()?;

    let mut tunnel = Tunnel::open(scope, config.tunnel.clone()).await?;
    let factory = tunnel.connection_factory();

    let outcome = {
        let work = pin!(config.request.execute(&factory));
        let watch = pin!(tunnel.watch());
        let cancelled = pin!(scope.cancelled());
        match select(work, select(watch, cancelled)).await {
            Either::Left((report, _)) => report,
            Either::Right((Either::Left((err, _)), _)) => Err(err),
            Either::Right((Either::Right(((), _)), _)) => Err(Error::Cancelled {
                context: format!("run against {}", config.tunnel.remote_host),
            }),
        }
    };

    let closed = tunnel.close().await;
    #[cfg(feature = "tracing")]
    if let (Err(_), Err(cleanup)) = (&outcome, &closed) {
        tracing::warn!(error = %cleanup, "tunnel cleanup failed after an aborted run");
    }

    let completed = outcome?.into_result()?;
    closed?;
    Ok(completed)
}
