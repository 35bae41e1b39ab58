use crate::bus::Bus;
use crate::{DispatchReport, Error, JobMode, JobResult, Result, UnitAction, UnitCompletion, runtime};

use futures_util::{FutureExt, StreamExt};
use zbus::zvariant::OwnedObjectPath;

use std::time::Duration;

/// Default upper bound for a single job to finish once queued.
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(300);

/// Applies one action to many units concurrently over a shared connection.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct Dispatcher {
    pub action: UnitAction,
    pub mode: JobMode,
    /// Per-unit deadline for the `JobRemoved` signal; `None` waits indefinitely.
    pub job_timeout: Option<Duration>,
}

impl Dispatcher {
    pub fn new(action: UnitAction, mode: JobMode) -> Self {
        Self {
            action,
            mode,
            job_timeout: Some(DEFAULT_JOB_TIMEOUT),
        }
    }

    pub fn with_job_timeout(mut self, job_timeout: Option<Duration>) -> Self {
        self.job_timeout = job_timeout;
        self
    }

    /// Queue a job per unit and wait for all of them.
    ///
    /// Units run independently: a failure is recorded for that unit only and never cancels the
    /// others. The report lists outcomes in the order of `units`.
    pub async fn dispatch<S: AsRef<str>>(&self, bus: &Bus, units: &[S]) -> DispatchReport {
        let mut report = DispatchReport::default();
        if units.is_empty() {
            return report;
        }

        // Private connections get job signals regardless; on a bus this adds the subscription.
        if let Err(_e) = bus.subscribe().await {
            #[cfg(feature = "tracing")]
            tracing::debug!(error = %_e, "manager subscribe failed; continuing");
        }

        let total = units.len();
        let outcomes = futures_util::future::join_all(
            units
                .iter()
                .enumerate()
                .map(|(idx, unit)| self.run_unit(bus, idx + 1, total, unit.as_ref())),
        )
        .await;

        for (unit, outcome) in units.iter().zip(outcomes) {
            report.push(unit.as_ref().to_string(), outcome);
        }

        #[cfg(feature = "tracing")]
        tracing::info!(
            action = %self.action,
            total,
            failed = report.failures.len(),
            "dispatch finished"
        );

        report
    }

    async fn run_unit(
        &self,
        bus: &Bus,
        position: usize,
        total: usize,
        unit: &str,
    ) -> Result<UnitCompletion> {
        #[cfg(feature = "tracing")]
        tracing::info!(%unit, action = %self.action, mode = %self.mode, position, total, "triggering action");

        let cancelled = async {
            bus.scope().cancelled().await;
            Err(Error::Cancelled {
                context: format!("{} {unit}", self.action),
            })
        };
        let outcome = futures_lite::future::or(self.trigger_and_wait(bus, unit), cancelled).await;

        #[cfg(feature = "tracing")]
        match &outcome {
            Ok(done) => {
                tracing::info!(%unit, job_id = done.job_id, result = %done.result, "unit action finished")
            }
            Err(e) => tracing::warn!(%unit, action = %self.action, error = %e, "unit action failed"),
        }

        outcome
    }

    async fn trigger_and_wait(&self, bus: &Bus, unit: &str) -> Result<UnitCompletion> {
        // Subscribe before queueing so a fast job's JobRemoved cannot be missed.
        let signals = bus.job_removed_signals().await?;
        let job = bus
            .invoke(self.action, unit, self.mode.as_dbus_str())
            .await?;
        let job_id = parse_job_id(&job)?;

        #[cfg(feature = "tracing")]
        tracing::debug!(%unit, job_id, job_path = %job.as_str(), "job queued");

        let result = self.wait_job_removed(signals, unit, &job).await?;
        if !result.is_success() {
            return Err(Error::JobFailed {
                unit: unit.to_string(),
                job_id,
                result: result.as_str().to_string(),
            });
        }
        Ok(UnitCompletion {
            unit: unit.to_string(),
            job_id,
            job_path: job.as_str().to_string(),
            result,
        })
    }

    async fn wait_job_removed(
        &self,
        signals: zbus::proxy::SignalStream<'static>,
        unit: &str,
        job: &OwnedObjectPath,
    ) -> Result<JobResult> {
        let mut signals = signals.fuse();
        let mut deadline = runtime::deadline(self.job_timeout).fuse();

        loop {
            futures_util::select! {
                _ = deadline => {
                    return Err(Error::JobTimeout {
                        unit: unit.to_string(),
                        timeout: self.job_timeout.unwrap_or_default(),
                    });
                }
                msg = signals.next() => {
                    let Some(msg) = msg else {
                        return Err(Error::IoError {
                            context: format!("signal stream closed while waiting for job {}", job.as_str()),
                        });
                    };
                    if let Some(result) = decode_job_removed(job.as_str(), msg)? {
                        return Ok(JobResult::parse(&result));
                    }
                }
            }
        }
    }
}

/// Numeric id from a job path such as `/org/freedesktop/systemd1/job/1234`.
fn parse_job_id(job: &OwnedObjectPath) -> Result<u32> {
    job.as_str()
        .rsplit('/')
        .next()
        .and_then(|id| id.parse().ok())
        .ok_or_else(|| Error::parse_error("job path without numeric id", job.as_str()))
}

fn decode_job_removed(job_path: &str, msg: zbus::Message) -> Result<Option<String>> {
    let body = msg.body();
    let decoded: std::result::Result<(u32, OwnedObjectPath, String, String), _> =
        body.deserialize();
    let (_id, job, _unit, result) = decoded.map_err(|e| Error::DbusError {
        name: "SignalDecode".to_string(),
        message: e.to_string(),
    })?;

    if job.as_str() == job_path {
        return Ok(Some(result));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]
    #![allow(clippy::panic)]
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn path(s: &str) -> OwnedObjectPath {
        OwnedObjectPath::try_from(s).expect("valid object path")
    }

    fn job_removed(id: u32, job: &str, unit: &str, result: &str) -> zbus::Message {
        zbus::Message::signal(
            "/org/freedesktop/systemd1",
            "org.freedesktop.systemd1.Manager",
            "JobRemoved",
        )
        .expect("builder")
        .build(&(id, path(job), unit, result))
        .expect("msg")
    }

    #[test]
    fn job_id_is_the_last_path_segment() {
        assert_eq!(
            parse_job_id(&path("/org/freedesktop/systemd1/job/4711")).expect("ok"),
            4711
        );
        let err = parse_job_id(&path("/org/freedesktop/systemd1/job/x")).expect_err("fail");
        assert!(matches!(err, Error::ParseError { .. }), "{err:?}");
    }

    #[test]
    fn job_removed_matches_only_the_awaited_job() {
        let msg = job_removed(7, "/org/freedesktop/systemd1/job/7", "a.service", "done");
        assert_eq!(
            decode_job_removed("/org/freedesktop/systemd1/job/7", msg).expect("ok"),
            Some("done".to_string())
        );

        let msg = job_removed(8, "/org/freedesktop/systemd1/job/8", "b.service", "failed");
        assert_eq!(
            decode_job_removed("/org/freedesktop/systemd1/job/7", msg).expect("ok"),
            None
        );
    }

    #[test]
    fn default_dispatcher_bounds_each_job() {
        let d = Dispatcher::new(UnitAction::default(), JobMode::default());
        assert_eq!(d.job_timeout, Some(DEFAULT_JOB_TIMEOUT));
        assert_eq!(d.action, UnitAction::Restart);
        assert_eq!(d.mode, JobMode::Replace);
        assert_eq!(d.with_job_timeout(None).job_timeout, None);
    }
}
