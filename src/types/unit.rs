use crate::{Error, Result};

use std::fmt;
use std::str::FromStr;

/// systemd job mode passed to `StartUnit`/`StopUnit`/... .
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum JobMode {
    #[default]
    Replace,
    Fail,
    Isolate,
    IgnoreDependencies,
    IgnoreRequirements,
}

impl JobMode {
    pub const ALL: [JobMode; 5] = [
        JobMode::Replace,
        JobMode::Fail,
        JobMode::Isolate,
        JobMode::IgnoreDependencies,
        JobMode::IgnoreRequirements,
    ];

    pub fn as_dbus_str(&self) -> &'static str {
        match self {
            JobMode::Replace => "replace",
            JobMode::Fail => "fail",
            JobMode::Isolate => "isolate",
            JobMode::IgnoreDependencies => "ignore-dependencies",
            JobMode::IgnoreRequirements => "ignore-requirements",
        }
    }
}

impl FromStr for JobMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        JobMode::ALL
            .into_iter()
            .find(|m| m.as_dbus_str() == s)
            .ok_or_else(|| {
                Error::invalid_input(format!(
                    "mode must be one of {:?}, but it is: {s:?}",
                    JobMode::ALL.map(|m| m.as_dbus_str())
                ))
            })
    }
}

impl fmt::Display for JobMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_dbus_str())
    }
}

/// Unit lifecycle action, mapped 1:1 onto a `org.freedesktop.systemd1.Manager` method.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum UnitAction {
    Start,
    Stop,
    #[default]
    Restart,
    Reload,
    TryRestart,
    ReloadOrRestart,
    ReloadOrTryRestart,
}

impl UnitAction {
    pub const ALL: [UnitAction; 7] = [
        UnitAction::Start,
        UnitAction::Stop,
        UnitAction::Restart,
        UnitAction::Reload,
        UnitAction::TryRestart,
        UnitAction::ReloadOrRestart,
        UnitAction::ReloadOrTryRestart,
    ];

    /// The action name as used by `systemctl`.
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitAction::Start => "start",
            UnitAction::Stop => "stop",
            UnitAction::Restart => "restart",
            UnitAction::Reload => "reload",
            UnitAction::TryRestart => "try-restart",
            UnitAction::ReloadOrRestart => "reload-or-restart",
            UnitAction::ReloadOrTryRestart => "reload-or-try-restart",
        }
    }

    pub(crate) fn dbus_method(&self) -> &'static str {
        match self {
            UnitAction::Start => "StartUnit",
            UnitAction::Stop => "StopUnit",
            UnitAction::Restart => "RestartUnit",
            UnitAction::Reload => "ReloadUnit",
            UnitAction::TryRestart => "TryRestartUnit",
            UnitAction::ReloadOrRestart => "ReloadOrRestartUnit",
            UnitAction::ReloadOrTryRestart => "ReloadOrTryRestartUnit",
        }
    }

    pub(crate) fn error_action(&self) -> &'static str {
        match self {
            UnitAction::Start => "start_unit",
            UnitAction::Stop => "stop_unit",
            UnitAction::Restart => "restart_unit",
            UnitAction::Reload => "reload_unit",
            UnitAction::TryRestart => "try_restart_unit",
            UnitAction::ReloadOrRestart => "reload_or_restart_unit",
            UnitAction::ReloadOrTryRestart => "reload_or_try_restart_unit",
        }
    }
}

impl FromStr for UnitAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        UnitAction::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| {
                Error::invalid_input(format!(
                    "action must be one of {:?}, but it is: {s:?}",
                    UnitAction::ALL.map(|a| a.as_str())
                ))
            })
    }
}

impl fmt::Display for UnitAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// systemd `Unit.LoadState`.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum LoadState {
    Loaded,
    NotFound,
    Error,
    Masked,
    Stub,
    Merged,
    BadSetting,
    Unknown(String),
}

impl LoadState {
    pub(crate) fn parse(s: &str) -> Self {
        match s {
            "loaded" => LoadState::Loaded,
            "not-found" => LoadState::NotFound,
            "error" => LoadState::Error,
            "masked" => LoadState::Masked,
            "stub" => LoadState::Stub,
            "merged" => LoadState::Merged,
            "bad-setting" => LoadState::BadSetting,
            other => LoadState::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            LoadState::Loaded => "loaded",
            LoadState::NotFound => "not-found",
            LoadState::Error => "error",
            LoadState::Masked => "masked",
            LoadState::Stub => "stub",
            LoadState::Merged => "merged",
            LoadState::BadSetting => "bad-setting",
            LoadState::Unknown(s) => s.as_str(),
        }
    }
}

/// systemd `Unit.ActiveState`.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum ActiveState {
    Active,
    Reloading,
    Inactive,
    Failed,
    Activating,
    Deactivating,
    Maintenance,
    Unknown(String),
}

impl ActiveState {
    pub(crate) fn parse(s: &str) -> Self {
        match s {
            "active" => ActiveState::Active,
            "reloading" => ActiveState::Reloading,
            "inactive" => ActiveState::Inactive,
            "failed" => ActiveState::Failed,
            "activating" => ActiveState::Activating,
            "deactivating" => ActiveState::Deactivating,
            "maintenance" => ActiveState::Maintenance,
            other => ActiveState::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ActiveState::Active => "active",
            ActiveState::Reloading => "reloading",
            ActiveState::Inactive => "inactive",
            ActiveState::Failed => "failed",
            ActiveState::Activating => "activating",
            ActiveState::Deactivating => "deactivating",
            ActiveState::Maintenance => "maintenance",
            ActiveState::Unknown(s) => s.as_str(),
        }
    }
}

/// Terminal result of a systemd job, as delivered by the `JobRemoved` signal.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum JobResult {
    Done,
    Canceled,
    Timeout,
    Failed,
    Dependency,
    Skipped,
    Other(String),
}

impl JobResult {
    pub(crate) fn parse(s: &str) -> Self {
        match s {
            "done" => JobResult::Done,
            "canceled" => JobResult::Canceled,
            "timeout" => JobResult::Timeout,
            "failed" => JobResult::Failed,
            "dependency" => JobResult::Dependency,
            "skipped" => JobResult::Skipped,
            other => JobResult::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            JobResult::Done => "done",
            JobResult::Canceled => "canceled",
            JobResult::Timeout => "timeout",
            JobResult::Failed => "failed",
            JobResult::Dependency => "dependency",
            JobResult::Skipped => "skipped",
            JobResult::Other(s) => s.as_str(),
        }
    }

    /// `skipped` is what `try-restart` reports for an inactive unit, so it counts as success.
    pub fn is_success(&self) -> bool {
        matches!(self, JobResult::Done | JobResult::Skipped)
    }
}

impl fmt::Display for JobResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single row returned by `org.freedesktop.systemd1.Manager.ListUnits*`.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub struct UnitDescriptor {
    pub name: String,
    pub description: Option<String>,
    pub load_state: LoadState,
    pub active_state: ActiveState,
    pub sub_state: Option<String>,
}

impl UnitDescriptor {
    pub fn new(
        name: impl Into<String>,
        load_state: &str,
        active_state: &str,
        sub_state: &str,
    ) -> Self {
        Self {
            name: name.into(),
            description: None,
            load_state: LoadState::parse(load_state),
            active_state: ActiveState::parse(active_state),
            sub_state: if sub_state.is_empty() {
                None
            } else {
                Some(sub_state.to_string())
            },
        }
    }

    pub(crate) fn from_dbus(item: crate::bus::ListUnitItem) -> Self {
        let (name, description, load_state, active_state, sub_state, ..) = item;
        let mut unit = Self::new(name, &load_state, &active_state, &sub_state);
        if !description.is_empty() {
            unit.description = Some(description);
        }
        unit
    }

    /// True when the load, active or sub state equals any of `states`.
    pub fn in_any_state<S: AsRef<str>>(&self, states: &[S]) -> bool {
        states.iter().any(|s| {
            let s = s.as_ref();
            self.load_state.as_str() == s
                || self.active_state.as_str() == s
                || self.sub_state.as_deref() == Some(s)
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]
    #![allow(clippy::panic)]
    #![allow(clippy::unwrap_used)]

    use super::*;
    use zbus::zvariant::OwnedObjectPath;

    fn path(s: &str) -> OwnedObjectPath {
        OwnedObjectPath::try_from(s).expect("valid object path")
    }

    #[test]
    fn job_mode_parses_every_documented_mode() {
        for mode in JobMode::ALL {
            assert_eq!(mode.as_dbus_str().parse::<JobMode>().expect("ok"), mode);
        }
        assert_eq!(
            "ignore-dependencies".parse::<JobMode>().expect("ok"),
            JobMode::IgnoreDependencies
        );
    }

    #[test]
    fn job_mode_rejects_unknown_mode() {
        let err = "replace-irreversibly".parse::<JobMode>().expect_err("must fail");
        let Error::InvalidInput { context } = err else {
            panic!("unexpected error: {err:?}");
        };
        assert!(context.contains("replace-irreversibly"));
    }

    #[test]
    fn unit_action_maps_to_manager_methods() {
        assert_eq!(UnitAction::Start.dbus_method(), "StartUnit");
        assert_eq!(UnitAction::Stop.dbus_method(), "StopUnit");
        assert_eq!(UnitAction::Restart.dbus_method(), "RestartUnit");
        assert_eq!(UnitAction::Reload.dbus_method(), "ReloadUnit");
        assert_eq!(UnitAction::TryRestart.dbus_method(), "TryRestartUnit");
        assert_eq!(
            UnitAction::ReloadOrRestart.dbus_method(),
            "ReloadOrRestartUnit"
        );
        assert_eq!(
            UnitAction::ReloadOrTryRestart.dbus_method(),
            "ReloadOrTryRestartUnit"
        );
    }

    #[test]
    fn unit_action_round_trips_through_systemctl_names() {
        for action in UnitAction::ALL {
            assert_eq!(action.as_str().parse::<UnitAction>().expect("ok"), action);
        }
        assert!("kill".parse::<UnitAction>().is_err());
    }

    #[test]
    fn job_result_success_covers_done_and_skipped() {
        assert!(JobResult::parse("done").is_success());
        assert!(JobResult::parse("skipped").is_success());
        assert!(!JobResult::parse("failed").is_success());
        assert!(!JobResult::parse("canceled").is_success());
        assert_eq!(
            JobResult::parse("once"),
            JobResult::Other("once".to_string())
        );
    }

    #[test]
    fn state_filter_matches_any_of_the_three_fields() {
        let unit = UnitDescriptor::new("nginx.service", "loaded", "active", "running");
        assert!(unit.in_any_state(&["loaded"]));
        assert!(unit.in_any_state(&["active"]));
        assert!(unit.in_any_state(&["running"]));
        assert!(unit.in_any_state(&["failed", "running"]));
        assert!(!unit.in_any_state(&["failed", "exited"]));
    }

    #[test]
    fn descriptor_decodes_list_units_row() {
        let item = (
            "nginx.service".to_string(),
            "".to_string(),
            "loaded".to_string(),
            "active".to_string(),
            "running".to_string(),
            "".to_string(),
            path("/org/freedesktop/systemd1/unit/nginx_2eservice"),
            0u32,
            "".to_string(),
            path("/"),
        );

        let unit = UnitDescriptor::from_dbus(item);
        assert_eq!(unit.name, "nginx.service");
        assert_eq!(unit.description, None);
        assert_eq!(unit.load_state, LoadState::Loaded);
        assert_eq!(unit.active_state, ActiveState::Active);
        assert_eq!(unit.sub_state.as_deref(), Some("running"));
    }
}
