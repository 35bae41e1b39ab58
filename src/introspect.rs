//! Runtime discovery of the unit listing API offered by a remote manager.
//!
//! Older systemd releases lack `ListUnitsByPatterns` (v230) or even `ListUnitsFiltered` (v227).
//! [`resolve`] introspects the manager object once and binds a [`UnitFetcher`] to the best method
//! available; the fetcher makes up for missing server-side filtering locally, so every variant
//! returns the same unit set.

use crate::bus::{Bus, SYSTEMD_MANAGER_INTERFACE};
use crate::{Error, PatternSet, Result, UnitDescriptor};

/// The unit listing method a [`UnitFetcher`] is bound to, in order of preference.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum FetchCapability {
    /// `ListUnitsByPatterns`: states and patterns are applied by the manager.
    ByPatterns,
    /// `ListUnitsFiltered`: states applied by the manager, patterns locally.
    Filtered,
    /// `ListUnits`: states and patterns applied locally.
    Unfiltered,
}

impl FetchCapability {
    const PREFERENCE: [FetchCapability; 3] = [
        FetchCapability::ByPatterns,
        FetchCapability::Filtered,
        FetchCapability::Unfiltered,
    ];

    pub fn method_name(&self) -> &'static str {
        match self {
            FetchCapability::ByPatterns => "ListUnitsByPatterns",
            FetchCapability::Filtered => "ListUnitsFiltered",
            FetchCapability::Unfiltered => "ListUnits",
        }
    }

    /// Pick the most capable method present in `methods`.
    pub(crate) fn select<S: AsRef<str>>(methods: &[S]) -> Result<Self> {
        Self::PREFERENCE
            .into_iter()
            .find(|cap| methods.iter().any(|m| m.as_ref() == cap.method_name()))
            .ok_or_else(|| Error::Capability {
                methods: methods
                    .iter()
                    .map(|m| m.as_ref())
                    .filter(|m| m.contains("ListUnits"))
                    .map(str::to_string)
                    .collect(),
            })
    }
}

/// Method names of the manager interface found in an introspection document.
pub(crate) fn manager_methods(xml: &str) -> Result<Vec<String>> {
    let node = zbus_xml::Node::from_reader(xml.as_bytes())
        .map_err(|e| Error::parse_error(format!("introspection xml: {e}"), xml))?;

    if node.interfaces().is_empty() {
        return Err(Error::parse_error("introspection lists no interfaces", xml));
    }

    Ok(node
        .interfaces()
        .iter()
        .filter(|iface| iface.name().as_str() == SYSTEMD_MANAGER_INTERFACE)
        .flat_map(|iface| iface.methods())
        .map(|m| m.name().as_str().to_string())
        .collect())
}

/// Introspect the manager behind `bus` and bind a fetcher to its best listing method.
pub async fn resolve(bus: &Bus) -> Result<UnitFetcher> {
    let xml = bus.introspect().await?;
    let methods = manager_methods(&xml)?;
    let capability = FetchCapability::select(&methods)?;

    #[cfg(feature = "tracing")]
    tracing::info!(
        method = capability.method_name(),
        "selected unit listing method"
    );

    Ok(UnitFetcher::new(capability))
}

/// Lists units through one [`FetchCapability`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct UnitFetcher {
    capability: FetchCapability,
}

impl UnitFetcher {
    pub fn new(capability: FetchCapability) -> Self {
        Self { capability }
    }

    pub fn capability(&self) -> FetchCapability {
        self.capability
    }

    /// Units whose name matches any of `patterns` and, when `states` is non-empty, whose load,
    /// active or sub state equals one of `states`.
    ///
    /// An empty pattern set yields no units.
    pub async fn fetch<S: AsRef<str>>(
        &self,
        bus: &Bus,
        states: &[S],
        patterns: &PatternSet,
    ) -> Result<Vec<UnitDescriptor>> {
        if patterns.is_empty() {
            return Ok(Vec::new());
        }

        let states: Vec<&str> = states.iter().map(|s| s.as_ref()).collect();
        let rows = match self.capability {
            FetchCapability::ByPatterns => {
                bus.list_units_by_patterns(&states, &patterns.as_strs())
                    .await?
            }
            FetchCapability::Filtered => bus.list_units_filtered(&states).await?,
            FetchCapability::Unfiltered => bus.list_units().await?,
        };

        let units = rows.into_iter().map(UnitDescriptor::from_dbus).collect();
        let units = self.narrow(units, &states, patterns);

        #[cfg(feature = "tracing")]
        tracing::debug!(
            method = self.capability.method_name(),
            matched = units.len(),
            "listed units"
        );

        Ok(units)
    }

    /// Apply whatever filtering the bound method leaves to the client.
    pub(crate) fn narrow(
        &self,
        units: Vec<UnitDescriptor>,
        states: &[&str],
        patterns: &PatternSet,
    ) -> Vec<UnitDescriptor> {
        match self.capability {
            FetchCapability::ByPatterns => units,
            FetchCapability::Filtered => patterns.filter(units),
            FetchCapability::Unfiltered => {
                let units = patterns.filter(units);
                if states.is_empty() {
                    return units;
                }
                units
                    .into_iter()
                    .filter(|u| u.in_any_state(states))
                    .collect()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]
    #![allow(clippy::panic)]
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn manager_xml(methods: &[&str]) -> String {
        let methods: String = methods
            .iter()
            .map(|m| format!(r#"<method name="{m}"></method>"#))
            .collect();
        format!(
            r#"<!DOCTYPE node PUBLIC "-//freedesktop//DTD D-BUS Object Introspection 1.0//EN"
 "http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd">
<node>
 <interface name="org.freedesktop.DBus.Peer">
  <method name="Ping"/>
 </interface>
 <interface name="org.freedesktop.systemd1.Manager">
  {methods}
 </interface>
</node>"#
        )
    }

    fn units(rows: &[(&str, &str, &str, &str)]) -> Vec<UnitDescriptor> {
        rows.iter()
            .map(|(n, l, a, s)| UnitDescriptor::new(*n, l, a, s))
            .collect()
    }

    #[test]
    fn prefers_by_patterns_over_everything() {
        let xml = manager_xml(&["ListUnits", "ListUnitsFiltered", "ListUnitsByPatterns"]);
        let methods = manager_methods(&xml).expect("ok");
        assert_eq!(
            FetchCapability::select(&methods).expect("ok"),
            FetchCapability::ByPatterns
        );
    }

    #[test]
    fn falls_back_to_filtered_then_plain_listing() {
        let methods = manager_methods(&manager_xml(&["ListUnits", "ListUnitsFiltered"])).expect("ok");
        assert_eq!(
            FetchCapability::select(&methods).expect("ok"),
            FetchCapability::Filtered
        );

        let methods = manager_methods(&manager_xml(&["GetUnit", "ListUnits"])).expect("ok");
        assert_eq!(
            FetchCapability::select(&methods).expect("ok"),
            FetchCapability::Unfiltered
        );
    }

    #[test]
    fn no_listing_method_reports_discovered_set() {
        let methods =
            manager_methods(&manager_xml(&["GetUnit", "ListUnitsByNames"])).expect("ok");
        let err = FetchCapability::select(&methods).expect_err("must fail");
        let Error::Capability { methods } = err else {
            panic!("unexpected error: {err:?}");
        };
        assert_eq!(methods, ["ListUnitsByNames"]);
    }

    #[test]
    fn methods_of_other_interfaces_are_ignored() {
        let methods = manager_methods(&manager_xml(&[])).expect("ok");
        assert!(methods.is_empty());
        assert!(FetchCapability::select(&methods).is_err());
    }

    #[test]
    fn malformed_xml_is_a_parse_error() {
        let err = manager_methods("<node><interface").expect_err("must fail");
        assert!(matches!(err, Error::ParseError { .. }), "{err:?}");
    }

    #[test]
    fn unfiltered_fetcher_is_list_then_pattern_then_state_filter() {
        let all = units(&[
            ("nginx.service", "loaded", "active", "running"),
            ("nginx-debug.service", "loaded", "inactive", "dead"),
            ("redis.service", "loaded", "active", "running"),
            ("mysql.service", "loaded", "failed", "failed"),
        ]);
        let patterns = PatternSet::compile(&["nginx*", "mysql.service"]).expect("ok");
        let states = ["running", "failed"];

        let expected: Vec<UnitDescriptor> = patterns
            .filter(all.clone())
            .into_iter()
            .filter(|u| u.in_any_state(&states))
            .collect();

        let got = UnitFetcher::new(FetchCapability::Unfiltered).narrow(all, &states, &patterns);
        assert_eq!(got, expected);
        let names: Vec<&str> = got.iter().map(|u| u.name.as_str()).collect();
        assert_eq!(names, ["nginx.service", "mysql.service"]);
    }

    #[test]
    fn filtered_fetcher_leaves_states_to_the_manager() {
        let all = units(&[
            ("nginx.service", "loaded", "inactive", "dead"),
            ("redis.service", "loaded", "active", "running"),
        ]);
        let patterns = PatternSet::compile(&["nginx*"]).expect("ok");
        let got = UnitFetcher::new(FetchCapability::Filtered).narrow(all, &["active"], &patterns);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].name, "nginx.service");
    }
}
