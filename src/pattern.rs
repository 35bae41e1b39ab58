//! Shell-glob matching of unit names.
//!
//! Matching approximates the `fnmatch` semantics that `ListUnitsByPatterns` applies on the remote
//! side, so the resolved unit set does not depend on which listing method is available.

use crate::{Error, Result, UnitDescriptor};

use glob::{MatchOptions, Pattern};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// A compiled set of unit name globs.
#[derive(Clone, Debug)]
pub struct PatternSet {
    patterns: Vec<Pattern>,
}

impl PatternSet {
    /// Compile every pattern; the first malformed one fails the whole set.
    pub fn compile<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| {
                let p = p.as_ref();
                Pattern::new(p).map_err(|e| Error::InvalidPattern {
                    pattern: p.to_string(),
                    detail: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// The patterns as given, for server-side matching.
    pub fn as_strs(&self) -> Vec<&str> {
        self.patterns.iter().map(Pattern::as_str).collect()
    }

    /// True if `name` matches at least one pattern.
    pub fn matches(&self, name: &str) -> bool {
        self.patterns
            .iter()
            .any(|p| p.matches_with(name, MATCH_OPTIONS))
    }

    /// Keep the units whose name matches any pattern, preserving input order.
    pub fn filter(&self, units: Vec<UnitDescriptor>) -> Vec<UnitDescriptor> {
        units.into_iter().filter(|u| self.matches(&u.name)).collect()
    }
}

/// Return the subset of `units` whose name matches any of `patterns`.
pub fn match_units<S: AsRef<str>>(
    patterns: &[S],
    units: Vec<UnitDescriptor>,
) -> Result<Vec<UnitDescriptor>> {
    Ok(PatternSet::compile(patterns)?.filter(units))
}
