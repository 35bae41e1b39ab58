use crate::{DispatchError, Error, JobResult, Result, UnitFailure};

/// A finished job for one unit.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub struct UnitCompletion {
    pub unit: String,
    pub job_id: u32,
    pub job_path: String,
    pub result: JobResult,
}

/// Per-unit outcomes of one dispatch, in the order the units were given.
#[derive(Debug, Default)]
#[non_exhaustive]
pub struct DispatchReport {
    pub completed: Vec<UnitCompletion>,
    pub failures: Vec<UnitFailure>,
}

impl DispatchReport {
    pub(crate) fn push(&mut self, unit: String, outcome: Result<UnitCompletion>) {
        match outcome {
            Ok(done) => self.completed.push(done),
            Err(error) => self.failures.push(UnitFailure { unit, error }),
        }
    }

    /// Number of units that were dispatched.
    pub fn total(&self) -> usize {
        self.completed.len() + self.failures.len()
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Collapse into the terminal result: `Err(Error::Dispatch)` iff at least one unit failed.
    pub fn into_result(self) -> Result<Vec<UnitCompletion>> {
        if self.failures.is_empty() {
            return Ok(self.completed);
        }
        Err(Error::Dispatch(DispatchError {
            failures: self.failures,
            completed: self.completed,
        }))
    }
}
