//! Per-group match statistics over parsed experiment groups.

use serde::Serialize;

use crate::{
    error::Error,
    outlog::{ExperimentGroup, ExperimentState},
};

/// Match statistics for one experiment group.
#[derive(Debug, Clone, Serialize)]
pub struct GroupSummary {
    /// First observed state of the group, describing the experiment.
    pub descriptor: ExperimentState,
    pub total: usize,
    pub matches: usize,
    /// `matches / total`.
    pub ratio: f64,
}

/// Computes one [`GroupSummary`] per group, in group order.
///
/// A group without observed states is a capture defect and yields
/// [`Error::EmptyGroup`] instead of a made-up ratio.
pub fn summarize(groups: &[ExperimentGroup]) -> Result<Vec<GroupSummary>, Error> {
    groups
        .iter()
        .enumerate()
        .map(|(index, group)| {
            let Some(first) = group.states.first() else {
                return Err(Error::EmptyGroup { index });
            };
            let total = group.states.len();
            let matches = group.states.iter().filter(|state| state.matches).count();
            Ok(GroupSummary {
                descriptor: first.clone(),
                total,
                matches,
                ratio: matches as f64 / total as f64,
            })
        })
        .collect()
}
