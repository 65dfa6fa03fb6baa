//! Advisory job summary computed from the execution status histogram.
//!
//! The authoritative `Job.status` is written by the planner, the runner, and
//! rejection; this summary exists for the job detail endpoint.

use serde::Serialize;
use std::collections::BTreeMap;

use fleet_core::ExecutionStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Summary {
    Empty,
    Success,
    Failed,
    Partial,
    Queued,
    Running,
    New,
}

pub fn summarize(counts: &BTreeMap<ExecutionStatus, i64>) -> Summary {
    let get = |s: ExecutionStatus| counts.get(&s).copied().unwrap_or(0);

    let total: i64 = counts.values().sum();
    let done = get(ExecutionStatus::Success)
        + get(ExecutionStatus::Failed)
        + get(ExecutionStatus::Cancelled)
        + get(ExecutionStatus::Timeout)
        + get(ExecutionStatus::Blocked);

    if total == 0 {
        Summary::Empty
    } else if done == total
        && get(ExecutionStatus::Failed) == 0
        && get(ExecutionStatus::Blocked) == 0
        && get(ExecutionStatus::Timeout) == 0
    {
        Summary::Success
    } else if done == total && get(ExecutionStatus::Success) == 0 {
        Summary::Failed
    } else if done == total {
        Summary::Partial
    } else if get(ExecutionStatus::Queued) > 0 {
        Summary::Queued
    } else if get(ExecutionStatus::Running) > 0 {
        Summary::Running
    } else {
        Summary::New
    }
}

#[cfg(test)]
mod tests {
    use super::{summarize, Summary};
    use fleet_core::ExecutionStatus;
    use std::collections::BTreeMap;

    fn counts(pairs: &[(ExecutionStatus, i64)]) -> BTreeMap<ExecutionStatus, i64> {
        pairs.iter().copied().collect()
    }

    #[test]
    fn empty_job_is_empty() {
        assert_eq!(summarize(&BTreeMap::new()), Summary::Empty);
    }

    #[test]
    fn all_success_is_success() {
        let c = counts(&[(ExecutionStatus::Success, 3)]);
        assert_eq!(summarize(&c), Summary::Success);
    }

    #[test]
    fn cancelled_only_counts_as_failed() {
        let c = counts(&[(ExecutionStatus::Cancelled, 2)]);
        assert_eq!(summarize(&c), Summary::Failed);
    }

    #[test]
    fn blocked_beside_success_is_partial() {
        let c = counts(&[
            (ExecutionStatus::Success, 1),
            (ExecutionStatus::Blocked, 1),
        ]);
        assert_eq!(summarize(&c), Summary::Partial);
    }

    #[test]
    fn timeout_beside_success_is_partial() {
        let c = counts(&[
            (ExecutionStatus::Success, 2),
            (ExecutionStatus::Timeout, 1),
        ]);
        assert_eq!(summarize(&c), Summary::Partial);
    }

    #[test]
    fn queued_wins_over_running_while_in_flight() {
        let c = counts(&[
            (ExecutionStatus::Queued, 1),
            (ExecutionStatus::Running, 1),
            (ExecutionStatus::Success, 1),
        ]);
        assert_eq!(summarize(&c), Summary::Queued);
    }

    #[test]
    fn running_without_queued_is_running() {
        let c = counts(&[
            (ExecutionStatus::Running, 1),
            (ExecutionStatus::Success, 1),
        ]);
        assert_eq!(summarize(&c), Summary::Running);
    }

    #[test]
    fn new_only_is_new() {
        let c = counts(&[(ExecutionStatus::New, 4)]);
        assert_eq!(summarize(&c), Summary::New);
    }
}
