use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::QueueError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Complete,
    Failed,
    Error,
    Inactive,
    Killed,
    Deferred,
}

impl JobState {
    pub const ALL: [JobState; 8] = [
        JobState::Pending,
        JobState::Running,
        JobState::Complete,
        JobState::Failed,
        JobState::Error,
        JobState::Inactive,
        JobState::Killed,
        JobState::Deferred,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Complete => "complete",
            JobState::Failed => "failed",
            JobState::Error => "error",
            JobState::Inactive => "inactive",
            JobState::Killed => "killed",
            JobState::Deferred => "deferred",
        }
    }

    /// Final states. A job never leaves them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Complete | JobState::Error | JobState::Inactive | JobState::Killed
        )
    }

    /// Non-terminal states waiting for `query_at` before the next run.
    pub fn is_waiting(&self) -> bool {
        matches!(self, JobState::Failed | JobState::Deferred)
    }

    /// Terminal states that can be restarted as a fresh job.
    pub fn is_stopped(&self) -> bool {
        matches!(
            self,
            JobState::Killed | JobState::Inactive | JobState::Error
        )
    }

    /// States a worker may pick a job up from.
    pub fn is_dispatchable(&self) -> bool {
        matches!(
            self,
            JobState::Pending | JobState::Failed | JobState::Deferred
        )
    }

    pub fn can_transition_to(&self, next: JobState) -> bool {
        match self {
            JobState::Pending | JobState::Failed | JobState::Deferred => {
                next == JobState::Running
            }
            JobState::Running => matches!(
                next,
                JobState::Complete
                    | JobState::Failed
                    | JobState::Error
                    | JobState::Inactive
                    | JobState::Killed
                    | JobState::Deferred
            ),
            JobState::Complete | JobState::Error | JobState::Inactive | JobState::Killed => false,
        }
    }

    pub(crate) fn check_transition(&self, next: JobState) -> Result<(), QueueError> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(QueueError::conflict(format!(
                "illegal transition [{}] -> [{}]",
                self, next
            )))
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| QueueError::validation(format!("unknown job state [{}]", s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        for from in JobState::ALL.iter().filter(|s| s.is_terminal()) {
            for to in JobState::ALL {
                assert!(!from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn running_is_the_only_way_out_of_waiting() {
        for from in [JobState::Pending, JobState::Failed, JobState::Deferred] {
            let next: Vec<_> = JobState::ALL
                .into_iter()
                .filter(|to| from.can_transition_to(*to))
                .collect();
            assert_eq!(next, vec![JobState::Running]);
        }
    }

    #[test]
    fn running_reaches_every_outcome() {
        let outcomes: Vec<_> = JobState::ALL
            .into_iter()
            .filter(|to| JobState::Running.can_transition_to(*to))
            .collect();
        assert_eq!(outcomes.len(), 6);
        assert!(!outcomes.contains(&JobState::Pending));
        assert!(!outcomes.contains(&JobState::Running));
    }

    #[test]
    fn state_classification() {
        assert!(JobState::Failed.is_waiting());
        assert!(JobState::Deferred.is_waiting());
        assert!(!JobState::Pending.is_waiting());
        assert!(JobState::Killed.is_stopped());
        assert!(JobState::Inactive.is_stopped());
        assert!(JobState::Error.is_stopped());
        assert!(!JobState::Complete.is_stopped());
        assert!(JobState::Complete.is_terminal());
    }

    #[test]
    fn parse_round_trips_names() {
        assert_eq!("deferred".parse::<JobState>().unwrap(), JobState::Deferred);
        assert!("skipped".parse::<JobState>().is_err());
        assert_eq!(JobState::Killed.to_string(), "killed");
    }
}
