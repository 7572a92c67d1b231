//! Workflow and campaign execution states.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a workflow or a campaign.
///
/// Observed transitions are monotone along
/// `New -> Planning -> Executing -> {Done | Failed | Canceled}`; once a
/// final state is reached the state never changes again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Submitted, not yet planned.
    New,
    /// The planner is computing a schedule.
    Planning,
    /// At least one workflow is executing.
    Executing,
    /// Finished successfully.
    Done,
    /// Execution failed.
    Failed,
    /// Canceled by the user.
    Canceled,
}

/// States from which no further transition happens.
pub const FINAL_STATES: [State; 3] = [State::Done, State::Failed, State::Canceled];

impl State {
    /// Whether this state is terminal.
    pub fn is_final(self) -> bool {
        matches!(self, State::Done | State::Failed | State::Canceled)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::New => "NEW",
            State::Planning => "PLANNING",
            State::Executing => "EXECUTING",
            State::Done => "DONE",
            State::Failed => "FAILED",
            State::Canceled => "CANCELED",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_states_are_terminal() {
        for state in FINAL_STATES {
            assert!(state.is_final());
        }
        assert!(!State::New.is_final());
        assert!(!State::Planning.is_final());
        assert!(!State::Executing.is_final());
    }
}
