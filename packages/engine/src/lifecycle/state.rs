// packages/engine/src/lifecycle/state.rs
//! Instance state machine

use crate::utils::errors::{EngineError, Result};
use crate::utils::ids::InstanceId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

const HISTORY_LIMIT: usize = 64;

/// Lifecycle state of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Pending,
    Running,
    Suspended,
    Terminated,
    Failed,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Pending => "pending",
            InstanceState::Running => "running",
            InstanceState::Suspended => "suspended",
            InstanceState::Terminated => "terminated",
            InstanceState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceState::Terminated | InstanceState::Failed)
    }

    /// Whether `self -> next` is an edge of the lifecycle graph
    ///
    /// `pending -> failed` covers a restore that fails during spawn and
    /// `suspended -> failed` a corrupted checkpoint on resume.
    pub fn can_transition_to(&self, next: InstanceState) -> bool {
        use InstanceState::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Running, Suspended)
                | (Running, Terminated)
                | (Running, Failed)
                | (Suspended, Running)
                | (Suspended, Terminated)
                | (Suspended, Failed)
        )
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One applied transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub from: InstanceState,
    pub to: InstanceState,
    pub at: DateTime<Utc>,
    pub reason: String,
}

/// Current state plus a bounded transition history
#[derive(Debug, Clone)]
pub struct StateMachine {
    state: InstanceState,
    history: VecDeque<Transition>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: InstanceState::Pending,
            history: VecDeque::new(),
        }
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    pub fn history(&self) -> impl Iterator<Item = &Transition> {
        self.history.iter()
    }

    /// Apply a transition, leaving the state untouched when the edge is invalid
    pub fn transition(
        &mut self,
        instance_id: &InstanceId,
        to: InstanceState,
        reason: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Result<Transition> {
        let from = self.state;
        if !from.can_transition_to(to) {
            return Err(EngineError::InvalidTransition {
                instance_id: instance_id.clone(),
                from,
                to,
            });
        }

        let transition = Transition {
            from,
            to,
            at,
            reason: reason.into(),
        };
        self.state = to;
        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(transition.clone());

        metrics::counter!(
            "agentcore_transitions_total",
            "from" => from.as_str(),
            "to" => to.as_str()
        )
        .increment(1);

        Ok(transition)
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ALL: [InstanceState; 5] = [
        InstanceState::Pending,
        InstanceState::Running,
        InstanceState::Suspended,
        InstanceState::Terminated,
        InstanceState::Failed,
    ];

    #[test]
    fn test_terminal_states_accept_nothing() {
        for terminal in [InstanceState::Terminated, InstanceState::Failed] {
            for next in ALL {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_pending_cannot_terminate() {
        assert!(!InstanceState::Pending.can_transition_to(InstanceState::Terminated));
        assert!(!InstanceState::Pending.can_transition_to(InstanceState::Suspended));

        let id = InstanceId::generate();
        let mut machine = StateMachine::new();
        let err = machine
            .transition(&id, InstanceState::Terminated, "abandoned", Utc::now())
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
        assert_eq!(machine.state(), InstanceState::Pending);
    }

    #[test]
    fn test_suspend_resume_cycle() {
        let id = InstanceId::generate();
        let mut machine = StateMachine::new();
        machine.transition(&id, InstanceState::Running, "spawned", Utc::now()).unwrap();
        machine.transition(&id, InstanceState::Suspended, "idle", Utc::now()).unwrap();
        machine.transition(&id, InstanceState::Running, "resumed", Utc::now()).unwrap();
        assert_eq!(machine.state(), InstanceState::Running);
        assert_eq!(machine.history().count(), 3);
    }

    #[test]
    fn test_invalid_transition_leaves_state() {
        let id = InstanceId::generate();
        let mut machine = StateMachine::new();
        let err = machine
            .transition(&id, InstanceState::Suspended, "too early", Utc::now())
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
        assert_eq!(machine.state(), InstanceState::Pending);
        assert_eq!(machine.history().count(), 0);
    }

    #[test]
    fn test_history_is_bounded() {
        let id = InstanceId::generate();
        let mut machine = StateMachine::new();
        machine.transition(&id, InstanceState::Running, "spawned", Utc::now()).unwrap();
        for _ in 0..100 {
            machine.transition(&id, InstanceState::Suspended, "s", Utc::now()).unwrap();
            machine.transition(&id, InstanceState::Running, "r", Utc::now()).unwrap();
        }
        assert_eq!(machine.history().count(), HISTORY_LIMIT);
    }

    proptest! {
        #[test]
        fn prop_state_only_moves_along_edges(steps in proptest::collection::vec(0usize..5, 0..40)) {
            let id = InstanceId::generate();
            let mut machine = StateMachine::new();
            for step in steps {
                let before = machine.state();
                let next = ALL[step];
                match machine.transition(&id, next, "prop", Utc::now()) {
                    Ok(t) => {
                        prop_assert!(before.can_transition_to(next));
                        prop_assert_eq!(t.from, before);
                        prop_assert_eq!(machine.state(), next);
                    }
                    Err(_) => {
                        prop_assert!(!before.can_transition_to(next));
                        prop_assert_eq!(machine.state(), before);
                    }
                }
            }
        }
    }
}
