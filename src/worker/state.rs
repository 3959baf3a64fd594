//! Execution context state machine.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::worker::context::ContextId;

/// Cap on recorded transitions per context.
const MAX_TRANSITIONS: usize = 64;

/// State of an execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextState {
    /// Ready for a request.
    Idle,
    /// Running exactly one request.
    Busy,
    /// Gone; never reused.
    Terminated,
}

impl ContextState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: ContextState) -> bool {
        use ContextState::*;

        matches!(
            (self, target),
            (Idle, Busy) | (Idle, Terminated) |
            (Busy, Idle) | (Busy, Terminated)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated)
    }

    /// Whether a request may be dispatched to a context in this state.
    pub fn accepts_work(&self) -> bool {
        matches!(self, Self::Idle)
    }
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Terminated => "terminated",
        };
        write!(f, "{s}")
    }
}

/// A state transition event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: ContextState,
    pub to: ContextState,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Lifecycle record of one execution context, owned by the manager.
#[derive(Debug, Clone, Serialize)]
pub struct ContextLifecycle {
    pub context_id: ContextId,
    pub state: ContextState,
    pub spawned_at: DateTime<Utc>,
    pub terminated_at: Option<DateTime<Utc>>,
    /// Requests this context has finished.
    pub tasks_completed: u64,
    pub transitions: Vec<StateTransition>,
}

impl ContextLifecycle {
    pub fn new(context_id: ContextId) -> Self {
        Self {
            context_id,
            state: ContextState::Idle,
            spawned_at: Utc::now(),
            terminated_at: None,
            tasks_completed: 0,
            transitions: Vec::new(),
        }
    }

    /// Transition to a new state.
    pub fn transition_to(
        &mut self,
        new_state: ContextState,
        reason: Option<String>,
    ) -> Result<(), String> {
        if !self.state.can_transition_to(new_state) {
            return Err(format!(
                "Context {} cannot transition from {} to {}",
                self.context_id, self.state, new_state
            ));
        }

        self.transitions.push(StateTransition {
            from: self.state,
            to: new_state,
            timestamp: Utc::now(),
            reason,
        });
        if self.transitions.len() > MAX_TRANSITIONS {
            let drain_count = self.transitions.len() - MAX_TRANSITIONS;
            self.transitions.drain(..drain_count);
        }

        if self.state == ContextState::Busy && new_state == ContextState::Idle {
            self.tasks_completed += 1;
        }
        if new_state == ContextState::Terminated {
            self.terminated_at = Some(Utc::now());
        }

        self.state = new_state;
        Ok(())
    }
}
