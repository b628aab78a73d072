use crate::errors::TransitionError;
use crate::models::job_state::{JobEvent, JobState, StateTransition};
use chrono::Utc;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Side effect run after a matching transition. Returning `Err` (or
/// panicking) is logged and recorded on the history entry, never propagated.
pub type TransitionHook = Arc<dyn Fn(&StateTransition) -> Result<(), String> + Send + Sync>;

/// Pure transition table.
///
/// Terminal states are checked before the table, so any event applied to
/// COMPLETED or CANCELLED yields `TerminalState` rather than
/// `InvalidTransition`.
pub fn next_state(current: Option<JobState>, event: JobEvent) -> Result<JobState, TransitionError> {
    use JobEvent as E;
    use JobState as S;

    let from = match current {
        None if event == E::Create => return Ok(S::Created),
        None => return Err(TransitionError::NotCreated(event)),
        Some(state) if state.is_terminal() => return Err(TransitionError::TerminalState(state)),
        Some(state) => state,
    };

    match (from, event) {
        (S::Created, E::Queue) => Ok(S::Queued),
        (S::Queued, E::Start) => Ok(S::Running),
        (S::Running, E::Pause) => Ok(S::Paused),
        (S::Paused, E::Resume) => Ok(S::Running),
        (S::Running, E::Complete) => Ok(S::Completed),
        (S::Running, E::Fail) => Ok(S::Failed),
        (S::Queued | S::Running, E::Cancel) => Ok(S::Cancelled),
        (S::Running, E::Timeout) => Ok(S::Timeout),
        (S::Failed, E::Retry) => Ok(S::Queued),
        _ => Err(TransitionError::InvalidTransition { from, event }),
    }
}

/// Lifecycle of a single job: current state, append-only history and
/// registered side-effect hooks.
#[derive(Clone, Default)]
pub struct JobStateMachine {
    current: Option<JobState>,
    history: Vec<StateTransition>,
    hooks: HashMap<(JobState, JobState), Vec<TransitionHook>>,
}

impl JobStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Machine positioned at a state read back from storage. History starts empty.
    pub fn restored(state: JobState) -> Self {
        Self {
            current: Some(state),
            ..Self::default()
        }
    }

    pub fn current(&self) -> Option<JobState> {
        self.current
    }

    pub fn history(&self) -> &[StateTransition] {
        &self.history
    }

    pub fn on_transition(&mut self, from: JobState, to: JobState, hook: TransitionHook) {
        self.hooks.entry((from, to)).or_default().push(hook);
    }

    pub fn transition(
        &mut self,
        event: JobEvent,
        metadata: serde_json::Value,
    ) -> Result<JobState, TransitionError> {
        let from = self.current;
        let to = next_state(from, event)?;

        let mut record = StateTransition {
            from,
            to,
            event,
            timestamp: Utc::now(),
            metadata,
            hook_failures: Vec::new(),
        };

        self.current = Some(to);

        if let Some(from) = from {
            if let Some(hooks) = self.hooks.get(&(from, to)) {
                for hook in hooks {
                    if let Err(failure) = run_hook(hook, &record) {
                        record.hook_failures.push(failure);
                    }
                }
            }
        }

        debug!("Job transition {:?} -> {} on '{}'", from, to, event);
        self.history.push(record);

        Ok(to)
    }
}

fn run_hook(hook: &TransitionHook, record: &StateTransition) -> Result<(), String> {
    match catch_unwind(AssertUnwindSafe(|| hook(record))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(message)) => {
            warn!(
                "Transition hook failed on '{}' -> {}: {}",
                record.event, record.to, message
            );
            Err(message)
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(
                "Transition hook panicked on '{}' -> {}: {}",
                record.event, record.to, message
            );
            Err(format!("hook panicked: {}", message))
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl fmt::Debug for JobStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobStateMachine")
            .field("current", &self.current)
            .field("history", &self.history)
            .field("hooks", &self.hooks.values().map(Vec::len).sum::<usize>())
            .finish()
    }
}
