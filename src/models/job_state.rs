use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of an analysis job
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Created,
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl JobState {
    pub const ALL: [JobState; 8] = [
        JobState::Created,
        JobState::Queued,
        JobState::Running,
        JobState::Paused,
        JobState::Completed,
        JobState::Failed,
        JobState::Cancelled,
        JobState::Timeout,
    ];

    /// COMPLETED and CANCELLED accept no further events.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Cancelled)
    }

    /// States counted as in-flight by duplicate detection and cancellation.
    pub fn is_active(self) -> bool {
        matches!(self, JobState::Queued | JobState::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Created => "created",
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Paused => "paused",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
            JobState::Timeout => "timeout",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("Unknown job state: {}", s))
    }
}

/// Events that drive the job state machine
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobEvent {
    Create,
    Queue,
    Start,
    Pause,
    Resume,
    Complete,
    Fail,
    Cancel,
    Timeout,
    Retry,
}

impl JobEvent {
    pub const ALL: [JobEvent; 10] = [
        JobEvent::Create,
        JobEvent::Queue,
        JobEvent::Start,
        JobEvent::Pause,
        JobEvent::Resume,
        JobEvent::Complete,
        JobEvent::Fail,
        JobEvent::Cancel,
        JobEvent::Timeout,
        JobEvent::Retry,
    ];
}

impl fmt::Display for JobEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobEvent::Create => "create",
            JobEvent::Queue => "queue",
            JobEvent::Start => "start",
            JobEvent::Pause => "pause",
            JobEvent::Resume => "resume",
            JobEvent::Complete => "complete",
            JobEvent::Fail => "fail",
            JobEvent::Cancel => "cancel",
            JobEvent::Timeout => "timeout",
            JobEvent::Retry => "retry",
        };
        f.write_str(name)
    }
}

/// One entry of a state machine's append-only history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateTransition {
    /// `None` only for the initial CREATE transition
    pub from: Option<JobState>,
    pub to: JobState,
    pub event: JobEvent,
    pub timestamp: DateTime<Utc>,
    pub metadata: serde_json::Value,
    /// Errors raised by side-effect hooks; they never block the transition
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hook_failures: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_string_round_trip() {
        for state in JobState::ALL {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert_eq!("RUNNING".parse::<JobState>().unwrap(), JobState::Running);
        assert!("finished".parse::<JobState>().is_err());
    }

    #[test]
    fn test_terminal_and_active_states() {
        let terminal: Vec<_> = JobState::ALL.into_iter().filter(|s| s.is_terminal()).collect();
        assert_eq!(terminal, vec![JobState::Completed, JobState::Cancelled]);

        assert!(JobState::Queued.is_active());
        assert!(JobState::Running.is_active());
        assert!(!JobState::Failed.is_active());
    }

    #[test]
    fn test_state_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&JobState::Timeout).unwrap(), "\"timeout\"");
    }
}
