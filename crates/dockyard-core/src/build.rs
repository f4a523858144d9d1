//! Build and job records with their status machine.
//!
//! ```text
//! Pending ──► Running ──► Success | Failure | Error | Killed
//!    └──────────────────► Error | Killed
//! ```
//!
//! Terminal states are final and no state is re-entered.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Status of a build or one of its jobs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    Running,
    Success,
    Failure,
    Error,
    Killed,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Status::Success | Status::Failure | Status::Error | Status::Killed
        )
    }

    /// Whether moving from `self` to `next` is allowed.
    pub fn can_transition_to(self, next: Status) -> bool {
        match (self, next) {
            (Status::Pending, Status::Running) => true,
            (Status::Pending, Status::Error | Status::Killed) => true,
            (Status::Running, n) => n.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Running => "running",
            Status::Success => "success",
            Status::Failure => "failure",
            Status::Error => "error",
            Status::Killed => "killed",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected status transition.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid status transition {from} -> {to}")]
pub struct StatusError {
    pub from: Status,
    pub to: Status,
}

fn advance(current: &mut Status, next: Status) -> Result<(), StatusError> {
    if current.can_transition_to(next) {
        *current = next;
        Ok(())
    } else {
        Err(StatusError {
            from: *current,
            to: next,
        })
    }
}

/// What triggered a build.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BuildEvent {
    #[default]
    Push,
    PullRequest,
    Tag,
    Deployment,
}

/// A build: one commit, one or more jobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Build {
    pub id: i64,
    pub number: i64,
    #[serde(default)]
    pub event: BuildEvent,
    pub status: Status,
    #[serde(default)]
    pub commit: String,
    #[serde(default)]
    pub branch: String,
    /// Unix seconds; zero until set.
    #[serde(default)]
    pub started: u64,
    #[serde(default)]
    pub finished: u64,
}

impl Build {
    pub fn new(id: i64, number: i64) -> Self {
        Self {
            id,
            number,
            event: BuildEvent::Push,
            status: Status::Pending,
            commit: String::new(),
            branch: String::new(),
            started: 0,
            finished: 0,
        }
    }

    pub fn advance(&mut self, next: Status) -> Result<(), StatusError> {
        advance(&mut self.status, next)
    }
}

/// One matrix entry of a build, executed in its own agent container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: i64,
    pub build_id: i64,
    pub number: i64,
    pub status: Status,
    #[serde(default)]
    pub exit_code: i32,
    /// Pool host the job ran on.
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub started: u64,
    #[serde(default)]
    pub finished: u64,
}

impl Job {
    pub fn new(id: i64, build_id: i64, number: i64) -> Self {
        Self {
            id,
            build_id,
            number,
            status: Status::Pending,
            exit_code: 0,
            node_id: None,
            started: 0,
            finished: 0,
        }
    }

    pub fn advance(&mut self, next: Status) -> Result<(), StatusError> {
        advance(&mut self.status, next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_to_running_to_terminal() {
        let mut job = Job::new(1, 1, 1);
        job.advance(Status::Running).unwrap();
        job.advance(Status::Success).unwrap();
        assert_eq!(job.status, Status::Success);
    }

    #[test]
    fn terminal_states_are_final() {
        for terminal in [Status::Success, Status::Failure, Status::Error, Status::Killed] {
            for next in [
                Status::Pending,
                Status::Running,
                Status::Success,
                Status::Failure,
                Status::Error,
                Status::Killed,
            ] {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn states_are_not_reentered() {
        let mut build = Build::new(1, 1);
        build.advance(Status::Running).unwrap();
        let err = build.advance(Status::Running).unwrap_err();
        assert_eq!(err.from, Status::Running);
        assert_eq!(err.to, Status::Running);
    }

    #[test]
    fn pending_can_fail_without_running() {
        assert!(Status::Pending.can_transition_to(Status::Error));
        assert!(Status::Pending.can_transition_to(Status::Killed));
        assert!(!Status::Pending.can_transition_to(Status::Success));
        assert!(!Status::Pending.can_transition_to(Status::Failure));
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&Status::Killed).unwrap();
        assert_eq!(json, "\"killed\"");
        let event: BuildEvent = serde_json::from_str("\"pull_request\"").unwrap();
        assert_eq!(event, BuildEvent::PullRequest);
    }
}
