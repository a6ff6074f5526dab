//! Task lifecycle state machine
//!
//! A task moves through the pipeline as
//! `Intake -> Sanitized -> Crawled -> Postprocessed -> Stored`, and from
//! `Stored` it either stays there (done), moves to `Abandoned`, or takes the
//! retry edge `Stored -> Retrying -> Sanitized` and runs again.

use serde::{Serialize, Deserialize};
use std::fmt;
use thiserror::Error;

use crate::crawler::task::Task;

/// Failure codes assigned by the pipeline itself
pub mod failure_code {
    /// The pipeline was cancelled before the attempt could run
    pub const CANCELLED: &str = "Cancelled";

    /// The working directory could not be prepared
    pub const WORKING_DIR: &str = "WorkingDirFailed";

    /// Storing a successful crawl failed
    pub const STORAGE: &str = "StorageFailed";

    /// The browser panicked during the crawl
    pub const CRAWL_PANICKED: &str = "CrawlPanicked";
}

/// Lifecycle states of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    Intake,
    Sanitized,
    Crawled,
    Postprocessed,
    Stored,
    Retrying,
    Abandoned,
}

impl TaskState {
    /// Whether moving from `self` to `next` is a legal edge
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Intake, Sanitized)
                | (Sanitized, Crawled)
                | (Crawled, Postprocessed)
                | (Postprocessed, Stored)
                | (Stored, Retrying)
                | (Stored, Abandoned)
                | (Retrying, Sanitized)
        )
    }

    /// No further pipeline work will happen for the task
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stored | Self::Abandoned)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Intake => "intake",
            Self::Sanitized => "sanitized",
            Self::Crawled => "crawled",
            Self::Postprocessed => "postprocessed",
            Self::Stored => "stored",
            Self::Retrying => "retrying",
            Self::Abandoned => "abandoned",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid task state transition: {from} -> {to}")]
pub struct LifecycleError {
    pub from: TaskState,
    pub to: TaskState,
}

/// Outcome of the storage stage for one attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// The attempt succeeded; the task is done
    Completed,

    /// The task must be re-injected at the front of the pipeline
    Retry,

    /// The task failed for the last time
    Abandoned { failure_codes: Vec<String> },
}

impl Task {
    /// Move the task to `next`, rejecting edges the lifecycle does not allow
    pub fn advance(&mut self, next: TaskState) -> Result<(), LifecycleError> {
        if !self.state.can_transition_to(next) {
            return Err(LifecycleError { from: self.state, to: next });
        }
        self.state = next;
        Ok(())
    }

    /// Decide what happens to a stored attempt
    ///
    /// Must be called with the task in `Stored`. A failed task with attempts
    /// left is squashed for retry: the attempt counter is bumped, the current
    /// failure code moves into the history and the failure flag is cleared.
    pub fn resolve(&mut self) -> Result<Disposition, LifecycleError> {
        if !self.failed {
            if self.state != TaskState::Stored {
                return Err(LifecycleError { from: self.state, to: TaskState::Stored });
            }
            return Ok(Disposition::Completed);
        }

        if self.current_attempt >= self.max_attempts {
            return self.abandon();
        }

        self.advance(TaskState::Retrying)?;
        self.current_attempt += 1;
        self.failed = false;
        let code = self.failure_code.take().unwrap_or_default();
        self.past_failure_codes.push(code);
        Ok(Disposition::Retry)
    }

    /// Give up on the task regardless of remaining attempts
    pub fn abandon(&mut self) -> Result<Disposition, LifecycleError> {
        self.advance(TaskState::Abandoned)?;
        Ok(Disposition::Abandoned { failure_codes: self.failure_history() })
    }
}
