//! Task data model: one scheduled invocation of an action and its outcome.
//!
//! Transitions: `New → Running → Ok | Error`. The owning service's execution
//! worker is the only writer once a task has been dequeued.

pub mod archive;
pub mod queue;

use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Result, WardenError};
use crate::template::action::{ActionFailure, Args};

pub use archive::TaskArchive;
pub use queue::{TaskQueue, TaskWaiter};

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Lower value = more urgent.
pub type Priority = u8;

pub mod priority {
    use super::Priority;

    pub const SYSTEM: Priority = 0;
    pub const RECURRING: Priority = 5;
    pub const NORMAL: Priority = 10;
}

// ---------------------------------------------------------------------------
// TaskState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    New,
    Running,
    Ok,
    Error,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::New => "new",
            TaskState::Running => "running",
            TaskState::Ok => "ok",
            TaskState::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Ok | TaskState::Error)
    }

    fn can_become(self, next: TaskState) -> bool {
        matches!(
            (self, next),
            (TaskState::New, TaskState::Running)
                | (TaskState::Running, TaskState::Ok)
                | (TaskState::Running, TaskState::Error)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ErrorRecord
// ---------------------------------------------------------------------------

/// A captured action failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub category: String,
    pub message: String,
    #[serde(default)]
    pub stack_trace: String,
    pub count: u32,
    #[serde(with = "epoch")]
    pub first_seen: DateTime<Utc>,
    #[serde(with = "epoch")]
    pub last_seen: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn from_failure(failure: &ActionFailure, at: DateTime<Utc>) -> Self {
        let at = epoch::truncate(at);
        Self {
            category: failure.category.clone(),
            message: failure.message.clone(),
            stack_trace: failure.stack_trace.clone(),
            count: 1,
            first_seen: at,
            last_seen: at,
        }
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub guid: String,
    pub action_name: String,
    #[serde(default)]
    pub args: Args,
    pub priority: Priority,
    pub state: TaskState,
    #[serde(with = "epoch")]
    pub created: DateTime<Utc>,
    /// Seconds spent executing.
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error_record: Option<ErrorRecord>,
}

impl Task {
    pub fn new(action_name: impl Into<String>, args: Args) -> Self {
        Self {
            guid: Uuid::new_v4().to_string(),
            action_name: action_name.into(),
            args,
            priority: priority::NORMAL,
            state: TaskState::New,
            created: epoch::truncate(Utc::now()),
            duration: None,
            result: None,
            error_record: None,
        }
    }

    /// Move to `next`, refusing to leave a terminal state or go backwards.
    pub fn transition(&mut self, next: TaskState) -> Result<()> {
        if !self.state.can_become(next) {
            return Err(WardenError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        Ok(())
    }

    /// Record the outcome of a run that took `duration` seconds.
    pub fn finish(
        &mut self,
        outcome: std::result::Result<Value, ActionFailure>,
        duration: f64,
    ) -> Result<()> {
        self.duration = Some(duration);
        match outcome {
            Ok(value) => {
                self.transition(TaskState::Ok)?;
                self.result = Some(value);
            }
            Err(failure) => {
                self.transition(TaskState::Error)?;
                self.error_record = Some(ErrorRecord::from_failure(&failure, Utc::now()));
            }
        }
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

// ---------------------------------------------------------------------------
// Serde helpers for timestamps (serialized as epoch seconds: f64)
// ---------------------------------------------------------------------------

pub mod epoch {
    use super::*;

    /// Drop sub-microsecond precision so timestamps survive an f64 round-trip.
    pub fn truncate(ts: DateTime<Utc>) -> DateTime<Utc> {
        from_micros(ts.timestamp_micros())
    }

    pub fn to_secs(ts: &DateTime<Utc>) -> f64 {
        ts.timestamp_micros() as f64 / 1_000_000.0
    }

    pub fn from_secs(secs: f64) -> DateTime<Utc> {
        from_micros((secs * 1_000_000.0).round() as i64)
    }

    fn from_micros(micros: i64) -> DateTime<Utc> {
        Utc.timestamp_micros(micros).single().unwrap_or_default()
    }

    pub fn serialize<S>(ts: &DateTime<Utc>, s: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        s.serialize_f64(to_secs(ts))
    }

    pub fn deserialize<'de, D>(d: D) -> std::result::Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(d)?;
        Ok(from_secs(secs))
    }
}
