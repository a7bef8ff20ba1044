//! Message types exchanged with input schedulers and recording tasks.

use serde::Serialize;
use tokio::sync::oneshot;

use crate::domain::{InputId, RecordingState, ScheduleId, ScheduledRecording};

/// Messages processed by an [`InputTaskScheduler`](super::InputTaskScheduler).
#[derive(Debug)]
pub enum InputMessage {
    /// Start tracking a schedule.
    Add(ScheduledRecording),
    /// Stop tracking a schedule, cancelling its task if one is running.
    Remove(ScheduledRecording),
    /// Replace the tracked copy of a schedule.
    Update(ScheduledRecording),
    /// Drop tracked schedules missing from this pending set and refresh the rest.
    Reconcile(Vec<ScheduledRecording>),
    /// Re-run admission now.
    Rebuild,
    /// A recording task ended.
    TaskFinished {
        id: ScheduleId,
        /// Distinguishes restarts of the same schedule.
        seq: u64,
        outcome: RecordingOutcome,
    },
    /// Ask the running task for a schedule to stop.
    StopTask(ScheduleId),
    /// Query current state (response sent via oneshot channel).
    GetState(oneshot::Sender<InputSchedulerState>),
    /// Request graceful shutdown.
    Stop,
}

/// Commands delivered to a running recording task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskCommand {
    /// The schedule changed in a way compatible with the running recording.
    Update(ScheduledRecording),
    /// Finish early, keeping what was recorded.
    Stop,
    /// Abandon the recording.
    Cancel,
}

/// How a recording task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordingOutcome {
    Finished,
    /// Part of the program was lost.
    Clipped,
    Failed(String),
    Canceled,
}

impl RecordingOutcome {
    pub fn state(&self) -> RecordingState {
        match self {
            Self::Finished => RecordingState::Finished,
            Self::Clipped => RecordingState::Clipped,
            Self::Failed(_) => RecordingState::Failed,
            Self::Canceled => RecordingState::Canceled,
        }
    }
}

/// State transition requested by an input scheduler, applied to the store
/// by the control loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateReport {
    pub input_id: InputId,
    pub schedule_id: ScheduleId,
    pub state: RecordingState,
    pub reason: Option<String>,
}

/// Snapshot of an input scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InputSchedulerState {
    pub input_id: InputId,
    /// Waiting schedules, by id.
    pub waiting: Vec<ScheduleId>,
    /// Schedules with a running task, by id.
    pub active: Vec<ScheduleId>,
    /// Running tasks that were asked to stop or cancel.
    pub stopping: Vec<ScheduleId>,
    pub next_rebuild_at_ms: Option<i64>,
}
