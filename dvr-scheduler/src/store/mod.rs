//! Schedule store.
//!
//! The store is the single owner of schedule and series records. Reads are
//! served synchronously from memory; every write is persisted through a
//! [`ScheduleRepository`] before memory is touched, and a [`StoreEvent`] is
//! published after memory is updated.

mod memory;
mod repository;

pub use memory::{IdGenerator, MemoryScheduleStore};
pub use repository::{InMemoryRepository, ScheduleRepository, StoreSnapshot};

use std::collections::HashSet;

use async_trait::async_trait;

use crate::Result;
use crate::domain::{
    ProgramId, RecordedProgram, RecordingState, ScheduleId, ScheduledRecording, SeriesRecording,
    SeriesRecordingId,
};
use crate::events::EventBroadcaster;

/// Change notifications, published in the order changes were applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// Initial load completed; reads now reflect persisted state.
    LoadFinished,
    SchedulesAdded(Vec<ScheduledRecording>),
    SchedulesRemoved(Vec<ScheduledRecording>),
    SchedulesStatusChanged(Vec<ScheduledRecording>),
    SeriesAdded(Vec<SeriesRecording>),
    SeriesRemoved(Vec<SeriesRecording>),
    SeriesChanged(Vec<SeriesRecording>),
}

impl StoreEvent {
    pub fn description(&self) -> String {
        match self {
            Self::LoadFinished => "Store load finished".to_string(),
            Self::SchedulesAdded(list) => format!("{} schedule(s) added", list.len()),
            Self::SchedulesRemoved(list) => format!("{} schedule(s) removed", list.len()),
            Self::SchedulesStatusChanged(list) => format!("{} schedule(s) changed", list.len()),
            Self::SeriesAdded(list) => format!("{} series added", list.len()),
            Self::SeriesRemoved(list) => format!("{} series removed", list.len()),
            Self::SeriesChanged(list) => format!("{} series changed", list.len()),
        }
    }
}

pub type StoreEventBroadcaster = EventBroadcaster<StoreEvent>;

/// Read/write contract of the schedule store.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    fn subscribe(&self) -> tokio::sync::broadcast::Receiver<StoreEvent>;
    fn is_loaded(&self) -> bool;

    // ========== Schedule reads ==========

    fn scheduled_recording(&self, id: ScheduleId) -> Option<ScheduledRecording>;
    /// Live (non-tombstone) schedule for a program.
    fn scheduled_recording_for_program(&self, program_id: ProgramId) -> Option<ScheduledRecording>;
    fn all_scheduled_recordings(&self) -> Vec<ScheduledRecording>;
    fn recordings_with_state(&self, states: &[RecordingState]) -> Vec<ScheduledRecording>;
    /// `NOT_STARTED` or `IN_PROGRESS` schedules ending after `now_ms`.
    fn available_scheduled_recordings(&self, now_ms: i64) -> Vec<ScheduledRecording>;
    fn started_recordings(&self, now_ms: i64) -> Vec<ScheduledRecording>;
    fn non_started_recordings(&self, now_ms: i64) -> Vec<ScheduledRecording>;
    fn scheduled_recordings_for_series(&self, id: SeriesRecordingId) -> Vec<ScheduledRecording>;
    /// Earliest start strictly after `now_ms` among available schedules.
    fn next_start_time_after(&self, now_ms: i64) -> Option<i64>;

    // ========== Tombstones ==========

    fn deleted_schedules(&self) -> Vec<ScheduledRecording>;
    fn disallowed_program_ids(&self) -> HashSet<ProgramId>;

    // ========== Series and recorded programs ==========

    fn series_recordings(&self) -> Vec<SeriesRecording>;
    fn series_recording(&self, id: SeriesRecordingId) -> Option<SeriesRecording>;
    fn series_recording_by_series_id(&self, series_id: &str) -> Option<SeriesRecording>;
    fn recorded_programs(&self) -> Vec<RecordedProgram>;

    // ========== Writes ==========

    /// Add schedules, assigning ids. Returns the stored copies.
    async fn add_scheduled_recordings(
        &self,
        schedules: Vec<ScheduledRecording>,
    ) -> Result<Vec<ScheduledRecording>>;
    async fn update_scheduled_recordings(&self, schedules: Vec<ScheduledRecording>) -> Result<()>;
    /// Remove schedules. Unless `force`, a not-started series episode becomes
    /// a `DELETED` tombstone instead of vanishing.
    async fn remove_scheduled_recordings(
        &self,
        schedules: Vec<ScheduledRecording>,
        force: bool,
    ) -> Result<()>;
    async fn change_state(&self, id: ScheduleId, state: RecordingState) -> Result<()>;

    async fn add_series_recording(&self, series: SeriesRecording) -> Result<SeriesRecording>;
    async fn update_series_recording(&self, series: SeriesRecording) -> Result<()>;
    async fn remove_series_recording(&self, id: SeriesRecordingId) -> Result<()>;

    async fn add_recorded_program(&self, program: RecordedProgram) -> Result<RecordedProgram>;
}
