//! Scheduled recording entity.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use super::{
    ChannelId, InputId, Priority, Program, ProgramId, RecordedProgram, ScheduleId,
    SeriesRecordingId, TimeRange,
};
use crate::clock::ms_to_datetime;

/// Lifecycle state of a scheduled recording.
///
/// `NotStarted -> InProgress -> Finished`, with `Failed`, `Clipped` and
/// `Canceled` as alternate terminal states. `Deleted` is a tombstone kept
/// only for series episodes the user removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordingState {
    NotStarted,
    InProgress,
    Finished,
    Failed,
    Clipped,
    Canceled,
    Deleted,
}

impl RecordingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "NOT_STARTED",
            Self::InProgress => "IN_PROGRESS",
            Self::Finished => "FINISHED",
            Self::Failed => "FAILED",
            Self::Clipped => "CLIPPED",
            Self::Canceled => "CANCELED",
            Self::Deleted => "DELETED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "NOT_STARTED" => Some(Self::NotStarted),
            "IN_PROGRESS" => Some(Self::InProgress),
            "FINISHED" => Some(Self::Finished),
            "FAILED" => Some(Self::Failed),
            "CLIPPED" => Some(Self::Clipped),
            "CANCELED" => Some(Self::Canceled),
            "DELETED" => Some(Self::Deleted),
            _ => None,
        }
    }

    /// States that still compete for a tuner.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::NotStarted | Self::InProgress)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Finished | Self::Failed | Self::Clipped | Self::Canceled | Self::Deleted
        )
    }
}

impl std::fmt::Display for RecordingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Whether a schedule follows an EPG program or an explicit time range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleKind {
    Program,
    Timed,
}

/// A single recording instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledRecording {
    pub id: ScheduleId,
    pub input_id: InputId,
    pub channel_id: ChannelId,
    pub program_id: Option<ProgramId>,
    pub start_ms: i64,
    pub end_ms: i64,
    pub priority: Priority,
    pub state: RecordingState,
    pub series_recording_id: Option<SeriesRecordingId>,

    pub title: Option<String>,
    pub episode_title: Option<String>,
    pub season_number: Option<String>,
    pub episode_number: Option<String>,
    pub description: Option<String>,
    pub poster_uri: Option<String>,
    pub thumbnail_uri: Option<String>,
}

impl ScheduledRecording {
    /// Schedule covering an explicit time range on a channel.
    pub fn for_time_range(
        input_id: InputId,
        channel_id: ChannelId,
        start_ms: i64,
        end_ms: i64,
    ) -> Self {
        Self {
            id: ScheduleId::NOT_SET,
            input_id,
            channel_id,
            program_id: None,
            start_ms,
            end_ms,
            priority: Priority::default(),
            state: RecordingState::NotStarted,
            series_recording_id: None,
            title: None,
            episode_title: None,
            season_number: None,
            episode_number: None,
            description: None,
            poster_uri: None,
            thumbnail_uri: None,
        }
    }

    /// Schedule following an EPG program, copying its display metadata.
    pub fn for_program(input_id: InputId, program: &Program) -> Self {
        Self {
            program_id: Some(program.id),
            title: program.title.clone(),
            episode_title: program.episode_title.clone(),
            season_number: program.season_number.clone(),
            episode_number: program.episode_number.clone(),
            description: program.description.clone(),
            poster_uri: program.poster_uri.clone(),
            thumbnail_uri: program.thumbnail_uri.clone(),
            ..Self::for_time_range(input_id, program.channel_id, program.start_ms, program.end_ms)
        }
    }

    /// Finished schedule standing for an already recorded program.
    pub fn for_recorded_program(recorded: &RecordedProgram) -> Self {
        Self {
            program_id: recorded.program_id,
            state: RecordingState::Finished,
            title: recorded.title.clone(),
            episode_title: recorded.episode_title.clone(),
            season_number: recorded.season_number.clone(),
            episode_number: recorded.episode_number.clone(),
            ..Self::for_time_range(
                recorded.input_id.clone(),
                recorded.channel_id,
                recorded.start_ms,
                recorded.end_ms,
            )
        }
    }

    pub fn with_id(mut self, id: ScheduleId) -> Self {
        self.id = id;
        self
    }

    pub fn with_priority(mut self, priority: impl Into<Priority>) -> Self {
        self.priority = priority.into();
        self
    }

    pub fn with_state(mut self, state: RecordingState) -> Self {
        self.state = state;
        self
    }

    pub fn with_series(mut self, series_recording_id: Option<SeriesRecordingId>) -> Self {
        self.series_recording_id = series_recording_id;
        self
    }

    pub fn with_time(mut self, start_ms: i64, end_ms: i64) -> Self {
        self.start_ms = start_ms;
        self.end_ms = end_ms;
        self
    }

    pub fn kind(&self) -> ScheduleKind {
        if self.program_id.is_some() {
            ScheduleKind::Program
        } else {
            ScheduleKind::Timed
        }
    }

    pub fn time_range(&self) -> TimeRange {
        TimeRange::new(self.start_ms, self.end_ms)
    }

    pub fn duration_ms(&self) -> i64 {
        self.end_ms.saturating_sub(self.start_ms)
    }

    pub fn is_overlapping(&self, range: &TimeRange) -> bool {
        self.time_range().overlaps(range)
    }

    pub fn is_not_started(&self) -> bool {
        self.state == RecordingState::NotStarted
    }

    pub fn is_in_progress(&self) -> bool {
        self.state == RecordingState::InProgress
    }

    pub fn is_canceled(&self) -> bool {
        self.state == RecordingState::Canceled
    }

    /// The schedule stands for the same recording as `other`: same program,
    /// or same channel and time range when not tied to a program.
    pub fn is_same_recording(&self, other: &ScheduledRecording) -> bool {
        match self.kind() {
            ScheduleKind::Program => self.program_id == other.program_id,
            ScheduleKind::Timed => {
                self.channel_id == other.channel_id
                    && self.start_ms == other.start_ms
                    && self.end_ms == other.end_ms
            }
        }
    }

    pub fn display_start(&self) -> String {
        ms_to_datetime(self.start_ms).to_rfc3339()
    }
}

/// Ascending by priority, then by id. A newer schedule (higher id) ranks
/// above an older one of equal priority.
pub fn priority_cmp(a: &ScheduledRecording, b: &ScheduledRecording) -> Ordering {
    a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id))
}

/// Ascending by start time, then by descending priority, then by id.
pub fn start_then_priority_cmp(a: &ScheduledRecording, b: &ScheduledRecording) -> Ordering {
    a.start_ms
        .cmp(&b.start_ms)
        .then_with(|| b.priority.cmp(&a.priority))
        .then_with(|| a.id.cmp(&b.id))
}

/// Ascending by end time.
pub fn end_time_cmp(a: &ScheduledRecording, b: &ScheduledRecording) -> Ordering {
    a.end_ms.cmp(&b.end_ms)
}
