//! EPG programs and finished recordings.

use serde::{Deserialize, Serialize};

use super::{ChannelId, InputId, ProgramId, RecordedProgramId, TimeRange};

/// A program airing on a channel, as listed by the EPG.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Program {
    pub id: ProgramId,
    pub channel_id: ChannelId,
    /// Stable series key shared by all episodes of a show.
    pub series_id: Option<String>,
    pub title: Option<String>,
    pub episode_title: Option<String>,
    pub season_number: Option<String>,
    pub episode_number: Option<String>,
    pub description: Option<String>,
    pub poster_uri: Option<String>,
    pub thumbnail_uri: Option<String>,
    pub start_ms: i64,
    pub end_ms: i64,
    pub recording_prohibited: bool,
}

impl Program {
    pub fn new(id: ProgramId, channel_id: ChannelId, start_ms: i64, end_ms: i64) -> Self {
        Self {
            id,
            channel_id,
            start_ms,
            end_ms,
            ..Default::default()
        }
    }

    pub fn with_series(mut self, series_id: impl Into<String>) -> Self {
        self.series_id = Some(series_id.into());
        self
    }

    pub fn with_episode(
        mut self,
        season_number: Option<&str>,
        episode_number: Option<&str>,
    ) -> Self {
        self.season_number = season_number.map(str::to_string);
        self.episode_number = episode_number.map(str::to_string);
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn time_range(&self) -> TimeRange {
        TimeRange::new(self.start_ms, self.end_ms)
    }

    /// A program is schedulable only when it has a real id and a non-empty
    /// time range.
    pub fn is_valid(&self) -> bool {
        self.id.is_set() && self.start_ms < self.end_ms
    }

    pub fn has_episode_number(&self) -> bool {
        self.season_number.is_some() || self.episode_number.is_some()
    }
}

/// A recording that has already been made.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RecordedProgram {
    pub id: RecordedProgramId,
    pub input_id: InputId,
    pub channel_id: ChannelId,
    pub program_id: Option<ProgramId>,
    pub series_id: Option<String>,
    pub title: Option<String>,
    pub episode_title: Option<String>,
    pub season_number: Option<String>,
    pub episode_number: Option<String>,
    pub start_ms: i64,
    pub end_ms: i64,
    /// The recording lost part of the program.
    pub clipped: bool,
}
