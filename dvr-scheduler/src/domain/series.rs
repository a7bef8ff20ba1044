//! Series recording rules.

use serde::{Deserialize, Serialize};

use super::{ChannelId, InputId, Program, SeriesPriority, SeriesRecordingId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SeriesState {
    #[default]
    Normal,
    Canceled,
}

/// Channels a series rule records from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelOption {
    /// Only the rule's own channel.
    #[default]
    One,
    /// Any channel carrying the series.
    All,
}

/// Series metadata from an external lookup.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SeriesInfo {
    pub series_id: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub long_description: Option<String>,
    pub genres: Vec<String>,
    pub poster_uri: Option<String>,
    pub photo_uri: Option<String>,
}

/// A standing rule: record every episode of a series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesRecording {
    pub id: SeriesRecordingId,
    /// Stable series key shared with [`Program::series_id`].
    pub series_id: String,
    pub input_id: InputId,
    pub channel_id: ChannelId,
    pub channel_option: ChannelOption,
    pub priority: SeriesPriority,
    pub state: SeriesState,

    pub title: Option<String>,
    pub description: Option<String>,
    pub long_description: Option<String>,
    pub genres: Vec<String>,
    pub poster_uri: Option<String>,
    pub photo_uri: Option<String>,
}

impl SeriesRecording {
    pub fn new(series_id: impl Into<String>, input_id: InputId, channel_id: ChannelId) -> Self {
        Self {
            id: SeriesRecordingId::NOT_SET,
            series_id: series_id.into(),
            input_id,
            channel_id,
            channel_option: ChannelOption::One,
            priority: SeriesPriority::DEFAULT,
            state: SeriesState::Normal,
            title: None,
            description: None,
            long_description: None,
            genres: Vec::new(),
            poster_uri: None,
            photo_uri: None,
        }
    }

    /// Rule derived from one of the series' programs.
    pub fn for_program(input_id: InputId, program: &Program) -> Option<Self> {
        let series_id = program.series_id.clone()?;
        let mut series = Self::new(series_id, input_id, program.channel_id);
        series.title = program.title.clone();
        series.description = program.description.clone();
        series.poster_uri = program.poster_uri.clone();
        Some(series)
    }

    pub fn with_id(mut self, id: SeriesRecordingId) -> Self {
        self.id = id;
        self
    }

    pub fn with_priority(mut self, priority: SeriesPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_channel_option(mut self, option: ChannelOption) -> Self {
        self.channel_option = option;
        self
    }

    pub fn with_state(mut self, state: SeriesState) -> Self {
        self.state = state;
        self
    }

    pub fn is_canceled(&self) -> bool {
        self.state == SeriesState::Canceled
    }

    /// The program is an episode of this series on an eligible channel.
    pub fn matches_program(&self, program: &Program) -> bool {
        program.series_id.as_deref() == Some(self.series_id.as_str())
            && (self.channel_option == ChannelOption::All || program.channel_id == self.channel_id)
    }

    pub fn apply_info(&mut self, info: &SeriesInfo) {
        self.title = info.title.clone();
        self.description = info.description.clone();
        self.long_description = info.long_description.clone();
        self.genres = info.genres.clone();
        self.poster_uri = info.poster_uri.clone();
        self.photo_uri = info.photo_uri.clone();
    }
}
