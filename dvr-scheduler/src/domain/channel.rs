//! Channel and input metadata.

use serde::{Deserialize, Serialize};

use super::{ChannelId, InputId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    /// Input that serves this channel.
    pub input_id: InputId,
    pub display_name: String,
    pub display_number: Option<String>,
}

impl Channel {
    pub fn new(id: ChannelId, input_id: InputId, display_name: impl Into<String>) -> Self {
        Self {
            id,
            input_id,
            display_name: display_name.into(),
            display_number: None,
        }
    }
}

/// Live capability of a tuner-bearing input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputInfo {
    pub id: InputId,
    pub tuner_count: usize,
    pub can_record: bool,
}

impl InputInfo {
    pub fn new(id: InputId, tuner_count: usize) -> Self {
        Self {
            id,
            tuner_count,
            can_record: true,
        }
    }

    /// Tuners available for recording right now.
    pub fn recording_tuner_count(&self) -> usize {
        if self.can_record { self.tuner_count } else { 0 }
    }
}
