//! Priority value objects.
//!
//! Priorities are plain integers where a higher value wins. Two bands keep
//! manually scheduled episodes and series rules apart:
//!
//! - [`EpisodePriority`] values are `>= EpisodePriority::FLOOR`.
//! - [`SeriesPriority`] values are `< EpisodePriority::FLOOR`.
//!
//! Suggestions step by [`PRIORITY_OFFSET`] so inserting between two existing
//! priorities rarely requires renumbering.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Gap between consecutive suggested priorities.
pub const PRIORITY_OFFSET: i64 = 1024;

/// Priority of a scheduled recording. Higher wins.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Priority(pub i64);

impl Priority {
    pub const MIN: Self = Self(i64::MIN);
    pub const MAX: Self = Self(i64::MAX);

    pub fn get(self) -> i64 {
        self.0
    }

    /// One step above `self`, saturating at `i64::MAX`.
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    pub fn is_episode_band(self) -> bool {
        self.0 >= EpisodePriority::FLOOR
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Priority in the episode band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct EpisodePriority(i64);

impl EpisodePriority {
    /// Lowest value of the band. Also the default episode priority.
    pub const FLOOR: i64 = i64::MAX >> 1;
    pub const DEFAULT: Self = Self(Self::FLOOR);

    pub fn new(value: i64) -> Option<Self> {
        (value >= Self::FLOOR).then_some(Self(value))
    }

    /// Suggest a priority above `highest`, the current maximum over all
    /// schedules (`None` when there are none).
    pub fn above(highest: Option<Priority>) -> Self {
        let base = highest
            .map(Priority::get)
            .unwrap_or(i64::MIN)
            .max(Self::FLOOR - PRIORITY_OFFSET);
        Self(base.saturating_add(PRIORITY_OFFSET))
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl Default for EpisodePriority {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl From<EpisodePriority> for Priority {
    fn from(value: EpisodePriority) -> Self {
        Priority(value.0)
    }
}

impl From<EpisodePriority> for i64 {
    fn from(value: EpisodePriority) -> Self {
        value.0
    }
}

impl TryFrom<i64> for EpisodePriority {
    type Error = String;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value).ok_or_else(|| format!("{} is below the episode priority band", value))
    }
}

/// Priority in the series band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct SeriesPriority(i64);

impl SeriesPriority {
    /// Highest value of the band.
    pub const CEILING: i64 = EpisodePriority::FLOOR - 1;
    pub const DEFAULT: Self = Self(EpisodePriority::FLOOR >> 1);

    pub fn new(value: i64) -> Option<Self> {
        (value <= Self::CEILING).then_some(Self(value))
    }

    /// Suggest a priority above `highest`, the current maximum over all
    /// series recordings (`None` when there are none).
    pub fn above(highest: Option<SeriesPriority>) -> Self {
        let base = highest
            .map(SeriesPriority::get)
            .unwrap_or(i64::MIN)
            .max(Self::DEFAULT.0 - PRIORITY_OFFSET);
        Self(base.saturating_add(PRIORITY_OFFSET).min(Self::CEILING))
    }

    /// Priority for the series at position `order` in a user-defined ranking.
    pub fn for_order(order: i64) -> Self {
        let value = order
            .saturating_mul(PRIORITY_OFFSET)
            .saturating_add(Self::DEFAULT.0);
        Self(value.min(Self::CEILING))
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl Default for SeriesPriority {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl From<SeriesPriority> for Priority {
    fn from(value: SeriesPriority) -> Self {
        Priority(value.0)
    }
}

impl From<SeriesPriority> for i64 {
    fn from(value: SeriesPriority) -> Self {
        value.0
    }
}

impl TryFrom<i64> for SeriesPriority {
    type Error = String;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value).ok_or_else(|| format!("{} is above the series priority band", value))
    }
}

impl fmt::Display for SeriesPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
