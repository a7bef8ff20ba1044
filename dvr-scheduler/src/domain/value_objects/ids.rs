//! Identifier newtypes.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            /// Placeholder for an id the store has not assigned yet.
            pub const NOT_SET: Self = Self(0);

            pub fn get(self) -> i64 {
                self.0
            }

            pub fn is_set(self) -> bool {
                self != Self::NOT_SET
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }
    };
}

numeric_id!(
    /// Identity of a [`ScheduledRecording`](crate::domain::ScheduledRecording).
    ScheduleId
);
numeric_id!(
    /// Identity of a [`SeriesRecording`](crate::domain::SeriesRecording).
    SeriesRecordingId
);
numeric_id!(
    /// Identity of an EPG program instance.
    ProgramId
);
numeric_id!(ChannelId);
numeric_id!(RecordedProgramId);

/// Identity of a tuner-bearing input.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InputId(String);

impl InputId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InputId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for InputId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_set() {
        assert!(!ScheduleId::NOT_SET.is_set());
        assert!(ScheduleId(3).is_set());
        assert_eq!(ScheduleId::default(), ScheduleId::NOT_SET);
    }

    #[test]
    fn test_serialization_is_transparent() {
        assert_eq!(serde_json::to_string(&ChannelId(7)).unwrap(), "7");
        assert_eq!(
            serde_json::to_string(&InputId::new("tuner.hdhr")).unwrap(),
            "\"tuner.hdhr\""
        );
    }
}
