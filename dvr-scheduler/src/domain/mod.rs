//! Domain layer: entities and value objects shared by every component.

pub mod channel;
pub mod program;
pub mod schedule;
pub mod series;
pub mod value_objects;

pub use channel::{Channel, InputInfo};
pub use program::{Program, RecordedProgram};
pub use schedule::{RecordingState, ScheduleKind, ScheduledRecording};
pub use series::{ChannelOption, SeriesInfo, SeriesRecording, SeriesState};
pub use value_objects::*;
