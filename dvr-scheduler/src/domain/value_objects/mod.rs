//! Domain value objects.

mod ids;
mod priority;
mod time_range;

pub use ids::{ChannelId, InputId, ProgramId, RecordedProgramId, ScheduleId, SeriesRecordingId};
pub use priority::{EpisodePriority, PRIORITY_OFFSET, Priority, SeriesPriority};
pub use time_range::TimeRange;
