//! Series expansion: standing series rules turned into per-episode schedules.

mod engine;
mod episode;

pub use engine::{SeriesRecordingScheduler, add_schedule_to_series_recording};
pub use episode::{
    CandidateFilter, ScheduledEpisode, is_episode_scheduled, pick_one_program_per_episode,
    recorded_episodes,
};
