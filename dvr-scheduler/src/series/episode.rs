//! Episode bookkeeping for series expansion: which episodes a series
//! already covers, which EPG programs are worth scheduling, and the
//! one-program-per-episode pick.

use std::collections::{HashMap, HashSet};

use crate::domain::{
    Program, ProgramId, RecordedProgram, RecordingState, ScheduledRecording, SeriesRecording,
    SeriesRecordingId,
};
use crate::store::ScheduleStore;

/// One episode of one series rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScheduledEpisode {
    pub series_recording_id: SeriesRecordingId,
    pub season_number: Option<String>,
    pub episode_number: Option<String>,
}

impl ScheduledEpisode {
    pub fn new(
        series_recording_id: SeriesRecordingId,
        season_number: Option<String>,
        episode_number: Option<String>,
    ) -> Self {
        Self {
            series_recording_id,
            season_number,
            episode_number,
        }
    }

    pub fn for_program(series_recording_id: SeriesRecordingId, program: &Program) -> Self {
        Self::new(
            series_recording_id,
            program.season_number.clone(),
            program.episode_number.clone(),
        )
    }

    pub fn for_recorded(series_recording_id: SeriesRecordingId, recorded: &RecordedProgram) -> Self {
        Self::new(
            series_recording_id,
            recorded.season_number.clone(),
            recorded.episode_number.clone(),
        )
    }

    /// `None` for schedules without a series back-reference.
    pub fn for_schedule(schedule: &ScheduledRecording) -> Option<Self> {
        schedule.series_recording_id.map(|id| {
            Self::new(
                id,
                schedule.season_number.clone(),
                schedule.episode_number.clone(),
            )
        })
    }

    /// Both season and episode number are present.
    pub fn is_complete(&self) -> bool {
        is_present(&self.season_number) && is_present(&self.episode_number)
    }
}

fn is_present(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.is_empty())
}

/// An episode only counts as scheduled when its key is complete.
pub fn is_episode_scheduled(scheduled: &HashSet<ScheduledEpisode>, episode: &ScheduledEpisode) -> bool {
    episode.is_complete() && scheduled.contains(episode)
}

/// Episodes of `series` already covered by a recorded program.
pub fn recorded_episodes(
    series: &SeriesRecording,
    recorded: &[RecordedProgram],
) -> HashSet<ScheduledEpisode> {
    recorded
        .iter()
        .filter(|p| p.series_id.as_deref() == Some(series.series_id.as_str()))
        .map(|p| ScheduledEpisode::for_recorded(series.id, p))
        .collect()
}

/// Decides which EPG programs are candidates for a set of series rules.
#[derive(Debug)]
pub struct CandidateFilter<'a> {
    series: &'a [SeriesRecording],
    disallowed: HashSet<ProgramId>,
    scheduled: HashSet<ScheduledEpisode>,
    now_ms: i64,
}

impl<'a> CandidateFilter<'a> {
    /// `extra_scheduled` marks additional episodes as covered, e.g. ones
    /// already recorded.
    pub fn new(
        store: &dyn ScheduleStore,
        series: &'a [SeriesRecording],
        extra_scheduled: HashSet<ScheduledEpisode>,
        now_ms: i64,
    ) -> Self {
        let series_ids: HashSet<SeriesRecordingId> = series.iter().map(|s| s.id).collect();
        let mut scheduled = extra_scheduled;
        scheduled.extend(
            store
                .all_scheduled_recordings()
                .iter()
                .filter(|s| {
                    !matches!(s.state, RecordingState::Failed | RecordingState::Clipped)
                })
                .filter_map(ScheduledEpisode::for_schedule)
                .filter(|e| series_ids.contains(&e.series_recording_id)),
        );
        Self {
            series,
            disallowed: store.disallowed_program_ids(),
            scheduled,
            now_ms,
        }
    }

    pub fn accepts(&self, program: &Program) -> bool {
        if program.start_ms <= self.now_ms
            || program.recording_prohibited
            || self.disallowed.contains(&program.id)
        {
            return false;
        }
        if !is_present(&program.season_number) && !is_present(&program.episode_number) {
            return false;
        }
        self.series.iter().any(|series| {
            series.matches_program(program)
                && !is_episode_scheduled(
                    &self.scheduled,
                    &ScheduledEpisode::for_program(series.id, program),
                )
        })
    }
}

/// Keep one program per episode, per series rule.
///
/// Programs lacking a season or episode number are all kept. Within an
/// episode, every program that already has a `NOT_STARTED` schedule is kept;
/// if none has, only the earliest one is.
pub fn pick_one_program_per_episode(
    store: &dyn ScheduleStore,
    series: &[SeriesRecording],
    programs: Vec<Program>,
) -> HashMap<SeriesRecordingId, Vec<Program>> {
    let mut result: HashMap<SeriesRecordingId, Vec<Program>> =
        series.iter().map(|s| (s.id, Vec::new())).collect();
    let by_series_id: HashMap<&str, SeriesRecordingId> =
        series.iter().map(|s| (s.series_id.as_str(), s.id)).collect();

    let is_scheduled = |program: &Program| {
        store
            .scheduled_recording_for_program(program.id)
            .is_some_and(|s| s.is_not_started())
    };

    let mut episodes: HashMap<ScheduledEpisode, Vec<Program>> = HashMap::new();
    for program in programs {
        let Some(&series_recording_id) = program.series_id.as_deref().and_then(|id| by_series_id.get(id))
        else {
            continue;
        };
        let episode = ScheduledEpisode::for_program(series_recording_id, &program);
        if !episode.is_complete() {
            result.entry(series_recording_id).or_default().push(program);
            continue;
        }
        episodes.entry(episode).or_default().push(program);
    }

    for (episode, mut candidates) in episodes {
        let picked = result.entry(episode.series_recording_id).or_default();
        let scheduled: Vec<Program> = candidates.iter().filter(|p| is_scheduled(p)).cloned().collect();
        if scheduled.is_empty() {
            candidates.sort_by_key(|p| (p.start_ms, p.id));
            picked.extend(candidates.into_iter().next());
        } else {
            picked.extend(scheduled);
        }
    }

    for programs in result.values_mut() {
        programs.sort_by_key(|p| (p.start_ms, p.id));
    }
    result
}
