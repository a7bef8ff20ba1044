//! Conflict resolution.
//!
//! Pure functions deciding which of a set of schedules cannot all be
//! recorded given a tuner count. Results are sorted by ascending priority,
//! so the schedule least likely to survive comes first.

use std::collections::HashSet;

use crate::domain::schedule::{end_time_cmp, priority_cmp};
use crate::domain::{ChannelId, InputId, Priority, ScheduleId, ScheduledRecording, TimeRange};

/// Id carried by the synthetic schedules that model live viewing and tuning.
/// They never appear in a result.
const SYNTHETIC_ID: ScheduleId = ScheduleId(i64::MIN);

/// Schedules in `schedules` that conflict anywhere in time.
pub fn conflicting_schedules(
    schedules: &[ScheduledRecording],
    tuner_count: usize,
) -> Vec<ScheduledRecording> {
    compute_conflicts(schedules, tuner_count, &[TimeRange::ALL])
}

/// Schedules that will not be recorded, considering only those overlapping
/// one of `windows`.
///
/// Candidates are sorted by end time so a single forward scan finds each
/// overlap group. Within a group the highest-priority schedule per channel
/// is kept, other same-channel entries conflict, and anything beyond the
/// top `tuner_count` conflicts.
pub fn compute_conflicts(
    schedules: &[ScheduledRecording],
    tuner_count: usize,
    windows: &[TimeRange],
) -> Vec<ScheduledRecording> {
    let mut candidates: Vec<&ScheduledRecording> = schedules
        .iter()
        .filter(|s| s.start_ms < s.end_ms && windows.iter().any(|w| s.is_overlapping(w)))
        .collect();
    candidates.sort_by(|a, b| end_time_cmp(a, b));

    let mut conflicting = vec![false; candidates.len()];
    for i in 0..candidates.len() {
        if conflicting[i] {
            continue;
        }
        let r1 = candidates[i];
        let mut group: Vec<usize> = vec![i];
        for j in (i + 1)..candidates.len() {
            if !conflicting[j] && r1.end_ms > candidates[j].start_ms {
                group.push(j);
            }
        }
        // Highest priority first.
        group.sort_by(|&a, &b| priority_cmp(candidates[b], candidates[a]));

        let mut channels: HashSet<ChannelId> = HashSet::new();
        group.retain(|&idx| {
            if channels.insert(candidates[idx].channel_id) {
                true
            } else {
                conflicting[idx] = true;
                false
            }
        });

        if group.len() > tuner_count {
            for &idx in &group[tuner_count..] {
                conflicting[idx] = true;
            }
        }
    }

    let mut result: Vec<ScheduledRecording> = candidates
        .into_iter()
        .zip(conflicting)
        .filter(|(schedule, conflicting)| *conflicting && schedule.id != SYNTHETIC_ID)
        .map(|(schedule, _)| schedule.clone())
        .collect();
    result.sort_by(priority_cmp);
    result
}

/// Conflicts that would exist if `to_add` joined `current`.
///
/// A current schedule standing for the same recording as one being added is
/// replaced rather than counted twice. Only the time ranges of `to_add` are
/// considered.
pub fn conflicts_if_added(
    to_add: &[ScheduledRecording],
    current: &[ScheduledRecording],
    tuner_count: usize,
) -> Vec<ScheduledRecording> {
    let mut to_check: Vec<ScheduledRecording> = current
        .iter()
        .filter(|existing| !to_add.iter().any(|added| added.is_same_recording(existing)))
        .cloned()
        .collect();
    let windows: Vec<TimeRange> = to_add.iter().map(ScheduledRecording::time_range).collect();
    to_check.extend(to_add.iter().cloned());
    compute_conflicts(&to_check, tuner_count, &windows)
}

/// Conflicts caused by watching `channel_id` from `now_ms` indefinitely.
///
/// Schedules on the watched channel only compete among themselves for one
/// tuner; the rest compete with the live viewing at `new_priority`.
pub fn conflicts_for_watching(
    input_id: &InputId,
    channel_id: ChannelId,
    now_ms: i64,
    new_priority: Priority,
    schedules: &[ScheduledRecording],
    tuner_count: usize,
) -> Vec<ScheduledRecording> {
    let (same_channel, mut others): (Vec<_>, Vec<_>) = schedules
        .iter()
        .cloned()
        .partition(|s| s.channel_id == channel_id);
    others.push(synthetic(input_id, channel_id, now_ms, i64::MAX, new_priority));

    let mut result = conflicting_schedules(&same_channel, 1);
    result.extend(conflicting_schedules(&others, tuner_count));
    result.sort_by(priority_cmp);
    result
}

/// Conflicts among started recordings caused by tuning to `channel_id` now.
///
/// Tuning to a channel that is already being recorded costs no tuner.
pub fn conflicts_for_tune(
    input_id: &InputId,
    channel_id: ChannelId,
    now_ms: i64,
    new_priority: Priority,
    started: &[ScheduledRecording],
    tuner_count: usize,
) -> Vec<ScheduledRecording> {
    if started.iter().any(|s| s.channel_id == channel_id) {
        return conflicting_schedules(started, tuner_count);
    }
    let mut to_check = started.to_vec();
    to_check.push(synthetic(
        input_id,
        channel_id,
        now_ms,
        now_ms.saturating_add(1),
        new_priority,
    ));
    conflicting_schedules(&to_check, tuner_count)
}

fn synthetic(
    input_id: &InputId,
    channel_id: ChannelId,
    start_ms: i64,
    end_ms: i64,
    priority: Priority,
) -> ScheduledRecording {
    ScheduledRecording::for_time_range(input_id.clone(), channel_id, start_ms, end_ms)
        .with_id(SYNTHETIC_ID)
        .with_priority(priority)
}
