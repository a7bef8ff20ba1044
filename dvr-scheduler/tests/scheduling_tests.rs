//! End-to-end tests for the DVR services.
//!
//! Each test wires a [`ServiceContainer`] over an in-memory repository and a
//! static catalog, with a fixed clock and a recording wake-up alarm.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use dvr_scheduler::Error;
use dvr_scheduler::catalog::StaticCatalog;
use dvr_scheduler::clock::{MS_PER_HOUR, MS_PER_MINUTE, ManualClock};
use dvr_scheduler::config::DvrConfig;
use dvr_scheduler::domain::{
    Channel, ChannelId, InputId, InputInfo, Priority, Program, ProgramId, RecordedProgram,
    RecordedProgramId, RecordingState, ScheduleId, ScheduledRecording, SeriesState,
};
use dvr_scheduler::scheduler::{Recorder, RecordingOutcome, TaskCommand, TaskControl, WakeupAlarm};
use dvr_scheduler::services::{Collaborators, ServiceContainer};
use dvr_scheduler::store::{InMemoryRepository, ScheduleStore, StoreSnapshot};

const NOW: i64 = 1_700_000_000_000;
const INPUT: &str = "tuner";

#[derive(Default)]
struct RecordingAlarm {
    calls: Mutex<Vec<i64>>,
}

impl WakeupAlarm for RecordingAlarm {
    fn set(&self, wake_at_ms: i64) {
        self.calls.lock().push(wake_at_ms);
    }
}

/// Records until asked to stop, then reports how it was stopped.
struct StoppableRecorder;

#[async_trait]
impl Recorder for StoppableRecorder {
    async fn record(
        &self,
        _schedule: ScheduledRecording,
        _channel: Channel,
        mut control: TaskControl,
    ) -> RecordingOutcome {
        control.stopped().await;
        match control.try_recv() {
            Some(TaskCommand::Cancel) => RecordingOutcome::Canceled,
            _ => RecordingOutcome::Clipped,
        }
    }
}

struct Harness {
    container: ServiceContainer<InMemoryRepository>,
    catalog: Arc<StaticCatalog>,
    alarm: Arc<RecordingAlarm>,
}

fn harness(snapshot: StoreSnapshot, tuner_count: usize) -> anyhow::Result<Harness> {
    let catalog = Arc::new(StaticCatalog::new());
    catalog.upsert_input(InputInfo::new(InputId::new(INPUT), tuner_count));
    catalog.upsert_channel(Channel::new(ChannelId(1), InputId::new(INPUT), "one"));
    catalog.upsert_channel(Channel::new(ChannelId(2), InputId::new(INPUT), "two"));
    catalog.set_loaded(true);

    let deps = Collaborators {
        catalog: catalog.clone(),
        programs: catalog.clone(),
        series_info: catalog.clone(),
        recorder: Arc::new(StoppableRecorder),
        clock: Arc::new(ManualClock::new(NOW)),
    };
    let alarm = Arc::new(RecordingAlarm::default());
    let container = ServiceContainer::with_alarm(
        DvrConfig::default(),
        Arc::new(InMemoryRepository::with_snapshot(snapshot)),
        deps,
        alarm.clone(),
        None,
    )?;
    Ok(Harness {
        container,
        catalog,
        alarm,
    })
}

fn recording(id: i64, channel: i64, start: i64, end: i64, priority: i64) -> ScheduledRecording {
    ScheduledRecording::for_time_range(InputId::new(INPUT), ChannelId(channel), start, end)
        .with_id(ScheduleId(id))
        .with_priority(Priority(priority))
}

fn snapshot_of(schedules: Vec<ScheduledRecording>) -> StoreSnapshot {
    StoreSnapshot {
        schedules,
        ..Default::default()
    }
}

fn state_of(store: &dyn ScheduleStore, id: ScheduleId) -> Option<RecordingState> {
    store.scheduled_recording(id).map(|s| s.state)
}

/// Poll `cond` until it holds or five seconds pass.
async fn wait_for(cond: impl Fn() -> bool) -> bool {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}

mod wakeup_tests {
    use super::*;

    #[tokio::test]
    async fn test_distant_schedule_arms_alarm_before_start() -> anyhow::Result<()> {
        let start = NOW + 12 * MS_PER_HOUR;
        let h = harness(snapshot_of(vec![recording(1, 1, start, start + MS_PER_HOUR, 10)]), 1)?;

        h.container.start().await?;
        assert_eq!(*h.alarm.calls.lock(), vec![start - MS_PER_MINUTE]);

        h.container.scheduler.update().await;
        assert_eq!(
            *h.alarm.calls.lock(),
            vec![start - MS_PER_MINUTE, start - MS_PER_MINUTE]
        );
        // Nothing is due yet, so no tuner was touched.
        assert!(h.container.scheduler.active_inputs().is_empty());

        h.container.shutdown_with_timeout(Duration::from_secs(2)).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_no_alarm_without_schedules() -> anyhow::Result<()> {
        let h = harness(StoreSnapshot::default(), 1)?;
        h.container.start().await?;
        h.container.scheduler.update().await;
        assert!(h.alarm.calls.lock().is_empty());
        h.container.shutdown_with_timeout(Duration::from_secs(2)).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_starts_within_boundary() -> anyhow::Result<()> {
        let h = harness(StoreSnapshot::default(), 1)?;
        let r = recording(1, 1, NOW + 3, NOW + 100, 1);
        assert!(!h.container.scheduler.starts_within(&r, 2));
        assert!(h.container.scheduler.starts_within(&r, 3));
        Ok(())
    }
}

mod recording_tests {
    use super::*;

    #[tokio::test]
    async fn test_restart_recovers_interrupted_recordings() -> anyhow::Result<()> {
        let h = harness(
            snapshot_of(vec![
                recording(1, 1, NOW - 10 * MS_PER_MINUTE, NOW + MS_PER_HOUR, 10)
                    .with_state(RecordingState::InProgress),
                recording(2, 2, NOW - MS_PER_HOUR, NOW - MS_PER_MINUTE, 10)
                    .with_state(RecordingState::InProgress),
                recording(3, 2, NOW - MS_PER_HOUR, NOW - MS_PER_MINUTE, 10),
            ]),
            1,
        )?;
        h.container.start().await?;

        let store = h.container.store.clone();
        assert_eq!(state_of(store.as_ref(), ScheduleId(2)), Some(RecordingState::Failed));
        assert_eq!(state_of(store.as_ref(), ScheduleId(3)), Some(RecordingState::Failed));
        // The interrupted recording still has airtime left, so it is picked up again.
        assert!(wait_for(|| state_of(store.as_ref(), ScheduleId(1)) == Some(RecordingState::InProgress)).await);
        assert!(
            h.container
                .scheduler
                .input_state(&InputId::new(INPUT))
                .await?
                .is_some_and(|state| state.active == vec![ScheduleId(1)])
        );

        h.container.shutdown_with_timeout(Duration::from_secs(2)).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_due_schedule_starts_recording() -> anyhow::Result<()> {
        let h = harness(snapshot_of(vec![recording(1, 1, NOW, NOW + MS_PER_HOUR, 10)]), 1)?;
        h.container.start().await?;

        let store = h.container.store.clone();
        assert!(wait_for(|| state_of(store.as_ref(), ScheduleId(1)) == Some(RecordingState::InProgress)).await);
        assert_eq!(h.container.stats().active_inputs, 1);

        h.container.shutdown_with_timeout(Duration::from_secs(2)).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_higher_priority_preempts_running_recording() -> anyhow::Result<()> {
        let h = harness(snapshot_of(vec![recording(1, 1, NOW, NOW + MS_PER_HOUR, 10)]), 1)?;
        h.container.start().await?;
        let store = h.container.store.clone();
        assert!(wait_for(|| state_of(store.as_ref(), ScheduleId(1)) == Some(RecordingState::InProgress)).await);

        let added = store
            .add_scheduled_recordings(vec![
                ScheduledRecording::for_time_range(InputId::new(INPUT), ChannelId(2), NOW, NOW + 30 * MS_PER_MINUTE)
                    .with_priority(Priority(20)),
            ])
            .await?;
        let newcomer = added[0].id;

        assert!(
            wait_for(|| {
                state_of(store.as_ref(), ScheduleId(1)) == Some(RecordingState::Clipped)
                    && state_of(store.as_ref(), newcomer) == Some(RecordingState::InProgress)
            })
            .await
        );

        h.container.shutdown_with_timeout(Duration::from_secs(2)).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_lower_priority_newcomer_fails() -> anyhow::Result<()> {
        let h = harness(snapshot_of(vec![recording(1, 1, NOW, NOW + MS_PER_HOUR, 20)]), 1)?;
        h.container.start().await?;
        let store = h.container.store.clone();
        assert!(wait_for(|| state_of(store.as_ref(), ScheduleId(1)) == Some(RecordingState::InProgress)).await);

        let added = store
            .add_scheduled_recordings(vec![
                ScheduledRecording::for_time_range(InputId::new(INPUT), ChannelId(2), NOW, NOW + 30 * MS_PER_MINUTE)
                    .with_priority(Priority(10)),
            ])
            .await?;
        let newcomer = added[0].id;

        assert!(wait_for(|| state_of(store.as_ref(), newcomer) == Some(RecordingState::Failed)).await);
        assert_eq!(state_of(store.as_ref(), ScheduleId(1)), Some(RecordingState::InProgress));

        h.container.shutdown_with_timeout(Duration::from_secs(2)).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_two_tuners_record_in_parallel() -> anyhow::Result<()> {
        let h = harness(
            snapshot_of(vec![
                recording(1, 1, NOW, NOW + MS_PER_HOUR, 10),
                recording(2, 2, NOW, NOW + MS_PER_HOUR, 5),
            ]),
            2,
        )?;
        h.container.start().await?;
        let store = h.container.store.clone();
        assert!(
            wait_for(|| {
                state_of(store.as_ref(), ScheduleId(1)) == Some(RecordingState::InProgress)
                    && state_of(store.as_ref(), ScheduleId(2)) == Some(RecordingState::InProgress)
            })
            .await
        );
        h.container.shutdown_with_timeout(Duration::from_secs(2)).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_revoked_recording_capability_fails_due_schedule() -> anyhow::Result<()> {
        let h = harness(snapshot_of(vec![recording(1, 1, NOW, NOW + MS_PER_HOUR, 10)]), 1)?;
        let mut input = InputInfo::new(InputId::new(INPUT), 1);
        input.can_record = false;
        h.catalog.upsert_input(input);

        h.container.start().await?;
        let store = h.container.store.clone();
        assert!(wait_for(|| state_of(store.as_ref(), ScheduleId(1)) == Some(RecordingState::Failed)).await);
        h.container.shutdown_with_timeout(Duration::from_secs(2)).await?;
        Ok(())
    }
}

mod dvr_manager_tests {
    use super::*;

    fn episode(id: i64, channel: i64, start: i64, number: &str) -> Program {
        Program::new(ProgramId(id), ChannelId(channel), start, start + 30 * MS_PER_MINUTE)
            .with_series("show")
            .with_title("Show")
            .with_episode(Some("1"), Some(number))
    }

    #[tokio::test]
    async fn test_operations_require_loaded_store() -> anyhow::Result<()> {
        let h = harness(StoreSnapshot::default(), 1)?;
        let program = Program::new(ProgramId(1), ChannelId(1), NOW + MS_PER_HOUR, NOW + 2 * MS_PER_HOUR);
        let err = h
            .container
            .dvr_manager
            .add_schedule(&program)
            .await
            .expect_err("store is not loaded");
        assert!(matches!(err, Error::Validation(_)));
        Ok(())
    }

    #[tokio::test]
    async fn test_new_schedule_outranks_existing() -> anyhow::Result<()> {
        let start = NOW + 12 * MS_PER_HOUR;
        let h = harness(snapshot_of(vec![recording(1, 1, start, start + MS_PER_HOUR, 10)]), 1)?;
        h.container.start().await?;
        let manager = h.container.dvr_manager.clone();
        assert!(wait_for(|| manager.schedule_manager().is_initialized()).await);

        let program = Program::new(ProgramId(7), ChannelId(2), start, start + MS_PER_HOUR);
        let schedule = manager.add_schedule(&program).await?;
        assert!(schedule.priority > Priority(10));
        assert_eq!(schedule.program_id, Some(ProgramId(7)));

        // Both want the single tuner at the same time; the older one loses.
        let store = h.container.store.clone();
        assert!(wait_for(|| {
            manager
                .schedule_manager()
                .all_conflicting_schedules()
                .iter()
                .any(|s| s.id == ScheduleId(1))
        })
        .await);
        assert!(store.scheduled_recording_for_program(ProgramId(7)).is_some());

        h.container.shutdown_with_timeout(Duration::from_secs(2)).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_overriding_schedule_beats_only_the_overridden() -> anyhow::Result<()> {
        let start = NOW + 12 * MS_PER_HOUR;
        let low = recording(1, 1, start, start + MS_PER_HOUR, 10);
        let h = harness(
            snapshot_of(vec![low.clone(), recording(2, 1, start + 2 * MS_PER_HOUR, start + 3 * MS_PER_HOUR, 50)]),
            1,
        )?;
        h.container.start().await?;

        let program = Program::new(ProgramId(9), ChannelId(2), start, start + MS_PER_HOUR);
        let schedule = h
            .container
            .dvr_manager
            .add_schedule_overriding(&program, &[low])
            .await?;
        assert_eq!(schedule.priority, Priority(11));

        h.container.shutdown_with_timeout(Duration::from_secs(2)).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_removing_running_recording_clips_it() -> anyhow::Result<()> {
        let h = harness(snapshot_of(vec![recording(1, 1, NOW, NOW + MS_PER_HOUR, 10)]), 1)?;
        h.container.start().await?;
        let store = h.container.store.clone();
        assert!(wait_for(|| state_of(store.as_ref(), ScheduleId(1)) == Some(RecordingState::InProgress)).await);

        let running = store
            .scheduled_recording(ScheduleId(1))
            .expect("schedule exists");
        let manager = h.container.dvr_manager.clone();
        assert_eq!(manager.current_recording(ChannelId(1)).map(|s| s.id), Some(ScheduleId(1)));
        assert_eq!(
            manager.earliest_recording_end_time(&InputId::new(INPUT)),
            Some(NOW + MS_PER_HOUR)
        );

        manager.remove_scheduled_recording(vec![running]).await?;
        assert!(wait_for(|| state_of(store.as_ref(), ScheduleId(1)) == Some(RecordingState::Clipped)).await);

        h.container.shutdown_with_timeout(Duration::from_secs(2)).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_series_lifecycle() -> anyhow::Result<()> {
        let base = NOW + 24 * MS_PER_HOUR;
        let programs = vec![
            episode(1, 1, base, "1"),
            episode(2, 1, base + MS_PER_HOUR, "2"),
            episode(3, 1, base + 2 * MS_PER_HOUR, "3"),
        ];
        let h = harness(StoreSnapshot::default(), 1)?;
        h.catalog.set_programs(programs.clone());
        h.container.start().await?;
        let manager = h.container.dvr_manager.clone();
        let store = h.container.store.clone();

        let series = manager.add_series_recording(&programs[0], &programs).await?;
        assert_eq!(
            manager.series_recording_for_program(&programs[1]).map(|s| s.id),
            Some(series.id)
        );
        let members = store.scheduled_recordings_for_series(series.id);
        assert_eq!(members.len(), 3);
        assert!(members.iter().all(|s| s.priority == Priority::from(series.priority)));

        // Canceling the rule cancels its pending episodes.
        manager
            .update_series_recording(series.clone().with_state(SeriesState::Canceled))
            .await?;
        assert!(
            store
                .scheduled_recordings_for_series(series.id)
                .iter()
                .all(ScheduledRecording::is_canceled)
        );

        // Resuming brings them back.
        manager
            .update_series_recording(series.clone().with_state(SeriesState::Normal))
            .await?;
        assert!(
            store
                .scheduled_recordings_for_series(series.id)
                .iter()
                .all(ScheduledRecording::is_not_started)
        );

        manager.remove_series_recording(series.id).await?;
        assert!(store.series_recording(series.id).is_none());
        assert!(store.scheduled_recordings_for_series(series.id).is_empty());

        h.container.shutdown_with_timeout(Duration::from_secs(2)).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_series_add_skips_recorded_program_with_empty_range() -> anyhow::Result<()> {
        let recorded = |id: i64, number: &str, start: i64, end: i64| RecordedProgram {
            id: RecordedProgramId(id),
            input_id: InputId::new(INPUT),
            channel_id: ChannelId(1),
            series_id: Some("show".into()),
            season_number: Some("1".into()),
            episode_number: Some(number.into()),
            start_ms: start,
            end_ms: end,
            ..Default::default()
        };
        let snapshot = StoreSnapshot {
            recorded_programs: vec![
                recorded(1, "7", NOW - MS_PER_HOUR, NOW - MS_PER_HOUR),
                recorded(2, "8", NOW - 2 * MS_PER_HOUR, NOW - MS_PER_HOUR),
            ],
            ..Default::default()
        };
        let programs = vec![episode(1, 1, NOW + 24 * MS_PER_HOUR, "1")];
        let h = harness(snapshot, 1)?;
        h.catalog.set_programs(programs.clone());
        h.container.start().await?;
        let store = h.container.store.clone();

        let series = h
            .container
            .dvr_manager
            .add_series_recording(&programs[0], &programs)
            .await?;

        let members = store.scheduled_recordings_for_series(series.id);
        assert_eq!(members.len(), 2);
        let finished: Vec<&ScheduledRecording> = members
            .iter()
            .filter(|s| s.state == RecordingState::Finished)
            .collect();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].episode_number.as_deref(), Some("8"));

        h.container.shutdown_with_timeout(Duration::from_secs(2)).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_recordability() -> anyhow::Result<()> {
        let h = harness(StoreSnapshot::default(), 1)?;
        let manager = h.container.dvr_manager.clone();
        // Not loaded yet.
        assert!(!manager.is_channel_recordable(ChannelId(1)));

        h.container.start().await?;
        assert!(manager.is_channel_recordable(ChannelId(1)));
        assert!(!manager.is_channel_recordable(ChannelId(99)));

        let mut program = Program::new(ProgramId(5), ChannelId(2), NOW, NOW + MS_PER_HOUR);
        assert!(manager.is_program_recordable(&program));
        program.recording_prohibited = true;
        assert!(!manager.is_program_recordable(&program));

        h.container.shutdown_with_timeout(Duration::from_secs(2)).await?;
        Ok(())
    }
}
