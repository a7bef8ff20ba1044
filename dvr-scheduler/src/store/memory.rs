//! In-memory schedule store with write-through persistence.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};

use super::{ScheduleRepository, ScheduleStore, StoreEvent, StoreEventBroadcaster};
use crate::clock::{Clock, SystemClock};
use crate::domain::{
    ProgramId, RecordedProgram, RecordedProgramId, RecordingState, ScheduleId, ScheduledRecording,
    SeriesRecording, SeriesRecordingId,
};
use crate::{Error, Result, soft_assert};

/// Monotonic id source. Ids start at 1.
#[derive(Debug)]
pub struct IdGenerator {
    next: AtomicI64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicI64::new(1),
        }
    }

    /// Make sure future ids are greater than `max_seen`.
    pub fn seed_after(&self, max_seen: i64) {
        self.next.fetch_max(max_seen.saturating_add(1), Ordering::SeqCst);
    }

    pub fn next_id(&self) -> i64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Schedule store holding everything in memory.
///
/// Writes are serialized and persisted to the repository before the
/// in-memory view changes, so a failed write leaves memory untouched.
pub struct MemoryScheduleStore<R>
where
    R: ScheduleRepository,
{
    /// Live schedules. Tombstones are kept apart in `deleted`.
    schedules: DashMap<ScheduleId, ScheduledRecording>,
    /// `DELETED` tombstones keyed by program id.
    deleted: DashMap<ProgramId, ScheduledRecording>,
    series: DashMap<SeriesRecordingId, SeriesRecording>,
    recorded: RwLock<Vec<RecordedProgram>>,
    schedule_ids: IdGenerator,
    series_ids: IdGenerator,
    recorded_ids: IdGenerator,
    loaded: AtomicBool,
    write_lock: Mutex<()>,
    repo: Arc<R>,
    broadcaster: StoreEventBroadcaster,
    clock: Arc<dyn Clock>,
}

impl<R> MemoryScheduleStore<R>
where
    R: ScheduleRepository,
{
    pub fn new(repo: Arc<R>, broadcaster: StoreEventBroadcaster) -> Self {
        Self {
            schedules: DashMap::new(),
            deleted: DashMap::new(),
            series: DashMap::new(),
            recorded: RwLock::new(Vec::new()),
            schedule_ids: IdGenerator::new(),
            series_ids: IdGenerator::new(),
            recorded_ids: IdGenerator::new(),
            loaded: AtomicBool::new(false),
            write_lock: Mutex::new(()),
            repo,
            broadcaster,
            clock: Arc::new(SystemClock),
        }
    }

    /// Use `clock` to decide which persisted schedules went stale.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    // ========== Initialization ==========

    /// Load persisted state into memory and publish `LoadFinished`.
    pub async fn load(&self) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        info!("Loading schedules from repository");

        let snapshot = self.repo.load().await?;
        let now = self.clock.now_ms();

        // Nothing is recording yet, so no persisted schedule can still be in progress.
        let fixed: Vec<ScheduledRecording> = snapshot
            .schedules
            .iter()
            .filter_map(|s| stale_state_fixup(s, now).map(|state| s.clone().with_state(state)))
            .collect();
        if !fixed.is_empty() {
            self.repo.upsert_schedules(&fixed).await?;
            info!("Reset {} stale schedule state(s) on load", fixed.len());
        }
        let mut fixed: HashMap<ScheduleId, ScheduledRecording> =
            fixed.into_iter().map(|s| (s.id, s)).collect();

        self.schedules.clear();
        self.deleted.clear();
        self.series.clear();

        for schedule in snapshot.schedules {
            let schedule = fixed.remove(&schedule.id).unwrap_or(schedule);
            self.schedule_ids.seed_after(schedule.id.get());
            if schedule.state == RecordingState::Deleted {
                match schedule.program_id {
                    Some(program_id) => {
                        self.deleted.insert(program_id, schedule);
                    }
                    None => warn!(schedule_id = %schedule.id, "Dropping tombstone without program id"),
                }
            } else {
                self.schedules.insert(schedule.id, schedule);
            }
        }
        for series in snapshot.series {
            self.series_ids.seed_after(series.id.get());
            self.series.insert(series.id, series);
        }
        for program in &snapshot.recorded_programs {
            self.recorded_ids.seed_after(program.id.get());
        }
        *self.recorded.write() = snapshot.recorded_programs;

        let count = self.schedules.len();
        self.loaded.store(true, Ordering::SeqCst);
        info!(
            "Loaded {} schedules, {} tombstones, {} series",
            count,
            self.deleted.len(),
            self.series.len()
        );
        self.broadcaster.publish(StoreEvent::LoadFinished);
        Ok(count)
    }

    // ========== Internal helpers ==========

    fn publish(&self, event: StoreEvent) {
        debug!("Store event: {}", event.description());
        self.broadcaster.publish(event);
    }

    /// Tombstones superseded by new or updated schedules for the same programs.
    fn superseded_tombstones(&self, schedules: &[ScheduledRecording]) -> Vec<ScheduledRecording> {
        schedules
            .iter()
            .filter_map(|s| s.program_id)
            .filter_map(|program_id| self.deleted.get(&program_id).map(|t| t.clone()))
            .collect()
    }

    async fn persist_tombstone_removal(&self, tombstones: &[ScheduledRecording]) -> Result<()> {
        if tombstones.is_empty() {
            return Ok(());
        }
        let ids: Vec<ScheduleId> = tombstones.iter().map(|t| t.id).collect();
        self.repo.delete_schedules(&ids).await
    }

    fn forget_tombstones(&self, tombstones: &[ScheduledRecording]) {
        for tombstone in tombstones {
            if let Some(program_id) = tombstone.program_id {
                self.deleted.remove(&program_id);
            }
        }
    }

    async fn update_locked(&self, schedules: Vec<ScheduledRecording>) -> Result<()> {
        let mut updates = Vec::with_capacity(schedules.len());
        for schedule in schedules {
            let Some(existing) = self.schedules.get(&schedule.id).map(|e| e.clone()) else {
                warn!(schedule_id = %schedule.id, "Ignoring update of unknown schedule");
                continue;
            };
            soft_assert!(
                existing.channel_id == schedule.channel_id,
                "Channel of schedule {} changed from {} to {}",
                schedule.id,
                existing.channel_id,
                schedule.channel_id
            );
            updates.push(schedule);
        }
        if updates.is_empty() {
            return Ok(());
        }

        let tombstones = self.superseded_tombstones(&updates);
        self.repo.upsert_schedules(&updates).await?;
        self.persist_tombstone_removal(&tombstones).await?;

        self.forget_tombstones(&tombstones);
        for schedule in &updates {
            self.schedules.insert(schedule.id, schedule.clone());
        }
        self.publish(StoreEvent::SchedulesStatusChanged(updates));
        Ok(())
    }

    async fn remove_locked(&self, schedules: Vec<ScheduledRecording>, force: bool) -> Result<()> {
        let mut to_delete = Vec::new();
        let mut to_tombstone = Vec::new();
        for schedule in schedules {
            let Some(existing) = self.schedules.get(&schedule.id).map(|e| e.clone()) else {
                warn!(schedule_id = %schedule.id, "Ignoring removal of unknown schedule");
                continue;
            };
            let keep_tombstone = !force
                && existing.is_not_started()
                && existing.series_recording_id.is_some()
                && existing.program_id.is_some();
            if keep_tombstone {
                to_tombstone.push(existing.with_state(RecordingState::Deleted));
            } else {
                to_delete.push(existing);
            }
        }
        if to_delete.is_empty() && to_tombstone.is_empty() {
            return Ok(());
        }

        if !to_delete.is_empty() {
            let ids: Vec<ScheduleId> = to_delete.iter().map(|s| s.id).collect();
            self.repo.delete_schedules(&ids).await?;
        }
        if !to_tombstone.is_empty() {
            self.repo.upsert_schedules(&to_tombstone).await?;
        }

        let mut removed = Vec::with_capacity(to_delete.len() + to_tombstone.len());
        for schedule in to_delete {
            self.schedules.remove(&schedule.id);
            removed.push(schedule);
        }
        for tombstone in to_tombstone {
            self.schedules.remove(&tombstone.id);
            if let Some(program_id) = tombstone.program_id {
                self.deleted.insert(program_id, tombstone.clone());
            }
            removed.push(tombstone);
        }
        self.publish(StoreEvent::SchedulesRemoved(removed));
        Ok(())
    }

    fn collect_schedules<F>(&self, filter: F) -> Vec<ScheduledRecording>
    where
        F: Fn(&ScheduledRecording) -> bool,
    {
        let mut list: Vec<ScheduledRecording> = self
            .schedules
            .iter()
            .filter(|entry| filter(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        list.sort_by_key(|s| s.id);
        list
    }
}

/// State a persisted schedule should take when loaded at `now`, if it changes.
fn stale_state_fixup(schedule: &ScheduledRecording, now: i64) -> Option<RecordingState> {
    match schedule.state {
        RecordingState::InProgress if schedule.end_ms <= now => Some(RecordingState::Failed),
        RecordingState::InProgress => Some(RecordingState::NotStarted),
        RecordingState::NotStarted if schedule.end_ms <= now => Some(RecordingState::Failed),
        _ => None,
    }
}

#[async_trait]
impl<R> ScheduleStore for MemoryScheduleStore<R>
where
    R: ScheduleRepository + 'static,
{
    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.broadcaster.subscribe()
    }

    fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    // ========== Schedule reads ==========

    fn scheduled_recording(&self, id: ScheduleId) -> Option<ScheduledRecording> {
        self.schedules.get(&id).map(|e| e.clone())
    }

    fn scheduled_recording_for_program(&self, program_id: ProgramId) -> Option<ScheduledRecording> {
        self.schedules
            .iter()
            .find(|entry| entry.program_id == Some(program_id))
            .map(|entry| entry.value().clone())
    }

    fn all_scheduled_recordings(&self) -> Vec<ScheduledRecording> {
        self.collect_schedules(|_| true)
    }

    fn recordings_with_state(&self, states: &[RecordingState]) -> Vec<ScheduledRecording> {
        self.collect_schedules(|s| states.contains(&s.state))
    }

    fn available_scheduled_recordings(&self, now_ms: i64) -> Vec<ScheduledRecording> {
        self.collect_schedules(|s| s.state.is_pending() && s.end_ms > now_ms)
    }

    fn started_recordings(&self, now_ms: i64) -> Vec<ScheduledRecording> {
        self.collect_schedules(|s| s.is_in_progress() && s.end_ms > now_ms)
    }

    fn non_started_recordings(&self, now_ms: i64) -> Vec<ScheduledRecording> {
        self.collect_schedules(|s| s.is_not_started() && s.end_ms > now_ms)
    }

    fn scheduled_recordings_for_series(&self, id: SeriesRecordingId) -> Vec<ScheduledRecording> {
        self.collect_schedules(|s| s.series_recording_id == Some(id))
    }

    fn next_start_time_after(&self, now_ms: i64) -> Option<i64> {
        self.schedules
            .iter()
            .filter(|entry| entry.is_not_started() && entry.start_ms > now_ms)
            .map(|entry| entry.start_ms)
            .min()
    }

    // ========== Tombstones ==========

    fn deleted_schedules(&self) -> Vec<ScheduledRecording> {
        let mut list: Vec<ScheduledRecording> =
            self.deleted.iter().map(|e| e.value().clone()).collect();
        list.sort_by_key(|s| s.id);
        list
    }

    fn disallowed_program_ids(&self) -> HashSet<ProgramId> {
        self.deleted.iter().map(|e| *e.key()).collect()
    }

    // ========== Series and recorded programs ==========

    fn series_recordings(&self) -> Vec<SeriesRecording> {
        let mut list: Vec<SeriesRecording> =
            self.series.iter().map(|e| e.value().clone()).collect();
        list.sort_by_key(|s| s.id);
        list
    }

    fn series_recording(&self, id: SeriesRecordingId) -> Option<SeriesRecording> {
        self.series.get(&id).map(|e| e.clone())
    }

    fn series_recording_by_series_id(&self, series_id: &str) -> Option<SeriesRecording> {
        self.series
            .iter()
            .find(|e| e.series_id == series_id)
            .map(|e| e.value().clone())
    }

    fn recorded_programs(&self) -> Vec<RecordedProgram> {
        self.recorded.read().clone()
    }

    // ========== Writes ==========

    async fn add_scheduled_recordings(
        &self,
        schedules: Vec<ScheduledRecording>,
    ) -> Result<Vec<ScheduledRecording>> {
        if schedules.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(invalid) = schedules.iter().find(|s| s.start_ms >= s.end_ms) {
            return Err(Error::validation(format!(
                "schedule on channel {} has an empty time range [{}, {})",
                invalid.channel_id, invalid.start_ms, invalid.end_ms
            )));
        }

        let _guard = self.write_lock.lock().await;
        let added: Vec<ScheduledRecording> = schedules
            .into_iter()
            .map(|s| s.with_id(ScheduleId(self.schedule_ids.next_id())))
            .collect();
        let tombstones = self.superseded_tombstones(&added);

        self.repo.upsert_schedules(&added).await?;
        self.persist_tombstone_removal(&tombstones).await?;

        self.forget_tombstones(&tombstones);
        for schedule in &added {
            self.schedules.insert(schedule.id, schedule.clone());
        }
        debug!("Added {} schedule(s)", added.len());
        self.publish(StoreEvent::SchedulesAdded(added.clone()));
        Ok(added)
    }

    async fn update_scheduled_recordings(&self, schedules: Vec<ScheduledRecording>) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.update_locked(schedules).await
    }

    async fn remove_scheduled_recordings(
        &self,
        schedules: Vec<ScheduledRecording>,
        force: bool,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.remove_locked(schedules, force).await
    }

    async fn change_state(&self, id: ScheduleId, state: RecordingState) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let Some(existing) = self.scheduled_recording(id) else {
            warn!(schedule_id = %id, state = %state, "Ignoring state change of unknown schedule");
            return Ok(());
        };
        if existing.state == state {
            return Ok(());
        }
        debug!(schedule_id = %id, from = %existing.state, to = %state, "Changing schedule state");
        self.update_locked(vec![existing.with_state(state)]).await
    }

    async fn add_series_recording(&self, series: SeriesRecording) -> Result<SeriesRecording> {
        if series.series_id.is_empty() {
            return Err(Error::validation("series recording needs a series id"));
        }
        let _guard = self.write_lock.lock().await;
        let series = series.with_id(SeriesRecordingId(self.series_ids.next_id()));
        self.repo.upsert_series(&series).await?;
        self.series.insert(series.id, series.clone());
        info!(series_recording_id = %series.id, series_id = %series.series_id, "Added series recording");
        self.publish(StoreEvent::SeriesAdded(vec![series.clone()]));
        Ok(series)
    }

    async fn update_series_recording(&self, series: SeriesRecording) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if !self.series.contains_key(&series.id) {
            warn!(series_recording_id = %series.id, "Ignoring update of unknown series recording");
            return Ok(());
        }
        self.repo.upsert_series(&series).await?;
        self.series.insert(series.id, series.clone());
        self.publish(StoreEvent::SeriesChanged(vec![series]));
        Ok(())
    }

    async fn remove_series_recording(&self, id: SeriesRecordingId) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let Some(series) = self.series_recording(id) else {
            warn!(series_recording_id = %id, "Ignoring removal of unknown series recording");
            return Ok(());
        };

        let (to_delete, to_detach): (Vec<_>, Vec<_>) = self
            .collect_schedules(|s| s.series_recording_id == Some(id))
            .into_iter()
            .partition(ScheduledRecording::is_not_started);
        let to_detach: Vec<ScheduledRecording> =
            to_detach.into_iter().map(|s| s.with_series(None)).collect();
        let tombstones: Vec<ScheduledRecording> = self
            .deleted
            .iter()
            .filter(|e| e.series_recording_id == Some(id))
            .map(|e| e.value().clone())
            .collect();

        let mut delete_ids: Vec<ScheduleId> = to_delete.iter().map(|s| s.id).collect();
        delete_ids.extend(tombstones.iter().map(|t| t.id));
        if !delete_ids.is_empty() {
            self.repo.delete_schedules(&delete_ids).await?;
        }
        if !to_detach.is_empty() {
            self.repo.upsert_schedules(&to_detach).await?;
        }
        self.repo.delete_series(id).await?;

        for schedule in &to_delete {
            self.schedules.remove(&schedule.id);
        }
        self.forget_tombstones(&tombstones);
        for schedule in &to_detach {
            self.schedules.insert(schedule.id, schedule.clone());
        }
        self.series.remove(&id);

        if !to_delete.is_empty() {
            self.publish(StoreEvent::SchedulesRemoved(to_delete));
        }
        if !to_detach.is_empty() {
            self.publish(StoreEvent::SchedulesStatusChanged(to_detach));
        }
        info!(series_recording_id = %id, "Removed series recording");
        self.publish(StoreEvent::SeriesRemoved(vec![series]));
        Ok(())
    }

    async fn add_recorded_program(&self, program: RecordedProgram) -> Result<RecordedProgram> {
        let _guard = self.write_lock.lock().await;
        let mut program = program;
        if program.id.is_set() {
            self.recorded_ids.seed_after(program.id.get());
        } else {
            program.id = RecordedProgramId(self.recorded_ids.next_id());
        }
        self.repo.insert_recorded_program(&program).await?;
        self.recorded.write().push(program.clone());
        Ok(program)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ChannelId, InputId, Program, SeriesPriority};
    use crate::store::{InMemoryRepository, StoreSnapshot};

    fn store() -> (Arc<InMemoryRepository>, MemoryScheduleStore<InMemoryRepository>) {
        let repo = Arc::new(InMemoryRepository::new());
        let store = MemoryScheduleStore::new(repo.clone(), StoreEventBroadcaster::new());
        (repo, store)
    }

    fn program(id: i64, start: i64, end: i64) -> Program {
        Program::new(ProgramId(id), ChannelId(1), start, end)
    }

    fn program_schedule(id: i64, start: i64, end: i64) -> ScheduledRecording {
        ScheduledRecording::for_program(InputId::new("input"), &program(id, start, end))
    }

    #[tokio::test]
    async fn test_add_assigns_ids_and_publishes() {
        let (repo, store) = store();
        store.load().await.unwrap();
        let mut rx = store.subscribe();

        let added = store
            .add_scheduled_recordings(vec![program_schedule(1, 0, 10), program_schedule(2, 10, 20)])
            .await
            .unwrap();
        assert_eq!(added[0].id, ScheduleId(1));
        assert_eq!(added[1].id, ScheduleId(2));
        assert_eq!(repo.snapshot().schedules.len(), 2);
        assert_eq!(rx.recv().await.unwrap(), StoreEvent::SchedulesAdded(added));
    }

    #[tokio::test]
    async fn test_add_rejects_empty_range() {
        let (_repo, store) = store();
        let err = store
            .add_scheduled_recordings(vec![program_schedule(1, 10, 10)])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(store.all_scheduled_recordings().is_empty());
    }

    #[tokio::test]
    async fn test_failed_write_leaves_memory_untouched() {
        let (repo, store) = store();
        store.load().await.unwrap();
        let added = store
            .add_scheduled_recordings(vec![program_schedule(1, 0, 10)])
            .await
            .unwrap();

        repo.set_fail_writes(true);
        let result = store
            .change_state(added[0].id, RecordingState::InProgress)
            .await;
        assert!(matches!(result, Err(Error::Storage(_))));
        assert_eq!(
            store.scheduled_recording(added[0].id).unwrap().state,
            RecordingState::NotStarted
        );
    }

    #[tokio::test]
    async fn test_change_state_same_state_is_noop() {
        let (_repo, store) = store();
        let added = store
            .add_scheduled_recordings(vec![program_schedule(1, 0, 10)])
            .await
            .unwrap();
        let mut rx = store.subscribe();
        store
            .change_state(added[0].id, RecordingState::NotStarted)
            .await
            .unwrap();
        store
            .change_state(ScheduleId(99), RecordingState::Failed)
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_removing_series_episode_leaves_tombstone() {
        let (_repo, store) = store();
        let series = store
            .add_series_recording(SeriesRecording::new("show", InputId::new("input"), ChannelId(1)))
            .await
            .unwrap();
        let added = store
            .add_scheduled_recordings(vec![
                program_schedule(5, 0, 10).with_series(Some(series.id)),
                program_schedule(6, 10, 20),
            ])
            .await
            .unwrap();

        store
            .remove_scheduled_recordings(added.clone(), false)
            .await
            .unwrap();
        assert!(store.all_scheduled_recordings().is_empty());
        assert_eq!(
            store.disallowed_program_ids(),
            HashSet::from([ProgramId(5)])
        );

        // Scheduling the program again lifts the tombstone.
        store
            .add_scheduled_recordings(vec![program_schedule(5, 0, 10)])
            .await
            .unwrap();
        assert!(store.disallowed_program_ids().is_empty());
    }

    #[tokio::test]
    async fn test_remove_series_detaches_and_deletes_members() {
        let (repo, store) = store();
        let series = store
            .add_series_recording(
                SeriesRecording::new("show", InputId::new("input"), ChannelId(1))
                    .with_priority(SeriesPriority::DEFAULT),
            )
            .await
            .unwrap();
        let added = store
            .add_scheduled_recordings(vec![
                program_schedule(1, 0, 10).with_series(Some(series.id)),
                program_schedule(2, 10, 20).with_series(Some(series.id)),
                program_schedule(3, 20, 30).with_series(Some(series.id)),
            ])
            .await
            .unwrap();
        store
            .change_state(added[0].id, RecordingState::Finished)
            .await
            .unwrap();
        store
            .remove_scheduled_recordings(vec![added[2].clone()], false)
            .await
            .unwrap();
        assert_eq!(store.deleted_schedules().len(), 1);

        let mut rx = store.subscribe();
        store.remove_series_recording(series.id).await.unwrap();

        let remaining = store.all_scheduled_recordings();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, added[0].id);
        assert_eq!(remaining[0].series_recording_id, None);
        assert!(store.deleted_schedules().is_empty());
        assert!(store.series_recording(series.id).is_none());
        assert_eq!(repo.snapshot().schedules.len(), 1);

        assert!(matches!(rx.recv().await.unwrap(), StoreEvent::SchedulesRemoved(list) if list.len() == 1));
        assert!(matches!(rx.recv().await.unwrap(), StoreEvent::SchedulesStatusChanged(_)));
        assert!(matches!(rx.recv().await.unwrap(), StoreEvent::SeriesRemoved(_)));
    }

    #[tokio::test]
    async fn test_load_restores_tombstones_and_seeds_ids() {
        let tombstone = program_schedule(9, 0, 10)
            .with_id(ScheduleId(40))
            .with_state(RecordingState::Deleted);
        let live = program_schedule(10, 0, 10).with_id(ScheduleId(41));
        let repo = Arc::new(InMemoryRepository::with_snapshot(StoreSnapshot {
            schedules: vec![tombstone, live],
            ..Default::default()
        }));
        let store = MemoryScheduleStore::new(repo, StoreEventBroadcaster::new());
        assert!(!store.is_loaded());

        assert_eq!(store.load().await.unwrap(), 1);
        assert!(store.is_loaded());
        assert_eq!(store.disallowed_program_ids(), HashSet::from([ProgramId(9)]));

        let added = store
            .add_scheduled_recordings(vec![program_schedule(11, 0, 10)])
            .await
            .unwrap();
        assert_eq!(added[0].id, ScheduleId(42));
    }

    #[tokio::test]
    async fn test_load_resets_stale_states() {
        use crate::clock::ManualClock;

        let now = 1_000_000;
        let interrupted = program_schedule(1, now - 5_000, now + 5_000)
            .with_id(ScheduleId(1))
            .with_state(RecordingState::InProgress);
        let ended_in_progress = program_schedule(2, now - 10_000, now - 1)
            .with_id(ScheduleId(2))
            .with_state(RecordingState::InProgress);
        let missed = program_schedule(3, now - 10_000, now)
            .with_id(ScheduleId(3));
        let finished = program_schedule(4, now - 10_000, now - 1)
            .with_id(ScheduleId(4))
            .with_state(RecordingState::Finished);
        let repo = Arc::new(InMemoryRepository::with_snapshot(StoreSnapshot {
            schedules: vec![interrupted, ended_in_progress, missed, finished],
            ..Default::default()
        }));
        let store = MemoryScheduleStore::new(repo.clone(), StoreEventBroadcaster::new())
            .with_clock(Arc::new(ManualClock::new(now)));

        store.load().await.unwrap();

        let state = |id| store.scheduled_recording(ScheduleId(id)).unwrap().state;
        assert_eq!(state(1), RecordingState::NotStarted);
        assert_eq!(state(2), RecordingState::Failed);
        assert_eq!(state(3), RecordingState::Failed);
        assert_eq!(state(4), RecordingState::Finished);

        // The reset states are persisted too.
        let persisted = repo.snapshot().schedules;
        let persisted_state = |id| {
            persisted
                .iter()
                .find(|s| s.id == ScheduleId(id))
                .map(|s| s.state)
        };
        assert_eq!(persisted_state(1), Some(RecordingState::NotStarted));
        assert_eq!(persisted_state(2), Some(RecordingState::Failed));
        assert_eq!(persisted_state(3), Some(RecordingState::Failed));
    }

    #[tokio::test]
    async fn test_update_of_unknown_or_removed_schedule_is_noop() {
        let (repo, store) = store();
        store.load().await.unwrap();
        let added = store
            .add_scheduled_recordings(vec![program_schedule(1, 0, 10), program_schedule(2, 10, 20)])
            .await
            .unwrap();
        store
            .remove_scheduled_recordings(vec![added[1].clone()], true)
            .await
            .unwrap();
        let mut rx = store.subscribe();

        store
            .update_scheduled_recordings(vec![
                added[1].clone().with_state(RecordingState::Failed),
                program_schedule(3, 20, 30)
                    .with_id(ScheduleId(77))
                    .with_state(RecordingState::Failed),
            ])
            .await
            .unwrap();

        assert!(rx.try_recv().is_err());
        assert!(store.scheduled_recording(added[1].id).is_none());
        assert!(store.scheduled_recording(ScheduleId(77)).is_none());
        assert_eq!(repo.snapshot().schedules.len(), 1);
    }

    #[tokio::test]
    async fn test_time_queries() {
        let (_repo, store) = store();
        let added = store
            .add_scheduled_recordings(vec![
                program_schedule(1, 0, 100),
                program_schedule(2, 200, 300),
                program_schedule(3, 400, 500),
            ])
            .await
            .unwrap();
        store
            .change_state(added[0].id, RecordingState::InProgress)
            .await
            .unwrap();

        assert_eq!(store.available_scheduled_recordings(50).len(), 3);
        assert_eq!(store.started_recordings(50).len(), 1);
        assert_eq!(store.non_started_recordings(50).len(), 2);
        assert_eq!(store.next_start_time_after(50), Some(200));
        assert_eq!(store.next_start_time_after(200), Some(400));
        assert_eq!(store.next_start_time_after(500), None);
        assert_eq!(store.available_scheduled_recordings(150).len(), 2);
    }
}
