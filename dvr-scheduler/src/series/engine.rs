//! Series expansion engine.
//!
//! Turns standing series rules into concrete per-episode schedules. Each
//! update runs as a cancellable background task; a newer update touching a
//! series cancels the in-flight one and restarts it with the union of both
//! series sets.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::episode::{CandidateFilter, ScheduledEpisode, pick_one_program_per_episode, recorded_episodes};
use crate::{Result, soft_assert};
use crate::catalog::{ProgramQuery, ProgramSource, SeriesInfoSource};
use crate::clock::Clock;
use crate::domain::{
    ChannelOption, Program, RecordingState, ScheduledRecording, SeriesRecording,
    SeriesRecordingId,
};
use crate::store::{ScheduleStore, StoreEvent};

struct UpdateTask {
    id: u64,
    series: Vec<SeriesRecording>,
    token: CancellationToken,
}

impl UpdateTask {
    fn covers(&self, id: SeriesRecordingId) -> bool {
        self.series.iter().any(|s| s.id == id)
    }
}

pub struct SeriesRecordingScheduler {
    store: Arc<dyn ScheduleStore>,
    programs: Arc<dyn ProgramSource>,
    series_info: Arc<dyn SeriesInfoSource>,
    clock: Arc<dyn Clock>,
    tasks: Mutex<Vec<UpdateTask>>,
    fetched_series_ids: Mutex<HashSet<String>>,
    next_task_id: AtomicU64,
    started: AtomicBool,
    cancellation_token: Mutex<CancellationToken>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl SeriesRecordingScheduler {
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        programs: Arc<dyn ProgramSource>,
        series_info: Arc<dyn SeriesInfoSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            programs,
            series_info,
            clock,
            tasks: Mutex::new(Vec::new()),
            fetched_series_ids: Mutex::new(HashSet::new()),
            next_task_id: AtomicU64::new(1),
            started: AtomicBool::new(false),
            cancellation_token: Mutex::new(CancellationToken::new()),
            listener: Mutex::new(None),
        }
    }

    /// Series ids whose metadata was already fetched, e.g. restored from a
    /// previous run.
    pub fn with_fetched_series_ids(self, ids: impl IntoIterator<Item = String>) -> Self {
        self.fetched_series_ids.lock().extend(ids);
        self
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn fetched_series_ids(&self) -> HashSet<String> {
        self.fetched_series_ids.lock().clone()
    }

    /// Number of update tasks still running.
    pub fn pending_updates(&self) -> usize {
        self.tasks.lock().len()
    }

    // ========== Lifecycle ==========

    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        soft_assert!(self.store.is_loaded(), "series scheduler started before the store loaded");
        info!("Starting series recording scheduler");

        let token = CancellationToken::new();
        *self.cancellation_token.lock() = token.clone();

        let mut events = self.store.subscribe();
        let engine = Arc::clone(self);
        let listener = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = token.cancelled() => break,

                    event = events.recv() => match event {
                        Ok(event) => engine.handle_store_event(event),
                        Err(RecvError::Lagged(missed)) => {
                            warn!("Series scheduler missed {} store events, updating all", missed);
                            engine.update_all();
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        });
        *self.listener.lock() = Some(listener);

        let fetched = self.fetched_series_ids();
        for series in self.store.series_recordings() {
            if !fetched.contains(&series.series_id) {
                self.fetch_series_info(series);
            }
        }
        self.update_all();
    }

    pub fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Stopping series recording scheduler");
        self.cancellation_token.lock().cancel();
        for task in self.tasks.lock().drain(..) {
            task.token.cancel();
        }
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
    }

    // ========== Updates ==========

    /// Create or refresh schedules for every series rule.
    pub fn update_all(self: &Arc<Self>) {
        if !self.is_started() {
            return;
        }
        self.update_schedules(self.store.series_recordings());
    }

    /// Restart expansion for `series`, folding in any in-flight task that
    /// covers one of them.
    pub fn update_schedules(self: &Arc<Self>, series: Vec<SeriesRecording>) {
        let mut to_update: HashMap<SeriesRecordingId, SeriesRecording> =
            series.into_iter().map(|s| (s.id, s)).collect();
        {
            let mut tasks = self.tasks.lock();
            tasks.retain(|task| {
                if to_update.keys().any(|id| task.covers(*id)) {
                    task.token.cancel();
                    for s in &task.series {
                        to_update.entry(s.id).or_insert_with(|| s.clone());
                    }
                    false
                } else {
                    true
                }
            });
        }

        // Work on the stored copies; removed rules drop out.
        let mut to_update: Vec<SeriesRecording> = to_update
            .into_keys()
            .filter_map(|id| self.store.series_recording(id))
            .collect();
        if to_update.is_empty() || !self.store.is_loaded() {
            return;
        }
        to_update.sort_by_key(|s| s.id);

        if to_update.iter().any(|s| s.channel_option == ChannelOption::All) {
            self.spawn_update(to_update);
        } else {
            for series in to_update {
                self.spawn_update(vec![series]);
            }
        }
    }

    fn spawn_update(self: &Arc<Self>, series: Vec<SeriesRecording>) {
        let id = self.next_task_id.fetch_add(1, Ordering::SeqCst);
        let token = self.cancellation_token.lock().child_token();
        debug!(task = id, series = series.len(), "Spawning series update");
        self.tasks.lock().push(UpdateTask {
            id,
            series: series.clone(),
            token: token.clone(),
        });

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = token.cancelled() => {
                    debug!(task = id, "Series update cancelled");
                    return;
                }
                result = engine.run_update(&series, &token) => result,
            };
            engine.tasks.lock().retain(|task| task.id != id);
            if let Err(e) = result {
                error!(task = id, "Creating schedules for series recordings failed: {}", e);
            }
        });
    }

    /// Query, filter and apply one update. Returns the number of programs
    /// handed to the store.
    pub async fn run_update(
        &self,
        series: &[SeriesRecording],
        token: &CancellationToken,
    ) -> Result<usize> {
        let now = self.clock.now_ms();
        let filter = CandidateFilter::new(self.store.as_ref(), series, HashSet::new(), now);
        let programs = self.programs.query_programs(&build_query(series, now)).await?;
        if token.is_cancelled() {
            return Ok(0);
        }

        let candidates: Vec<Program> = programs.into_iter().filter(|p| filter.accepts(p)).collect();
        let mut picked = pick_one_program_per_episode(self.store.as_ref(), series, candidates);

        let mut applied = 0;
        for rule in series {
            // The rule may have been removed or changed while querying.
            let Some(current) = self.store.series_recording(rule.id) else {
                continue;
            };
            let programs = picked.remove(&rule.id).unwrap_or_default();
            if programs.is_empty() {
                continue;
            }
            applied += programs.len();
            add_schedule_to_series_recording(self.store.as_ref(), &current, &programs).await?;
        }
        Ok(applied)
    }

    /// Programs that would be scheduled for a series rule that is not stored
    /// yet. In-flight updates are restarted afterwards.
    pub async fn query_programs(self: &Arc<Self>, series: &SeriesRecording) -> Result<Vec<Program>> {
        soft_assert!(self.store.is_loaded(), "series programs queried before the store loaded");
        let now = self.clock.now_ms();
        let single = std::slice::from_ref(series);
        let recorded = recorded_episodes(series, &self.store.recorded_programs());

        let result = async {
            let filter = CandidateFilter::new(self.store.as_ref(), single, recorded, now);
            let programs = self.programs.query_programs(&build_query(single, now)).await?;
            let candidates: Vec<Program> =
                programs.into_iter().filter(|p| filter.accepts(p)).collect();
            let mut picked = pick_one_program_per_episode(self.store.as_ref(), single, candidates);
            Ok(picked.remove(&series.id).unwrap_or_default())
        }
        .await;

        self.restart_tasks();
        result
    }

    /// Run [`query_programs`](Self::query_programs) in the background and
    /// hand the programs to `on_done`. Errors yield an empty list.
    pub fn expand_series<F>(self: &Arc<Self>, series: SeriesRecording, on_done: F) -> JoinHandle<()>
    where
        F: FnOnce(Vec<Program>) + Send + 'static,
    {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            match engine.query_programs(&series).await {
                Ok(programs) => on_done(programs),
                Err(e) => {
                    error!(series_id = %series.series_id, "Loading programs for series failed: {}", e);
                    on_done(Vec::new());
                }
            }
        })
    }

    fn restart_tasks(self: &Arc<Self>) {
        let series: Vec<SeriesRecording> = {
            let mut tasks = self.tasks.lock();
            tasks
                .drain(..)
                .flat_map(|task| {
                    task.token.cancel();
                    task.series
                })
                .collect()
        };
        if !series.is_empty() {
            self.update_schedules(series);
        }
    }

    // ========== Store events ==========

    fn handle_store_event(self: &Arc<Self>, event: StoreEvent) {
        match event {
            StoreEvent::LoadFinished => self.update_all(),
            StoreEvent::SeriesAdded(series) => {
                for s in series {
                    self.fetch_series_info(s);
                }
            }
            StoreEvent::SeriesRemoved(series) => self.cancel_tasks_for_removed(&series),
            StoreEvent::SeriesChanged(series) => self.update_schedules(series),
            StoreEvent::SchedulesAdded(_) => {}
            StoreEvent::SchedulesRemoved(schedules) => self.handle_schedule_change(&schedules),
            StoreEvent::SchedulesStatusChanged(schedules) => {
                let lost: Vec<ScheduledRecording> = schedules
                    .into_iter()
                    .filter(|s| matches!(s.state, RecordingState::Failed | RecordingState::Clipped))
                    .filter(|s| {
                        ScheduledEpisode::for_schedule(s).is_some_and(|e| e.is_complete())
                    })
                    .collect();
                self.handle_schedule_change(&lost);
            }
        }
    }

    /// Cancel tasks whose series were all removed.
    fn cancel_tasks_for_removed(&self, removed: &[SeriesRecording]) {
        let removed: HashSet<SeriesRecordingId> = removed.iter().map(|s| s.id).collect();
        self.tasks.lock().retain(|task| {
            if task.series.iter().all(|s| removed.contains(&s.id)) {
                task.token.cancel();
                false
            } else {
                true
            }
        });
    }

    /// Re-expand the series owning any of `schedules`.
    fn handle_schedule_change(self: &Arc<Self>, schedules: &[ScheduledRecording]) {
        let ids: HashSet<SeriesRecordingId> = schedules
            .iter()
            .filter(|s| s.state != RecordingState::Finished)
            .filter_map(|s| s.series_recording_id)
            .collect();
        let series: Vec<SeriesRecording> = ids
            .into_iter()
            .filter_map(|id| self.store.series_recording(id))
            .collect();
        if !series.is_empty() {
            self.update_schedules(series);
        }
    }

    // ========== Series info ==========

    fn fetch_series_info(self: &Arc<Self>, series: SeriesRecording) {
        let engine = Arc::clone(self);
        let token = self.cancellation_token.lock().child_token();
        tokio::spawn(async move {
            let info = tokio::select! {
                _ = token.cancelled() => return,
                info = engine.series_info.series_info(&series.series_id) => info,
            };
            match info {
                Ok(Some(info)) => {
                    let Some(mut current) = engine.store.series_recording(series.id) else {
                        return;
                    };
                    current.apply_info(&info);
                    if let Err(e) = engine.store.update_series_recording(current).await {
                        error!(series_id = %series.series_id, "Failed to store series info: {}", e);
                        return;
                    }
                    engine.fetched_series_ids.lock().insert(info.series_id);
                }
                Ok(None) => debug!(series_id = %series.series_id, "No series info available"),
                Err(e) => warn!(series_id = %series.series_id, "Fetching series info failed: {}", e),
            }
        });
    }
}

fn build_query(series: &[SeriesRecording], now_ms: i64) -> ProgramQuery {
    let all_channels = series.iter().any(|s| s.channel_option == ChannelOption::All);
    ProgramQuery {
        series_ids: series.iter().map(|s| s.series_id.clone()).collect(),
        start_after_ms: now_ms,
        channel_id: match series {
            [single] if !all_channels => Some(single.channel_id),
            _ => None,
        },
    }
}

/// Attach `programs` to `series`.
///
/// A `NOT_STARTED` or `CANCELED` schedule that already exists for a program
/// takes the series' priority and back-reference. Programs without a
/// schedule get a new one, pre-cancelled when the series is cancelled.
pub async fn add_schedule_to_series_recording(
    store: &dyn ScheduleStore,
    series: &SeriesRecording,
    programs: &[Program],
) -> Result<()> {
    let mut to_add = Vec::new();
    let mut to_update = Vec::new();
    for program in programs {
        match store.scheduled_recording_for_program(program.id) {
            Some(existing) => {
                if matches!(existing.state, RecordingState::NotStarted | RecordingState::Canceled) {
                    let updated = existing
                        .clone()
                        .with_priority(series.priority)
                        .with_series(Some(series.id));
                    if updated != existing {
                        to_update.push(updated);
                    }
                }
            }
            None => {
                let mut schedule = ScheduledRecording::for_program(series.input_id.clone(), program)
                    .with_priority(series.priority)
                    .with_series(Some(series.id));
                if series.is_canceled() {
                    schedule = schedule.with_state(RecordingState::Canceled);
                }
                to_add.push(schedule);
            }
        }
    }

    if !to_add.is_empty() {
        info!(series_recording_id = %series.id, "Adding {} episode schedule(s)", to_add.len());
        store.add_scheduled_recordings(to_add).await?;
    }
    if !to_update.is_empty() {
        store.update_scheduled_recordings(to_update).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::StaticCatalog;
    use crate::clock::ManualClock;
    use crate::domain::{
        ChannelId, InputId, Priority, ProgramId, SeriesInfo, SeriesPriority, SeriesState,
    };
    use crate::events::EventBroadcaster;
    use crate::store::{InMemoryRepository, MemoryScheduleStore};

    const NOW: i64 = 1_000_000;

    struct Fixture {
        engine: Arc<SeriesRecordingScheduler>,
        store: Arc<MemoryScheduleStore<InMemoryRepository>>,
        catalog: Arc<StaticCatalog>,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryScheduleStore::new(
            Arc::new(InMemoryRepository::new()),
            EventBroadcaster::new(),
        ));
        store.load().await.unwrap();
        let catalog = Arc::new(StaticCatalog::new());
        let engine = Arc::new(SeriesRecordingScheduler::new(
            store.clone(),
            catalog.clone(),
            catalog.clone(),
            Arc::new(ManualClock::new(NOW)),
        ));
        Fixture {
            engine,
            store,
            catalog,
        }
    }

    fn episode(id: i64, channel: i64, start: i64, number: &str) -> Program {
        Program::new(ProgramId(id), ChannelId(channel), start, start + 1_000)
            .with_series("show")
            .with_episode(Some("1"), Some(number))
    }

    async fn add_series(store: &MemoryScheduleStore<InMemoryRepository>, option: ChannelOption) -> SeriesRecording {
        store
            .add_series_recording(
                SeriesRecording::new("show", InputId::new("tuner"), ChannelId(1))
                    .with_channel_option(option)
                    .with_priority(SeriesPriority::DEFAULT),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_run_update_dedups_across_channels() {
        let f = fixture().await;
        let series = add_series(&f.store, ChannelOption::All).await;
        f.catalog.set_programs(vec![
            episode(1, 1, NOW + 10_000, "1"),
            episode(2, 2, NOW + 5_000, "1"),
            episode(3, 1, NOW + 20_000, "2"),
        ]);

        let applied = f
            .engine
            .run_update(&[series.clone()], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(applied, 2);

        let mut program_ids: Vec<i64> = f
            .store
            .scheduled_recordings_for_series(series.id)
            .iter()
            .filter_map(|s| s.program_id.map(ProgramId::get))
            .collect();
        program_ids.sort();
        assert_eq!(program_ids, vec![2, 3]);

        // A second pass finds nothing new.
        let applied = f
            .engine
            .run_update(&[series], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(applied, 0);
    }

    #[tokio::test]
    async fn test_canceled_series_creates_canceled_schedules() {
        let f = fixture().await;
        let series = add_series(&f.store, ChannelOption::One).await;
        let series = series.with_state(SeriesState::Canceled);

        add_schedule_to_series_recording(f.store.as_ref(), &series, &[episode(1, 1, NOW + 10_000, "1")])
            .await
            .unwrap();
        let schedules = f.store.scheduled_recordings_for_series(series.id);
        assert_eq!(schedules.len(), 1);
        assert_eq!(schedules[0].state, RecordingState::Canceled);
        assert_eq!(schedules[0].priority, Priority::from(series.priority));
    }

    #[tokio::test]
    async fn test_existing_schedule_adopted_by_series() {
        let f = fixture().await;
        let series = add_series(&f.store, ChannelOption::One).await;
        let program = episode(1, 1, NOW + 10_000, "1");
        f.store
            .add_scheduled_recordings(vec![ScheduledRecording::for_program(
                InputId::new("tuner"),
                &program,
            )])
            .await
            .unwrap();

        add_schedule_to_series_recording(f.store.as_ref(), &series, &[program.clone()])
            .await
            .unwrap();
        let schedule = f.store.scheduled_recording_for_program(program.id).unwrap();
        assert_eq!(schedule.series_recording_id, Some(series.id));
        assert_eq!(schedule.priority, Priority::from(series.priority));
        assert_eq!(f.store.all_scheduled_recordings().len(), 1);
    }

    #[tokio::test]
    async fn test_query_programs_skips_recorded_episodes() {
        let f = fixture().await;
        f.store
            .add_recorded_program(crate::domain::RecordedProgram {
                series_id: Some("show".into()),
                season_number: Some("1".into()),
                episode_number: Some("1".into()),
                start_ms: 1,
                end_ms: 2,
                ..Default::default()
            })
            .await
            .unwrap();
        f.catalog
            .set_programs(vec![episode(1, 1, NOW + 10_000, "1"), episode(2, 1, NOW + 20_000, "2")]);

        let series = SeriesRecording::new("show", InputId::new("tuner"), ChannelId(1));
        let programs = f.engine.query_programs(&series).await.unwrap();
        let ids: Vec<i64> = programs.iter().map(|p| p.id.get()).collect();
        assert_eq!(ids, vec![2]);
    }

    #[tokio::test]
    async fn test_start_expands_and_fetches_info() {
        let f = fixture().await;
        let series = add_series(&f.store, ChannelOption::One).await;
        f.catalog.set_programs(vec![episode(1, 1, NOW + 10_000, "1")]);
        f.catalog.upsert_series_info(SeriesInfo {
            series_id: "show".into(),
            title: Some("The Show".into()),
            ..Default::default()
        });

        let mut events = f.store.subscribe();
        f.engine.start();

        let mut saw_schedule = false;
        let mut saw_info = false;
        while !(saw_schedule && saw_info) {
            match events.recv().await.unwrap() {
                StoreEvent::SchedulesAdded(added) => {
                    assert_eq!(added[0].series_recording_id, Some(series.id));
                    saw_schedule = true;
                }
                StoreEvent::SeriesChanged(changed) => {
                    assert_eq!(changed[0].title.as_deref(), Some("The Show"));
                    saw_info = true;
                }
                _ => {}
            }
        }
        assert!(f.engine.fetched_series_ids().contains("show"));
        f.engine.stop();
        assert_eq!(f.engine.pending_updates(), 0);
    }

    /// Holds the first query until released; later queries answer at once.
    struct GatedPrograms {
        calls: AtomicU64,
        first_entered: tokio::sync::Notify,
        release_first: tokio::sync::Notify,
        stale: Vec<Program>,
        fresh: Vec<Program>,
    }

    #[async_trait::async_trait]
    impl ProgramSource for GatedPrograms {
        async fn query_programs(&self, _query: &ProgramQuery) -> Result<Vec<Program>> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                self.first_entered.notify_one();
                self.release_first.notified().await;
                return Ok(self.stale.clone());
            }
            Ok(self.fresh.clone())
        }

        fn current_program(&self, _channel_id: ChannelId, _now_ms: i64) -> Option<Program> {
            None
        }
    }

    #[tokio::test]
    async fn test_newer_update_discards_in_flight_results() {
        let f = fixture().await;
        let series = add_series(&f.store, ChannelOption::One).await;
        let programs = Arc::new(GatedPrograms {
            calls: AtomicU64::new(0),
            first_entered: tokio::sync::Notify::new(),
            release_first: tokio::sync::Notify::new(),
            stale: vec![episode(1, 1, NOW + 10_000, "1")],
            fresh: vec![episode(2, 1, NOW + 20_000, "2")],
        });
        let engine = Arc::new(SeriesRecordingScheduler::new(
            f.store.clone(),
            programs.clone(),
            f.catalog.clone(),
            Arc::new(ManualClock::new(NOW)),
        ));

        engine.update_schedules(vec![series.clone()]);
        programs.first_entered.notified().await;
        assert_eq!(engine.pending_updates(), 1);

        engine.update_schedules(vec![series.clone()]);
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while engine.pending_updates() > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        programs.release_first.notify_one();
        tokio::task::yield_now().await;

        let program_ids: Vec<Option<ProgramId>> = f
            .store
            .scheduled_recordings_for_series(series.id)
            .iter()
            .map(|s| s.program_id)
            .collect();
        assert_eq!(program_ids, vec![Some(ProgramId(2))]);
        assert_eq!(programs.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_build_query_channel_restriction() {
        let one = SeriesRecording::new("a", InputId::new("t"), ChannelId(3));
        let all = SeriesRecording::new("b", InputId::new("t"), ChannelId(4))
            .with_channel_option(ChannelOption::All);

        assert_eq!(build_query(std::slice::from_ref(&one), 5).channel_id, Some(ChannelId(3)));
        let query = build_query(&[one, all], 5);
        assert_eq!(query.channel_id, None);
        assert_eq!(query.series_ids, vec!["a".to_string(), "b".to_string()]);
    }
}
