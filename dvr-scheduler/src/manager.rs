//! Schedule manager.
//!
//! Tracks, per input, the schedules that still compete for a tuner
//! (`NOT_STARTED` or `IN_PROGRESS`) and the conflict set derived from them.
//! Every store mutation updates the per-input lists, recomputes conflicts and
//! publishes only the delta.
//!
//! Nothing is computed until both the schedules and the channel metadata
//! have loaded; queries issued before that return empty results.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::ChannelCatalog;
use crate::clock::Clock;
use crate::conflict;
use crate::domain::{
    ChannelId, EpisodePriority, InputId, InputInfo, Priority, Program, ScheduleId,
    ScheduledRecording, SeriesPriority,
};
use crate::events::EventBroadcaster;
use crate::store::{ScheduleStore, StoreEvent};

/// Events re-emitted to UI-facing listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerEvent {
    SchedulesAdded(Vec<ScheduledRecording>),
    SchedulesRemoved(Vec<ScheduledRecording>),
    SchedulesStatusChanged(Vec<ScheduledRecording>),
    /// `conflicting == false` lists schedules whose conflict was resolved.
    ConflictStateChanged {
        conflicting: bool,
        schedules: Vec<ScheduledRecording>,
    },
}

#[derive(Debug, Default)]
struct ManagerState {
    schedules_loaded: bool,
    channels_loaded: bool,
    initialized: bool,
    input_schedules: HashMap<InputId, Vec<ScheduledRecording>>,
    input_conflicts: HashMap<InputId, Vec<ScheduledRecording>>,
}

pub struct ScheduleManager {
    store: Arc<dyn ScheduleStore>,
    catalog: Arc<dyn ChannelCatalog>,
    clock: Arc<dyn Clock>,
    state: RwLock<ManagerState>,
    broadcaster: EventBroadcaster<ManagerEvent>,
}

impl ScheduleManager {
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        catalog: Arc<dyn ChannelCatalog>,
        clock: Arc<dyn Clock>,
        broadcaster: EventBroadcaster<ManagerEvent>,
    ) -> Self {
        Self {
            store,
            catalog,
            clock,
            state: RwLock::new(ManagerState::default()),
            broadcaster,
        }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ManagerEvent> {
        self.broadcaster.subscribe()
    }

    pub fn is_initialized(&self) -> bool {
        self.state.read().initialized
    }

    /// Follow the store until `token` is cancelled.
    pub fn run(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        // Subscribe before sampling the load flags so LoadFinished cannot slip by.
        let mut events = manager.store.subscribe();
        if manager.store.is_loaded() {
            manager.on_schedules_loaded();
        }
        if manager.catalog.is_loaded() {
            manager.on_channels_loaded();
        }

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = token.cancelled() => {
                        debug!("Schedule manager stopping");
                        break;
                    }

                    event = events.recv() => match event {
                        Ok(event) => manager.handle_store_event(&event),
                        Err(RecvError::Lagged(missed)) => {
                            warn!("Schedule manager missed {} store events, rebuilding", missed);
                            manager.rebuild();
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        })
    }

    // ========== Readiness ==========

    pub fn on_schedules_loaded(&self) {
        let mut state = self.state.write();
        state.schedules_loaded = true;
        if state.channels_loaded {
            self.build_data(&mut *state);
        }
    }

    pub fn on_channels_loaded(&self) {
        let mut state = self.state.write();
        state.channels_loaded = true;
        if state.schedules_loaded {
            self.build_data(&mut *state);
        }
    }

    /// Channels were added or removed; schedules may have changed input.
    pub fn on_channel_list_updated(&self) {
        let mut state = self.state.write();
        if state.schedules_loaded {
            self.build_data(&mut *state);
        }
    }

    /// Rebuild everything from the store.
    pub fn rebuild(&self) {
        let mut state = self.state.write();
        if state.schedules_loaded && state.channels_loaded {
            self.build_data(&mut *state);
        }
    }

    fn build_data(&self, state: &mut ManagerState) {
        state.input_schedules.clear();
        for schedule in self.store.all_scheduled_recordings() {
            if !schedule.state.is_pending() {
                continue;
            }
            // The input may be temporarily unavailable; only the channel must exist.
            if let Some(channel) = self.catalog.channel(schedule.channel_id) {
                state
                    .input_schedules
                    .entry(channel.input_id)
                    .or_default()
                    .push(schedule);
            }
        }
        if !state.initialized {
            state.initialized = true;
            info!(
                "Schedule manager initialized with {} input(s)",
                state.input_schedules.len()
            );
        }
        self.update_conflicts(state);
    }

    // ========== Store events ==========

    pub fn handle_store_event(&self, event: &StoreEvent) {
        match event {
            StoreEvent::LoadFinished => self.on_schedules_loaded(),
            StoreEvent::SchedulesAdded(schedules) => {
                if self.apply(|state| {
                    for schedule in schedules.iter().filter(|s| s.state.is_pending()) {
                        self.insert(state, schedule.clone());
                    }
                }) {
                    self.broadcaster
                        .publish(ManagerEvent::SchedulesAdded(schedules.clone()));
                }
            }
            StoreEvent::SchedulesRemoved(schedules) => {
                if self.apply(|state| {
                    for schedule in schedules {
                        Self::remove(state, schedule.id);
                    }
                }) {
                    self.broadcaster
                        .publish(ManagerEvent::SchedulesRemoved(schedules.clone()));
                }
            }
            StoreEvent::SchedulesStatusChanged(schedules) => {
                if self.apply(|state| {
                    for schedule in schedules {
                        Self::remove(state, schedule.id);
                        if schedule.state.is_pending() {
                            self.insert(state, schedule.clone());
                        }
                    }
                }) {
                    self.broadcaster
                        .publish(ManagerEvent::SchedulesStatusChanged(schedules.clone()));
                }
            }
            StoreEvent::SeriesAdded(_) | StoreEvent::SeriesRemoved(_) | StoreEvent::SeriesChanged(_) => {}
        }
    }

    /// Run `mutate` and recompute conflicts. Returns false before initialization.
    fn apply(&self, mutate: impl FnOnce(&mut ManagerState)) -> bool {
        let mut state = self.state.write();
        if !state.initialized {
            return false;
        }
        mutate(&mut *state);
        self.update_conflicts(&mut *state);
        true
    }

    fn insert(&self, state: &mut ManagerState, schedule: ScheduledRecording) {
        let Some(channel) = self.catalog.channel(schedule.channel_id) else {
            debug!(schedule_id = %schedule.id, "Skipping schedule on unknown channel");
            return;
        };
        state
            .input_schedules
            .entry(channel.input_id)
            .or_default()
            .push(schedule);
    }

    fn remove(state: &mut ManagerState, id: ScheduleId) {
        for schedules in state.input_schedules.values_mut() {
            schedules.retain(|s| s.id != id);
        }
        state.input_schedules.retain(|_, schedules| !schedules.is_empty());
    }

    fn update_conflicts(&self, state: &mut ManagerState) {
        let old_conflicts = std::mem::take(&mut state.input_conflicts);
        for (input_id, schedules) in &state.input_schedules {
            let Some(input) = self.catalog.input(input_id) else {
                continue;
            };
            let conflicts = conflict::conflicting_schedules(schedules, input.tuner_count);
            if !conflicts.is_empty() {
                state.input_conflicts.insert(input_id.clone(), conflicts);
            }
        }

        let old: HashMap<ScheduleId, &ScheduledRecording> = old_conflicts
            .values()
            .flatten()
            .map(|s| (s.id, s))
            .collect();
        let new: HashMap<ScheduleId, &ScheduledRecording> = state
            .input_conflicts
            .values()
            .flatten()
            .map(|s| (s.id, s))
            .collect();

        let mut resolved: Vec<ScheduledRecording> = old
            .iter()
            .filter(|(id, _)| !new.contains_key(id))
            .map(|(_, s)| (*s).clone())
            .collect();
        let mut conflicting: Vec<ScheduledRecording> = new
            .iter()
            .filter(|(id, _)| !old.contains_key(id))
            .map(|(_, s)| (*s).clone())
            .collect();

        if !resolved.is_empty() {
            resolved.sort_by_key(|s| s.id);
            debug!("{} schedule(s) no longer conflicting", resolved.len());
            self.broadcaster.publish(ManagerEvent::ConflictStateChanged {
                conflicting: false,
                schedules: resolved,
            });
        }
        if !conflicting.is_empty() {
            conflicting.sort_by_key(|s| s.id);
            debug!("{} schedule(s) became conflicting", conflicting.len());
            self.broadcaster.publish(ManagerEvent::ConflictStateChanged {
                conflicting: true,
                schedules: conflicting,
            });
        }
    }

    // ========== Queries ==========

    /// Pending schedules tracked for `input_id`.
    pub fn schedules_for_input(&self, input_id: &InputId) -> Vec<ScheduledRecording> {
        self.state
            .read()
            .input_schedules
            .get(input_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn started_recordings(&self, input_id: &InputId) -> Vec<ScheduledRecording> {
        self.schedules_for_input(input_id)
            .into_iter()
            .filter(ScheduledRecording::is_in_progress)
            .collect()
    }

    /// Current conflict set of `input_id`, lowest priority first.
    pub fn conflicting_schedules(&self, input_id: &InputId) -> Vec<ScheduledRecording> {
        self.state
            .read()
            .input_conflicts
            .get(input_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn all_conflicting_schedules(&self) -> Vec<ScheduledRecording> {
        let mut list: Vec<ScheduledRecording> = self
            .state
            .read()
            .input_conflicts
            .values()
            .flatten()
            .cloned()
            .collect();
        list.sort_by_key(|s| s.id);
        list
    }

    pub fn is_conflicting(&self, schedule: &ScheduledRecording) -> bool {
        self.state
            .read()
            .input_conflicts
            .values()
            .flatten()
            .any(|s| s.id == schedule.id)
    }

    /// Conflicts that scheduling `program` now would cause.
    pub fn conflicting_schedules_for_program(&self, program: &Program) -> Vec<ScheduledRecording> {
        if !self.is_initialized() || !program.is_valid() {
            return Vec::new();
        }
        let Some(input) = self.recordable_input(program.channel_id) else {
            return Vec::new();
        };
        let candidate = ScheduledRecording::for_program(input.id.clone(), program)
            .with_priority(self.suggest_new_priority());
        conflict::conflicts_if_added(
            &[candidate],
            &self.schedules_for_input(&input.id),
            input.tuner_count,
        )
    }

    /// Conflicts that recording `channel_id` over `[start_ms, end_ms)` would cause.
    pub fn conflicting_schedules_for_range(
        &self,
        channel_id: ChannelId,
        start_ms: i64,
        end_ms: i64,
    ) -> Vec<ScheduledRecording> {
        if !self.is_initialized() || start_ms >= end_ms {
            return Vec::new();
        }
        let Some(input) = self.recordable_input(channel_id) else {
            return Vec::new();
        };
        let candidate =
            ScheduledRecording::for_time_range(input.id.clone(), channel_id, start_ms, end_ms)
                .with_priority(self.suggest_new_priority());
        conflict::conflicts_if_added(
            &[candidate],
            &self.schedules_for_input(&input.id),
            input.tuner_count,
        )
    }

    /// Started recordings that tuning to `channel_id` would interrupt.
    pub fn conflicting_schedules_for_tune(&self, channel_id: ChannelId) -> Vec<ScheduledRecording> {
        if !self.is_initialized() {
            return Vec::new();
        }
        let Some(input) = self.recordable_input(channel_id) else {
            return Vec::new();
        };
        let started = self.started_recordings(&input.id);
        conflict::conflicts_for_tune(
            &input.id,
            channel_id,
            self.clock.now_ms(),
            self.suggest_new_priority().into(),
            &started,
            input.tuner_count,
        )
    }

    /// Schedules that watching `channel_id` indefinitely would prevent.
    pub fn conflicting_schedules_for_watching(
        &self,
        channel_id: ChannelId,
    ) -> Vec<ScheduledRecording> {
        if !self.is_initialized() {
            return Vec::new();
        }
        let Some(input) = self.recordable_input(channel_id) else {
            return Vec::new();
        };
        let schedules = self.schedules_for_input(&input.id);
        if schedules.is_empty() {
            return Vec::new();
        }
        conflict::conflicts_for_watching(
            &input.id,
            channel_id,
            self.clock.now_ms(),
            self.suggest_new_priority().into(),
            &schedules,
            input.tuner_count,
        )
    }

    fn recordable_input(&self, channel_id: ChannelId) -> Option<InputInfo> {
        self.catalog
            .input_for_channel(channel_id)
            .filter(|input| input.can_record && input.tuner_count > 0)
    }

    // ========== Priorities ==========

    /// Priority beating every existing schedule.
    pub fn suggest_new_priority(&self) -> EpisodePriority {
        if !self.is_initialized() {
            return EpisodePriority::DEFAULT;
        }
        let highest: Option<Priority> = self
            .store
            .all_scheduled_recordings()
            .iter()
            .map(|s| s.priority)
            .max();
        EpisodePriority::above(highest)
    }

    /// Priority beating every existing series recording.
    pub fn suggest_new_series_priority(&self) -> SeriesPriority {
        if !self.is_initialized() {
            return SeriesPriority::DEFAULT;
        }
        let highest = self
            .store
            .series_recordings()
            .iter()
            .map(|s| s.priority)
            .max();
        SeriesPriority::above(highest)
    }

    /// Input ids that currently have pending schedules.
    pub fn inputs_with_schedules(&self) -> HashSet<InputId> {
        self.state.read().input_schedules.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::StaticCatalog;
    use crate::clock::ManualClock;
    use crate::domain::{Channel, InputInfo, ProgramId, RecordingState};
    use crate::store::{InMemoryRepository, MemoryScheduleStore, StoreEventBroadcaster};

    const NOW: i64 = 1_000_000;

    struct Fixture {
        store: Arc<MemoryScheduleStore<InMemoryRepository>>,
        catalog: Arc<StaticCatalog>,
        manager: ScheduleManager,
    }

    fn fixture(tuners: usize) -> Fixture {
        let store = Arc::new(MemoryScheduleStore::new(
            Arc::new(InMemoryRepository::new()),
            StoreEventBroadcaster::new(),
        ));
        let catalog = Arc::new(StaticCatalog::new());
        catalog.upsert_input(InputInfo::new(InputId::new("tuner"), tuners));
        for id in 1..=3 {
            catalog.upsert_channel(Channel::new(ChannelId(id), InputId::new("tuner"), "ch"));
        }
        let manager = ScheduleManager::new(
            store.clone(),
            catalog.clone(),
            Arc::new(ManualClock::new(NOW)),
            EventBroadcaster::new(),
        );
        Fixture {
            store,
            catalog,
            manager,
        }
    }

    fn timed(channel: i64, start: i64, end: i64, priority: i64) -> ScheduledRecording {
        ScheduledRecording::for_time_range(InputId::new("tuner"), ChannelId(channel), start, end)
            .with_priority(Priority(priority))
    }

    #[tokio::test]
    async fn test_queries_before_initialization_are_empty() {
        let f = fixture(1);
        f.manager.on_schedules_loaded();
        assert!(!f.manager.is_initialized());
        let program = Program::new(ProgramId(1), ChannelId(1), NOW, NOW + 100);
        assert!(f.manager.conflicting_schedules_for_program(&program).is_empty());
        assert!(f.manager.conflicting_schedules_for_watching(ChannelId(1)).is_empty());
        assert_eq!(f.manager.suggest_new_priority(), EpisodePriority::DEFAULT);

        f.manager.on_channels_loaded();
        assert!(f.manager.is_initialized());
    }

    #[tokio::test]
    async fn test_conflict_delta_events() {
        let f = fixture(1);
        f.manager.on_schedules_loaded();
        f.manager.on_channels_loaded();
        let mut rx = f.manager.subscribe();

        let low = f
            .store
            .add_scheduled_recordings(vec![timed(1, NOW, NOW + 100, 1)])
            .await
            .unwrap();
        f.manager
            .handle_store_event(&StoreEvent::SchedulesAdded(low.clone()));
        assert_eq!(rx.try_recv().unwrap(), ManagerEvent::SchedulesAdded(low.clone()));

        let high = f
            .store
            .add_scheduled_recordings(vec![timed(2, NOW, NOW + 100, 5)])
            .await
            .unwrap();
        f.manager
            .handle_store_event(&StoreEvent::SchedulesAdded(high.clone()));
        assert_eq!(
            rx.try_recv().unwrap(),
            ManagerEvent::ConflictStateChanged {
                conflicting: true,
                schedules: low.clone(),
            }
        );
        assert_eq!(rx.try_recv().unwrap(), ManagerEvent::SchedulesAdded(high.clone()));
        assert!(f.manager.is_conflicting(&low[0]));

        // Failing the winner resolves the loser's conflict.
        let failed = high[0].clone().with_state(RecordingState::Failed);
        f.manager
            .handle_store_event(&StoreEvent::SchedulesStatusChanged(vec![failed]));
        assert_eq!(
            rx.try_recv().unwrap(),
            ManagerEvent::ConflictStateChanged {
                conflicting: false,
                schedules: low.clone(),
            }
        );
        assert!(!f.manager.is_conflicting(&low[0]));
    }

    #[tokio::test]
    async fn test_unknown_channel_is_skipped() {
        let f = fixture(1);
        f.manager.on_schedules_loaded();
        f.manager.on_channels_loaded();
        let added = f
            .store
            .add_scheduled_recordings(vec![timed(9, NOW, NOW + 100, 1)])
            .await
            .unwrap();
        f.manager.handle_store_event(&StoreEvent::SchedulesAdded(added));
        assert!(f.manager.inputs_with_schedules().is_empty());
    }

    #[tokio::test]
    async fn test_channel_list_update_rebuilds() {
        let f = fixture(1);
        f.store
            .add_scheduled_recordings(vec![timed(1, NOW, NOW + 100, 1)])
            .await
            .unwrap();
        f.manager.on_schedules_loaded();
        f.manager.on_channels_loaded();
        assert_eq!(f.manager.schedules_for_input(&InputId::new("tuner")).len(), 1);

        f.catalog.remove_channel(ChannelId(1));
        f.manager.on_channel_list_updated();
        assert!(f.manager.schedules_for_input(&InputId::new("tuner")).is_empty());
    }

    #[tokio::test]
    async fn test_program_conflicts_guarded_by_input() {
        let f = fixture(1);
        f.manager.on_schedules_loaded();
        f.manager.on_channels_loaded();
        let added = f
            .store
            .add_scheduled_recordings(vec![timed(1, NOW, NOW + 100, 1)])
            .await
            .unwrap();
        f.manager
            .handle_store_event(&StoreEvent::SchedulesAdded(added.clone()));

        let program = Program::new(ProgramId(1), ChannelId(2), NOW, NOW + 100);
        assert_eq!(f.manager.conflicting_schedules_for_program(&program), added);

        let invalid = Program::new(ProgramId(2), ChannelId(2), NOW + 100, NOW);
        assert!(f.manager.conflicting_schedules_for_program(&invalid).is_empty());

        f.catalog.upsert_input(InputInfo {
            can_record: false,
            ..InputInfo::new(InputId::new("tuner"), 1)
        });
        assert!(f.manager.conflicting_schedules_for_program(&program).is_empty());
    }

    #[tokio::test]
    async fn test_suggest_priorities() {
        let f = fixture(1);
        f.manager.on_schedules_loaded();
        f.manager.on_channels_loaded();
        assert_eq!(f.manager.suggest_new_priority(), EpisodePriority::DEFAULT);

        let top = EpisodePriority::DEFAULT.get() + 10;
        f.store
            .add_scheduled_recordings(vec![timed(1, NOW, NOW + 100, top)])
            .await
            .unwrap();
        assert_eq!(
            f.manager.suggest_new_priority().get(),
            top + crate::domain::PRIORITY_OFFSET
        );
        assert_eq!(f.manager.suggest_new_series_priority(), SeriesPriority::DEFAULT);
    }
}
