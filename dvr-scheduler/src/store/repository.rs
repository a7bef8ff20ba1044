//! Persistence behind the schedule store.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::domain::{
    RecordedProgram, RecordedProgramId, ScheduleId, ScheduledRecording, SeriesRecording,
    SeriesRecordingId,
};
use crate::{Error, Result};

/// Everything the store persists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreSnapshot {
    /// Includes `DELETED` tombstones.
    pub schedules: Vec<ScheduledRecording>,
    pub series: Vec<SeriesRecording>,
    pub recorded_programs: Vec<RecordedProgram>,
}

/// Persistence contract.
#[async_trait]
pub trait ScheduleRepository: Send + Sync {
    async fn load(&self) -> Result<StoreSnapshot>;

    /// Insert or replace schedules by id.
    async fn upsert_schedules(&self, schedules: &[ScheduledRecording]) -> Result<()>;
    async fn delete_schedules(&self, ids: &[ScheduleId]) -> Result<()>;

    async fn upsert_series(&self, series: &SeriesRecording) -> Result<()>;
    async fn delete_series(&self, id: SeriesRecordingId) -> Result<()>;

    async fn insert_recorded_program(&self, program: &RecordedProgram) -> Result<()>;
}

/// Repository keeping everything in process memory.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    schedules: Mutex<BTreeMap<ScheduleId, ScheduledRecording>>,
    series: Mutex<BTreeMap<SeriesRecordingId, SeriesRecording>>,
    recorded: Mutex<BTreeMap<RecordedProgramId, RecordedProgram>>,
    fail_writes: AtomicBool,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Repository pre-populated with `snapshot`.
    pub fn with_snapshot(snapshot: StoreSnapshot) -> Self {
        let repo = Self::new();
        repo.schedules
            .lock()
            .extend(snapshot.schedules.into_iter().map(|s| (s.id, s)));
        repo.series
            .lock()
            .extend(snapshot.series.into_iter().map(|s| (s.id, s)));
        repo.recorded
            .lock()
            .extend(snapshot.recorded_programs.into_iter().map(|p| (p.id, p)));
        repo
    }

    /// Make every subsequent write fail until cleared.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::storage("repository rejected the write"));
        }
        Ok(())
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            schedules: self.schedules.lock().values().cloned().collect(),
            series: self.series.lock().values().cloned().collect(),
            recorded_programs: self.recorded.lock().values().cloned().collect(),
        }
    }
}

#[async_trait]
impl ScheduleRepository for InMemoryRepository {
    async fn load(&self) -> Result<StoreSnapshot> {
        Ok(self.snapshot())
    }

    async fn upsert_schedules(&self, schedules: &[ScheduledRecording]) -> Result<()> {
        self.check_writable()?;
        let mut stored = self.schedules.lock();
        for schedule in schedules {
            stored.insert(schedule.id, schedule.clone());
        }
        Ok(())
    }

    async fn delete_schedules(&self, ids: &[ScheduleId]) -> Result<()> {
        self.check_writable()?;
        let mut stored = self.schedules.lock();
        for id in ids {
            stored.remove(id);
        }
        Ok(())
    }

    async fn upsert_series(&self, series: &SeriesRecording) -> Result<()> {
        self.check_writable()?;
        self.series.lock().insert(series.id, series.clone());
        Ok(())
    }

    async fn delete_series(&self, id: SeriesRecordingId) -> Result<()> {
        self.check_writable()?;
        self.series.lock().remove(&id);
        Ok(())
    }

    async fn insert_recorded_program(&self, program: &RecordedProgram) -> Result<()> {
        self.check_writable()?;
        self.recorded.lock().insert(program.id, program.clone());
        Ok(())
    }
}
