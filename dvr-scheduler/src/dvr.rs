//! DVR manager: the user-facing recording operations.
//!
//! Builds schedules and series rules from EPG programs, picks their
//! priorities and funnels every mutation through the store. Running
//! recordings are never touched directly; stop requests go to the
//! scheduler that owns the tuner.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::catalog::{ChannelCatalog, ProgramSource};
use crate::clock::Clock;
use crate::domain::{
    ChannelId, InputId, InputInfo, Priority, Program, RecordingState, ScheduledRecording,
    SeriesRecording, SeriesRecordingId, SeriesState,
};
use crate::manager::ScheduleManager;
use crate::scheduler::Scheduler;
use crate::series::{SeriesRecordingScheduler, add_schedule_to_series_recording};
use crate::store::ScheduleStore;
use crate::{Error, Result};

pub struct DvrManager {
    store: Arc<dyn ScheduleStore>,
    catalog: Arc<dyn ChannelCatalog>,
    programs: Arc<dyn ProgramSource>,
    manager: Arc<ScheduleManager>,
    scheduler: Arc<Scheduler>,
    series_scheduler: Arc<SeriesRecordingScheduler>,
    clock: Arc<dyn Clock>,
}

impl DvrManager {
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        catalog: Arc<dyn ChannelCatalog>,
        programs: Arc<dyn ProgramSource>,
        manager: Arc<ScheduleManager>,
        scheduler: Arc<Scheduler>,
        series_scheduler: Arc<SeriesRecordingScheduler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            catalog,
            programs,
            manager,
            scheduler,
            series_scheduler,
            clock,
        }
    }

    fn ensure_loaded(&self) -> Result<()> {
        if self.store.is_loaded() {
            Ok(())
        } else {
            Err(Error::validation("schedules are not loaded yet"))
        }
    }

    fn input_for_channel(&self, channel_id: ChannelId) -> Result<InputInfo> {
        self.catalog
            .input_for_channel(channel_id)
            .ok_or_else(|| Error::not_found("input for channel", channel_id))
    }

    // ========== Schedules ==========

    /// Schedule `program`. An episode of a recorded series joins that series
    /// with its priority; anything else gets a priority above all others.
    pub async fn add_schedule(&self, program: &Program) -> Result<ScheduledRecording> {
        self.ensure_loaded()?;
        let input = self.input_for_channel(program.channel_id)?;
        let schedule = match self.series_recording_for_program(program) {
            Some(series) => ScheduledRecording::for_program(input.id, program)
                .with_priority(series.priority)
                .with_series(Some(series.id)),
            None => ScheduledRecording::for_program(input.id, program)
                .with_priority(self.manager.suggest_new_priority()),
        };
        self.add_one(schedule).await
    }

    /// Schedule `program` so that it wins against every schedule in
    /// `overrides` and nothing else.
    pub async fn add_schedule_overriding(
        &self,
        program: &Program,
        overrides: &[ScheduledRecording],
    ) -> Result<ScheduledRecording> {
        self.ensure_loaded()?;
        info!(program_id = %program.id, "Adding schedule instead of {} other(s)", overrides.len());
        let input = self.input_for_channel(program.channel_id)?;
        let priority = overrides
            .iter()
            .map(|s| s.priority)
            .min()
            .map(Priority::next)
            .unwrap_or(Priority::MAX);
        self.add_one(ScheduledRecording::for_program(input.id, program).with_priority(priority))
            .await
    }

    /// Record `channel_id` over `[start_ms, end_ms)`.
    pub async fn add_schedule_for_channel(
        &self,
        channel_id: ChannelId,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<ScheduledRecording> {
        self.ensure_loaded()?;
        let input = self.input_for_channel(channel_id)?;
        self.add_one(
            ScheduledRecording::for_time_range(input.id, channel_id, start_ms, end_ms)
                .with_priority(self.manager.suggest_new_priority()),
        )
        .await
    }

    async fn add_one(&self, schedule: ScheduledRecording) -> Result<ScheduledRecording> {
        self.store
            .add_scheduled_recordings(vec![schedule])
            .await?
            .pop()
            .ok_or_else(|| Error::storage("store returned no schedule"))
    }

    pub async fn update_scheduled_recording(&self, schedule: ScheduledRecording) -> Result<()> {
        self.ensure_loaded()?;
        self.store.update_scheduled_recordings(vec![schedule]).await
    }

    /// Remove schedules. In-progress ones are stopped instead; they end up
    /// clipped rather than deleted.
    pub async fn remove_scheduled_recording(&self, schedules: Vec<ScheduledRecording>) -> Result<()> {
        self.ensure_loaded()?;
        let (running, idle): (Vec<_>, Vec<_>) =
            schedules.into_iter().partition(ScheduledRecording::is_in_progress);
        for schedule in &running {
            self.stop_recording(schedule).await?;
        }
        if !idle.is_empty() {
            self.store.remove_scheduled_recordings(idle, false).await?;
        }
        Ok(())
    }

    pub async fn stop_recording(&self, schedule: &ScheduledRecording) -> Result<()> {
        self.ensure_loaded()?;
        info!(schedule_id = %schedule.id, "Stop recording requested");
        self.scheduler.stop_recording(schedule).await
    }

    // ========== Series ==========

    /// Create a series rule from `program` and schedule `programs_to_schedule`
    /// for it. Already recorded episodes are attached first so the series
    /// does not record them again.
    pub async fn add_series_recording(
        &self,
        program: &Program,
        programs_to_schedule: &[Program],
    ) -> Result<SeriesRecording> {
        self.ensure_loaded()?;
        let input = self.input_for_channel(program.channel_id)?;
        let series = SeriesRecording::for_program(input.id, program)
            .ok_or_else(|| Error::validation(format!("program {} has no series id", program.id)))?
            .with_priority(self.manager.suggest_new_series_priority());
        let series = self.store.add_series_recording(series).await?;
        info!(series_recording_id = %series.id, "Added series recording with {} program(s)", programs_to_schedule.len());

        let recorded: Vec<ScheduledRecording> = self
            .store
            .recorded_programs()
            .iter()
            .filter(|p| p.series_id.as_deref() == Some(series.series_id.as_str()) && !p.clipped)
            .filter(|p| {
                let valid = p.start_ms < p.end_ms;
                if !valid {
                    warn!(
                        recorded_program_id = %p.id,
                        "Skipping recorded program with empty time range [{}, {})",
                        p.start_ms,
                        p.end_ms
                    );
                }
                valid
            })
            .map(|p| {
                ScheduledRecording::for_recorded_program(p)
                    .with_priority(series.priority)
                    .with_series(Some(series.id))
            })
            .collect();
        if !recorded.is_empty() {
            self.store.add_scheduled_recordings(recorded).await?;
        }
        add_schedule_to_series_recording(self.store.as_ref(), &series, programs_to_schedule).await?;
        Ok(series)
    }

    /// Store a changed series rule and carry state and priority changes over
    /// to its schedules.
    pub async fn update_series_recording(&self, series: SeriesRecording) -> Result<()> {
        self.ensure_loaded()?;
        let previous = self.store.series_recording(series.id);
        let was_canceled = previous.as_ref().is_some_and(SeriesRecording::is_canceled);
        let old_priority = previous.map(|s| s.priority);

        self.store.update_series_recording(series.clone()).await?;

        if !was_canceled && series.state == SeriesState::Canceled {
            self.cancel_series_schedules(&series).await?;
        } else if was_canceled && series.state == SeriesState::Normal {
            self.resume_series_schedules(&series).await?;
        }

        if old_priority != Some(series.priority) {
            let now = self.clock.now_ms();
            let priority = Priority::from(series.priority);
            let to_update: Vec<ScheduledRecording> = self
                .store
                .scheduled_recordings_for_series(series.id)
                .into_iter()
                .filter(|s| !s.is_in_progress() && s.start_ms > now && s.priority != priority)
                .map(|s| s.with_priority(priority))
                .collect();
            if !to_update.is_empty() {
                self.store.update_scheduled_recordings(to_update).await?;
            }
        }
        Ok(())
    }

    async fn cancel_series_schedules(&self, series: &SeriesRecording) -> Result<()> {
        let now = self.clock.now_ms();
        let mut to_cancel = Vec::new();
        for schedule in self.store.available_scheduled_recordings(now) {
            if schedule.series_recording_id != Some(series.id) {
                continue;
            }
            if schedule.is_in_progress() {
                self.stop_recording(&schedule).await?;
            } else {
                to_cancel.push(schedule.with_state(RecordingState::Canceled));
            }
        }
        if !to_cancel.is_empty() {
            self.store.update_scheduled_recordings(to_cancel).await?;
        }
        Ok(())
    }

    async fn resume_series_schedules(&self, series: &SeriesRecording) -> Result<()> {
        let now = self.clock.now_ms();
        let to_resume: Vec<ScheduledRecording> = self
            .store
            .scheduled_recordings_for_series(series.id)
            .into_iter()
            .filter(|s| s.is_canceled() && s.end_ms > now)
            .map(|s| s.with_state(RecordingState::NotStarted))
            .collect();
        if !to_resume.is_empty() {
            self.store.update_scheduled_recordings(to_resume).await?;
        }
        Ok(())
    }

    /// Remove a series rule, stopping a member that is being recorded.
    pub async fn remove_series_recording(&self, id: SeriesRecordingId) -> Result<()> {
        self.ensure_loaded()?;
        if self.store.series_recording(id).is_none() {
            warn!(series_recording_id = %id, "Ignoring removal of unknown series recording");
            return Ok(());
        }
        if let Some(running) = self
            .store
            .scheduled_recordings_for_series(id)
            .into_iter()
            .find(ScheduledRecording::is_in_progress)
            && let Err(e) = self.stop_recording(&running).await
        {
            error!(schedule_id = %running.id, "Failed to stop series recording: {}", e);
        }
        self.store.remove_series_recording(id).await
    }

    /// Programs a new series rule for `program` would schedule.
    pub async fn query_programs_for_series(&self, program: &Program) -> Result<Vec<Program>> {
        self.ensure_loaded()?;
        let input = self.input_for_channel(program.channel_id)?;
        let series = SeriesRecording::for_program(input.id, program)
            .ok_or_else(|| Error::validation(format!("program {} has no series id", program.id)))?
            .with_priority(self.manager.suggest_new_series_priority());
        self.series_scheduler.query_programs(&series).await
    }

    pub fn series_recording_for_program(&self, program: &Program) -> Option<SeriesRecording> {
        let series_id = program.series_id.as_deref()?;
        self.store.series_recording_by_series_id(series_id)
    }

    // ========== Queries ==========

    /// End of the earliest-ending recording running on `input_id`.
    pub fn earliest_recording_end_time(&self, input_id: &InputId) -> Option<i64> {
        self.store
            .started_recordings(self.clock.now_ms())
            .iter()
            .filter(|s| {
                self.catalog
                    .input_for_channel(s.channel_id)
                    .is_some_and(|input| &input.id == input_id)
            })
            .map(|s| s.end_ms)
            .min()
    }

    /// Recording running on `channel_id`, if any.
    pub fn current_recording(&self, channel_id: ChannelId) -> Option<ScheduledRecording> {
        if !self.store.is_loaded() {
            return None;
        }
        self.store
            .started_recordings(self.clock.now_ms())
            .into_iter()
            .find(|s| s.channel_id == channel_id)
    }

    pub fn is_channel_recordable(&self, channel_id: ChannelId) -> bool {
        if !self.store.is_loaded() {
            return false;
        }
        let Some(input) = self.catalog.input_for_channel(channel_id) else {
            warn!(channel_id = %channel_id, "No input for channel");
            return false;
        };
        if !input.can_record {
            return false;
        }
        self.programs
            .current_program(channel_id, self.clock.now_ms())
            .is_none_or(|p| !p.recording_prohibited)
    }

    pub fn is_program_recordable(&self, program: &Program) -> bool {
        if !self.store.is_loaded() {
            return false;
        }
        match self.catalog.input_for_channel(program.channel_id) {
            Some(input) => input.can_record && !program.recording_prohibited,
            None => {
                warn!(program_id = %program.id, "No input for program");
                false
            }
        }
    }

    pub fn schedule_manager(&self) -> &Arc<ScheduleManager> {
        &self.manager
    }
}
