//! Top-level recording scheduler.
//!
//! Routes schedules that start soon to the per-input scheduler of their
//! channel's input, keeps the wake-up alarm pointed at the next start, and
//! applies state reports from the input schedulers to the store. The store
//! is only ever written from the control loop spawned by [`Scheduler::start`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::alarm::WakeupAlarm;
use super::handle::InputHandle;
use super::input_scheduler::{InputSchedulerConfig, InputTaskScheduler};
use super::messages::{InputMessage, InputSchedulerState, StateReport};
use super::task::Recorder;
use crate::catalog::ChannelCatalog;
use crate::clock::{Clock, ms_to_datetime};
use crate::config::DvrConfig;
use crate::domain::{InputId, RecordingState, ScheduledRecording};
use crate::store::{ScheduleStore, StoreEvent};
use crate::{Error, Result};

pub struct Scheduler {
    store: Arc<dyn ScheduleStore>,
    catalog: Arc<dyn ChannelCatalog>,
    recorder: Arc<dyn Recorder>,
    clock: Arc<dyn Clock>,
    alarm: Arc<dyn WakeupAlarm>,
    config: DvrConfig,
    inputs: DashMap<InputId, InputHandle>,
    reports_tx: mpsc::UnboundedSender<StateReport>,
    reports_rx: Mutex<Option<mpsc::UnboundedReceiver<StateReport>>>,
    cancellation_token: CancellationToken,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        catalog: Arc<dyn ChannelCatalog>,
        recorder: Arc<dyn Recorder>,
        clock: Arc<dyn Clock>,
        alarm: Arc<dyn WakeupAlarm>,
        config: DvrConfig,
    ) -> Self {
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        Self {
            store,
            catalog,
            recorder,
            clock,
            alarm,
            config,
            inputs: DashMap::new(),
            reports_tx,
            reports_rx: Mutex::new(Some(reports_rx)),
            cancellation_token: CancellationToken::new(),
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Subscribe to the store, spawn the control loop and run one update.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let Some(mut reports) = self.reports_rx.lock().take() else {
            warn!("Scheduler already started");
            return Ok(());
        };
        info!("Starting recording scheduler");

        let mut events = self.store.subscribe();
        let scheduler = Arc::clone(self);
        let token = self.cancellation_token.clone();
        let control = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = token.cancelled() => {
                        debug!("Scheduler control loop stopping");
                        break;
                    }

                    Some(report) = reports.recv() => {
                        scheduler.apply_report(report).await;
                    }

                    event = events.recv() => match event {
                        Ok(event) => scheduler.handle_store_event(event).await,
                        Err(RecvError::Lagged(missed)) => {
                            warn!("Scheduler missed {} store events, reconciling inputs", missed);
                            scheduler.reconcile().await;
                            scheduler.update().await;
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        });
        self.tasks.lock().push(control);
        self.started.store(true, Ordering::SeqCst);

        self.update().await;
        Ok(())
    }

    /// Run [`update`](Self::update) on every alarm tick until stopped.
    pub fn watch_alarm(self: &Arc<Self>, mut ticks: mpsc::UnboundedReceiver<()>) {
        let scheduler = Arc::clone(self);
        let token = self.cancellation_token.clone();
        let watcher = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    tick = ticks.recv() => match tick {
                        Some(()) => {
                            debug!("Wake-up alarm fired");
                            scheduler.update().await;
                        }
                        None => break,
                    },
                }
            }
        });
        self.tasks.lock().push(watcher);
    }

    /// Cancel every input scheduler and the control loop.
    pub async fn stop(&self) {
        if self.cancellation_token.is_cancelled() {
            return;
        }
        self.started.store(false, Ordering::SeqCst);
        info!("Stopping recording scheduler");
        for entry in self.inputs.iter() {
            let _ = entry.value().request_stop();
        }
        self.cancellation_token.cancel();
        self.inputs.clear();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for result in join_all(tasks).await {
            if let Err(e) = result
                && e.is_panic()
            {
                error!("Scheduler task panicked: {}", e);
            }
        }
    }

    /// Hand schedules that start soon to their inputs and re-arm the alarm.
    pub async fn update(&self) {
        let now = self.clock.now_ms();
        let wake = self.config.wake_before_start_ms;
        for schedule in self.store.available_scheduled_recordings(now) {
            if schedule.is_not_started() && self.starts_within(&schedule, wake) {
                self.send_to_input(&schedule, InputMessage::Add(schedule.clone()))
                    .await;
            }
        }
        self.update_next_alarm(now);
    }

    /// `true` once `now >= start - delta_ms`.
    pub fn starts_within(&self, schedule: &ScheduledRecording, delta_ms: i64) -> bool {
        self.clock.now_ms() >= schedule.start_ms.saturating_sub(delta_ms)
    }

    /// Ask the input that owns `schedule` to stop its running task.
    pub async fn stop_recording(&self, schedule: &ScheduledRecording) -> Result<()> {
        let input_id = self.route(schedule);
        let handle = self
            .inputs
            .get(&input_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::not_found("input scheduler", &input_id))?;
        handle.stop_task(schedule.id).await?;
        Ok(())
    }

    /// Snapshot of one input scheduler, if it is running.
    pub async fn input_state(&self, input_id: &InputId) -> Result<Option<InputSchedulerState>> {
        let Some(handle) = self.inputs.get(input_id).map(|entry| entry.value().clone()) else {
            return Ok(None);
        };
        Ok(Some(handle.state().await?))
    }

    pub fn active_inputs(&self) -> Vec<InputId> {
        self.inputs.iter().map(|entry| entry.key().clone()).collect()
    }

    // ========== Internals ==========

    fn update_next_alarm(&self, now: i64) {
        let wake = self.config.wake_before_start_ms;
        // Anything starting inside the wake window was just handed over.
        if let Some(next_start) = self.store.next_start_time_after(now.saturating_add(wake)) {
            let wake_at = next_start - wake;
            debug!(wake_at = %ms_to_datetime(wake_at), "Next wake-up");
            self.alarm.set(wake_at);
        }
    }

    async fn handle_store_event(&self, event: StoreEvent) {
        let wake = self.config.wake_before_start_ms;
        match event {
            StoreEvent::LoadFinished => {}
            StoreEvent::SchedulesAdded(schedules) => {
                for schedule in schedules {
                    if schedule.is_not_started() && self.starts_within(&schedule, wake) {
                        self.send_to_input(&schedule, InputMessage::Add(schedule.clone()))
                            .await;
                    }
                }
            }
            StoreEvent::SchedulesRemoved(schedules) => {
                for schedule in schedules {
                    self.send_to_input(&schedule, InputMessage::Remove(schedule.clone()))
                        .await;
                }
            }
            StoreEvent::SchedulesStatusChanged(schedules) => {
                for schedule in schedules {
                    if schedule.state.is_pending() {
                        self.send_to_input(&schedule, InputMessage::Update(schedule.clone()))
                            .await;
                        if schedule.is_not_started() && self.starts_within(&schedule, wake) {
                            self.send_to_input(&schedule, InputMessage::Add(schedule.clone()))
                                .await;
                        }
                    } else {
                        self.send_to_input(&schedule, InputMessage::Remove(schedule.clone()))
                            .await;
                    }
                }
            }
            StoreEvent::SeriesAdded(_) | StoreEvent::SeriesRemoved(_) | StoreEvent::SeriesChanged(_) => {
                return;
            }
        }
        self.update().await;
    }

    /// Send every running input the pending schedules it should track.
    async fn reconcile(&self) {
        let mut pending: HashMap<InputId, Vec<ScheduledRecording>> = HashMap::new();
        for schedule in self
            .store
            .recordings_with_state(&[RecordingState::NotStarted, RecordingState::InProgress])
        {
            pending.entry(self.route(&schedule)).or_default().push(schedule);
        }

        let handles: Vec<InputHandle> = self.inputs.iter().map(|e| e.value().clone()).collect();
        for handle in handles {
            let schedules = pending.remove(handle.input_id()).unwrap_or_default();
            if let Err(e) = handle.reconcile(schedules).await {
                warn!(input_id = %handle.input_id(), "Failed to reconcile input scheduler: {}", e);
                self.forget_input(handle.input_id());
            }
        }
    }

    async fn apply_report(&self, report: StateReport) {
        let Some(current) = self.store.scheduled_recording(report.schedule_id) else {
            warn!(
                schedule_id = %report.schedule_id,
                input_id = %report.input_id,
                "Dropping state report for unknown schedule"
            );
            return;
        };
        if current.state.is_terminal() {
            debug!(
                schedule_id = %report.schedule_id,
                current = %current.state,
                reported = %report.state,
                "Ignoring state report for a schedule that already ended"
            );
            return;
        }
        if let Some(reason) = &report.reason {
            info!(schedule_id = %report.schedule_id, state = %report.state, "Recording state change: {}", reason);
        }
        if let Err(e) = self.store.change_state(report.schedule_id, report.state).await {
            error!(schedule_id = %report.schedule_id, "Failed to persist state change: {}", e);
        }
    }

    /// Input that records `schedule`: its channel's input, else the one stored.
    fn route(&self, schedule: &ScheduledRecording) -> InputId {
        self.catalog
            .input_for_channel(schedule.channel_id)
            .map(|input| input.id)
            .unwrap_or_else(|| schedule.input_id.clone())
    }

    async fn send_to_input(&self, schedule: &ScheduledRecording, msg: InputMessage) {
        let input_id = self.route(schedule);
        let lost_on_failure = matches!(msg, InputMessage::Update(_)) && schedule.is_in_progress();
        let handle = match &msg {
            InputMessage::Add(_) => self.input_handle(&input_id),
            _ => self.running_input(&input_id),
        };
        let Some(handle) = handle else {
            if lost_on_failure && !self.cancellation_token.is_cancelled() {
                self.report_lost(&input_id, schedule);
            }
            return;
        };
        if let Err(e) = handle.deliver(msg).await {
            warn!(input_id = %input_id, schedule_id = %schedule.id, "Failed to reach input scheduler: {}", e);
            self.forget_input(&input_id);
            if lost_on_failure {
                self.report_lost(&input_id, schedule);
            }
        }
    }

    /// A recording whose input scheduler is gone will never report back.
    fn report_lost(&self, input_id: &InputId, schedule: &ScheduledRecording) {
        let report = StateReport {
            input_id: input_id.clone(),
            schedule_id: schedule.id,
            state: RecordingState::Failed,
            reason: Some("input scheduler stopped".to_string()),
        };
        if self.reports_tx.send(report).is_err() {
            debug!(schedule_id = %schedule.id, "State report dropped, control loop gone");
        }
    }

    fn forget_input(&self, input_id: &InputId) {
        if self
            .inputs
            .remove_if(input_id, |_, handle| handle.is_closed())
            .is_some()
        {
            info!(input_id = %input_id, "Forgot stopped input scheduler");
        }
    }

    /// Handle of an input scheduler that is already running.
    fn running_input(&self, input_id: &InputId) -> Option<InputHandle> {
        if self.cancellation_token.is_cancelled() {
            return None;
        }
        self.inputs
            .get(input_id)
            .map(|entry| entry.value().clone())
            .filter(|handle| !handle.is_closed())
    }

    /// Handle of the input's scheduler, spawning one if needed. `None` after stop.
    fn input_handle(&self, input_id: &InputId) -> Option<InputHandle> {
        if self.cancellation_token.is_cancelled() {
            return None;
        }
        if let Some(entry) = self.inputs.get(input_id)
            && !entry.value().is_closed()
        {
            return Some(entry.value().clone());
        }

        info!(input_id = %input_id, "Spawning input scheduler");
        let (handle, join) = InputTaskScheduler::spawn(
            input_id.clone(),
            Arc::clone(&self.catalog),
            Arc::clone(&self.recorder),
            Arc::clone(&self.clock),
            self.reports_tx.clone(),
            InputSchedulerConfig::from(&self.config),
            self.cancellation_token.child_token(),
        );
        self.inputs.insert(input_id.clone(), handle.clone());
        self.tasks.lock().push(join);
        Some(handle)
    }
}
