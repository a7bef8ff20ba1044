//! Per-input task scheduler.
//!
//! One actor per tuner-bearing input owns tuner admission for that input.
//! Schedules wait until their start time (minus the early-start lead) has
//! arrived, then either get a free tuner, preempt a lower-priority task, or
//! fail. All mutation and every rebuild run on the actor's own loop.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::handle::InputHandle;
use super::messages::{InputMessage, InputSchedulerState, RecordingOutcome, StateReport};
use super::task::{ActiveTask, Recorder};
use crate::catalog::ChannelCatalog;
use crate::clock::Clock;
use crate::config::DvrConfig;
use crate::domain::schedule::start_then_priority_cmp;
use crate::domain::{
    Channel, InputId, Priority, RecordingState, ScheduleId, ScheduledRecording,
};

/// Tunables for one input scheduler.
#[derive(Debug, Clone)]
pub struct InputSchedulerConfig {
    /// Admit a schedule this long before its start.
    pub early_start_offset_ms: i64,
    pub stop_timeout: Option<Duration>,
    pub mailbox_capacity: usize,
    pub send_timeout: Duration,
}

impl From<&DvrConfig> for InputSchedulerConfig {
    fn from(config: &DvrConfig) -> Self {
        Self {
            early_start_offset_ms: config.recording_early_start_offset_ms,
            stop_timeout: config.task_stop_timeout(),
            mailbox_capacity: config.mailbox_capacity,
            send_timeout: config.send_timeout(),
        }
    }
}

impl Default for InputSchedulerConfig {
    fn default() -> Self {
        Self::from(&DvrConfig::default())
    }
}

pub struct InputTaskScheduler {
    input_id: InputId,
    mailbox: mpsc::Receiver<InputMessage>,
    /// Handed to tasks so they can report `TaskFinished`.
    self_sender: mpsc::Sender<InputMessage>,
    waiting: BTreeMap<ScheduleId, ScheduledRecording>,
    active: HashMap<ScheduleId, ActiveTask>,
    next_rebuild_at_ms: Option<i64>,
    rebuild_pending: bool,
    next_seq: u64,
    catalog: Arc<dyn ChannelCatalog>,
    recorder: Arc<dyn Recorder>,
    clock: Arc<dyn Clock>,
    reports: mpsc::UnboundedSender<StateReport>,
    config: InputSchedulerConfig,
    cancellation_token: CancellationToken,
}

impl InputTaskScheduler {
    pub fn new(
        input_id: InputId,
        catalog: Arc<dyn ChannelCatalog>,
        recorder: Arc<dyn Recorder>,
        clock: Arc<dyn Clock>,
        reports: mpsc::UnboundedSender<StateReport>,
        config: InputSchedulerConfig,
        cancellation_token: CancellationToken,
    ) -> (Self, InputHandle) {
        let (tx, rx) = mpsc::channel(config.mailbox_capacity.max(1));
        let handle = InputHandle::new(
            input_id.clone(),
            tx.clone(),
            cancellation_token.clone(),
            config.send_timeout,
        );
        let scheduler = Self {
            input_id,
            mailbox: rx,
            self_sender: tx,
            waiting: BTreeMap::new(),
            active: HashMap::new(),
            next_rebuild_at_ms: None,
            rebuild_pending: false,
            next_seq: 0,
            catalog,
            recorder,
            clock,
            reports,
            config,
            cancellation_token,
        };
        (scheduler, handle)
    }

    /// Create the actor and run it on the tokio runtime.
    pub fn spawn(
        input_id: InputId,
        catalog: Arc<dyn ChannelCatalog>,
        recorder: Arc<dyn Recorder>,
        clock: Arc<dyn Clock>,
        reports: mpsc::UnboundedSender<StateReport>,
        config: InputSchedulerConfig,
        cancellation_token: CancellationToken,
    ) -> (InputHandle, JoinHandle<()>) {
        let (scheduler, handle) = Self::new(
            input_id,
            catalog,
            recorder,
            clock,
            reports,
            config,
            cancellation_token,
        );
        (handle, tokio::spawn(scheduler.run()))
    }

    pub async fn run(mut self) {
        info!(input_id = %self.input_id, "Input scheduler starting");

        loop {
            if self.rebuild_pending {
                self.rebuild();
            }
            let rebuild_timer = Self::rebuild_timer(self.time_until_rebuild());

            tokio::select! {
                biased;

                _ = self.cancellation_token.cancelled() => {
                    info!(input_id = %self.input_id, "Input scheduler cancelled");
                    break;
                }

                msg = self.mailbox.recv() => {
                    let Some(msg) = msg else { break };
                    if self.handle_message(msg) {
                        break;
                    }
                    // Coalesce queued messages into a single rebuild.
                    let mut stop = false;
                    while let Ok(msg) = self.mailbox.try_recv() {
                        if self.handle_message(msg) {
                            stop = true;
                            break;
                        }
                    }
                    if stop {
                        break;
                    }
                }

                _ = rebuild_timer => {
                    debug!(input_id = %self.input_id, "Rebuild timer fired");
                    self.rebuild_pending = true;
                }
            }
        }

        self.shutdown();
        info!(input_id = %self.input_id, "Input scheduler stopped");
    }

    fn time_until_rebuild(&self) -> Option<Duration> {
        self.next_rebuild_at_ms.map(|at| {
            let delay = at.saturating_sub(self.clock.now_ms()).max(0);
            Duration::from_millis(delay as u64)
        })
    }

    async fn rebuild_timer(delay: Option<Duration>) {
        match delay {
            Some(delay) if delay.is_zero() => tokio::task::yield_now().await,
            Some(delay) => tokio::time::sleep(delay).await,
            None => std::future::pending().await,
        }
    }

    fn shutdown(&mut self) {
        for task in self.active.values() {
            task.stop();
        }
        self.waiting.clear();
        self.next_rebuild_at_ms = None;
    }

    /// Handle one message. Returns `true` if the actor should stop.
    pub(crate) fn handle_message(&mut self, msg: InputMessage) -> bool {
        match msg {
            InputMessage::Add(schedule) => self.handle_add(schedule),
            InputMessage::Remove(schedule) => self.handle_remove(schedule),
            InputMessage::Update(schedule) => self.handle_update(schedule),
            InputMessage::Reconcile(pending) => self.handle_reconcile(pending),
            InputMessage::Rebuild => self.rebuild_pending = true,
            InputMessage::TaskFinished { id, seq, outcome } => {
                self.handle_task_finished(id, seq, outcome)
            }
            InputMessage::StopTask(id) => self.handle_stop_task(id),
            InputMessage::GetState(reply) => {
                if self.rebuild_pending {
                    self.rebuild();
                }
                let _ = reply.send(self.state());
            }
            InputMessage::Stop => {
                info!(input_id = %self.input_id, "Input scheduler received Stop");
                return true;
            }
        }
        false
    }

    // ========== Mutations ==========

    fn handle_add(&mut self, schedule: ScheduledRecording) {
        if self.active.contains_key(&schedule.id) || self.waiting.contains_key(&schedule.id) {
            debug!(schedule_id = %schedule.id, "Schedule already tracked, ignoring add");
            return;
        }
        debug!(input_id = %self.input_id, schedule_id = %schedule.id, "Schedule waiting for a tuner");
        self.waiting.insert(schedule.id, schedule);
        self.rebuild_pending = true;
    }

    fn handle_remove(&mut self, schedule: ScheduledRecording) {
        self.drop_schedule(schedule.id);
    }

    fn handle_update(&mut self, schedule: ScheduledRecording) {
        let now = self.clock.now_ms();
        if self.active.contains_key(&schedule.id) && self.waiting.contains_key(&schedule.id) {
            // The task is already winding down; only the re-queued copy matters.
            self.waiting.insert(schedule.id, schedule);
            self.rebuild_pending = true;
            return;
        }
        if let Some(task) = self.active.get_mut(&schedule.id) {
            if schedule.start_ms > now && schedule.start_ms > task.start_ms() {
                debug!(schedule_id = %schedule.id, "Start moved later, re-queueing");
                task.cancel();
                self.waiting.insert(schedule.id, schedule);
            } else {
                task.update(schedule);
            }
            return;
        }
        if self.waiting.contains_key(&schedule.id) {
            self.waiting.insert(schedule.id, schedule);
            self.rebuild_pending = true;
        }
    }

    fn handle_reconcile(&mut self, pending: Vec<ScheduledRecording>) {
        let mut pending: HashMap<ScheduleId, ScheduledRecording> =
            pending.into_iter().map(|s| (s.id, s)).collect();
        let mut tracked: Vec<ScheduleId> = self.waiting.keys().copied().collect();
        tracked.extend(self.active.keys().filter(|id| !self.waiting.contains_key(*id)));

        for id in tracked {
            let Some(schedule) = pending.remove(&id) else {
                debug!(input_id = %self.input_id, schedule_id = %id, "Dropping schedule that is no longer pending");
                self.drop_schedule(id);
                continue;
            };
            let changed = match (self.waiting.get(&id), self.active.get(&id)) {
                (Some(waiting), _) => *waiting != schedule,
                (None, Some(task)) => {
                    task.start_ms() != schedule.start_ms
                        || task.end_ms() != schedule.end_ms
                        || task.priority() != schedule.priority
                }
                (None, None) => false,
            };
            if changed {
                self.handle_update(schedule);
            }
        }
    }

    /// Forget `id`, cancelling its task if one is running.
    fn drop_schedule(&mut self, id: ScheduleId) {
        // A copy re-queued by an earlier update must not restart.
        let was_waiting = self.waiting.remove(&id).is_some();
        if let Some(task) = self.active.get(&id) {
            debug!(schedule_id = %id, "Cancelling active task of removed schedule");
            task.cancel();
        } else if was_waiting {
            self.rebuild_pending = true;
        }
    }

    fn handle_stop_task(&mut self, id: ScheduleId) {
        match self.active.get(&id) {
            Some(task) => task.stop(),
            None => debug!(schedule_id = %id, "No active task to stop"),
        }
    }

    fn handle_task_finished(&mut self, id: ScheduleId, seq: u64, outcome: RecordingOutcome) {
        match self.active.get(&id) {
            Some(task) if task.seq() == seq => {}
            _ => {
                debug!(schedule_id = %id, seq, "Ignoring stale task completion");
                return;
            }
        }
        self.active.remove(&id);

        if self.waiting.contains_key(&id) {
            debug!(schedule_id = %id, "Task of re-queued schedule ended");
        } else {
            let reason = match &outcome {
                RecordingOutcome::Failed(reason) => Some(reason.clone()),
                _ => None,
            };
            self.report(id, outcome.state(), reason);
        }
        self.rebuild_pending = true;
    }

    // ========== Admission ==========

    /// Admit, preempt or fail waiting schedules whose time has come.
    pub(crate) fn rebuild(&mut self) {
        self.rebuild_pending = false;
        self.next_rebuild_at_ms = None;
        if self.waiting.is_empty() {
            return;
        }

        let now = self.clock.now_ms();
        let lead = self.config.early_start_offset_ms;

        let expired: Vec<ScheduleId> = self
            .waiting
            .values()
            .filter(|s| s.end_ms <= now)
            .map(|s| s.id)
            .collect();
        for id in expired {
            if let Some(schedule) = self.waiting.remove(&id) {
                self.fail(&schedule, "ended before a tuner was available");
            }
        }
        if self.waiting.is_empty() {
            return;
        }

        let mut to_start: Vec<ScheduledRecording> = self
            .waiting
            .values()
            .filter(|s| {
                !s.is_canceled()
                    && s.start_ms.saturating_sub(lead) <= now
                    && s.end_ms > now
                    && !self.active.contains_key(&s.id)
            })
            .cloned()
            .collect();
        to_start.sort_by(start_then_priority_cmp);

        // Capability may be revoked at any time; re-read on every pass.
        let tuner_count = self
            .catalog
            .input(&self.input_id)
            .map(|input| input.recording_tuner_count())
            .unwrap_or(0);

        for candidate in to_start {
            if self.has_task_finishing_by(candidate.start_ms) {
                debug!(
                    schedule_id = %candidate.id,
                    "A running task ends before this start, waiting for it"
                );
                break;
            }

            if self.active.len() < tuner_count {
                self.waiting.remove(&candidate.id);
                match self.catalog.channel(candidate.channel_id) {
                    Some(channel) => self.start_task(candidate, channel),
                    None => self.fail(&candidate, "channel is no longer available"),
                }
            } else if let Some(victim) = self.lowest_priority_task_below(candidate.priority) {
                info!(
                    input_id = %self.input_id,
                    victim = %victim,
                    schedule_id = %candidate.id,
                    "Preempting lower-priority recording"
                );
                if let Some(task) = self.active.get(&victim)
                    && !task.is_stopping()
                {
                    task.stop();
                }
                break;
            } else {
                self.waiting.remove(&candidate.id);
                self.fail(&candidate, "no tuner available");
            }
        }

        self.next_rebuild_at_ms = self
            .waiting
            .values()
            .map(|s| {
                let admit_at = s.start_ms.saturating_sub(lead);
                if admit_at > now { admit_at } else { s.end_ms }
            })
            .min();
    }

    fn has_task_finishing_by(&self, start_ms: i64) -> bool {
        self.active.values().any(|task| task.end_ms() <= start_ms)
    }

    fn lowest_priority_task_below(&self, priority: Priority) -> Option<ScheduleId> {
        self.active
            .values()
            .filter(|task| task.priority() < priority)
            .min_by_key(|task| (task.priority(), task.id()))
            .map(ActiveTask::id)
    }

    fn start_task(&mut self, schedule: ScheduledRecording, channel: Channel) {
        self.next_seq += 1;
        info!(
            input_id = %self.input_id,
            schedule_id = %schedule.id,
            start = %schedule.display_start(),
            "Starting recording task"
        );
        let schedule = schedule.with_state(RecordingState::InProgress);
        let id = schedule.id;
        let task = ActiveTask::spawn(
            self.next_seq,
            schedule,
            channel,
            Arc::clone(&self.recorder),
            self.config.stop_timeout,
            self.self_sender.clone(),
        );
        self.active.insert(id, task);
        self.report(id, RecordingState::InProgress, None);
    }

    fn fail(&self, schedule: &ScheduledRecording, reason: &str) {
        warn!(
            input_id = %self.input_id,
            schedule_id = %schedule.id,
            "Recording failed: {}",
            reason
        );
        self.report(schedule.id, RecordingState::Failed, Some(reason.to_string()));
    }

    fn report(&self, schedule_id: ScheduleId, state: RecordingState, reason: Option<String>) {
        let report = StateReport {
            input_id: self.input_id.clone(),
            schedule_id,
            state,
            reason,
        };
        if self.reports.send(report).is_err() {
            debug!(schedule_id = %schedule_id, "State report dropped, control loop gone");
        }
    }

    pub(crate) fn state(&self) -> InputSchedulerState {
        let mut active: Vec<ScheduleId> = self.active.keys().copied().collect();
        active.sort();
        let mut stopping: Vec<ScheduleId> = self
            .active
            .values()
            .filter(|task| task.is_stopping())
            .map(ActiveTask::id)
            .collect();
        stopping.sort();
        InputSchedulerState {
            input_id: self.input_id.clone(),
            waiting: self.waiting.keys().copied().collect(),
            active,
            stopping,
            next_rebuild_at_ms: self.next_rebuild_at_ms,
        }
    }
}
