//! Recording tasks.
//!
//! A task is one attempt to record a schedule on a tuner. It is created and
//! stopped only by the owning input scheduler, and reports its end back to
//! that scheduler's mailbox.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::messages::{InputMessage, RecordingOutcome, TaskCommand};
use crate::domain::{Channel, Priority, ScheduleId, ScheduledRecording};

const TASK_COMMAND_CAPACITY: usize = 16;

/// Performs the actual recording.
#[async_trait]
pub trait Recorder: Send + Sync + 'static {
    /// Record `schedule` from `channel` until it ends or `control` asks to
    /// stop or cancel.
    async fn record(
        &self,
        schedule: ScheduledRecording,
        channel: Channel,
        control: TaskControl,
    ) -> RecordingOutcome;
}

/// Command side of a running task, handed to the [`Recorder`].
pub struct TaskControl {
    commands: mpsc::Receiver<TaskCommand>,
    stop_token: CancellationToken,
}

impl TaskControl {
    /// Next command, or `None` once the scheduler dropped the task.
    pub async fn recv(&mut self) -> Option<TaskCommand> {
        self.commands.recv().await
    }

    pub fn try_recv(&mut self) -> Option<TaskCommand> {
        self.commands.try_recv().ok()
    }

    /// A stop or cancel was requested.
    pub fn stop_requested(&self) -> bool {
        self.stop_token.is_cancelled()
    }

    /// Resolves once a stop or cancel is requested.
    pub async fn stopped(&self) {
        self.stop_token.cancelled().await
    }
}

/// Scheduler-side view of a running task.
pub(crate) struct ActiveTask {
    schedule: ScheduledRecording,
    seq: u64,
    commands: mpsc::Sender<TaskCommand>,
    stop_token: CancellationToken,
}

impl ActiveTask {
    /// Spawn the recording. The end is reported to `mailbox` as `TaskFinished`.
    ///
    /// With a `stop_timeout`, a task that has not returned that long after a
    /// stop or cancel is dropped and reported as failed.
    pub(crate) fn spawn(
        seq: u64,
        schedule: ScheduledRecording,
        channel: Channel,
        recorder: Arc<dyn Recorder>,
        stop_timeout: Option<Duration>,
        mailbox: mpsc::Sender<InputMessage>,
    ) -> Self {
        let (commands, command_rx) = mpsc::channel(TASK_COMMAND_CAPACITY);
        let stop_token = CancellationToken::new();
        let control = TaskControl {
            commands: command_rx,
            stop_token: stop_token.clone(),
        };

        let id = schedule.id;
        let task_schedule = schedule.clone();
        let watchdog = stop_token.clone();
        tokio::spawn(async move {
            let record = recorder.record(task_schedule, channel, control);
            let outcome = match stop_timeout {
                None => record.await,
                Some(timeout) => {
                    tokio::select! {
                        outcome = record => outcome,
                        _ = async {
                            watchdog.cancelled().await;
                            tokio::time::sleep(timeout).await;
                        } => {
                            warn!(schedule_id = %id, "Recording task ignored stop request, abandoning it");
                            RecordingOutcome::Failed("task did not acknowledge stop".to_string())
                        }
                    }
                }
            };
            debug!(schedule_id = %id, outcome = ?outcome, "Recording task ended");
            if mailbox
                .send(InputMessage::TaskFinished { id, seq, outcome })
                .await
                .is_err()
            {
                debug!(schedule_id = %id, "Input scheduler gone before task finished");
            }
        });

        Self {
            schedule,
            seq,
            commands,
            stop_token,
        }
    }

    pub(crate) fn id(&self) -> ScheduleId {
        self.schedule.id
    }

    pub(crate) fn seq(&self) -> u64 {
        self.seq
    }

    pub(crate) fn start_ms(&self) -> i64 {
        self.schedule.start_ms
    }

    pub(crate) fn end_ms(&self) -> i64 {
        self.schedule.end_ms
    }

    pub(crate) fn priority(&self) -> Priority {
        self.schedule.priority
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stop_token.is_cancelled()
    }

    /// Forward a compatible schedule change to the task.
    pub(crate) fn update(&mut self, schedule: ScheduledRecording) {
        self.schedule = schedule.clone();
        self.send(TaskCommand::Update(schedule));
    }

    pub(crate) fn stop(&self) {
        self.send(TaskCommand::Stop);
        self.stop_token.cancel();
    }

    pub(crate) fn cancel(&self) {
        self.send(TaskCommand::Cancel);
        self.stop_token.cancel();
    }

    fn send(&self, command: TaskCommand) {
        if let Err(e) = self.commands.try_send(command) {
            warn!(schedule_id = %self.schedule.id, "Failed to deliver task command: {}", e);
        }
    }
}
