//! Typed handle to an input scheduler's mailbox.
//!
//! Delivery first tries the mailbox without waiting. When it is full the
//! caller waits for a slot, bounded by the configured send timeout.

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::messages::{InputMessage, InputSchedulerState};
use crate::domain::{InputId, ScheduleId, ScheduledRecording};

/// Why a message did not reach an input scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("input scheduler has stopped")]
    ActorStopped,
    #[error("input scheduler mailbox is full")]
    MailboxFull,
    #[error("timed out waiting for input scheduler mailbox space")]
    Timeout,
}

/// Cloneable sender side of one [`InputTaskScheduler`](super::InputTaskScheduler).
#[derive(Clone)]
pub struct InputHandle {
    input_id: InputId,
    sender: mpsc::Sender<InputMessage>,
    cancellation_token: CancellationToken,
    send_timeout: Duration,
}

impl InputHandle {
    pub(crate) fn new(
        input_id: InputId,
        sender: mpsc::Sender<InputMessage>,
        cancellation_token: CancellationToken,
        send_timeout: Duration,
    ) -> Self {
        Self {
            input_id,
            sender,
            cancellation_token,
            send_timeout,
        }
    }

    pub fn input_id(&self) -> &InputId {
        &self.input_id
    }

    // ========== Schedule operations ==========

    pub async fn add(&self, schedule: ScheduledRecording) -> Result<(), SendError> {
        self.send(InputMessage::Add(schedule)).await
    }

    pub async fn remove(&self, schedule: ScheduledRecording) -> Result<(), SendError> {
        self.send(InputMessage::Remove(schedule)).await
    }

    pub async fn update(&self, schedule: ScheduledRecording) -> Result<(), SendError> {
        self.send(InputMessage::Update(schedule)).await
    }

    /// Bring the tracked schedules in line with `pending`. Waits for mailbox space.
    pub async fn reconcile(&self, pending: Vec<ScheduledRecording>) -> Result<(), SendError> {
        self.deliver(InputMessage::Reconcile(pending)).await
    }

    pub async fn rebuild(&self) -> Result<(), SendError> {
        self.send(InputMessage::Rebuild).await
    }

    /// Stop the running task of `id`, keeping what was recorded.
    pub async fn stop_task(&self, id: ScheduleId) -> Result<(), SendError> {
        self.send(InputMessage::StopTask(id)).await
    }

    /// Snapshot of the scheduler, taken after any pending admission pass.
    pub async fn state(&self) -> Result<InputSchedulerState, SendError> {
        let (reply, rx) = oneshot::channel();
        self.send(InputMessage::GetState(reply)).await?;
        rx.await.map_err(|_| SendError::ActorStopped)
    }

    // ========== Lifecycle ==========

    /// Ask the scheduler to wind down. Never waits for mailbox space.
    pub fn request_stop(&self) -> Result<(), SendError> {
        self.try_send(InputMessage::Stop)
    }

    pub fn cancel(&self) {
        self.cancellation_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    /// The scheduler dropped its mailbox.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    // ========== Delivery ==========

    pub async fn send(&self, msg: InputMessage) -> Result<(), SendError> {
        let msg = match self.sender.try_send(msg) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Closed(_)) => return Err(SendError::ActorStopped),
            Err(TrySendError::Full(msg)) => msg,
        };
        let permit = tokio::time::timeout(self.send_timeout, self.sender.reserve())
            .await
            .map_err(|_| SendError::Timeout)?
            .map_err(|_| SendError::ActorStopped)?;
        permit.send(msg);
        Ok(())
    }

    /// Deliver `msg` however long the mailbox stays full. Fails only once the
    /// scheduler has stopped.
    pub async fn deliver(&self, msg: InputMessage) -> Result<(), SendError> {
        self.sender
            .send(msg)
            .await
            .map_err(|_| SendError::ActorStopped)
    }

    pub fn try_send(&self, msg: InputMessage) -> Result<(), SendError> {
        self.sender.try_send(msg).map_err(|e| match e {
            TrySendError::Full(_) => SendError::MailboxFull,
            TrySendError::Closed(_) => SendError::ActorStopped,
        })
    }
}

impl fmt::Debug for InputHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputHandle")
            .field("input_id", &self.input_id)
            .field("free_slots", &self.sender.capacity())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
