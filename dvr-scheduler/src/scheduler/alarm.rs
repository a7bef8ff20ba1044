//! Wake-up alarm for the next pending recording.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::clock::{Clock, ms_to_datetime};

/// Wakes the host shortly before a recording needs a tuner.
pub trait WakeupAlarm: Send + Sync + 'static {
    /// Replace any pending alarm with one firing at `wake_at_ms`.
    fn set(&self, wake_at_ms: i64);
}

/// Alarm backed by a tokio sleep. Each firing sends one tick on the
/// receiver returned by [`TimerAlarm::new`].
pub struct TimerAlarm {
    clock: Arc<dyn Clock>,
    ticks: mpsc::UnboundedSender<()>,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl TimerAlarm {
    pub fn new(clock: Arc<dyn Clock>) -> (Self, mpsc::UnboundedReceiver<()>) {
        let (ticks, rx) = mpsc::unbounded_channel();
        (
            Self {
                clock,
                ticks,
                pending: Mutex::new(None),
            },
            rx,
        )
    }

    /// Drop the pending alarm, if any.
    pub fn clear(&self) {
        if let Some(previous) = self.pending.lock().take() {
            previous.abort();
        }
    }
}

impl WakeupAlarm for TimerAlarm {
    fn set(&self, wake_at_ms: i64) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No tokio runtime, alarm not set");
            return;
        };

        let delay = wake_at_ms.saturating_sub(self.clock.now_ms()).max(0) as u64;
        debug!(wake_at = %ms_to_datetime(wake_at_ms), "Setting wake-up alarm");

        let ticks = self.ticks.clone();
        let sleeper = runtime.spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            let _ = ticks.send(());
        });

        if let Some(previous) = self.pending.lock().replace(sleeper) {
            previous.abort();
        }
    }
}

impl Drop for TimerAlarm {
    fn drop(&mut self) {
        self.clear();
    }
}
