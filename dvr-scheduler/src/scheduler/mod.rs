//! Recording scheduler: per-input admission actors plus the service that
//! feeds them.

mod alarm;
mod handle;
mod input_scheduler;
mod messages;
mod service;
mod task;

pub use alarm::{TimerAlarm, WakeupAlarm};
pub use handle::{InputHandle, SendError};
pub use input_scheduler::{InputSchedulerConfig, InputTaskScheduler};
pub use messages::{InputMessage, InputSchedulerState, RecordingOutcome, StateReport, TaskCommand};
pub use service::Scheduler;
pub use task::{Recorder, TaskControl};
