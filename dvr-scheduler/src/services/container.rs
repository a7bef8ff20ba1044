//! Service container for dependency injection.
//!
//! The ServiceContainer wires the store, schedule manager, recording
//! scheduler, series engine and DVR manager together and manages their
//! lifecycle.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::Result;
use crate::catalog::{ChannelCatalog, ProgramSource, SeriesInfoSource};
use crate::clock::Clock;
use crate::config::DvrConfig;
use crate::dvr::DvrManager;
use crate::events::EventBroadcaster;
use crate::manager::{ManagerEvent, ScheduleManager};
use crate::scheduler::{Recorder, Scheduler, TimerAlarm, WakeupAlarm};
use crate::series::SeriesRecordingScheduler;
use crate::store::{MemoryScheduleStore, ScheduleRepository, ScheduleStore, StoreEvent};

/// Default shutdown timeout.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// External collaborators the container does not own.
#[derive(Clone)]
pub struct Collaborators {
    pub catalog: Arc<dyn ChannelCatalog>,
    pub programs: Arc<dyn ProgramSource>,
    pub series_info: Arc<dyn SeriesInfoSource>,
    pub recorder: Arc<dyn Recorder>,
    pub clock: Arc<dyn Clock>,
}

/// Service container holding all scheduler services.
pub struct ServiceContainer<R>
where
    R: ScheduleRepository + 'static,
{
    pub config: DvrConfig,
    pub store: Arc<MemoryScheduleStore<R>>,
    pub schedule_manager: Arc<ScheduleManager>,
    pub scheduler: Arc<Scheduler>,
    pub series_scheduler: Arc<SeriesRecordingScheduler>,
    pub dvr_manager: Arc<DvrManager>,
    alarm_ticks: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<()>>>,
    manager_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    cancellation_token: CancellationToken,
}

impl<R> ServiceContainer<R>
where
    R: ScheduleRepository + 'static,
{
    /// Build the services with a tokio-timer wake-up alarm.
    pub fn new(config: DvrConfig, repo: Arc<R>, deps: Collaborators) -> Result<Self> {
        let (alarm, ticks) = TimerAlarm::new(Arc::clone(&deps.clock));
        Self::with_alarm(config, repo, deps, Arc::new(alarm), Some(ticks))
    }

    /// Build the services with a custom alarm. When `ticks` is given, each
    /// tick runs a scheduler update.
    pub fn with_alarm(
        config: DvrConfig,
        repo: Arc<R>,
        deps: Collaborators,
        alarm: Arc<dyn WakeupAlarm>,
        ticks: Option<mpsc::UnboundedReceiver<()>>,
    ) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(
            MemoryScheduleStore::new(
                repo,
                EventBroadcaster::<StoreEvent>::with_capacity(config.event_channel_capacity),
            )
            .with_clock(Arc::clone(&deps.clock)),
        );
        let store_dyn: Arc<dyn ScheduleStore> = store.clone();

        let schedule_manager = Arc::new(ScheduleManager::new(
            Arc::clone(&store_dyn),
            Arc::clone(&deps.catalog),
            Arc::clone(&deps.clock),
            EventBroadcaster::<ManagerEvent>::with_capacity(config.event_channel_capacity),
        ));
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&store_dyn),
            Arc::clone(&deps.catalog),
            Arc::clone(&deps.recorder),
            Arc::clone(&deps.clock),
            alarm,
            config.clone(),
        ));
        let series_scheduler = Arc::new(SeriesRecordingScheduler::new(
            Arc::clone(&store_dyn),
            Arc::clone(&deps.programs),
            Arc::clone(&deps.series_info),
            Arc::clone(&deps.clock),
        ));
        let dvr_manager = Arc::new(DvrManager::new(
            store_dyn,
            deps.catalog,
            deps.programs,
            Arc::clone(&schedule_manager),
            Arc::clone(&scheduler),
            Arc::clone(&series_scheduler),
            deps.clock,
        ));

        Ok(Self {
            config,
            store,
            schedule_manager,
            scheduler,
            series_scheduler,
            dvr_manager,
            alarm_ticks: parking_lot::Mutex::new(ticks),
            manager_task: parking_lot::Mutex::new(None),
            cancellation_token: CancellationToken::new(),
        })
    }

    /// Load the store and start every service.
    pub async fn start(&self) -> Result<()> {
        info!("Initializing DVR services");

        // Followers subscribe before the load so they see LoadFinished.
        *self.manager_task.lock() = Some(
            self.schedule_manager
                .run(self.cancellation_token.child_token()),
        );

        let count = self.store.load().await?;
        info!("Loaded {} schedule(s)", count);

        self.scheduler.start().await?;
        if let Some(ticks) = self.alarm_ticks.lock().take() {
            self.scheduler.watch_alarm(ticks);
        }
        self.series_scheduler.start();

        info!("DVR services initialized");
        Ok(())
    }

    /// Tell the schedule manager the channel list changed.
    pub fn on_channel_list_updated(&self) {
        self.schedule_manager.on_channel_list_updated();
    }

    /// Tell the schedule manager channel metadata finished loading.
    pub fn on_channels_loaded(&self) {
        self.schedule_manager.on_channels_loaded();
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_with_timeout(DEFAULT_SHUTDOWN_TIMEOUT).await
    }

    /// Stop every service, waiting at most `timeout` for them to wind down.
    pub async fn shutdown_with_timeout(&self, timeout: Duration) -> Result<()> {
        info!("Shutting down DVR services (timeout: {:?})", timeout);
        self.cancellation_token.cancel();
        self.series_scheduler.stop();

        let manager_task = self.manager_task.lock().take();
        let result = tokio::time::timeout(timeout, async {
            self.scheduler.stop().await;
            if let Some(task) = manager_task {
                let _ = task.await;
            }
        })
        .await;
        if result.is_err() {
            warn!("Shutdown timeout reached, forcing shutdown");
        }

        info!("DVR services shut down");
        Ok(())
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            schedule_count: self.store.all_scheduled_recordings().len(),
            series_count: self.store.series_recordings().len(),
            conflict_count: self.schedule_manager.all_conflicting_schedules().len(),
            active_inputs: self.scheduler.active_inputs().len(),
            pending_series_updates: self.series_scheduler.pending_updates(),
        }
    }
}

/// Service statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStats {
    pub schedule_count: usize,
    pub series_count: usize,
    pub conflict_count: usize,
    /// Inputs with a running scheduler.
    pub active_inputs: usize,
    pub pending_series_updates: usize,
}
