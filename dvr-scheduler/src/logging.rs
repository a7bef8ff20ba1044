//! Logging setup with a reloadable filter.

use chrono::Local;
use tracing::info;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    reload::{self, Handle},
    util::SubscriberInitExt,
};

use crate::{Error, Result};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "dvr_scheduler=info";

#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

pub type FilterHandle = Handle<EnvFilter, tracing_subscriber::Registry>;

/// Handle for adjusting the active log filter at runtime.
pub struct LoggingHandle {
    handle: FilterHandle,
}

impl LoggingHandle {
    /// Get the current filter directive string.
    pub fn get_filter(&self) -> String {
        self.handle
            .with_current(|filter| filter.to_string())
            .unwrap_or_default()
    }

    /// Set a new filter directive, e.g. `"dvr_scheduler=debug"`.
    pub fn set_filter(&self, directive: &str) -> Result<()> {
        let new_filter = EnvFilter::try_new(directive)
            .map_err(|e| Error::Other(format!("Invalid filter directive: {}", e)))?;

        self.handle
            .reload(new_filter)
            .map_err(|e| Error::Other(format!("Failed to reload filter: {}", e)))?;

        info!(directive = %directive, "Log filter updated");
        Ok(())
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over `DEFAULT_LOG_FILTER`. Fails if a global
/// subscriber is already set.
pub fn init_logging(json: bool) -> Result<LoggingHandle> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let (filter_layer, handle) = reload::Layer::new(filter);

    let registry = tracing_subscriber::registry().with(filter_layer);
    let result = if json {
        registry
            .with(fmt::layer().json().with_timer(LocalTimer))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(true).with_timer(LocalTimer))
            .try_init()
    };
    result.map_err(|e| Error::Other(format!("Failed to install subscriber: {}", e)))?;

    Ok(LoggingHandle { handle })
}
