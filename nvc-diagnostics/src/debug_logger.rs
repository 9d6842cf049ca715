//! Structured logging setup

use nvc_core::NvcError;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info";

/// Installs the global `tracing` subscriber
#[derive(Debug, Default)]
pub struct DebugLogger;

impl DebugLogger {
    /// Create new debug logger
    pub fn new() -> Self {
        Self
    }

    /// Initialize logging from `RUST_LOG`, defaulting to `info`
    ///
    /// Calling it again after a subscriber is installed is a no-op.
    pub fn init_logging() -> Result<(), NvcError> {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
        Self::install(filter);
        Ok(())
    }

    /// Initialize logging with an explicit filter such as `debug` or
    /// `nvc=trace,nvc_signaling=debug`
    pub fn init_with_level(level: &str) -> Result<(), NvcError> {
        let filter = EnvFilter::try_new(level).map_err(|e| NvcError::Initialization {
            reason: format!("invalid log filter {:?}: {}", level, e),
        })?;
        Self::install(filter);
        Ok(())
    }

    fn install(filter: EnvFilter) {
        let installed = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init()
            .is_ok();
        if installed {
            tracing::debug!("Logging initialized");
        }
    }
}
