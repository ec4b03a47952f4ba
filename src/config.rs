//! Engine configuration.

use crate::error::{Error, Result};

/// Engine configuration.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Records per page when replaying a stream into a handler.
    /// Default: 100
    pub projection_page_size: usize,

    /// Records per page when the broker scans up to a notification.
    /// Default: 50
    pub broker_page_size: usize,

    /// Records per page when a distributor backfills a gap.
    /// Default: 100
    pub backfill_page_size: usize,

    /// Attempts made by `execute` before a write conflict is returned.
    /// Default: 3
    pub execute_retries: usize,

    /// Stream instances kept warm by the engine facade.
    /// Default: 1024
    pub stream_cache_size: usize,
}

impl EngineConfig {
    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let sizes = [
            ("projection_page_size", self.projection_page_size),
            ("broker_page_size", self.broker_page_size),
            ("backfill_page_size", self.backfill_page_size),
            ("execute_retries", self.execute_retries),
            ("stream_cache_size", self.stream_cache_size),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(Error::Configuration(format!("{} must be positive", name)));
            }
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            projection_page_size: 100,
            broker_page_size: 50,
            backfill_page_size: 100,
            execute_retries: 3,
            stream_cache_size: 1024,
        }
    }
}
