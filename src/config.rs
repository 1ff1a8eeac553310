//! Service configuration knobs.
//!
//! The process harness parses these from its CLI or config files and hands
//! the resulting [`ServiceConfig`] to the core. Defaults match the fleet
//! deployment values.

use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// TCP port the RPC transport binds to.
    pub port: u16,

    /// Device count above which bulk_run shards work onto peer instances.
    pub lb_threshold: usize,

    /// Seconds subtracted from the forwarded timeout for remote bulk calls.
    pub remote_call_overhead: u64,

    /// Max seconds to wait for in-flight sessions on shutdown.
    pub exit_max_wait: u64,

    /// Device inventory refresh interval, seconds.
    pub device_db_update_interval: u64,

    /// Restrict the inventory fetch to hostnames matching this pattern.
    pub device_name_filter: Option<String>,

    /// Bound on the blocking-call worker pool.
    pub max_default_executor_threads: usize,

    /// Default log level for the harness logger.
    pub log_level: String,

    /// Session count above which bulk_run_local sheds with an overload error.
    pub bulk_session_limit: usize,

    /// Retries for a forwarded bulk chunk rejected as overloaded.
    pub bulk_retry_limit: usize,

    /// Upper bound, seconds, of the random per-device stagger in bulk runs.
    pub bulk_run_jitter: u64,

    /// Bounds, seconds, of the random delay between bulk retries.
    pub bulk_retry_delay_min: u64,
    pub bulk_retry_delay_max: u64,

    /// Path to a JSON vendor profile document, merged over the builtins.
    pub device_vendors: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            port: 5000,
            lb_threshold: 100,
            remote_call_overhead: 20,
            exit_max_wait: 300,
            device_db_update_interval: 30 * 60,
            device_name_filter: None,
            max_default_executor_threads: 4,
            log_level: "info".to_string(),
            bulk_session_limit: 200,
            bulk_retry_limit: 5,
            bulk_run_jitter: 5,
            bulk_retry_delay_min: 5,
            bulk_retry_delay_max: 10,
            device_vendors: None,
        }
    }
}

impl ServiceConfig {
    pub fn remote_call_overhead(&self) -> Duration {
        Duration::from_secs(self.remote_call_overhead)
    }

    pub fn exit_max_wait(&self) -> Duration {
        Duration::from_secs(self.exit_max_wait)
    }

    pub fn device_db_update_interval(&self) -> Duration {
        Duration::from_secs(self.device_db_update_interval)
    }
}
