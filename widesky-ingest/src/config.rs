//! Pipeline configuration, from CLI flags with environment fallbacks.

use std::time::Duration;

use clap::Parser;
use widesky_common::retry::RetryPolicy;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Bluesky firehose to Postgres ingestion pipeline")]
pub struct Config {
    /// Firehose host to subscribe to.
    #[arg(long, env = "WIDESKY_FIREHOSE_HOST", default_value = "bsky.network")]
    pub firehose_host: String,
    /// Base URL of the DID directory used for handle resolution.
    #[arg(long, env = "WIDESKY_PLC_URL", default_value = "https://plc.directory")]
    pub plc_url: String,
    /// Postgres connection string.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,
    /// Drop and recreate all tables at startup.
    #[arg(long)]
    pub reset_schema: bool,
    /// Resume from this firehose sequence number.
    #[arg(long, env = "WIDESKY_CURSOR")]
    pub cursor: Option<i64>,
    /// Number of classifier workers.
    #[arg(long, default_value_t = 5)]
    pub workers: usize,
    /// Capacity of the frame and record queues.
    #[arg(long, default_value_t = 1024)]
    pub queue_capacity: usize,
    /// Rows per table buffered before a flush.
    #[arg(long, default_value_t = 100)]
    pub batch_size: usize,
    /// Seconds between flushes when the size threshold is not reached.
    #[arg(long, default_value_t = 3.0)]
    pub flush_interval_secs: f64,
    /// Seconds a single flush may take before it counts as failed.
    #[arg(long, default_value_t = 10)]
    pub flush_timeout_secs: u64,
    /// Base retry delay in milliseconds.
    #[arg(long, default_value_t = 500)]
    pub backoff_base_ms: u64,
    /// Retry delay ceiling in seconds.
    #[arg(long, default_value_t = 60)]
    pub backoff_cap_secs: u64,
    /// Random jitter added to each retry delay, in milliseconds.
    #[arg(long, default_value_t = 250)]
    pub backoff_jitter_ms: u64,
    /// Retries per directory lookup before degrading to an empty handle.
    #[arg(long, default_value_t = 3)]
    pub lookup_retries: u32,
    /// Retries per batch flush before the batch is dropped.
    #[arg(long, default_value_t = 3)]
    pub flush_retries: u32,
    /// Seconds of healthy streaming after which the reconnect counter resets.
    #[arg(long, default_value_t = 30)]
    pub stable_connection_secs: u64,
    /// Seconds without a frame before the connection is considered dead.
    #[arg(long, default_value_t = 60)]
    pub read_timeout_secs: u64,
    /// Seconds a websocket connect attempt may take before it fails.
    #[arg(long, default_value_t = 30)]
    pub connect_timeout_secs: u64,
    /// Maximum Postgres connections.
    #[arg(long, default_value_t = 6)]
    pub db_max_connections: u32,
}

impl Config {
    /// The backoff shape shared by every retrying stage. Each stage
    /// instantiates its own counter from this.
    pub fn backoff_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_secs(self.backoff_cap_secs),
        )
        .with_jitter(Duration::from_millis(self.backoff_jitter_ms))
    }

    pub fn lookup_policy(&self) -> RetryPolicy {
        self.backoff_policy().with_max_attempts(self.lookup_retries)
    }

    pub fn flush_policy(&self) -> RetryPolicy {
        self.backoff_policy().with_max_attempts(self.flush_retries)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs_f64(self.flush_interval_secs)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_secs(self.flush_timeout_secs)
    }

    pub fn stable_connection(&self) -> Duration {
        Duration::from_secs(self.stable_connection_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}
