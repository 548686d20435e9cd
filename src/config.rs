// ABOUTME: Tunable knobs for the hub and its eviction clock, with builder-style setters
// ABOUTME: Defaults match the original broker's constants

use std::path::PathBuf;
use std::time::Duration;

/// Default TCP listening port for the stream transport.
pub const DEFAULT_PORT: u16 = 8990;

/// Well-known inbound pipe for the named-pipe transport.
pub const DEFAULT_SERVER_FIFO: &str = "/tmp/chat_server_fifo";

/// Directory where per-client reply pipes live.
pub const DEFAULT_FIFO_DIR: &str = "/tmp";

/// Idle-eviction timing.
///
/// The router sweeps on a fixed cadence; entries idle past the threshold go
/// INACTIVE, and entries that stay INACTIVE for a further full interval are
/// removed from the roster.
///
/// ```rust
/// use chathub::config::EvictionConfig;
/// use std::time::Duration;
///
/// let eviction = EvictionConfig::default().with_idle_after(Duration::from_secs(120));
/// assert_eq!(eviction.interval, Duration::from_secs(1));
/// ```
#[derive(Debug, Clone)]
pub struct EvictionConfig {
    /// Sweep cadence (default: 1 second).
    pub interval: Duration,
    /// Inactivity threshold before an ACTIVE entry is evicted (default: 30 s).
    pub idle_after: Duration,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            idle_after: Duration::from_secs(30),
        }
    }
}

impl EvictionConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_idle_after(mut self, idle_after: Duration) -> Self {
        self.idle_after = idle_after;
        self
    }
}

/// Inbound frame rate limiting per endpoint (token bucket).
#[derive(Debug, Clone, Copy)]
pub struct RateConfig {
    /// Sustained frames per second.
    pub rate: f32,
    /// Burst capacity.
    pub burst: f32,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            rate: 10.0,
            burst: 20.0,
        }
    }
}

/// Hub-wide tuning.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Maximum number of roster entries (default: 50).
    pub capacity: usize,
    /// Pending frames per destination before drops begin (default: 64).
    pub queue_depth: usize,
    /// Per-frame write deadline before a destination is failed (default: 60 s).
    pub write_deadline: Duration,
    /// Consecutive queue-full drops before a destination is marked degraded
    /// and scheduled for eviction (default: 1).
    pub degraded_after: u32,
    /// How long shutdown waits for write queues to drain (default: 5 s).
    pub drain_deadline: Duration,
    pub eviction: EvictionConfig,
    pub rate: RateConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            capacity: 50,
            queue_depth: 64,
            write_deadline: Duration::from_secs(60),
            degraded_after: 1,
            drain_deadline: Duration::from_secs(5),
            eviction: EvictionConfig::default(),
            rate: RateConfig::default(),
        }
    }
}

impl HubConfig {
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_queue_depth(mut self, queue_depth: usize) -> Self {
        self.queue_depth = queue_depth;
        self
    }

    pub fn with_write_deadline(mut self, write_deadline: Duration) -> Self {
        self.write_deadline = write_deadline;
        self
    }

    pub fn with_degraded_after(mut self, degraded_after: u32) -> Self {
        self.degraded_after = degraded_after;
        self
    }

    pub fn with_eviction(mut self, eviction: EvictionConfig) -> Self {
        self.eviction = eviction;
        self
    }

    pub fn with_rate(mut self, rate: RateConfig) -> Self {
        self.rate = rate;
        self
    }
}

/// Where the named-pipe backend puts its artifacts.
#[derive(Debug, Clone)]
pub struct PipeConfig {
    pub server_path: PathBuf,
    pub client_dir: PathBuf,
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            server_path: PathBuf::from(DEFAULT_SERVER_FIFO),
            client_dir: PathBuf::from(DEFAULT_FIFO_DIR),
        }
    }
}

impl PipeConfig {
    pub fn with_server_path(mut self, server_path: impl Into<PathBuf>) -> Self {
        self.server_path = server_path.into();
        self
    }

    pub fn with_client_dir(mut self, client_dir: impl Into<PathBuf>) -> Self {
        self.client_dir = client_dir.into();
        self
    }
}
