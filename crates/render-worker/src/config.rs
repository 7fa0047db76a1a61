//! Worker configuration.

use std::num::NonZeroU32;
use std::path::PathBuf;
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use render_models::JobType;

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Root for per-run working directories and finished outputs
    pub work_dir: PathBuf,
    /// Sleep between dequeue attempts when the queue is empty
    pub poll_interval: Duration,
    /// Liveness heartbeat period for active jobs
    pub heartbeat_interval: Duration,
    /// Heartbeat age after which an active job counts as stalled
    pub stall_interval: Duration,
    /// How often the stall detector runs
    pub stall_check_interval: Duration,
    /// Graceful shutdown timeout
    pub shutdown_timeout: Duration,
    /// Prometheus exporter port; disabled when unset
    pub metrics_port: Option<u16>,
    /// Upper bound on one FFmpeg invocation
    pub stage_timeout: Option<Duration>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("/tmp/render"),
            poll_interval: Duration::from_millis(1000),
            heartbeat_interval: Duration::from_secs(15),
            stall_interval: Duration::from_secs(120),
            stall_check_interval: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(60),
            metrics_port: Some(9100),
            stage_timeout: None,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            work_dir: std::env::var("WORKER_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.work_dir),
            poll_interval: env_parse("WORKER_POLL_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            heartbeat_interval: env_parse("WORKER_HEARTBEAT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.heartbeat_interval),
            stall_interval: env_parse("WORKER_STALL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.stall_interval),
            stall_check_interval: env_parse("WORKER_STALL_CHECK_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.stall_check_interval),
            shutdown_timeout: env_parse("WORKER_SHUTDOWN_TIMEOUT")
                .map(Duration::from_secs)
                .unwrap_or(defaults.shutdown_timeout),
            metrics_port: match std::env::var("WORKER_METRICS_PORT") {
                Ok(v) if v.is_empty() || v == "off" => None,
                Ok(v) => v.parse().ok().or(defaults.metrics_port),
                Err(_) => defaults.metrics_port,
            },
            stage_timeout: env_parse("WORKER_STAGE_TIMEOUT_SECS")
                .filter(|secs: &u64| *secs > 0)
                .map(Duration::from_secs),
        }
    }
}

/// Concurrency and start-rate limits for one job type's pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub job_type: JobType,
    pub concurrency: usize,
    /// Max jobs started per `rate_window`
    pub rate_limit: u32,
    pub rate_window: Duration,
}

impl PoolConfig {
    pub fn defaults_for(job_type: JobType) -> Self {
        let (concurrency, rate_limit) = match job_type {
            JobType::Video => (2, 10),
            JobType::Tts => (5, 50),
            JobType::Avatar => (1, 5),
        };
        Self {
            job_type,
            concurrency,
            rate_limit,
            rate_window: Duration::from_secs(60),
        }
    }

    /// Read `{VIDEO,TTS,AVATAR}_CONCURRENCY`, `_RATE_LIMIT` and `_RATE_WINDOW_SECS`.
    pub fn from_env(job_type: JobType) -> Self {
        let defaults = Self::defaults_for(job_type);
        let prefix = job_type.as_str().to_uppercase();
        Self {
            job_type,
            concurrency: env_parse(&format!("{prefix}_CONCURRENCY")).unwrap_or(defaults.concurrency),
            rate_limit: env_parse(&format!("{prefix}_RATE_LIMIT")).unwrap_or(defaults.rate_limit),
            rate_window: env_parse(&format!("{prefix}_RATE_WINDOW_SECS"))
                .map(Duration::from_secs)
                .unwrap_or(defaults.rate_window),
        }
    }

    /// GCRA limiter allowing `rate_limit` starts per window, all of them in a burst.
    pub fn rate_limiter(&self) -> DefaultDirectRateLimiter {
        let max = NonZeroU32::new(self.rate_limit.max(1)).unwrap_or(NonZeroU32::MIN);
        let period = (self.rate_window / max.get()).max(Duration::from_nanos(1));
        let quota = Quota::with_period(period)
            .unwrap_or_else(|| Quota::per_minute(max))
            .allow_burst(max);
        RateLimiter::direct(quota)
    }
}
