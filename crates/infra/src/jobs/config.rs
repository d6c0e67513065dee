//! Runtime configuration resolved from environment variables.
//!
//! Resolution never fails: every field is validated on its own and falls
//! back to its default when missing or invalid.

use std::time::Duration;

use serde::Serialize;

use super::types::{Backoff, JobOptions};

pub const ENV_REDIS_URL: &str = "REDIS_URL";
pub const ENV_QUEUE_ENABLED: &str = "QUEUE_ENABLED";
pub const ENV_JOB_ATTEMPTS: &str = "QUEUE_JOB_ATTEMPTS";
pub const ENV_BACKOFF_DELAY_MS: &str = "QUEUE_BACKOFF_DELAY_MS";
pub const ENV_REMOVE_ON_COMPLETE: &str = "QUEUE_REMOVE_ON_COMPLETE";
pub const ENV_REMOVE_ON_FAIL: &str = "QUEUE_REMOVE_ON_FAIL";
pub const ENV_WORKER_CONCURRENCY: &str = "QUEUE_WORKER_CONCURRENCY";
pub const ENV_BROKER_TIMEOUT_MS: &str = "QUEUE_BROKER_TIMEOUT_MS";
pub const ENV_LOCK_TTL_MS: &str = "QUEUE_LOCK_TTL_MS";
pub const ENV_RECOVERY_STALE_AFTER_MS: &str = "VOCAL_RECOVERY_STALE_AFTER_MS";
pub const ENV_RECOVERY_INTERVAL_MS: &str = "VOCAL_RECOVERY_INTERVAL_MS";
pub const ENV_RECOVERY_MAX_ATTEMPTS: &str = "VOCAL_RECOVERY_MAX_ATTEMPTS";
pub const ENV_RECOVERY_BATCH_SIZE: &str = "VOCAL_RECOVERY_BATCH_SIZE";

pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
pub const DEFAULT_ATTEMPTS: u32 = 5;
pub const DEFAULT_BACKOFF_DELAY_MS: u64 = 3_000;
pub const DEFAULT_REMOVE_ON_COMPLETE: u64 = 1_000;
pub const DEFAULT_REMOVE_ON_FAIL: u64 = 5_000;
pub const DEFAULT_WORKER_CONCURRENCY: usize = 5;
pub const DEFAULT_BROKER_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_LOCK_TTL_MS: u64 = 5 * 60 * 1_000;
pub const DEFAULT_RECOVERY_STALE_AFTER_MS: u64 = 5 * 60 * 1_000;
pub const DEFAULT_RECOVERY_INTERVAL_MS: u64 = 60 * 1_000;
pub const DEFAULT_RECOVERY_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RECOVERY_BATCH_SIZE: usize = 100;

/// Recovery sweeper settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RecoveryConfig {
    /// Minimum age since last update before a memo counts as stuck.
    pub stale_after: Duration,
    pub interval: Duration,
    pub max_attempts: u32,
    pub batch_size: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_millis(DEFAULT_RECOVERY_STALE_AFTER_MS),
            interval: Duration::from_millis(DEFAULT_RECOVERY_INTERVAL_MS),
            max_attempts: DEFAULT_RECOVERY_MAX_ATTEMPTS,
            batch_size: DEFAULT_RECOVERY_BATCH_SIZE,
        }
    }
}

/// Queue runtime configuration, immutable once resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeConfig {
    pub broker_url: String,
    /// When false, dispatch never contacts the broker.
    pub queue_enabled: bool,
    pub worker_concurrency: usize,
    /// Bound on connecting to the broker and on each broker command.
    pub broker_timeout: Duration,
    /// How long a reserved job may stay unsettled before it is redelivered.
    pub lock_ttl: Duration,
    pub default_job_options: JobOptions,
    pub recovery: RecoveryConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            broker_url: DEFAULT_REDIS_URL.to_string(),
            queue_enabled: true,
            worker_concurrency: DEFAULT_WORKER_CONCURRENCY,
            broker_timeout: Duration::from_millis(DEFAULT_BROKER_TIMEOUT_MS),
            lock_ttl: Duration::from_millis(DEFAULT_LOCK_TTL_MS),
            default_job_options: JobOptions::default(),
            recovery: RecoveryConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Resolve from the process environment.
    pub fn from_env() -> Self {
        Self::resolve(|key| std::env::var(key).ok())
    }

    /// Resolve from an arbitrary variable lookup.
    pub fn resolve<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let broker_url = lookup(ENV_REDIS_URL)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_REDIS_URL.to_string());

        let queue_enabled = lookup(ENV_QUEUE_ENABLED)
            .map(|v| !is_disabled_flag(&v))
            .unwrap_or(true);

        let default_job_options = JobOptions {
            attempts: int_at_least(&lookup, ENV_JOB_ATTEMPTS, 1, DEFAULT_ATTEMPTS),
            backoff: Backoff::exponential(int_at_least(
                &lookup,
                ENV_BACKOFF_DELAY_MS,
                1,
                DEFAULT_BACKOFF_DELAY_MS,
            )),
            remove_on_complete: int_at_least(
                &lookup,
                ENV_REMOVE_ON_COMPLETE,
                0,
                DEFAULT_REMOVE_ON_COMPLETE,
            ),
            remove_on_fail: int_at_least(&lookup, ENV_REMOVE_ON_FAIL, 0, DEFAULT_REMOVE_ON_FAIL),
        };

        let recovery = RecoveryConfig {
            stale_after: Duration::from_millis(int_at_least(
                &lookup,
                ENV_RECOVERY_STALE_AFTER_MS,
                1,
                DEFAULT_RECOVERY_STALE_AFTER_MS,
            )),
            interval: Duration::from_millis(int_at_least(
                &lookup,
                ENV_RECOVERY_INTERVAL_MS,
                1,
                DEFAULT_RECOVERY_INTERVAL_MS,
            )),
            max_attempts: int_at_least(
                &lookup,
                ENV_RECOVERY_MAX_ATTEMPTS,
                1,
                DEFAULT_RECOVERY_MAX_ATTEMPTS,
            ),
            batch_size: int_at_least(
                &lookup,
                ENV_RECOVERY_BATCH_SIZE,
                1,
                DEFAULT_RECOVERY_BATCH_SIZE,
            ),
        };

        Self {
            broker_url,
            queue_enabled,
            worker_concurrency: int_at_least(
                &lookup,
                ENV_WORKER_CONCURRENCY,
                1,
                DEFAULT_WORKER_CONCURRENCY,
            ),
            broker_timeout: Duration::from_millis(int_at_least(
                &lookup,
                ENV_BROKER_TIMEOUT_MS,
                1,
                DEFAULT_BROKER_TIMEOUT_MS,
            )),
            lock_ttl: Duration::from_millis(int_at_least(
                &lookup,
                ENV_LOCK_TTL_MS,
                1,
                DEFAULT_LOCK_TTL_MS,
            )),
            default_job_options,
            recovery,
        }
    }

    pub fn with_queue_enabled(mut self, enabled: bool) -> Self {
        self.queue_enabled = enabled;
        self
    }
}

fn is_disabled_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "false" | "0" | "no" | "off"
    )
}

/// Parse `key` as an integer `>= min`, else `default`.
///
/// Parsing goes through `i64` first so negative input is rejected by the
/// bound check rather than by the target type.
fn int_at_least<F, T>(lookup: &F, key: &str, min: i64, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: TryFrom<i64>,
{
    lookup(key)
        .and_then(|raw| raw.trim().parse::<i64>().ok())
        .filter(|v| *v >= min)
        .and_then(|v| T::try_from(v).ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;

    fn resolve(vars: &[(&str, &str)]) -> RuntimeConfig {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RuntimeConfig::resolve(|key| map.get(key).cloned())
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let config = resolve(&[]);

        assert_eq!(config, RuntimeConfig::default());
        assert_eq!(config.default_job_options.attempts, 5);
        assert_eq!(config.default_job_options.backoff.delay_ms, 3_000);
        assert_eq!(config.default_job_options.remove_on_complete, 1_000);
        assert_eq!(config.default_job_options.remove_on_fail, 5_000);
        assert_eq!(config.worker_concurrency, 5);
        assert_eq!(config.broker_timeout, Duration::from_secs(5));
        assert_eq!(config.lock_ttl, Duration::from_secs(300));
        assert!(config.queue_enabled);
    }

    #[test]
    fn broker_timeout_and_lock_ttl_are_bounded_below() {
        let config = resolve(&[(ENV_BROKER_TIMEOUT_MS, "750"), (ENV_LOCK_TTL_MS, "0")]);

        assert_eq!(config.broker_timeout, Duration::from_millis(750));
        assert_eq!(config.lock_ttl, Duration::from_millis(DEFAULT_LOCK_TTL_MS));
    }

    #[test]
    fn valid_values_are_applied() {
        let config = resolve(&[
            (ENV_REDIS_URL, "redis://broker:6380"),
            (ENV_JOB_ATTEMPTS, "7"),
            (ENV_BACKOFF_DELAY_MS, " 250 "),
            (ENV_REMOVE_ON_COMPLETE, "0"),
            (ENV_REMOVE_ON_FAIL, "0"),
            (ENV_WORKER_CONCURRENCY, "2"),
            (ENV_RECOVERY_STALE_AFTER_MS, "1000"),
            (ENV_RECOVERY_MAX_ATTEMPTS, "4"),
        ]);

        assert_eq!(config.broker_url, "redis://broker:6380");
        assert_eq!(config.default_job_options.attempts, 7);
        assert_eq!(config.default_job_options.backoff.delay_ms, 250);
        assert_eq!(config.default_job_options.remove_on_complete, 0);
        assert_eq!(config.default_job_options.remove_on_fail, 0);
        assert_eq!(config.worker_concurrency, 2);
        assert_eq!(config.recovery.stale_after, Duration::from_secs(1));
        assert_eq!(config.recovery.max_attempts, 4);
    }

    #[test]
    fn zero_is_rejected_only_where_one_is_required() {
        let config = resolve(&[
            (ENV_JOB_ATTEMPTS, "0"),
            (ENV_WORKER_CONCURRENCY, "0"),
            (ENV_REMOVE_ON_COMPLETE, "0"),
        ]);

        assert_eq!(config.default_job_options.attempts, DEFAULT_ATTEMPTS);
        assert_eq!(config.worker_concurrency, DEFAULT_WORKER_CONCURRENCY);
        assert_eq!(config.default_job_options.remove_on_complete, 0);
    }

    #[test]
    fn queue_flag_parsing() {
        for off in ["false", "0", "no", "OFF", " False "] {
            assert!(!resolve(&[(ENV_QUEUE_ENABLED, off)]).queue_enabled, "{off}");
        }
        for on in ["true", "1", "yes", ""] {
            assert!(resolve(&[(ENV_QUEUE_ENABLED, on)]).queue_enabled, "{on}");
        }
    }

    #[test]
    fn blank_broker_url_falls_back() {
        assert_eq!(resolve(&[(ENV_REDIS_URL, "  ")]).broker_url, DEFAULT_REDIS_URL);
    }

    fn malformed() -> impl Strategy<Value = String> {
        prop_oneof![
            "[a-zA-Z]{1,8}",
            (i64::MIN..=-1i64).prop_map(|v| v.to_string()),
            (0.5f64..1e6).prop_map(|v| format!("{v:.3}")),
            Just(String::new()),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: a malformed value resets exactly its own field while a
        /// valid neighbour is kept.
        #[test]
        fn malformed_input_only_resets_its_field(bad in malformed(), good in 1u32..1_000) {
            let good = good.to_string();
            let config = resolve(&[
                (ENV_JOB_ATTEMPTS, bad.as_str()),
                (ENV_REMOVE_ON_FAIL, bad.as_str()),
                (ENV_WORKER_CONCURRENCY, good.as_str()),
                (ENV_BACKOFF_DELAY_MS, good.as_str()),
            ]);

            prop_assert_eq!(config.default_job_options.attempts, DEFAULT_ATTEMPTS);
            prop_assert_eq!(config.default_job_options.remove_on_fail, DEFAULT_REMOVE_ON_FAIL);
            prop_assert_eq!(config.worker_concurrency.to_string(), good.clone());
            prop_assert_eq!(config.default_job_options.backoff.delay_ms.to_string(), good);
        }

        #[test]
        fn recovery_fields_validate_independently(bad in malformed(), batch in 1usize..500) {
            let batch_str = batch.to_string();
            let config = resolve(&[
                (ENV_RECOVERY_INTERVAL_MS, bad.as_str()),
                (ENV_RECOVERY_MAX_ATTEMPTS, bad.as_str()),
                (ENV_RECOVERY_BATCH_SIZE, batch_str.as_str()),
            ]);

            prop_assert_eq!(config.recovery.interval, Duration::from_millis(DEFAULT_RECOVERY_INTERVAL_MS));
            prop_assert_eq!(config.recovery.max_attempts, DEFAULT_RECOVERY_MAX_ATTEMPTS);
            prop_assert_eq!(config.recovery.batch_size, batch);
        }
    }
}
