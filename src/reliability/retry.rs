use std::future::Future;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Result};
use rand::Rng;

use crate::error::{LedgerError, LedgerResult};
use crate::logging::{log, obj, v_num, v_str, Domain, Level};

/// Bounded retry budget shared by storage and oracle calls.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1500,
            max_delay_ms: 8000,
            jitter_factor: 0.33,
        }
    }
}

impl RetryConfig {
    /// No sleeping between attempts; for tests and in-memory stores.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
            max_delay_ms: 0,
            jitter_factor: 0.0,
        }
    }

    /// Calculate delay with exponential backoff and jitter
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms as f64 * 2.0_f64.powi(attempt as i32);
        let clamped = base.min(self.max_delay_ms as f64);

        let jitter_range = clamped * self.jitter_factor;
        let jitter: f64 = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };
        let final_delay = (clamped + jitter).max(0.0);

        Duration::from_millis(final_delay as u64)
    }
}

fn log_retry(operation_name: &str, attempt: u32, max: u32, err: &str, delay: Duration) {
    log(
        Level::Warn,
        Domain::Storage,
        "retry",
        obj(&[
            ("op", v_str(operation_name)),
            ("attempt", v_num(attempt as f64)),
            ("max_attempts", v_num(max as f64)),
            ("error", v_str(err)),
            ("delay_ms", v_num(delay.as_millis() as f64)),
        ]),
    );
}

/// Retry a storage operation while SQLite reports lock contention.
///
/// Non-busy errors return immediately. Exhausting the budget yields
/// `LedgerError::StorageBusy`.
pub fn retry_busy<T, F>(config: &RetryConfig, operation_name: &str, mut operation: F) -> LedgerResult<T>
where
    F: FnMut() -> LedgerResult<T>,
{
    let attempts = config.max_attempts.max(1);
    for attempt in 0..attempts {
        match operation() {
            Ok(result) => return Ok(result),
            Err(e) if e.is_busy() => {
                if attempt + 1 < attempts {
                    let delay = config.delay_for_attempt(attempt);
                    log_retry(operation_name, attempt + 1, attempts, &e.to_string(), delay);
                    thread::sleep(delay);
                }
            }
            Err(e) => return Err(e),
        }
    }
    Err(storage_busy(operation_name, attempts))
}

/// [`retry_busy`] for async callers: each attempt still runs synchronously,
/// but the backoff between attempts yields to the runtime.
pub async fn retry_busy_async<T, F>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> LedgerResult<T>
where
    F: FnMut() -> LedgerResult<T>,
{
    let attempts = config.max_attempts.max(1);
    for attempt in 0..attempts {
        match operation() {
            Ok(result) => return Ok(result),
            Err(e) if e.is_busy() => {
                if attempt + 1 < attempts {
                    let delay = config.delay_for_attempt(attempt);
                    log_retry(operation_name, attempt + 1, attempts, &e.to_string(), delay);
                    tokio::time::sleep(delay).await;
                }
            }
            Err(e) => return Err(e),
        }
    }
    Err(storage_busy(operation_name, attempts))
}

fn storage_busy(operation_name: &str, attempts: u32) -> LedgerError {
    log(
        Level::Error,
        Domain::Storage,
        "storage_busy",
        obj(&[("op", v_str(operation_name)), ("attempts", v_num(attempts as f64))]),
    );
    LedgerError::StorageBusy {
        op: operation_name.to_string(),
        attempts,
    }
}

/// Retry a fallible async operation with exponential backoff
pub async fn retry_async<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = config.max_attempts.max(1);
    let mut last_error: Option<anyhow::Error> = None;

    for attempt in 0..attempts {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if attempt + 1 < attempts {
                    let delay = config.delay_for_attempt(attempt);
                    log_retry(operation_name, attempt + 1, attempts, &e.to_string(), delay);
                    tokio::time::sleep(delay).await;
                }
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| anyhow!("retry_async exhausted without error")))
}
