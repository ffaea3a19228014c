//! Retry with exponential backoff for transient I/O.
//!
//! Cancellation is permanent: a canceled operation is never retried.

use std::future::Future;
use std::time::Duration;

use anyhow::anyhow;
use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub max_elapsed: Duration,
    pub multiplier: f64,
    pub randomization: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(1),
            max_elapsed: Duration::from_secs(3),
            multiplier: 2.0,
            randomization: 0.2,
        }
    }
}

/// Runs `op` until it succeeds, the elapsed budget runs out, or `cancel`
/// fires. The last error is returned on exhaustion.
pub async fn retry<T, F, Fut>(
    cancel: &CancellationToken,
    policy: Backoff,
    mut op: F,
) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let started = Instant::now();
    let mut interval = policy.initial_interval;

    loop {
        if cancel.is_cancelled() {
            return Err(anyhow!("canceled"));
        }

        match op().await {
            Ok(v) => return Ok(v),
            Err(err) => {
                if started.elapsed() >= policy.max_elapsed {
                    return Err(err.context("retries exhausted"));
                }

                let jitter =
                    1.0 + policy.randomization * rand::thread_rng().gen_range(-1.0f64..=1.0);
                let wait = interval.mul_f64(jitter);
                debug!(wait_ms = wait.as_millis() as u64, error = %err, "retrying after backoff");

                tokio::select! {
                    _ = cancel.cancelled() => return Err(anyhow!("canceled")),
                    _ = tokio::time::sleep(wait) => {}
                }
                interval = interval.mul_f64(policy.multiplier).min(policy.max_interval);
            }
        }
    }
}
