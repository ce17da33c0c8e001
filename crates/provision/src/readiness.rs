use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{StageErrorKind, chain};

/// Fixed-interval polling with a bounded number of attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl From<&polystore_config::ReadinessConfig> for ReadinessPolicy {
    fn from(config: &polystore_config::ReadinessConfig) -> Self {
        ReadinessPolicy {
            max_attempts: config.max_attempts,
            interval: config.interval,
        }
    }
}

/// Calls `probe` until it succeeds, sleeping `policy.interval` between
/// attempts. Returns the number of attempts it took.
///
/// Cancellation is observed between attempts; a probe in flight is not
/// interrupted.
pub async fn await_ready<F, Fut>(
    policy: &ReadinessPolicy,
    cancel: &CancellationToken,
    mut probe: F,
) -> Result<u32, StageErrorKind>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let mut last_error = String::from("never probed");
    for attempt in 1..=policy.max_attempts {
        if cancel.is_cancelled() {
            return Err(StageErrorKind::Cancelled);
        }
        match probe().await {
            Ok(()) => return Ok(attempt),
            Err(err) => {
                last_error = chain(&err);
                tracing::debug!(attempt, max_attempts = policy.max_attempts, error = %last_error, "not ready yet");
            }
        }
        if attempt == policy.max_attempts {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(policy.interval) => {}
            _ = cancel.cancelled() => return Err(StageErrorKind::Cancelled),
        }
    }
    Err(StageErrorKind::Timeout {
        attempts: policy.max_attempts,
        last_error,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn policy(max_attempts: u32) -> ReadinessPolicy {
        ReadinessPolicy {
            max_attempts,
            interval: Duration::from_secs(2),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_once_the_probe_passes() {
        let calls = &AtomicU32::new(0);
        let started = tokio::time::Instant::now();
        let attempts = await_ready(&policy(10), &CancellationToken::new(), || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 3 {
                anyhow::bail!("the database system is starting up");
            }
            Ok(())
        })
        .await;
        assert_eq!(attempts, Ok(4));
        // Three sleeps between four attempts.
        assert_eq!(started.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_with_the_last_error() {
        let calls = &AtomicU32::new(0);
        let result = await_ready(&policy(3), &CancellationToken::new(), || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            Err::<(), _>(anyhow::anyhow!("connection refused ({n})"))
        })
        .await;
        assert_eq!(
            result,
            Err(StageErrorKind::Timeout {
                attempts: 3,
                last_error: "connection refused (3)".into()
            })
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_polling() {
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let result = await_ready(&policy(100), &cancel, || {
            if calls.fetch_add(1, Ordering::SeqCst) == 1 {
                cancel.cancel();
            }
            async { Err::<(), _>(anyhow::anyhow!("not yet")) }
        })
        .await;
        assert_eq!(result, Err(StageErrorKind::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
