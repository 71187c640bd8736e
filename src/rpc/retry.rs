use std::{future::Future, time::Duration};

use rand::Rng;
use tokio::time::{Instant, sleep, timeout_at};
use tracing::warn;

use super::RpcError;
use crate::{account::Layer, config::RetryPolicy};

/// Run `call` until it succeeds, fails permanently, or the retry budget of
/// `policy` is spent.
///
/// Only transient errors are retried. Each attempt is bounded by
/// `policy.attempt_timeout` and by what is left of `policy.max_elapsed`; a
/// timed out attempt counts as transient.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    op: &'static str,
    layer: Layer,
    mut call: F,
) -> Result<T, RpcError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RpcError>>,
{
    let start = Instant::now();
    let ceiling = start + policy.max_elapsed;
    let mut attempt: u32 = 0;
    let mut maybe_delivered = false;

    loop {
        let attempt_deadline = (Instant::now() + policy.attempt_timeout).min(ceiling);
        let err = match timeout_at(attempt_deadline, call()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) => err,
            Err(_) => RpcError::Transient(format!(
                "no response within {:?}",
                policy.attempt_timeout
            )),
        };

        if !err.is_transient() {
            return Err(err);
        }
        maybe_delivered |= !matches!(err, RpcError::Unreachable(_));

        let delay = jittered(policy.delay_for(attempt), policy.jitter);
        let elapsed = start.elapsed();
        if elapsed + delay > policy.max_elapsed {
            return Err(RpcError::RetriesExhausted {
                attempts: attempt + 1,
                elapsed,
                maybe_delivered,
                last: Box::new(err),
            });
        }

        warn!(
            op,
            %layer,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Transient RPC failure, backing off"
        );
        sleep(delay).await;
        attempt += 1;
    }
}

fn jittered(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return delay;
    }
    let factor = 1.0 + rand::rng().random_range(-jitter..=jitter);
    delay.mul_f64(factor.max(0.0))
}
