use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

/// Call `attempt` until it yields a value or `deadline` passes.
///
/// At least one attempt is always made. Between attempts the loop sleeps for
/// `interval`, clamped to the time remaining. Returns `Ok(None)` once the
/// deadline has passed; the first error ends the loop.
pub async fn retry_until<T, E, F, Fut>(
    deadline: Instant,
    interval: Duration,
    mut attempt: F,
) -> Result<Option<T>, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    loop {
        if let Some(value) = attempt().await? {
            return Ok(Some(value));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn zero_timeout_still_tries_once() {
        let calls = AtomicU32::new(0);
        let result: Result<Option<()>, ()> = retry_until(Instant::now(), Duration::from_millis(5), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(None) }
        })
        .await;
        assert_eq!(result, Ok(None));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn returns_first_success() {
        let calls = AtomicU32::new(0);
        let result: Result<Option<u32>, ()> = retry_until(
            Instant::now() + Duration::from_secs(1),
            Duration::from_millis(10),
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { Ok((n == 3).then_some(n)) }
            },
        )
        .await;
        assert_eq!(result, Ok(Some(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_at_deadline() {
        let start = Instant::now();
        let result: Result<Option<()>, ()> = retry_until(
            start + Duration::from_millis(25),
            Duration::from_millis(10),
            || async { Ok(None) },
        )
        .await;
        assert_eq!(result, Ok(None));
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[tokio::test]
    async fn errors_short_circuit() {
        let calls = AtomicU32::new(0);
        let result: Result<Option<()>, &str> = retry_until(
            Instant::now() + Duration::from_secs(5),
            Duration::from_millis(1),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("down") }
            },
        )
        .await;
        assert_eq!(result, Err("down"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
