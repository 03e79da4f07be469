//! Cancellation-aware retry loop shared by the command runner and the
//! file-source fetch path.

use std::future::Future;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::signal::Signal;

/// Runs `op` up to `attempts` times, sleeping `interval` between failures.
///
/// Returns the number of attempts actually performed together with the final
/// outcome. Cancellation is checked before every attempt and interrupts the
/// inter-attempt sleep; a cancelled run performs no further attempts and
/// yields [`Error::Cancelled`]. The per-attempt callback receives the
/// one-based attempt counter so callers can log "[attempt/total]" lines.
pub async fn with_retries<T, F, Fut, C>(
    shutdown: &Signal,
    mut op: F,
    mut on_attempt_error: C,
    attempts: u32,
    interval: Duration,
) -> (u32, Result<T>)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    C: FnMut(u32, &Error),
{
    if attempts == 0 {
        return (0, Err(Error::invalid_argument("attempts must be > 0")));
    }

    let mut attempt = 0;
    loop {
        if shutdown.is_raised() {
            return (attempt, Err(Error::Cancelled));
        }

        match op().await {
            Ok(value) => return (attempt + 1, Ok(value)),
            Err(err) => {
                attempt += 1;
                on_attempt_error(attempt, &err);

                if attempt >= attempts {
                    return (attempt, Err(err));
                }

                tokio::select! {
                    _ = shutdown.raised() => return (attempt, Err(Error::Cancelled)),
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        }
    }
}
