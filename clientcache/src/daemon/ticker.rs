//! Jittered, cancellable timer loops.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Longest delay a jittered loop ever waits.
pub const MAX_JITTERED_DELAY: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Lower and upper bounds of a jittered delay, saturated to [`MAX_JITTERED_DELAY`].
pub fn jitter_bounds(base: TimeDelta, factor: f64) -> (Duration, Duration) {
    let base = base.to_std().unwrap_or(Duration::ZERO).as_secs_f64();
    let factor = if factor.is_nan() { 0.0 } else { factor.max(0.0) };
    let low = saturating_secs(base * (1.0 - factor));
    let high = saturating_secs(base * (1.0 + factor));
    (low, high)
}

fn saturating_secs(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs)
        .unwrap_or(MAX_JITTERED_DELAY)
        .min(MAX_JITTERED_DELAY)
}

/// Draw a delay uniformly from `[base*(1-f), base*(1+f)]`. `f = 0` returns `base`.
pub fn jittered(base: TimeDelta, factor: f64) -> Duration {
    let (low, high) = jitter_bounds(base, factor);
    if high <= low {
        return low;
    }
    let span = (high - low).as_secs_f64();
    low + Duration::try_from_secs_f64(span * rand::random::<f64>()).unwrap_or(Duration::ZERO)
}

/// Timing of one loop.
#[derive(Debug, Clone, Copy)]
pub struct TickerConfig {
    pub name: &'static str,
    pub interval: TimeDelta,
    pub randomization_factor: f64,
    /// Run the first tick without waiting.
    pub immediate: bool,
}

/// Run `tick` on a jittered schedule until `cancel` fires.
///
/// `wake` (when given) starts the next tick early. No tick starts after cancellation.
pub async fn run_ticker<F, Fut>(
    config: TickerConfig,
    cancel: CancellationToken,
    wake: Option<Arc<Notify>>,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut first = true;
    loop {
        if !(first && config.immediate) {
            let delay = jittered(config.interval, config.randomization_factor);
            debug!(ticker = config.name, ?delay, "Waiting for next tick");

            let woken = async {
                match &wake {
                    Some(notify) => notify.notified().await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
                _ = woken => {
                    debug!(ticker = config.name, "Woken early");
                }
            }
        }
        first = false;

        if cancel.is_cancelled() {
            break;
        }
        tick().await;
    }
    debug!(ticker = config.name, "Ticker stopped");
}
