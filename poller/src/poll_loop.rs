use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tokio::{sync::watch, time::Instant};
use tokio_util::sync::CancellationToken;

use config::ChainSpec;
use metrics::{
    ChainScope, POLL_BACKOFF_SECONDS, POLL_CONSECUTIVE_FAILURES, POLL_DURATION_SECONDS,
    POLL_SUCCESS, POLL_TIMESTAMP_SECONDS,
};

use crate::manager::PollerContext;

/// One failed tick keeps the plain interval; each further failure
/// doubles the wait, capped by the configured ceiling.
pub(crate) fn compute_backoff(interval: Duration, failures: u32, max: Duration) -> Duration {
    if failures == 0 {
        return interval;
    }

    let exponent = (failures - 1).min(20);
    let raw = interval.saturating_mul(1u32 << exponent);

    raw.min(max).max(interval)
}

fn epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Cooperative poll loop for one chain.
///
/// Runs until cancelled. The spec channel lets a reload swap the chain's
/// configuration between ticks; cancellation interrupts the sleep phase
/// promptly, while an in-flight collect finishes or times out first. On
/// exit, every series the chain published is pruned.
pub(crate) async fn run(
    ctx: Arc<PollerContext>,
    mut spec_rx: watch::Receiver<Arc<ChainSpec>>,
    cancel: CancellationToken,
    scope: ChainScope,
) {
    let mut consecutive_failures: u32 = 0;

    tracing::info!(chain = %scope.chain(), "starting poll loop");

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let spec = spec_rx.borrow_and_update().clone();
        let interval = spec.poll_interval.unwrap_or(ctx.default_poll_interval);

        let rpc = (ctx.rpc_factory)(&spec, scope.clone());
        let started = Instant::now();
        let outcome =
            collector::collect_chain(&spec, rpc.as_ref(), &scope, &ctx.health, &ctx.classes).await;
        let elapsed = started.elapsed();

        if outcome.success {
            consecutive_failures = 0;
        } else {
            consecutive_failures += 1;
        }

        let backoff = compute_backoff(interval, consecutive_failures, ctx.max_failure_backoff);
        let now = epoch_seconds();

        let chain = scope.chain().to_string();
        let chain_id_label = outcome
            .chain_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let labels = [chain.as_str(), chain_id_label.as_str()];

        scope.observe_histogram(POLL_DURATION_SECONDS, &labels, elapsed.as_secs_f64());
        scope.set_gauge(
            POLL_SUCCESS,
            &labels,
            if outcome.success { 1.0 } else { 0.0 },
        );
        scope.set_gauge(
            POLL_CONSECUTIVE_FAILURES,
            &labels,
            consecutive_failures as f64,
        );
        scope.set_gauge(POLL_BACKOFF_SECONDS, &labels, backoff.as_secs_f64());

        if outcome.success {
            scope.set_gauge(POLL_TIMESTAMP_SECONDS, &labels, now as f64);
            ctx.health.record_success(&spec.name, now, backoff);
            // Retire series this tick stopped publishing.
            scope.sweep_stale();
        } else {
            let category = outcome
                .last_error
                .map(|category| category.as_str())
                .unwrap_or("unknown");
            ctx.health
                .record_failure(&spec.name, now, category, consecutive_failures, backoff);
            tracing::warn!(
                chain = %spec.name,
                consecutive_failures,
                backoff_s = backoff.as_secs_f64(),
                category,
                "poll failed",
            );
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
    }

    // A cancelled chain leaves no series behind, whether it was removed
    // by a reload or stopped at shutdown.
    scope.prune_all();
    tracing::info!(chain = %scope.chain(), "poll loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SECOND: Duration = Duration::from_secs(1);
    const MAX: Duration = Duration::from_secs(900);

    #[test]
    fn backoff_doubles_from_the_second_failure() {
        assert_eq!(compute_backoff(SECOND, 0, MAX), SECOND);
        assert_eq!(compute_backoff(SECOND, 1, MAX), SECOND);
        assert_eq!(compute_backoff(SECOND, 2, MAX), Duration::from_secs(2));
        assert_eq!(compute_backoff(SECOND, 3, MAX), Duration::from_secs(4));
        assert_eq!(compute_backoff(SECOND, 5, MAX), Duration::from_secs(16));
    }

    #[test]
    fn backoff_is_capped() {
        assert_eq!(compute_backoff(SECOND, 30, MAX), MAX);
        assert_eq!(
            compute_backoff(Duration::from_secs(60), 10, Duration::from_secs(120)),
            Duration::from_secs(120),
        );
    }

    #[test]
    fn backoff_never_drops_below_the_interval() {
        // A ceiling below the interval cannot shrink the wait.
        assert_eq!(
            compute_backoff(Duration::from_secs(10), 4, Duration::from_secs(5)),
            Duration::from_secs(10),
        );
    }

    #[test]
    fn resets_to_interval_on_success() {
        let after_failures = compute_backoff(SECOND, 6, MAX);
        assert!(after_failures > SECOND);
        assert_eq!(compute_backoff(SECOND, 0, MAX), SECOND);
    }
}
