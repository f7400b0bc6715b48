use tracing::trace;

// Counter-style trace events; the Prometheus recorder in main only exposes
// the process-level handle.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "ledger.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn refresh_outcome(success: bool) {
    trace!(
        target = "ledger.metrics",
        outcome = if success { "success" } else { "failure" },
        "token_refresh_total_inc"
    );
}

pub fn financial_step(source: &'static str, outcome: &'static str) {
    trace!(
        target = "ledger.metrics",
        source = source,
        outcome = outcome,
        "financial_step_total_inc"
    );
}

pub fn cache_lookup(hit: bool) {
    trace!(
        target = "ledger.metrics",
        hit = hit,
        "financial_cache_lookup"
    );
}

pub fn sweep_finished(refreshed: usize, failed: usize, elapsed_ms: u128) {
    trace!(
        target = "ledger.metrics",
        refreshed = refreshed,
        failed = failed,
        elapsed_ms = elapsed_ms as u64,
        "refresh_sweep_finished"
    );
}
