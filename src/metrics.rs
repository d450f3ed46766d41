use tracing::trace;

// Counters are emitted as trace events; no exporter is wired in.

pub fn inc_requests(route: &'static str) {
    trace!(target = "mcflip.metrics", route, "requests_total_inc");
}

pub fn inc_remote_attempts(method: &str, outcome: &'static str) {
    trace!(
        target = "mcflip.metrics",
        method,
        outcome,
        "remote_attempts_total_inc"
    );
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "mcflip.metrics",
        stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}
