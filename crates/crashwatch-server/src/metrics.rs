//! Prometheus counters for crash sessions and the dispatcher.

use crashwatch_core::SessionOutcome;
use metrics::{counter, describe_counter, describe_gauge, gauge, Unit};
use std::sync::OnceLock;

static METRICS_INIT: OnceLock<()> = OnceLock::new();

/// Describe every metric once. Call after the exporter is installed.
pub fn init_metrics() {
    METRICS_INIT.get_or_init(|| {
        describe_counter!(
            "crash_sessions_total",
            Unit::Count,
            "Crash analysis sessions finished, by outcome"
        );
        describe_counter!("crashes_found_total", Unit::Count, "Crashes returned by the crash backend");
        describe_counter!(
            "crash_dispatch_rejected_total",
            Unit::Count,
            "Sessions dropped because the dispatch queue was full"
        );
        describe_counter!("crash_triggers_total", Unit::Count, "Crash signals seen in device traces");
        describe_gauge!("crash_sessions_in_flight", Unit::Count, "Sessions currently running");
    });
}

pub fn record_session(outcome: &SessionOutcome) {
    counter!("crash_sessions_total", "outcome" => outcome.label()).increment(1);
    if let SessionOutcome::CrashesFound { crashes, .. } = outcome {
        counter!("crashes_found_total").increment(*crashes as u64);
    }
}

pub fn record_dispatch_rejected() {
    counter!("crash_dispatch_rejected_total").increment(1);
}

pub fn record_trigger() {
    counter!("crash_triggers_total").increment(1);
}

pub fn update_sessions_in_flight(count: usize) {
    gauge!("crash_sessions_in_flight").set(count as f64);
}
