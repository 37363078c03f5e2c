//! Round counters and latencies, recorded through the global OpenTelemetry meter.
//! Without an installed meter provider every instrument is a no-op.

use once_cell::sync::Lazy;
use opentelemetry::metrics::{Counter, Histogram, Meter, Unit};

pub struct RoundMetrics {
    pub rounds_started: Counter<u64>,
    pub rounds_completed: Counter<u64>,
    pub rounds_failed: Counter<u64>,
    pub rounds_cancelled: Counter<u64>,
    pub device_updates: Counter<u64>,
    pub aggregation_latency_ms: Histogram<f64>,
    pub round_duration_ms: Histogram<f64>,
}

static ROUND_METER: Lazy<Meter> = Lazy::new(|| opentelemetry::global::meter("fedround"));

pub static ROUND_METRICS: Lazy<RoundMetrics> = Lazy::new(|| RoundMetrics {
    rounds_started: ROUND_METER.u64_counter("fedround_rounds_started_total").with_description("Rounds accepted by start").init(),
    rounds_completed: ROUND_METER.u64_counter("fedround_rounds_completed_total").with_description("Rounds that produced a model version").init(),
    rounds_failed: ROUND_METER.u64_counter("fedround_rounds_failed_total").with_description("Rounds ended by an error").init(),
    rounds_cancelled: ROUND_METER.u64_counter("fedround_rounds_cancelled_total").with_description("Rounds stopped by cancel").init(),
    device_updates: ROUND_METER.u64_counter("fedround_device_updates_total").with_description("Local updates collected from devices").init(),
    aggregation_latency_ms: ROUND_METER.f64_histogram("fedround_aggregation_latency_ms").with_description("Time spent combining local updates").with_unit(Unit::new("ms")).init(),
    round_duration_ms: ROUND_METER.f64_histogram("fedround_round_duration_ms").with_description("Start to completion wall time").with_unit(Unit::new("ms")).init(),
});
