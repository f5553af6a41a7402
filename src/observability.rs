use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: HTTP requests served. Labels: route, status.
pub const REQUESTS_TOTAL: &str = "slotbook_requests_total";

/// Histogram: HTTP request latency in seconds. Labels: route.
pub const REQUEST_DURATION_SECONDS: &str = "slotbook_request_duration_seconds";

// ── Booking lifecycle ───────────────────────────────────────────

/// Counter: appointments successfully booked.
pub const APPOINTMENTS_BOOKED_TOTAL: &str = "slotbook_appointments_booked_total";

/// Counter: appointments canceled by their requester.
pub const APPOINTMENTS_CANCELED_TOTAL: &str = "slotbook_appointments_canceled_total";

/// Counter: rejected create/cancel calls. Labels: reason.
pub const BOOKING_REJECTIONS_TOTAL: &str = "slotbook_booking_rejections_total";

// ── Job queue ───────────────────────────────────────────────────

/// Counter: jobs journaled. Labels: queue.
pub const JOBS_ENQUEUED_TOTAL: &str = "slotbook_jobs_enqueued_total";

/// Counter: jobs that finished successfully. Labels: queue.
pub const JOBS_COMPLETED_TOTAL: &str = "slotbook_jobs_completed_total";

/// Counter: jobs that failed terminally. Labels: queue.
pub const JOBS_FAILED_TOTAL: &str = "slotbook_jobs_failed_total";

/// Histogram: duration of a single handler attempt in seconds. Labels: queue.
pub const JOB_DURATION_SECONDS: &str = "slotbook_job_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotbook_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
///
/// A failed install is logged and the service keeps running without metrics.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus metrics exporter: {e}"),
    }
}

/// Collapse a status code to its class for the `status` label.
pub fn status_label(status: u16) -> &'static str {
    match status {
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        _ => "5xx",
    }
}
