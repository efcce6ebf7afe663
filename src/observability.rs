use std::net::SocketAddr;

use crate::sql::{Command, ReservationQuery};

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "seatd_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "seatd_query_duration_seconds";

// ── Booking outcomes ────────────────────────────────────────────

pub const RESERVATIONS_CREATED_TOTAL: &str = "seatd_reservations_created_total";

/// Counter. Labels: reason.
pub const RESERVATIONS_REJECTED_TOTAL: &str = "seatd_reservations_rejected_total";

pub const RESERVATIONS_CANCELLED_TOTAL: &str = "seatd_reservations_cancelled_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "seatd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "seatd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "seatd_connections_rejected_total";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "seatd_auth_failures_total";

/// Histogram: event log group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "seatd_wal_flush_duration_seconds";

/// Histogram: records per group-commit flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "seatd_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertRestaurant { .. } => "insert_restaurant",
        Command::InsertTable { .. } => "insert_table",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::CancelReservation { .. } => "cancel_reservation",
        Command::SelectRestaurants { .. } => "select_restaurants",
        Command::SelectTables { .. } => "select_tables",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectReservations(ReservationQuery::Mine) => "select_my_reservations",
        Command::SelectReservations(ReservationQuery::ById(_)) => "select_reservation",
        Command::SelectReservations(ReservationQuery::Overlap(_)) => "select_overlapping_reservations",
    }
}
