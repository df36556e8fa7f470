use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "campusd_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "campusd_query_duration_seconds";

/// Counter: booking attempts. Labels: outcome.
pub const BOOKINGS_TOTAL: &str = "campusd_bookings_total";

pub const OUTCOME_CONFIRMED: &str = "confirmed";
pub const OUTCOME_CONFLICT: &str = "conflict";
pub const OUTCOME_REJECTED: &str = "rejected";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "campusd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "campusd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "campusd_connections_rejected_total";

/// Gauge: number of loaded campuses.
pub const CAMPUSES_ACTIVE: &str = "campusd_campuses_active";

/// Counter: logins refused.
pub const AUTH_FAILURES_TOTAL: &str = "campusd_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "campusd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "campusd_wal_flush_batch_size";

/// Counter: completed WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "campusd_wal_compactions_total";

/// Install the Prometheus exporter on `port`. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
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
        Command::InsertUser { .. } => "insert_user",
        Command::DeleteUser { .. } => "delete_user",
        Command::InsertRoom { .. } => "insert_room",
        Command::UpdateRoomStatus { .. } => "update_room_status",
        Command::InsertBooking { .. } => "insert_booking",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::SelectUsers => "select_users",
        Command::SelectRooms { .. } => "select_rooms",
        Command::SelectBookings { .. } => "select_bookings",
    }
}
