use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotward_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotward_query_duration_seconds";

/// Counter: booking attempts. Labels: outcome.
pub const BOOKINGS_TOTAL: &str = "slotward_bookings_total";

/// Counter: appointment attempts. Labels: outcome.
pub const APPOINTMENTS_TOTAL: &str = "slotward_appointments_total";

/// Histogram: time spent waiting for row locks, in seconds. Labels: table.
pub const LOCK_WAIT_SECONDS: &str = "slotward_lock_wait_seconds";

/// Counter: seat releases that would have gone below zero.
pub const LEDGER_ANOMALIES_TOTAL: &str = "slotward_ledger_anomalies_total";

/// Counter: sessions created by template expansion.
pub const SESSIONS_GENERATED_TOTAL: &str = "slotward_sessions_generated_total";

// ── USE metrics (resource utilization) ──────────────────────────

pub const CONNECTIONS_ACTIVE: &str = "slotward_connections_active";
pub const CONNECTIONS_TOTAL: &str = "slotward_connections_total";
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotward_connections_rejected_total";

/// Gauge: number of loaded team engines.
pub const TEAMS_ACTIVE: &str = "slotward_teams_active";

pub const AUTH_FAILURES_TOTAL: &str = "slotward_auth_failures_total";

pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotward_wal_flush_duration_seconds";

/// Histogram: records per group-commit flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotward_wal_flush_batch_size";

pub const WAL_COMPACTIONS_TOTAL: &str = "slotward_wal_compactions_total";

/// Install the Prometheus exporter. No-op without a port.
pub fn init(port: Option<u16>) -> Result<(), String> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("failed to install Prometheus exporter: {e}"))?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short label for a command, for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertSession { .. } => "insert_session",
        Command::DeleteSession { .. } => "delete_session",
        Command::InsertClinician { .. } => "insert_clinician",
        Command::InsertTemplate { .. } => "insert_template",
        Command::DeleteTemplate { .. } => "delete_template",
        Command::InsertClinicExclusion { .. } => "insert_clinic_exclusion",
        Command::DeleteClinicExclusion { .. } => "delete_clinic_exclusion",
        Command::InsertSlotExclusion { .. } => "insert_slot_exclusion",
        Command::DeleteSlotExclusion { .. } => "delete_slot_exclusion",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::DeleteAppointment { .. } => "delete_appointment",
        Command::CreateBooking { .. } => "create_booking",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::AdminCancelBooking { .. } => "admin_cancel_booking",
        Command::UpdateBookingStatus { .. } => "update_booking_status",
        Command::UpdateBookingNotes { .. } => "update_booking_notes",
        Command::CreateAppointment { .. } => "create_appointment",
        Command::UpdateAppointmentStatus { .. } => "update_appointment_status",
        Command::GenerateSessions { .. } => "generate_sessions",
        Command::SetCapacity { .. } => "set_capacity",
        Command::CancelSession { .. } => "cancel_session",
        Command::UpdateSession { .. } => "update_session",
        Command::UpdateTemplate { .. } => "update_template",
        Command::SetTemplateActive { .. } => "set_template_active",
        Command::SetTimeZone { .. } => "set_time_zone",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectBookingByCode { .. } => "select_booking_by_code",
        Command::ListBookings { .. } => "list_bookings",
        Command::SelectSessions { .. } => "select_sessions",
        Command::SelectSessionDetails { .. } => "select_session_details",
        Command::SelectAppointments { .. } => "select_appointments",
        Command::SelectBookingStats { .. } => "select_booking_stats",
    }
}
