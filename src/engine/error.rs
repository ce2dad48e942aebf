use ulid::Ulid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    NotFound(Ulid),
    CodeNotFound(String),
    Cancelled,
    Full,
    DuplicateBooking,
    CapacityBelowBooked { capacity: u32, booked: u32 },
    ClinicClosed(String),
    ResourceUnavailable(String),
    SlotTaken,
    Forbidden,
    AlreadyFinalized,
    Timeout,
    TeamMismatch,
    AlreadyExists(Ulid),
    HasBookings(Ulid),
    Invalid(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Short stable tag, used as a metric label.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) | EngineError::CodeNotFound(_) => "not_found",
            EngineError::Cancelled => "cancelled",
            EngineError::Full => "full",
            EngineError::DuplicateBooking => "duplicate_booking",
            EngineError::CapacityBelowBooked { .. } => "capacity_below_booked",
            EngineError::ClinicClosed(_) => "clinic_closed",
            EngineError::ResourceUnavailable(_) => "resource_unavailable",
            EngineError::SlotTaken => "slot_taken",
            EngineError::Forbidden => "forbidden",
            EngineError::AlreadyFinalized => "already_finalized",
            EngineError::Timeout => "timeout",
            EngineError::TeamMismatch => "team_mismatch",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::HasBookings(_) => "has_bookings",
            EngineError::Invalid(_) => "invalid",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal_error",
        }
    }

    /// SQLSTATE sent to the client. Business outcomes without a Postgres
    /// equivalent use the `SW` class.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) | EngineError::CodeNotFound(_) => "P0002",
            EngineError::Cancelled => "SW002",
            EngineError::Full => "SW003",
            EngineError::DuplicateBooking => "23505",
            EngineError::CapacityBelowBooked { .. } => "SW005",
            EngineError::ClinicClosed(_) => "SW006",
            EngineError::ResourceUnavailable(_) => "SW007",
            EngineError::SlotTaken => "23P01",
            EngineError::Forbidden => "42501",
            EngineError::AlreadyFinalized => "SW010",
            EngineError::Timeout => "55P03",
            EngineError::TeamMismatch => "SW012",
            EngineError::AlreadyExists(_) => "23505",
            EngineError::HasBookings(_) => "2BP01",
            EngineError::Invalid(_) => "22023",
            EngineError::LimitExceeded(_) => "54000",
            EngineError::WalError(_) => "58030",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::CodeNotFound(code) => write!(f, "no booking with confirmation code {code}"),
            EngineError::Cancelled => write!(f, "This class has been cancelled"),
            EngineError::Full => write!(f, "This class is now full. Please try another time."),
            EngineError::DuplicateBooking => {
                write!(f, "You already have a booking for this class")
            }
            EngineError::CapacityBelowBooked { capacity, booked } => write!(
                f,
                "cannot reduce capacity to {capacity} below {booked} current bookings"
            ),
            EngineError::ClinicClosed(reason) => write!(f, "Clinic is closed: {reason}"),
            EngineError::ResourceUnavailable(reason) => {
                write!(f, "Clinician is not available: {reason}")
            }
            EngineError::SlotTaken => {
                write!(f, "Clinician already has an appointment during this time")
            }
            EngineError::Forbidden => write!(f, "permission denied"),
            EngineError::AlreadyFinalized => write!(f, "Booking is already cancelled or completed"),
            EngineError::Timeout => write!(f, "lock wait timed out, please retry"),
            EngineError::TeamMismatch => write!(f, "caller does not belong to this team"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::HasBookings(id) => {
                write!(f, "cannot delete session {id}: it has bookings")
            }
            EngineError::Invalid(msg) => write!(f, "invalid argument: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
