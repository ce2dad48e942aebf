use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, UTC.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// `[a1, a2)` and `[b1, b2)` overlap iff `a1 < b2 && b1 < a2`.
    /// Touching intervals do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

// ── People ───────────────────────────────────────────────────────

/// Whoever a booking or appointment is held for. Registered users carry a
/// `user_id`; guests are identified by e-mail only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Holder {
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub user_id: Option<String>,
}

impl Holder {
    pub fn email_matches(&self, email: &str) -> bool {
        self.email.trim().eq_ignore_ascii_case(email.trim())
    }
}

// ── Class sessions & bookings ────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Confirmed,
    Cancelled,
    NoShow,
    Completed,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::NoShow => "no_show",
            BookingStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "confirmed" => Some(BookingStatus::Confirmed),
            "cancelled" | "canceled" => Some(BookingStatus::Cancelled),
            "no_show" | "noshow" => Some(BookingStatus::NoShow),
            "completed" => Some(BookingStatus::Completed),
            _ => None,
        }
    }

    /// Every status except `Cancelled` keeps its seat counted in the ledger.
    pub fn holds_seat(&self) -> bool {
        !matches!(self, BookingStatus::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub session_id: Ulid,
    pub holder: Holder,
    pub status: BookingStatus,
    pub confirmation_code: String,
    pub notes: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: Ulid,
    pub template_id: Option<Ulid>,
    pub instructor_id: Ulid,
    pub branch_id: Ulid,
    pub span: Span,
    pub capacity: u32,
    pub booked_count: u32,
    pub is_cancelled: bool,
    pub cancel_reason: Option<String>,
    pub notes: Option<String>,
}

impl Session {
    pub fn available_spots(&self) -> u32 {
        self.capacity.saturating_sub(self.booked_count)
    }
}

/// One lockable session row together with the bookings it owns.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub session: Session,
    pub bookings: Vec<Booking>,
}

impl SessionState {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            bookings: Vec::new(),
        }
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    /// The confirmed booking held by `email` on this session, if any.
    pub fn confirmed_for(&self, email: &str) -> Option<&Booking> {
        self.bookings
            .iter()
            .find(|b| b.status == BookingStatus::Confirmed && b.holder.email_matches(email))
    }
}

// ── Clinicians & appointments ────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Scheduled,
    Cancelled,
    Completed,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Scheduled => "scheduled",
            AppointmentStatus::Cancelled => "cancelled",
            AppointmentStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "scheduled" => Some(AppointmentStatus::Scheduled),
            "cancelled" | "canceled" => Some(AppointmentStatus::Cancelled),
            "completed" => Some(AppointmentStatus::Completed),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self, AppointmentStatus::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub clinician_id: Ulid,
    pub span: Span,
    pub appointment_type_id: Ulid,
    pub pet_name: String,
    pub client: Holder,
    pub notes: Option<String>,
    pub status: AppointmentStatus,
    pub created_at: Ms,
    pub updated_at: Ms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExclusionKind {
    Holiday,
    Maintenance,
    Emergency,
    Training,
    Event,
    Closure,
    Sick,
    Vacation,
    Conference,
    Personal,
    Other,
}

impl ExclusionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExclusionKind::Holiday => "holiday",
            ExclusionKind::Maintenance => "maintenance",
            ExclusionKind::Emergency => "emergency",
            ExclusionKind::Training => "training",
            ExclusionKind::Event => "event",
            ExclusionKind::Closure => "closure",
            ExclusionKind::Sick => "sick",
            ExclusionKind::Vacation => "vacation",
            ExclusionKind::Conference => "conference",
            ExclusionKind::Personal => "personal",
            ExclusionKind::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let kind = match s.trim().to_ascii_lowercase().as_str() {
            "holiday" => ExclusionKind::Holiday,
            "maintenance" => ExclusionKind::Maintenance,
            "emergency" => ExclusionKind::Emergency,
            "training" => ExclusionKind::Training,
            "event" => ExclusionKind::Event,
            "closure" => ExclusionKind::Closure,
            "sick" => ExclusionKind::Sick,
            "vacation" => ExclusionKind::Vacation,
            "conference" => ExclusionKind::Conference,
            "personal" => ExclusionKind::Personal,
            "other" => ExclusionKind::Other,
            _ => return None,
        };
        Some(kind)
    }
}

/// A declared unavailability on one local calendar date. Scope is given by
/// where the exclusion is stored: the team closure list or a clinician row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exclusion {
    pub id: Ulid,
    pub date: NaiveDate,
    /// Local wall-clock window; `None` blocks the whole day.
    pub window: Option<(NaiveTime, NaiveTime)>,
    pub reason: Option<String>,
    pub kind: ExclusionKind,
}

impl Exclusion {
    /// Human-readable reason, falling back to the kind tag.
    pub fn label(&self) -> String {
        match &self.reason {
            Some(r) if !r.trim().is_empty() => r.clone(),
            _ => self.kind.as_str().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clinician {
    pub id: Ulid,
    pub name: String,
}

/// One lockable clinician row: its exclusions and appointments.
#[derive(Debug, Clone)]
pub struct ClinicianState {
    pub clinician: Clinician,
    pub exclusions: Vec<Exclusion>,
    /// Sorted by `span.start`.
    pub appointments: Vec<Appointment>,
}

impl ClinicianState {
    pub fn new(clinician: Clinician) -> Self {
        Self {
            clinician,
            exclusions: Vec::new(),
            appointments: Vec::new(),
        }
    }

    /// Insert maintaining sort order by span.start.
    pub fn insert_appointment(&mut self, appointment: Appointment) {
        let pos = self
            .appointments
            .binary_search_by_key(&appointment.span.start, |a| a.span.start)
            .unwrap_or_else(|e| e);
        self.appointments.insert(pos, appointment);
    }

    pub fn appointment(&self, id: Ulid) -> Option<&Appointment> {
        self.appointments.iter().find(|a| a.id == id)
    }

    /// Appointments whose span overlaps the query window, any status.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Appointment> {
        let right_bound = self
            .appointments
            .partition_point(|a| a.span.start < query.end);
        self.appointments[..right_bound]
            .iter()
            .filter(move |a| a.span.end > query.start)
    }
}

// ── Templates ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassTemplate {
    pub id: Ulid,
    pub instructor_id: Ulid,
    pub branch_id: Ulid,
    /// 0 = Sunday … 6 = Saturday.
    pub weekday: u8,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub capacity: u32,
    pub is_active: bool,
}

impl ClassTemplate {
    pub fn overlaps(&self, other: &ClassTemplate) -> bool {
        self.weekday == other.weekday
            && self.start_time < other.end_time
            && other.start_time < self.end_time
    }
}

// ── WAL records ──────────────────────────────────────────────────

/// Row-level writes. A committed transaction is a `Vec<Event>` written as a
/// single WAL record, so replay sees all of its writes or none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ZoneSet {
        zone: String,
    },
    SessionCreated {
        session: Session,
    },
    CapacitySet {
        session_id: Ulid,
        capacity: u32,
    },
    SessionCancelled {
        session_id: Ulid,
        reason: Option<String>,
    },
    SessionDeleted {
        session_id: Ulid,
    },
    /// Instructor, time and notes of a session, written in full.
    SessionUpdated {
        session_id: Ulid,
        instructor_id: Ulid,
        span: Span,
        notes: Option<String>,
    },
    /// Absolute seat count written by the ledger.
    SeatsAdjusted {
        session_id: Ulid,
        booked_count: u32,
    },
    BookingInserted {
        booking: Booking,
    },
    BookingStatusSet {
        session_id: Ulid,
        booking_id: Ulid,
        status: BookingStatus,
        at: Ms,
    },
    BookingNotesSet {
        session_id: Ulid,
        booking_id: Ulid,
        notes: Option<String>,
        at: Ms,
    },
    BookingDeleted {
        session_id: Ulid,
        booking_id: Ulid,
    },
    ClinicianAdded {
        clinician: Clinician,
    },
    ClinicExclusionAdded {
        exclusion: Exclusion,
    },
    ClinicExclusionRemoved {
        id: Ulid,
    },
    SlotExclusionAdded {
        clinician_id: Ulid,
        exclusion: Exclusion,
    },
    SlotExclusionRemoved {
        clinician_id: Ulid,
        id: Ulid,
    },
    AppointmentInserted {
        appointment: Appointment,
    },
    AppointmentStatusSet {
        clinician_id: Ulid,
        appointment_id: Ulid,
        status: AppointmentStatus,
        at: Ms,
    },
    AppointmentDeleted {
        clinician_id: Ulid,
        appointment_id: Ulid,
    },
    TemplateAdded {
        template: ClassTemplate,
    },
    TemplateActiveSet {
        id: Ulid,
        active: bool,
    },
    /// Replaces the stored template wholesale.
    TemplateUpdated {
        template: ClassTemplate,
    },
    TemplateRemoved {
        id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingReceipt {
    pub confirmation_code: String,
    pub booking: Booking,
    pub booked_count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingStats {
    pub total: u64,
    pub confirmed: u64,
    pub cancelled: u64,
    pub no_show: u64,
    pub completed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn appt(start: Ms, end: Ms, status: AppointmentStatus) -> Appointment {
        Appointment {
            id: Ulid::new(),
            clinician_id: Ulid::nil(),
            span: Span::new(start, end),
            appointment_type_id: Ulid::nil(),
            pet_name: "Rex".into(),
            client: Holder {
                name: "Ann".into(),
                email: "ann@example.com".into(),
                phone: None,
                user_id: None,
            },
            notes: None,
            status,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn span_overlap_is_half_open() {
        let a = Span::new(100, 200);
        assert!(a.overlaps(&Span::new(150, 250)));
        assert!(a.overlaps(&Span::new(0, 101)));
        assert!(!a.overlaps(&Span::new(200, 300)));
        assert!(!a.overlaps(&Span::new(0, 100)));
    }

    #[test]
    fn appointments_stay_sorted() {
        let mut cs = ClinicianState::new(Clinician { id: Ulid::new(), name: "Dr. Lee".into() });
        cs.insert_appointment(appt(300, 400, AppointmentStatus::Scheduled));
        cs.insert_appointment(appt(100, 200, AppointmentStatus::Scheduled));
        cs.insert_appointment(appt(200, 300, AppointmentStatus::Cancelled));
        let starts: Vec<Ms> = cs.appointments.iter().map(|a| a.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn overlapping_skips_adjacent() {
        let mut cs = ClinicianState::new(Clinician { id: Ulid::new(), name: "Dr. Lee".into() });
        cs.insert_appointment(appt(100, 200, AppointmentStatus::Scheduled));
        cs.insert_appointment(appt(450, 600, AppointmentStatus::Scheduled));
        cs.insert_appointment(appt(1000, 1100, AppointmentStatus::Scheduled));
        let hits: Vec<_> = cs.overlapping(&Span::new(200, 500)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(450, 600));
    }

    #[test]
    fn booking_status_seat_accounting() {
        assert!(BookingStatus::Confirmed.holds_seat());
        assert!(BookingStatus::NoShow.holds_seat());
        assert!(BookingStatus::Completed.holds_seat());
        assert!(!BookingStatus::Cancelled.holds_seat());
        assert_eq!(BookingStatus::parse("No_Show"), Some(BookingStatus::NoShow));
        assert_eq!(BookingStatus::parse("pending"), None);
    }

    #[test]
    fn holder_email_is_case_insensitive() {
        let h = Holder {
            name: "Ann".into(),
            email: "Ann@Example.com".into(),
            phone: None,
            user_id: None,
        };
        assert!(h.email_matches("ann@example.COM"));
        assert!(!h.email_matches("bob@example.com"));
    }

    #[test]
    fn exclusion_label_falls_back_to_kind() {
        let ex = Exclusion {
            id: Ulid::new(),
            date: NaiveDate::from_ymd_opt(2025, 12, 25).unwrap(),
            window: None,
            reason: None,
            kind: ExclusionKind::Holiday,
        };
        assert_eq!(ex.label(), "holiday");
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::SlotExclusionAdded {
            clinician_id: Ulid::new(),
            exclusion: Exclusion {
                id: Ulid::new(),
                date: NaiveDate::from_ymd_opt(2025, 3, 14).unwrap(),
                window: Some((
                    NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                    NaiveTime::from_hms_opt(12, 30, 0).unwrap(),
                )),
                reason: Some("conference".into()),
                kind: ExclusionKind::Conference,
            },
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
