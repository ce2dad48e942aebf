use crate::model::Ms;

pub const MAX_TEAMS: usize = 10_000;
pub const MAX_TEAM_NAME_LEN: usize = 128;

pub const MAX_SESSIONS_PER_TEAM: usize = 500_000;
pub const MAX_BOOKINGS_PER_SESSION: usize = 10_000;
pub const MAX_CLINICIANS_PER_TEAM: usize = 10_000;
pub const MAX_APPOINTMENTS_PER_CLINICIAN: usize = 100_000;
pub const MAX_EXCLUSIONS_PER_SCOPE: usize = 10_000;
pub const MAX_TEMPLATES_PER_TEAM: usize = 10_000;
pub const MAX_CAPACITY: u32 = 100_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_EMAIL_LEN: usize = 320;
pub const MAX_PHONE_LEN: usize = 64;
pub const MAX_NOTES_LEN: usize = 4096;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
/// A single session or appointment may not exceed one day.
pub const MAX_SPAN_DURATION_MS: Ms = 86_400_000;
/// Template expansion is capped at a year per call.
pub const MAX_GENERATE_DAYS: i64 = 366;
/// Schedule reads are capped at 92 days.
pub const MAX_QUERY_WINDOW_MS: Ms = 92 * 86_400_000;

pub const CONFIRMATION_CODE_LEN: usize = 8;
pub const MAX_CODE_ATTEMPTS: usize = 16;
