use ulid::Ulid;

use super::{Engine, EngineError, SharedSessionState};
use crate::auth::{AuthContext, Role};
use crate::limits::MAX_QUERY_WINDOW_MS;
use crate::model::*;

/// Team-wide booking search. Every field narrows the result; the date
/// bounds apply to the session start and are inclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingFilter {
    pub start_from: Option<Ms>,
    pub start_to: Option<Ms>,
    pub session_id: Option<Ulid>,
    pub status: Option<BookingStatus>,
    /// Case-insensitive substring of guest name, e-mail or confirmation code.
    pub search: Option<String>,
}

impl BookingFilter {
    fn matches(&self, b: &Booking) -> bool {
        if self.status.is_some_and(|s| b.status != s) {
            return false;
        }
        match self.search.as_deref().map(str::trim) {
            Some(needle) if !needle.is_empty() => {
                let needle = needle.to_lowercase();
                b.holder.name.to_lowercase().contains(&needle)
                    || b.holder.email.to_lowercase().contains(&needle)
                    || b.confirmation_code.to_lowercase().contains(&needle)
            }
            _ => true,
        }
    }
}

fn validate_range(from: Ms, to: Ms) -> Result<(), EngineError> {
    if from >= to {
        return Err(EngineError::Invalid("range start must be before end"));
    }
    if to - from > MAX_QUERY_WINDOW_MS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(())
}

impl Engine {
    fn session_rows(&self) -> Vec<SharedSessionState> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    /// Rows of sessions starting in `[from, to]`. Only these get locked.
    fn session_rows_starting_in(&self, from: Ms, to: Ms) -> Vec<SharedSessionState> {
        self.sessions_starting_in(from, to)
            .iter()
            .filter_map(|id| self.session(id))
            .collect()
    }

    pub async fn booking_by_code(&self, ctx: &AuthContext, code: &str) -> Result<Booking, EngineError> {
        self.authorize(ctx, Role::Guest)?;
        let code = code.trim().to_ascii_uppercase();
        let not_found = || EngineError::CodeNotFound(code.clone());
        let booking_id = self.codes.get(&code).map(|e| *e.value()).ok_or_else(not_found)?;
        let session_id = self
            .booking_index
            .get(&booking_id)
            .map(|e| *e.value())
            .ok_or_else(not_found)?;
        let row = self.session(&session_id).ok_or_else(not_found)?;
        let ss = self.begin().read("sessions", row).await?;
        ss.booking(booking_id).cloned().ok_or_else(not_found)
    }

    pub async fn bookings_for_session(
        &self,
        ctx: &AuthContext,
        session_id: Ulid,
        status: Option<BookingStatus>,
    ) -> Result<Vec<Booking>, EngineError> {
        self.authorize(ctx, Role::Staff)?;
        let row = self.session(&session_id).ok_or(EngineError::NotFound(session_id))?;
        let ss = self.begin().read("sessions", row).await?;
        let mut bookings: Vec<Booking> = ss
            .bookings
            .iter()
            .filter(|b| status.is_none_or(|s| b.status == s))
            .cloned()
            .collect();
        bookings.sort_by_key(|b| b.created_at);
        Ok(bookings)
    }

    /// Sessions lying inside `[from, to)`, optionally for one branch,
    /// ordered by start. Guests never see cancelled sessions.
    pub async fn sessions_between(
        &self,
        ctx: &AuthContext,
        from: Ms,
        to: Ms,
        branch_id: Option<Ulid>,
    ) -> Result<Vec<Session>, EngineError> {
        self.authorize(ctx, Role::Guest)?;
        validate_range(from, to)?;
        let include_cancelled = ctx.role >= Role::Staff;

        let tx = self.begin();
        let mut out = Vec::new();
        for row in self.session_rows_starting_in(from, to) {
            let ss = tx.read("sessions", row).await?;
            let s = &ss.session;
            if s.span.start >= from
                && s.span.end <= to
                && branch_id.is_none_or(|b| s.branch_id == b)
                && (include_cancelled || !s.is_cancelled)
            {
                out.push(s.clone());
            }
        }
        out.sort_by_key(|s| (s.span.start, s.id));
        Ok(out)
    }

    /// Bookings across the whole team, newest first.
    pub async fn list_bookings(
        &self,
        ctx: &AuthContext,
        filter: &BookingFilter,
    ) -> Result<Vec<Booking>, EngineError> {
        self.authorize(ctx, Role::Staff)?;
        if let (Some(from), Some(to)) = (filter.start_from, filter.start_to)
            && from > to
        {
            return Err(EngineError::Invalid("range start must not be after end"));
        }

        let rows = match (filter.session_id, filter.start_from, filter.start_to) {
            (Some(id), _, _) => self.session(&id).into_iter().collect(),
            (None, Some(from), Some(to)) if to - from <= MAX_QUERY_WINDOW_MS => {
                self.session_rows_starting_in(from, to)
            }
            _ => self.session_rows(),
        };

        let tx = self.begin();
        let mut out = Vec::new();
        for row in rows {
            let ss = tx.read("sessions", row).await?;
            let start = ss.session.span.start;
            if filter.start_from.is_some_and(|from| start < from)
                || filter.start_to.is_some_and(|to| start > to)
            {
                continue;
            }
            out.extend(ss.bookings.iter().filter(|b| filter.matches(b)).cloned());
        }
        out.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        Ok(out)
    }

    pub async fn session_details(&self, ctx: &AuthContext, session_id: Ulid) -> Result<Session, EngineError> {
        self.authorize(ctx, Role::Guest)?;
        let row = self.session(&session_id).ok_or(EngineError::NotFound(session_id))?;
        let ss = self.begin().read("sessions", row).await?;
        if ss.session.is_cancelled && ctx.role < Role::Staff {
            return Err(EngineError::NotFound(session_id));
        }
        Ok(ss.session.clone())
    }

    /// Booking counts by status, over every session or those inside a range.
    pub async fn booking_stats(
        &self,
        ctx: &AuthContext,
        range: Option<(Ms, Ms)>,
    ) -> Result<BookingStats, EngineError> {
        self.authorize(ctx, Role::Staff)?;
        if let Some((from, to)) = range {
            validate_range(from, to)?;
        }

        let rows = match range {
            Some((from, to)) => self.session_rows_starting_in(from, to),
            None => self.session_rows(),
        };
        let tx = self.begin();
        let mut stats = BookingStats::default();
        for row in rows {
            let ss = tx.read("sessions", row).await?;
            if let Some((from, to)) = range
                && (ss.session.span.start < from || ss.session.span.end > to)
            {
                continue;
            }
            for b in &ss.bookings {
                stats.total += 1;
                match b.status {
                    BookingStatus::Confirmed => stats.confirmed += 1,
                    BookingStatus::Cancelled => stats.cancelled += 1,
                    BookingStatus::NoShow => stats.no_show += 1,
                    BookingStatus::Completed => stats.completed += 1,
                }
            }
        }
        Ok(stats)
    }

    pub async fn appointments_for_clinician(
        &self,
        ctx: &AuthContext,
        clinician_id: Ulid,
        range: Option<(Ms, Ms)>,
    ) -> Result<Vec<Appointment>, EngineError> {
        self.authorize(ctx, Role::Staff)?;
        let row = self.clinician(&clinician_id).ok_or(EngineError::NotFound(clinician_id))?;
        let cs = self.begin().read("clinicians", row).await?;
        let appointments = match range {
            Some((from, to)) => {
                validate_range(from, to)?;
                cs.overlapping(&Span::new(from, to)).cloned().collect()
            }
            None => cs.appointments.clone(),
        };
        Ok(appointments)
    }
}
