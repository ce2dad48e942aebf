use dashmap::mapref::entry::Entry;
use rand::Rng;
use ulid::Ulid;

use super::{Engine, EngineError, check_window, now_ms};
use crate::auth::{AuthContext, Role};
use crate::limits::*;
use crate::model::*;
use crate::observability::{APPOINTMENTS_TOTAL, BOOKINGS_TOTAL};

/// Unambiguous characters only: no 0/O, no 1/I.
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

#[derive(Debug, Clone)]
pub struct NewBooking {
    pub session_id: Ulid,
    pub holder: Holder,
    pub notes: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewAppointment {
    pub clinician_id: Ulid,
    pub span: Span,
    pub appointment_type_id: Ulid,
    pub pet_name: String,
    pub client: Holder,
    pub notes: Option<String>,
}

pub(super) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start >= span.end {
        return Err(EngineError::Invalid("start must be before end"));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span longer than one day"));
    }
    Ok(())
}

pub(super) fn validate_notes(notes: &Option<String>) -> Result<(), EngineError> {
    match notes {
        Some(n) if n.len() > MAX_NOTES_LEN => Err(EngineError::LimitExceeded("notes too long")),
        _ => Ok(()),
    }
}

fn validate_holder(holder: &Holder) -> Result<(), EngineError> {
    if holder.name.trim().is_empty() {
        return Err(EngineError::Invalid("name is required"));
    }
    if holder.name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    let email = holder.email.trim();
    if email.len() < 3 || !email.contains('@') {
        return Err(EngineError::Invalid("a valid email is required"));
    }
    if email.len() > MAX_EMAIL_LEN {
        return Err(EngineError::LimitExceeded("email too long"));
    }
    if holder.phone.as_ref().is_some_and(|p| p.len() > MAX_PHONE_LEN) {
        return Err(EngineError::LimitExceeded("phone too long"));
    }
    Ok(())
}

fn generate_code(rng: &mut impl Rng) -> String {
    (0..CONFIRMATION_CODE_LEN)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

fn count_outcome<T>(metric: &'static str, result: &Result<T, EngineError>, ok: &'static str) {
    let outcome = match result {
        Ok(_) => ok,
        Err(e) => e.code(),
    };
    metrics::counter!(metric, "outcome" => outcome).increment(1);
}

impl Engine {
    /// Reserve a fresh code in the team-wide index. The entry belongs to
    /// `booking_id` from here on; the caller removes it if the commit fails.
    fn claim_code(&self, booking_id: Ulid) -> Result<String, EngineError> {
        let mut rng = rand::thread_rng();
        for _ in 0..MAX_CODE_ATTEMPTS {
            let code = generate_code(&mut rng);
            if let Entry::Vacant(slot) = self.codes.entry(code.clone()) {
                slot.insert(booking_id);
                return Ok(code);
            }
        }
        Err(EngineError::LimitExceeded("no free confirmation code"))
    }

    fn session_of_booking(&self, booking_id: Ulid) -> Result<Ulid, EngineError> {
        self.booking_index
            .get(&booking_id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(booking_id))
    }

    pub async fn create_booking(
        &self,
        ctx: &AuthContext,
        req: NewBooking,
    ) -> Result<BookingReceipt, EngineError> {
        self.authorize(ctx, Role::Guest)?;
        validate_holder(&req.holder)?;
        validate_notes(&req.notes)?;
        let result = self.book_seat(req).await;
        count_outcome(BOOKINGS_TOTAL, &result, "confirmed");
        result
    }

    async fn book_seat(&self, req: NewBooking) -> Result<BookingReceipt, EngineError> {
        let tx = self.begin();
        let mut ss = self.lock_session(req.session_id, &tx).await?;

        let seat = ss.try_reserve()?;
        if ss.confirmed_for(&req.holder.email).is_some() {
            return Err(EngineError::DuplicateBooking);
        }
        if ss.bookings.len() >= MAX_BOOKINGS_PER_SESSION {
            return Err(EngineError::LimitExceeded("too many bookings on this session"));
        }

        let id = Ulid::new();
        let code = self.claim_code(id)?;
        let now = now_ms();
        let holder = Holder {
            email: req.holder.email.trim().to_string(),
            ..req.holder
        };
        let booking = Booking {
            id,
            session_id: req.session_id,
            holder,
            status: BookingStatus::Confirmed,
            confirmation_code: code.clone(),
            notes: req.notes,
            created_at: now,
            updated_at: now,
        };

        let record = [Event::BookingInserted { booking: booking.clone() }, seat];
        if let Err(e) = self.commit_session(&mut ss, &record).await {
            self.codes.remove(&code);
            return Err(e);
        }
        tracing::debug!(session = %req.session_id, booking = %id, "booking confirmed");

        Ok(BookingReceipt {
            confirmation_code: code,
            booking,
            booked_count: ss.session.booked_count,
        })
    }

    /// Self-service cancel: the caller proves ownership with the e-mail the
    /// booking was made under.
    pub async fn cancel_booking(
        &self,
        ctx: &AuthContext,
        code: &str,
        email: &str,
    ) -> Result<Booking, EngineError> {
        self.authorize(ctx, Role::Guest)?;
        let code = code.trim().to_ascii_uppercase();
        let booking_id = self
            .codes
            .get(&code)
            .map(|e| *e.value())
            .ok_or_else(|| EngineError::CodeNotFound(code.clone()))?;
        let session_id = self
            .session_of_booking(booking_id)
            .map_err(|_| EngineError::CodeNotFound(code.clone()))?;

        let tx = self.begin();
        let mut ss = self.lock_session(session_id, &tx).await?;
        let booking = ss
            .booking(booking_id)
            .ok_or_else(|| EngineError::CodeNotFound(code.clone()))?;
        if !booking.holder.email_matches(email) {
            return Err(EngineError::Forbidden);
        }
        if booking.status != BookingStatus::Confirmed {
            return Err(EngineError::AlreadyFinalized);
        }

        let record = [
            Event::BookingStatusSet {
                session_id,
                booking_id,
                status: BookingStatus::Cancelled,
                at: now_ms(),
            },
            ss.release(),
        ];
        self.commit_session(&mut ss, &record).await?;
        ss.booking(booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))
    }

    pub async fn admin_cancel_booking(
        &self,
        ctx: &AuthContext,
        booking_id: Ulid,
    ) -> Result<Booking, EngineError> {
        self.authorize(ctx, Role::Staff)?;
        let session_id = self.session_of_booking(booking_id)?;

        let tx = self.begin();
        let mut ss = self.lock_session(session_id, &tx).await?;
        let booking = ss
            .booking(booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        if booking.status != BookingStatus::Confirmed {
            return Err(EngineError::AlreadyFinalized);
        }

        let record = [
            Event::BookingStatusSet {
                session_id,
                booking_id,
                status: BookingStatus::Cancelled,
                at: now_ms(),
            },
            ss.release(),
        ];
        self.commit_session(&mut ss, &record).await?;
        tracing::info!(booking = %booking_id, by = %ctx.caller_id, "booking cancelled by staff");
        ss.booking(booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))
    }

    /// Move a booking between statuses, keeping the seat count in step.
    /// Leaving `cancelled` runs the full reservation check again.
    pub async fn update_booking_status(
        &self,
        ctx: &AuthContext,
        booking_id: Ulid,
        status: BookingStatus,
    ) -> Result<Booking, EngineError> {
        self.authorize(ctx, Role::Staff)?;
        let session_id = self.session_of_booking(booking_id)?;

        let tx = self.begin();
        let mut ss = self.lock_session(session_id, &tx).await?;
        let booking = ss
            .booking(booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;
        if booking.status == status {
            return Ok(booking);
        }

        let mut record = vec![Event::BookingStatusSet {
            session_id,
            booking_id,
            status,
            at: now_ms(),
        }];
        match (booking.status.holds_seat(), status.holds_seat()) {
            (true, false) => record.push(ss.release()),
            (false, true) => {
                let seat = ss.try_reserve()?;
                if status == BookingStatus::Confirmed
                    && ss.confirmed_for(&booking.holder.email).is_some()
                {
                    return Err(EngineError::DuplicateBooking);
                }
                record.push(seat);
            }
            _ => {}
        }

        self.commit_session(&mut ss, &record).await?;
        ss.booking(booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))
    }

    /// Staff note on a booking. `None` clears it. Status and seat are
    /// untouched.
    pub async fn update_booking_notes(
        &self,
        ctx: &AuthContext,
        booking_id: Ulid,
        notes: Option<String>,
    ) -> Result<Booking, EngineError> {
        self.authorize(ctx, Role::Staff)?;
        validate_notes(&notes)?;
        let session_id = self.session_of_booking(booking_id)?;

        let tx = self.begin();
        let mut ss = self.lock_session(session_id, &tx).await?;
        if ss.booking(booking_id).is_none() {
            return Err(EngineError::NotFound(booking_id));
        }
        let event = Event::BookingNotesSet {
            session_id,
            booking_id,
            notes,
            at: now_ms(),
        };
        self.commit_session(&mut ss, &[event]).await?;
        ss.booking(booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))
    }

    /// Remove a booking outright. A booking still holding a seat gives it
    /// back in the same record; its confirmation code stops resolving.
    pub async fn delete_booking(&self, ctx: &AuthContext, booking_id: Ulid) -> Result<Booking, EngineError> {
        self.authorize(ctx, Role::Staff)?;
        let session_id = self.session_of_booking(booking_id)?;

        let tx = self.begin();
        let mut ss = self.lock_session(session_id, &tx).await?;
        let booking = ss
            .booking(booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;

        let mut record = vec![Event::BookingDeleted { session_id, booking_id }];
        if booking.status.holds_seat() {
            record.push(ss.release());
        }
        self.commit_session(&mut ss, &record).await?;
        tracing::info!(booking = %booking_id, by = %ctx.caller_id, "booking deleted");
        Ok(booking)
    }

    pub async fn create_appointment(
        &self,
        ctx: &AuthContext,
        req: NewAppointment,
    ) -> Result<Appointment, EngineError> {
        self.authorize(ctx, Role::Staff)?;
        validate_span(&req.span)?;
        validate_holder(&req.client)?;
        validate_notes(&req.notes)?;
        if req.pet_name.trim().is_empty() {
            return Err(EngineError::Invalid("pet name is required"));
        }
        if req.pet_name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("pet name too long"));
        }
        let result = self.book_appointment(req).await;
        count_outcome(APPOINTMENTS_TOTAL, &result, "scheduled");
        result
    }

    async fn book_appointment(&self, req: NewAppointment) -> Result<Appointment, EngineError> {
        let tx = self.begin();
        // Closures before clinician, always.
        let calendar = tx.read("calendar", self.calendar.clone()).await?;
        let mut cs = self.lock_clinician(req.clinician_id, &tx).await?;

        if cs.appointments.len() >= MAX_APPOINTMENTS_PER_CLINICIAN {
            return Err(EngineError::LimitExceeded("too many appointments for clinician"));
        }
        check_window(calendar.zone, &calendar.closures, &cs, &req.span, None)?;

        let now = now_ms();
        let appointment = Appointment {
            id: Ulid::new(),
            clinician_id: req.clinician_id,
            span: req.span,
            appointment_type_id: req.appointment_type_id,
            pet_name: req.pet_name,
            client: req.client,
            notes: req.notes,
            status: AppointmentStatus::Scheduled,
            created_at: now,
            updated_at: now,
        };
        self.commit_clinician(
            &mut cs,
            &[Event::AppointmentInserted { appointment: appointment.clone() }],
        )
        .await?;
        Ok(appointment)
    }

    /// Restoring a cancelled appointment re-checks the window, ignoring the
    /// appointment itself.
    pub async fn update_appointment_status(
        &self,
        ctx: &AuthContext,
        appointment_id: Ulid,
        status: AppointmentStatus,
    ) -> Result<Appointment, EngineError> {
        self.authorize(ctx, Role::Staff)?;
        let clinician_id = self
            .appointment_index
            .get(&appointment_id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(appointment_id))?;

        let tx = self.begin();
        let calendar = tx.read("calendar", self.calendar.clone()).await?;
        let mut cs = self.lock_clinician(clinician_id, &tx).await?;
        let current = cs
            .appointment(appointment_id)
            .cloned()
            .ok_or(EngineError::NotFound(appointment_id))?;
        if current.status == status {
            return Ok(current);
        }
        if !current.status.is_active() && status.is_active() {
            check_window(
                calendar.zone,
                &calendar.closures,
                &cs,
                &current.span,
                Some(appointment_id),
            )?;
        }

        let event = Event::AppointmentStatusSet {
            clinician_id,
            appointment_id,
            status,
            at: now_ms(),
        };
        self.commit_clinician(&mut cs, &[event]).await?;
        cs.appointment(appointment_id)
            .cloned()
            .ok_or(EngineError::NotFound(appointment_id))
    }

    /// Remove an appointment outright, whatever its status.
    pub async fn delete_appointment(
        &self,
        ctx: &AuthContext,
        appointment_id: Ulid,
    ) -> Result<Appointment, EngineError> {
        self.authorize(ctx, Role::Staff)?;
        let clinician_id = self
            .appointment_index
            .get(&appointment_id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(appointment_id))?;

        let tx = self.begin();
        let mut cs = self.lock_clinician(clinician_id, &tx).await?;
        let appointment = cs
            .appointment(appointment_id)
            .cloned()
            .ok_or(EngineError::NotFound(appointment_id))?;
        self.commit_clinician(
            &mut cs,
            &[Event::AppointmentDeleted { clinician_id, appointment_id }],
        )
        .await?;
        Ok(appointment)
    }
}
