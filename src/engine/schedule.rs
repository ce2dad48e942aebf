use chrono::{Datelike, NaiveDate, NaiveTime};
use chrono_tz::Tz;
use ulid::Ulid;

use super::orchestrator::{validate_notes, validate_span};
use super::{Engine, EngineError, SharedClinicianState, to_utc};
use crate::auth::{AuthContext, Role};
use crate::limits::*;
use crate::model::*;

#[derive(Debug, Clone)]
pub struct NewSession {
    pub id: Ulid,
    pub instructor_id: Ulid,
    pub branch_id: Ulid,
    pub span: Span,
    pub capacity: u32,
    pub notes: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewTemplate {
    pub id: Ulid,
    pub instructor_id: Ulid,
    pub branch_id: Ulid,
    /// 0 = Sunday … 6 = Saturday.
    pub weekday: u8,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub capacity: u32,
}

/// Fields left `None` keep their current value.
#[derive(Debug, Clone, Default)]
pub struct SessionUpdate {
    pub instructor_id: Option<Ulid>,
    pub span: Option<Span>,
    pub capacity: Option<u32>,
    pub notes: Option<String>,
}

/// Fields left `None` keep their current value.
#[derive(Debug, Clone, Default)]
pub struct TemplateUpdate {
    pub instructor_id: Option<Ulid>,
    pub branch_id: Option<Ulid>,
    pub weekday: Option<u8>,
    pub start_time: Option<NaiveTime>,
    pub end_time: Option<NaiveTime>,
    pub capacity: Option<u32>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewExclusion {
    pub id: Ulid,
    pub date: NaiveDate,
    pub window: Option<(NaiveTime, NaiveTime)>,
    pub reason: Option<String>,
    pub kind: ExclusionKind,
}

fn validate_capacity(capacity: u32) -> Result<(), EngineError> {
    if capacity == 0 {
        return Err(EngineError::Invalid("capacity must be at least 1"));
    }
    if capacity > MAX_CAPACITY {
        return Err(EngineError::LimitExceeded("capacity too large"));
    }
    Ok(())
}

fn validate_template(template: &ClassTemplate) -> Result<(), EngineError> {
    if template.weekday > 6 {
        return Err(EngineError::Invalid("day of week must be 0-6"));
    }
    if template.start_time >= template.end_time {
        return Err(EngineError::Invalid("start time must be before end time"));
    }
    validate_capacity(template.capacity)
}

fn build_exclusion(req: NewExclusion) -> Result<Exclusion, EngineError> {
    if let Some((start, end)) = req.window
        && start >= end
    {
        return Err(EngineError::Invalid("exclusion start must be before end"));
    }
    validate_notes(&req.reason)?;
    Ok(Exclusion {
        id: req.id,
        date: req.date,
        window: req.window,
        reason: req.reason,
        kind: req.kind,
    })
}

impl Engine {
    // ── Sessions ─────────────────────────────────────────────

    /// Add one session. The instructor may not teach two live sessions at
    /// once.
    pub async fn create_session(
        &self,
        ctx: &AuthContext,
        req: NewSession,
    ) -> Result<Session, EngineError> {
        self.authorize(ctx, Role::Staff)?;
        validate_span(&req.span)?;
        validate_capacity(req.capacity)?;
        validate_notes(&req.notes)?;

        let _schedule = self.schedule_lock.lock().await;
        if self.sessions.contains_key(&req.id) {
            return Err(EngineError::AlreadyExists(req.id));
        }
        if self.sessions.len() >= MAX_SESSIONS_PER_TEAM {
            return Err(EngineError::LimitExceeded("too many sessions"));
        }
        self.check_instructor_free(req.instructor_id, &req.span, None).await?;

        let session = Session {
            id: req.id,
            template_id: None,
            instructor_id: req.instructor_id,
            branch_id: req.branch_id,
            span: req.span,
            capacity: req.capacity,
            booked_count: 0,
            is_cancelled: false,
            cancel_reason: None,
            notes: req.notes,
        };
        self.commit_tables(&[Event::SessionCreated { session: session.clone() }])
            .await?;
        Ok(session)
    }

    /// Caller holds `schedule_lock`. `ignore` is the session being moved,
    /// whose row the caller already holds.
    async fn check_instructor_free(
        &self,
        instructor_id: Ulid,
        span: &Span,
        ignore: Option<Ulid>,
    ) -> Result<(), EngineError> {
        let candidates: Vec<Ulid> = match self.instructor_sessions.get(&instructor_id) {
            Some(taught) => taught
                .iter()
                .filter(|(s, id)| s.overlaps(span) && Some(*id) != ignore)
                .map(|(_, id)| *id)
                .collect(),
            None => return Ok(()),
        };
        let tx = self.begin();
        for id in candidates {
            let Some(row) = self.session(&id) else { continue };
            let ss = tx.read("sessions", row).await?;
            if !ss.session.is_cancelled {
                return Err(EngineError::SlotTaken);
            }
        }
        Ok(())
    }

    /// Reschedule a session, hand it to another instructor, change its
    /// capacity or notes. Capacity may not drop below the seats held; a live
    /// session may not be moved onto one of the instructor's other classes.
    pub async fn update_session(
        &self,
        ctx: &AuthContext,
        session_id: Ulid,
        update: SessionUpdate,
    ) -> Result<Session, EngineError> {
        self.authorize(ctx, Role::Staff)?;
        if let Some(span) = &update.span {
            validate_span(span)?;
        }
        validate_notes(&update.notes)?;

        let _schedule = self.schedule_lock.lock().await;
        let tx = self.begin();
        let mut ss = self.lock_session(session_id, &tx).await?;
        let current = ss.session.clone();

        let mut record = Vec::new();
        if let Some(capacity) = update.capacity
            && capacity != current.capacity
        {
            record.push(ss.set_capacity(capacity)?);
        }

        let instructor_id = update.instructor_id.unwrap_or(current.instructor_id);
        let span = update.span.unwrap_or(current.span);
        let notes = update.notes.or_else(|| current.notes.clone());
        let moved = instructor_id != current.instructor_id || span != current.span;
        if moved && !current.is_cancelled {
            self.check_instructor_free(instructor_id, &span, Some(session_id))
                .await?;
        }
        if moved || notes != current.notes {
            record.push(Event::SessionUpdated {
                session_id,
                instructor_id,
                span,
                notes,
            });
        }
        if record.is_empty() {
            return Ok(current);
        }

        self.commit_session(&mut ss, &record).await?;
        tracing::info!(session = %session_id, by = %ctx.caller_id, "session updated");
        Ok(ss.session.clone())
    }

    pub async fn set_capacity(
        &self,
        ctx: &AuthContext,
        session_id: Ulid,
        capacity: u32,
    ) -> Result<Session, EngineError> {
        self.authorize(ctx, Role::Staff)?;
        let tx = self.begin();
        let mut ss = self.lock_session(session_id, &tx).await?;
        let event = ss.set_capacity(capacity)?;
        self.commit_session(&mut ss, &[event]).await?;
        Ok(ss.session.clone())
    }

    /// Cancelling a session keeps its bookings; it only stops new ones.
    pub async fn cancel_session(
        &self,
        ctx: &AuthContext,
        session_id: Ulid,
        reason: Option<String>,
    ) -> Result<Session, EngineError> {
        self.authorize(ctx, Role::Staff)?;
        validate_notes(&reason)?;
        let tx = self.begin();
        let mut ss = self.lock_session(session_id, &tx).await?;
        if ss.session.is_cancelled {
            return Ok(ss.session.clone());
        }
        self.commit_session(&mut ss, &[Event::SessionCancelled { session_id, reason }])
            .await?;
        tracing::info!(session = %session_id, by = %ctx.caller_id, "session cancelled");
        Ok(ss.session.clone())
    }

    pub async fn delete_session(&self, ctx: &AuthContext, session_id: Ulid) -> Result<(), EngineError> {
        self.authorize(ctx, Role::Staff)?;
        let _schedule = self.schedule_lock.lock().await;
        let tx = self.begin();
        let mut ss = self.lock_session(session_id, &tx).await?;
        if ss.session.booked_count > 0 {
            return Err(EngineError::HasBookings(session_id));
        }
        self.commit_session(&mut ss, &[Event::SessionDeleted { session_id }])
            .await
    }

    // ── Clinicians & exclusions ──────────────────────────────

    pub async fn add_clinician(
        &self,
        ctx: &AuthContext,
        id: Ulid,
        name: String,
    ) -> Result<Clinician, EngineError> {
        self.authorize(ctx, Role::Admin)?;
        if name.trim().is_empty() {
            return Err(EngineError::Invalid("clinician name is required"));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("name too long"));
        }
        let _schedule = self.schedule_lock.lock().await;
        if self.clinicians.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if self.clinicians.len() >= MAX_CLINICIANS_PER_TEAM {
            return Err(EngineError::LimitExceeded("too many clinicians"));
        }
        let clinician = Clinician { id, name };
        self.commit_tables(&[Event::ClinicianAdded { clinician: clinician.clone() }])
            .await?;
        Ok(clinician)
    }

    /// Team-wide closure. Admin only.
    pub async fn add_clinic_exclusion(
        &self,
        ctx: &AuthContext,
        req: NewExclusion,
    ) -> Result<Exclusion, EngineError> {
        self.authorize(ctx, Role::Admin)?;
        let exclusion = build_exclusion(req)?;
        let tx = self.begin();
        let mut calendar = tx.write("calendar", self.calendar.clone()).await?;
        if calendar.closures.iter().any(|e| e.id == exclusion.id) {
            return Err(EngineError::AlreadyExists(exclusion.id));
        }
        if calendar.closures.len() >= MAX_EXCLUSIONS_PER_SCOPE {
            return Err(EngineError::LimitExceeded("too many clinic exclusions"));
        }
        self.commit_calendar(
            &mut calendar,
            &[Event::ClinicExclusionAdded { exclusion: exclusion.clone() }],
        )
        .await?;
        Ok(exclusion)
    }

    pub async fn remove_clinic_exclusion(&self, ctx: &AuthContext, id: Ulid) -> Result<(), EngineError> {
        self.authorize(ctx, Role::Admin)?;
        let tx = self.begin();
        let mut calendar = tx.write("calendar", self.calendar.clone()).await?;
        if !calendar.closures.iter().any(|e| e.id == id) {
            return Err(EngineError::NotFound(id));
        }
        self.commit_calendar(&mut calendar, &[Event::ClinicExclusionRemoved { id }])
            .await
    }

    pub async fn add_slot_exclusion(
        &self,
        ctx: &AuthContext,
        clinician_id: Ulid,
        req: NewExclusion,
    ) -> Result<Exclusion, EngineError> {
        self.authorize(ctx, Role::Staff)?;
        let exclusion = build_exclusion(req)?;
        let tx = self.begin();
        let mut cs = self.lock_clinician(clinician_id, &tx).await?;
        if cs.exclusions.iter().any(|e| e.id == exclusion.id) {
            return Err(EngineError::AlreadyExists(exclusion.id));
        }
        if cs.exclusions.len() >= MAX_EXCLUSIONS_PER_SCOPE {
            return Err(EngineError::LimitExceeded("too many exclusions for clinician"));
        }
        self.commit_clinician(
            &mut cs,
            &[Event::SlotExclusionAdded { clinician_id, exclusion: exclusion.clone() }],
        )
        .await?;
        Ok(exclusion)
    }

    /// Remove a clinician exclusion by id alone; the owning clinician is
    /// found by scanning.
    pub async fn remove_slot_exclusion(&self, ctx: &AuthContext, id: Ulid) -> Result<(), EngineError> {
        self.authorize(ctx, Role::Staff)?;
        let rows: Vec<SharedClinicianState> =
            self.clinicians.iter().map(|e| e.value().clone()).collect();
        let tx = self.begin();
        for row in rows {
            let mut cs = tx.write("clinicians", row).await?;
            if cs.exclusions.iter().any(|e| e.id == id) {
                let clinician_id = cs.clinician.id;
                return self
                    .commit_clinician(&mut cs, &[Event::SlotExclusionRemoved { clinician_id, id }])
                    .await;
            }
        }
        Err(EngineError::NotFound(id))
    }

    // ── Templates ────────────────────────────────────────────

    pub async fn create_template(
        &self,
        ctx: &AuthContext,
        req: NewTemplate,
    ) -> Result<ClassTemplate, EngineError> {
        self.authorize(ctx, Role::Staff)?;
        let template = ClassTemplate {
            id: req.id,
            instructor_id: req.instructor_id,
            branch_id: req.branch_id,
            weekday: req.weekday,
            start_time: req.start_time,
            end_time: req.end_time,
            capacity: req.capacity,
            is_active: true,
        };
        validate_template(&template)?;

        let _schedule = self.schedule_lock.lock().await;
        if self.templates.contains_key(&req.id) {
            return Err(EngineError::AlreadyExists(req.id));
        }
        if self.templates.len() >= MAX_TEMPLATES_PER_TEAM {
            return Err(EngineError::LimitExceeded("too many templates"));
        }
        self.check_template_free(&template)?;
        self.commit_tables(&[Event::TemplateAdded { template: template.clone() }])
            .await?;
        Ok(template)
    }

    /// Same instructor, same weekday, overlapping times, both active.
    /// Caller holds `schedule_lock`.
    fn check_template_free(&self, template: &ClassTemplate) -> Result<(), EngineError> {
        let clash = self.templates.iter().any(|t| {
            t.id != template.id
                && t.is_active
                && t.instructor_id == template.instructor_id
                && t.overlaps(template)
        });
        if clash {
            return Err(EngineError::SlotTaken);
        }
        Ok(())
    }

    pub async fn set_template_active(
        &self,
        ctx: &AuthContext,
        id: Ulid,
        active: bool,
    ) -> Result<(), EngineError> {
        self.authorize(ctx, Role::Staff)?;
        let _schedule = self.schedule_lock.lock().await;
        let template = self
            .templates
            .get(&id)
            .map(|t| t.value().clone())
            .ok_or(EngineError::NotFound(id))?;
        if template.is_active == active {
            return Ok(());
        }
        if active {
            self.check_template_free(&template)?;
        }
        self.commit_tables(&[Event::TemplateActiveSet { id, active }]).await
    }

    /// Edit a template. Sessions it already produced keep their times; a new
    /// start time opens fresh slots for the next expansion.
    pub async fn update_template(
        &self,
        ctx: &AuthContext,
        id: Ulid,
        update: TemplateUpdate,
    ) -> Result<ClassTemplate, EngineError> {
        self.authorize(ctx, Role::Staff)?;
        let _schedule = self.schedule_lock.lock().await;
        let current = self
            .templates
            .get(&id)
            .map(|t| t.value().clone())
            .ok_or(EngineError::NotFound(id))?;
        let template = ClassTemplate {
            id,
            instructor_id: update.instructor_id.unwrap_or(current.instructor_id),
            branch_id: update.branch_id.unwrap_or(current.branch_id),
            weekday: update.weekday.unwrap_or(current.weekday),
            start_time: update.start_time.unwrap_or(current.start_time),
            end_time: update.end_time.unwrap_or(current.end_time),
            capacity: update.capacity.unwrap_or(current.capacity),
            is_active: update.is_active.unwrap_or(current.is_active),
        };
        validate_template(&template)?;
        if template == current {
            return Ok(current);
        }
        if template.is_active {
            self.check_template_free(&template)?;
        }
        self.commit_tables(&[Event::TemplateUpdated { template: template.clone() }])
            .await?;
        Ok(template)
    }

    pub async fn remove_template(&self, ctx: &AuthContext, id: Ulid) -> Result<(), EngineError> {
        self.authorize(ctx, Role::Staff)?;
        let _schedule = self.schedule_lock.lock().await;
        if !self.templates.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        self.commit_tables(&[Event::TemplateRemoved { id }]).await
    }

    /// Expand active templates into sessions for every date in
    /// `[start_date, end_date]`. Slots that already have a session are
    /// skipped, so running this twice creates nothing the second time.
    /// Returns the number of sessions created.
    pub async fn generate_sessions(
        &self,
        ctx: &AuthContext,
        start_date: NaiveDate,
        end_date: NaiveDate,
        branch_id: Option<Ulid>,
    ) -> Result<usize, EngineError> {
        self.authorize(ctx, Role::Staff)?;
        if end_date < start_date {
            return Err(EngineError::Invalid("end date is before start date"));
        }
        if (end_date - start_date).num_days() >= MAX_GENERATE_DAYS {
            return Err(EngineError::LimitExceeded("date range too long"));
        }

        let _schedule = self.schedule_lock.lock().await;
        let zone = self.zone().await;
        let mut templates: Vec<ClassTemplate> = self
            .templates
            .iter()
            .filter(|t| t.is_active && branch_id.is_none_or(|b| t.branch_id == b))
            .map(|t| t.value().clone())
            .collect();
        templates.sort_by_key(|t| (t.weekday, t.start_time));

        let record = expand_templates(&templates, zone, start_date, end_date, |tid, start| {
            self.template_slots.contains_key(&(tid, start))
        });
        if self.sessions.len() + record.len() > MAX_SESSIONS_PER_TEAM {
            return Err(EngineError::LimitExceeded("too many sessions"));
        }
        let created = record.len();
        if created > 0 {
            self.commit_tables(&record).await?;
        }
        metrics::counter!(crate::observability::SESSIONS_GENERATED_TOTAL).increment(created as u64);
        tracing::info!(
            team = %self.team_id,
            %start_date,
            %end_date,
            created,
            "generated sessions from templates"
        );
        Ok(created)
    }

    /// Pin the team's time zone. Admin only.
    pub async fn set_time_zone(&self, ctx: &AuthContext, name: &str) -> Result<(), EngineError> {
        self.authorize(ctx, Role::Admin)?;
        let zone: Tz = name
            .trim()
            .parse()
            .map_err(|_| EngineError::Invalid("unknown IANA time zone"))?;
        let tx = self.begin();
        let mut calendar = tx.write("calendar", self.calendar.clone()).await?;
        self.commit_calendar(
            &mut calendar,
            &[Event::ZoneSet { zone: zone.name().to_string() }],
        )
        .await
    }
}

/// One `SessionCreated` per (date, template) slot not yet taken.
fn expand_templates(
    templates: &[ClassTemplate],
    zone: Tz,
    start_date: NaiveDate,
    end_date: NaiveDate,
    exists: impl Fn(Ulid, Ms) -> bool,
) -> Vec<Event> {
    let mut events = Vec::new();
    for date in start_date.iter_days().take_while(|d| *d <= end_date) {
        let weekday = date.weekday().num_days_from_sunday() as u8;
        for t in templates.iter().filter(|t| t.weekday == weekday) {
            let start = to_utc(zone, date, t.start_time);
            let end = to_utc(zone, date, t.end_time);
            if start >= end || exists(t.id, start) {
                continue;
            }
            events.push(Event::SessionCreated {
                session: Session {
                    id: Ulid::new(),
                    template_id: Some(t.id),
                    instructor_id: t.instructor_id,
                    branch_id: t.branch_id,
                    span: Span::new(start, end),
                    capacity: t.capacity,
                    booked_count: 0,
                    is_cancelled: false,
                    cancel_reason: None,
                    notes: None,
                },
            });
        }
    }
    events
}
