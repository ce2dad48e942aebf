mod error;
mod ledger;
mod orchestrator;
mod queries;
mod resolver;
mod schedule;
mod tx;

pub use error::EngineError;
pub use ledger::SessionGuard;
pub use orchestrator::{NewAppointment, NewBooking};
pub use queries::BookingFilter;
pub use resolver::{WindowBlock, check_window, to_utc};
pub use schedule::{NewExclusion, NewSession, NewTemplate, SessionUpdate, TemplateUpdate};
pub use tx::TxScope;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono_tz::Tz;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::auth::{AuthContext, Role};
use crate::model::*;
use crate::wal::{Record, Wal};

pub type SharedSessionState = Arc<RwLock<SessionState>>;
pub type SharedClinicianState = Arc<RwLock<ClinicianState>>;

/// Team-wide calendar row: the team's zone and its closures.
#[derive(Debug, Clone)]
pub struct Calendar {
    pub zone: Tz,
    /// Set once the zone was chosen explicitly rather than taken from config.
    pub zone_pinned: bool,
    pub closures: Vec<Exclusion>,
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        record: Record,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        snapshot: Vec<Record>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type Pending = (Record, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Takes the first append, drains whatever else is already
/// queued, writes the batch and fsyncs once for all of it.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { record, response } => {
                let mut batch = vec![(record, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { record, response }) => batch.push((record, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
    tracing::debug!("WAL writer for {} exiting", wal.path().display());
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<Pending>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed, aborting {} transactions: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[Pending]) -> io::Result<()> {
    let mut append_err = None;
    for (record, _) in batch {
        if let Err(e) = wal.append_buffered(record) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after a failed append so stale bytes don't ride along
    // with the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { snapshot, response } => {
            let result = Wal::write_compact_file(wal.path(), &snapshot)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

/// One team's tables.
pub struct Engine {
    pub team_id: String,
    pub(crate) sessions: DashMap<Ulid, SharedSessionState>,
    pub(crate) clinicians: DashMap<Ulid, SharedClinicianState>,
    pub(crate) calendar: Arc<RwLock<Calendar>>,
    pub(crate) templates: DashMap<Ulid, ClassTemplate>,
    /// booking id → session id
    pub(crate) booking_index: DashMap<Ulid, Ulid>,
    /// confirmation code → booking id
    pub(crate) codes: DashMap<String, Ulid>,
    /// appointment id → clinician id
    pub(crate) appointment_index: DashMap<Ulid, Ulid>,
    /// (template id, start) → generated session id
    pub(crate) template_slots: DashMap<(Ulid, Ms), Ulid>,
    /// instructor id → (span, session id) of every session they teach
    pub(crate) instructor_sessions: DashMap<Ulid, Vec<(Span, Ulid)>>,
    /// UTC day number of a session's start → (start, session id)
    pub(crate) day_sessions: DashMap<i64, Vec<(Ms, Ulid)>>,
    /// Serializes writes that add or remove whole rows.
    pub(crate) schedule_lock: Mutex<()>,
    wal_tx: mpsc::Sender<WalCommand>,
    lock_timeout: Duration,
}

/// Which row an event writes to.
enum Target {
    Session(Ulid),
    Clinician(Ulid),
    Calendar,
    Tables,
}

fn target(event: &Event) -> Target {
    match event {
        Event::CapacitySet { session_id, .. }
        | Event::SessionCancelled { session_id, .. }
        | Event::SessionDeleted { session_id }
        | Event::SessionUpdated { session_id, .. }
        | Event::SeatsAdjusted { session_id, .. }
        | Event::BookingStatusSet { session_id, .. }
        | Event::BookingNotesSet { session_id, .. }
        | Event::BookingDeleted { session_id, .. } => Target::Session(*session_id),
        Event::BookingInserted { booking } => Target::Session(booking.session_id),
        Event::SlotExclusionAdded { clinician_id, .. }
        | Event::SlotExclusionRemoved { clinician_id, .. }
        | Event::AppointmentStatusSet { clinician_id, .. }
        | Event::AppointmentDeleted { clinician_id, .. } => Target::Clinician(*clinician_id),
        Event::AppointmentInserted { appointment } => Target::Clinician(appointment.clinician_id),
        Event::ZoneSet { .. } | Event::ClinicExclusionAdded { .. } | Event::ClinicExclusionRemoved { .. } => {
            Target::Calendar
        }
        Event::SessionCreated { .. }
        | Event::ClinicianAdded { .. }
        | Event::TemplateAdded { .. }
        | Event::TemplateActiveSet { .. }
        | Event::TemplateUpdated { .. }
        | Event::TemplateRemoved { .. } => Target::Tables,
    }
}

fn replay_contended() -> io::Error {
    io::Error::other("replay: row unexpectedly locked")
}

impl Engine {
    pub fn new(
        team_id: impl Into<String>,
        wal_path: PathBuf,
        default_zone: Tz,
        lock_timeout: Duration,
    ) -> io::Result<Self> {
        let records = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            team_id: team_id.into(),
            sessions: DashMap::new(),
            clinicians: DashMap::new(),
            calendar: Arc::new(RwLock::new(Calendar {
                zone: default_zone,
                zone_pinned: false,
                closures: Vec::new(),
            })),
            templates: DashMap::new(),
            booking_index: DashMap::new(),
            codes: DashMap::new(),
            appointment_index: DashMap::new(),
            template_slots: DashMap::new(),
            instructor_sessions: DashMap::new(),
            day_sessions: DashMap::new(),
            schedule_lock: Mutex::new(()),
            wal_tx,
            lock_timeout,
        };

        // Nobody else holds these rows yet, so try_write always succeeds.
        // Never block here: lazy team creation runs inside the runtime.
        for record in &records {
            for event in record {
                engine.replay_event(event)?;
            }
        }
        if !records.is_empty() {
            tracing::info!(
                team = %engine.team_id,
                records = records.len(),
                sessions = engine.sessions.len(),
                clinicians = engine.clinicians.len(),
                "replayed WAL"
            );
        }

        Ok(engine)
    }

    fn replay_event(&self, event: &Event) -> io::Result<()> {
        match target(event) {
            Target::Session(id) => {
                if let Some(row) = self.session(&id) {
                    let mut guard = row.try_write().map_err(|_| replay_contended())?;
                    self.apply_to_session(&mut guard, event);
                }
            }
            Target::Clinician(id) => {
                if let Some(row) = self.clinician(&id) {
                    let mut guard = row.try_write().map_err(|_| replay_contended())?;
                    self.apply_to_clinician(&mut guard, event);
                }
            }
            Target::Calendar => {
                let mut guard = self.calendar.try_write().map_err(|_| replay_contended())?;
                apply_to_calendar(&mut guard, event);
            }
            Target::Tables => self.apply_to_tables(event),
        }
        Ok(())
    }

    fn apply_to_session(&self, ss: &mut SessionState, event: &Event) {
        match event {
            Event::CapacitySet { capacity, .. } => ss.session.capacity = *capacity,
            Event::SessionCancelled { reason, .. } => {
                ss.session.is_cancelled = true;
                ss.session.cancel_reason = reason.clone();
            }
            Event::SeatsAdjusted { booked_count, .. } => ss.session.booked_count = *booked_count,
            Event::BookingInserted { booking } => {
                self.booking_index.insert(booking.id, booking.session_id);
                self.codes.insert(booking.confirmation_code.clone(), booking.id);
                ss.bookings.push(booking.clone());
            }
            Event::BookingStatusSet {
                booking_id,
                status,
                at,
                ..
            } => {
                if let Some(b) = ss.bookings.iter_mut().find(|b| b.id == *booking_id) {
                    b.status = *status;
                    b.updated_at = *at;
                }
            }
            Event::BookingNotesSet {
                booking_id,
                notes,
                at,
                ..
            } => {
                if let Some(b) = ss.bookings.iter_mut().find(|b| b.id == *booking_id) {
                    b.notes = notes.clone();
                    b.updated_at = *at;
                }
            }
            Event::BookingDeleted { booking_id, .. } => {
                if let Some(pos) = ss.bookings.iter().position(|b| b.id == *booking_id) {
                    let b = ss.bookings.remove(pos);
                    self.booking_index.remove(&b.id);
                    self.codes.remove(&b.confirmation_code);
                }
            }
            Event::SessionUpdated {
                instructor_id,
                span,
                notes,
                ..
            } => {
                self.unindex_session(&ss.session);
                ss.session.instructor_id = *instructor_id;
                ss.session.span = *span;
                ss.session.notes = notes.clone();
                self.index_session(&ss.session);
            }
            Event::SessionDeleted { session_id } => {
                for b in &ss.bookings {
                    self.booking_index.remove(&b.id);
                    self.codes.remove(&b.confirmation_code);
                }
                self.unindex_session(&ss.session);
                self.sessions.remove(session_id);
            }
            _ => {}
        }
    }

    fn apply_to_clinician(&self, cs: &mut ClinicianState, event: &Event) {
        match event {
            Event::SlotExclusionAdded { exclusion, .. } => cs.exclusions.push(exclusion.clone()),
            Event::SlotExclusionRemoved { id, .. } => cs.exclusions.retain(|e| e.id != *id),
            Event::AppointmentInserted { appointment } => {
                self.appointment_index
                    .insert(appointment.id, appointment.clinician_id);
                cs.insert_appointment(appointment.clone());
            }
            Event::AppointmentStatusSet {
                appointment_id,
                status,
                at,
                ..
            } => {
                if let Some(a) = cs.appointments.iter_mut().find(|a| a.id == *appointment_id) {
                    a.status = *status;
                    a.updated_at = *at;
                }
            }
            Event::AppointmentDeleted { appointment_id, .. } => {
                cs.appointments.retain(|a| a.id != *appointment_id);
                self.appointment_index.remove(appointment_id);
            }
            _ => {}
        }
    }

    fn apply_to_tables(&self, event: &Event) {
        match event {
            Event::SessionCreated { session } => {
                self.index_session(session);
                self.sessions.insert(
                    session.id,
                    Arc::new(RwLock::new(SessionState::new(session.clone()))),
                );
            }
            Event::ClinicianAdded { clinician } => {
                self.clinicians.insert(
                    clinician.id,
                    Arc::new(RwLock::new(ClinicianState::new(clinician.clone()))),
                );
            }
            Event::TemplateAdded { template } => {
                self.templates.insert(template.id, template.clone());
            }
            Event::TemplateActiveSet { id, active } => {
                if let Some(mut t) = self.templates.get_mut(id) {
                    t.is_active = *active;
                }
            }
            Event::TemplateUpdated { template } => {
                self.templates.insert(template.id, template.clone());
            }
            Event::TemplateRemoved { id } => {
                self.templates.remove(id);
            }
            _ => {}
        }
    }

    /// Add a session to the template-slot, instructor and start-day indexes.
    fn index_session(&self, session: &Session) {
        if let Some(tid) = session.template_id {
            self.template_slots.insert((tid, session.span.start), session.id);
        }
        self.instructor_sessions
            .entry(session.instructor_id)
            .or_default()
            .push((session.span, session.id));
        self.day_sessions
            .entry(day_of(session.span.start))
            .or_default()
            .push((session.span.start, session.id));
    }

    fn unindex_session(&self, session: &Session) {
        if let Some(tid) = session.template_id {
            self.template_slots
                .remove_if(&(tid, session.span.start), |_, id| *id == session.id);
        }
        if let Some(mut taught) = self.instructor_sessions.get_mut(&session.instructor_id) {
            taught.retain(|(_, id)| *id != session.id);
        }
        if let Some(mut day) = self.day_sessions.get_mut(&day_of(session.span.start)) {
            day.retain(|(_, id)| *id != session.id);
        }
    }

    /// Ids of sessions starting in `[from, to]`, read from the start-day
    /// index without touching any row lock.
    pub(crate) fn sessions_starting_in(&self, from: Ms, to: Ms) -> Vec<Ulid> {
        let mut ids = Vec::new();
        for day in day_of(from)..=day_of(to) {
            if let Some(entries) = self.day_sessions.get(&day) {
                ids.extend(
                    entries
                        .iter()
                        .filter(|(start, _)| *start >= from && *start <= to)
                        .map(|(_, id)| *id),
                );
            }
        }
        ids
    }

    /// Write a transaction to the WAL through the group-commit writer.
    async fn wal_append(&self, record: &[Event]) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                record: record.to_vec(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Commit then apply to a locked session row.
    pub(super) async fn commit_session(
        &self,
        ss: &mut SessionState,
        record: &[Event],
    ) -> Result<(), EngineError> {
        self.wal_append(record).await?;
        for event in record {
            self.apply_to_session(ss, event);
        }
        Ok(())
    }

    pub(super) async fn commit_clinician(
        &self,
        cs: &mut ClinicianState,
        record: &[Event],
    ) -> Result<(), EngineError> {
        self.wal_append(record).await?;
        for event in record {
            self.apply_to_clinician(cs, event);
        }
        Ok(())
    }

    pub(super) async fn commit_calendar(
        &self,
        cal: &mut Calendar,
        record: &[Event],
    ) -> Result<(), EngineError> {
        self.wal_append(record).await?;
        for event in record {
            apply_to_calendar(cal, event);
        }
        Ok(())
    }

    /// Commit row inserts/removals. Caller holds `schedule_lock`.
    pub(super) async fn commit_tables(&self, record: &[Event]) -> Result<(), EngineError> {
        self.wal_append(record).await?;
        for event in record {
            self.apply_to_tables(event);
        }
        Ok(())
    }

    pub fn session(&self, id: &Ulid) -> Option<SharedSessionState> {
        self.sessions.get(id).map(|e| e.value().clone())
    }

    pub fn clinician(&self, id: &Ulid) -> Option<SharedClinicianState> {
        self.clinicians.get(id).map(|e| e.value().clone())
    }

    pub(super) fn begin(&self) -> TxScope {
        TxScope::begin(self.lock_timeout)
    }

    pub(super) async fn lock_clinician(
        &self,
        id: Ulid,
        tx: &TxScope,
    ) -> Result<OwnedRwLockWriteGuard<ClinicianState>, EngineError> {
        let row = self.clinician(&id).ok_or(EngineError::NotFound(id))?;
        tx.write("clinicians", row).await
    }

    /// Caller must belong to this team and hold at least `min`.
    pub(super) fn authorize(&self, ctx: &AuthContext, min: Role) -> Result<(), EngineError> {
        if ctx.team_id != self.team_id {
            return Err(EngineError::TeamMismatch);
        }
        if ctx.role < min {
            return Err(EngineError::Forbidden);
        }
        Ok(())
    }

    pub async fn zone(&self) -> Tz {
        self.calendar.read().await.zone
    }

    /// Rewrite the WAL as the smallest set of records that rebuilds the
    /// current tables. Read locks on every row are held until the new file
    /// is in place, so no commit can fall between snapshot and swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _schedule = self.schedule_lock.lock().await;
        let calendar = self.calendar.clone().read_owned().await;

        let mut snapshot: Vec<Record> = Vec::new();
        if calendar.zone_pinned {
            snapshot.push(vec![Event::ZoneSet {
                zone: calendar.zone.name().to_string(),
            }]);
        }
        if !calendar.closures.is_empty() {
            snapshot.push(
                calendar
                    .closures
                    .iter()
                    .map(|e| Event::ClinicExclusionAdded { exclusion: e.clone() })
                    .collect(),
            );
        }
        let templates: Record = self
            .templates
            .iter()
            .map(|t| Event::TemplateAdded { template: t.value().clone() })
            .collect();
        if !templates.is_empty() {
            snapshot.push(templates);
        }

        let clinician_rows: Vec<SharedClinicianState> =
            self.clinicians.iter().map(|e| e.value().clone()).collect();
        let mut clinician_guards = Vec::with_capacity(clinician_rows.len());
        for row in clinician_rows {
            let cs = row.read_owned().await;
            let mut record = vec![Event::ClinicianAdded { clinician: cs.clinician.clone() }];
            record.extend(cs.exclusions.iter().map(|e| Event::SlotExclusionAdded {
                clinician_id: cs.clinician.id,
                exclusion: e.clone(),
            }));
            record.extend(
                cs.appointments
                    .iter()
                    .map(|a| Event::AppointmentInserted { appointment: a.clone() }),
            );
            snapshot.push(record);
            clinician_guards.push(cs);
        }

        let session_rows: Vec<SharedSessionState> =
            self.sessions.iter().map(|e| e.value().clone()).collect();
        let mut session_guards = Vec::with_capacity(session_rows.len());
        for row in session_rows {
            let ss = row.read_owned().await;
            let mut record = vec![Event::SessionCreated { session: ss.session.clone() }];
            record.extend(
                ss.bookings
                    .iter()
                    .map(|b| Event::BookingInserted { booking: b.clone() }),
            );
            snapshot.push(record);
            session_guards.push(ss);
        }

        let records = snapshot.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { snapshot, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;

        metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
        tracing::info!(team = %self.team_id, records, "compacted WAL");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

fn apply_to_calendar(cal: &mut Calendar, event: &Event) {
    match event {
        Event::ZoneSet { zone } => match zone.parse::<Tz>() {
            Ok(tz) => {
                cal.zone = tz;
                cal.zone_pinned = true;
            }
            Err(_) => tracing::warn!("ignoring unknown time zone '{zone}' in WAL"),
        },
        Event::ClinicExclusionAdded { exclusion } => cal.closures.push(exclusion.clone()),
        Event::ClinicExclusionRemoved { id } => cal.closures.retain(|e| e.id != *id),
        _ => {}
    }
}

const DAY_MS: Ms = 86_400_000;

fn day_of(ms: Ms) -> i64 {
    ms.div_euclid(DAY_MS)
}

pub(crate) fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}
