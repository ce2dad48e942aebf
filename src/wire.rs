use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::messages::data::DataRow;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::{AuthContext, IdentityProvider, SlotwardAuthSource};
use crate::engine::{
    Engine, EngineError, NewAppointment, NewBooking, NewSession, NewTemplate, SessionUpdate,
    TemplateUpdate,
};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, SqlError};
use crate::tenant::TenantManager;

pub struct SlotwardHandler {
    tenant_manager: Arc<TenantManager>,
    identities: Arc<dyn IdentityProvider>,
    query_parser: Arc<SlotwardQueryParser>,
}

impl SlotwardHandler {
    pub fn new(tenant_manager: Arc<TenantManager>, identities: Arc<dyn IdentityProvider>) -> Self {
        Self {
            tenant_manager,
            identities,
            query_parser: Arc::new(SlotwardQueryParser),
        }
    }

    /// Engine for the connection's database plus the caller's context.
    fn resolve<C: ClientInfo>(&self, client: &C) -> PgWireResult<(Arc<Engine>, AuthContext)> {
        let metadata = client.metadata();
        let db = metadata
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        let user = metadata.get("user").cloned().unwrap_or_default();
        let identity = self
            .identities
            .authenticate(&user)
            .ok_or_else(|| user_error("28000", format!("unknown user: {user}")))?;
        let engine = self
            .tenant_manager
            .get_or_create(&db)
            .map_err(|e| user_error("08006", format!("tenant error: {e}")))?;
        Ok((engine, identity.context_for(&db)))
    }

    async fn run(&self, engine: &Engine, ctx: &AuthContext, query: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = execute_command(engine, ctx, cmd).await;
        let status = match &result {
            Ok(_) => "ok",
            Err(e) => e.code(),
        };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        if let Err(e) = &result {
            tracing::debug!(team = %ctx.team_id, caller = %ctx.caller_id, command = label, "rejected: {e}");
        }
        result.map_err(engine_err)
    }
}

async fn execute_command(engine: &Engine, ctx: &AuthContext, cmd: Command) -> Result<Response, EngineError> {
    match cmd {
        Command::InsertSession {
            id,
            instructor_id,
            branch_id,
            start,
            end,
            capacity,
            notes,
        } => {
            engine
                .create_session(ctx, NewSession {
                    id,
                    instructor_id,
                    branch_id,
                    span: Span::new(start, end),
                    capacity,
                    notes,
                })
                .await?;
            Ok(inserted())
        }
        Command::DeleteSession { id } => {
            engine.delete_session(ctx, id).await?;
            Ok(deleted())
        }
        Command::InsertClinician { id, name } => {
            engine.add_clinician(ctx, id, name).await?;
            Ok(inserted())
        }
        Command::InsertTemplate {
            id,
            instructor_id,
            branch_id,
            weekday,
            start_time,
            end_time,
            capacity,
        } => {
            engine
                .create_template(ctx, NewTemplate {
                    id,
                    instructor_id,
                    branch_id,
                    weekday,
                    start_time,
                    end_time,
                    capacity,
                })
                .await?;
            Ok(inserted())
        }
        Command::DeleteTemplate { id } => {
            engine.remove_template(ctx, id).await?;
            Ok(deleted())
        }
        Command::InsertClinicExclusion { exclusion } => {
            engine.add_clinic_exclusion(ctx, exclusion).await?;
            Ok(inserted())
        }
        Command::DeleteClinicExclusion { id } => {
            engine.remove_clinic_exclusion(ctx, id).await?;
            Ok(deleted())
        }
        Command::InsertSlotExclusion {
            clinician_id,
            exclusion,
        } => {
            engine.add_slot_exclusion(ctx, clinician_id, exclusion).await?;
            Ok(inserted())
        }
        Command::DeleteSlotExclusion { id } => {
            engine.remove_slot_exclusion(ctx, id).await?;
            Ok(deleted())
        }
        Command::DeleteBooking { id } => {
            engine.delete_booking(ctx, id).await?;
            Ok(deleted())
        }
        Command::DeleteAppointment { id } => {
            engine.delete_appointment(ctx, id).await?;
            Ok(deleted())
        }

        Command::CreateBooking {
            session_id,
            name,
            email,
            phone,
        } => {
            let receipt = engine
                .create_booking(ctx, NewBooking {
                    session_id,
                    holder: Holder {
                        name,
                        email,
                        phone,
                        user_id: Some(ctx.caller_id.clone()),
                    },
                    notes: None,
                })
                .await?;
            Ok(receipt_rows(&receipt))
        }
        Command::CancelBooking { code, email } => {
            engine.cancel_booking(ctx, &code, &email).await?;
            Ok(success_row())
        }
        Command::AdminCancelBooking { booking_id } => {
            let booking = engine.admin_cancel_booking(ctx, booking_id).await?;
            Ok(booking_rows(std::slice::from_ref(&booking)))
        }
        Command::UpdateBookingStatus { booking_id, status } => {
            let booking = engine.update_booking_status(ctx, booking_id, status).await?;
            Ok(booking_rows(std::slice::from_ref(&booking)))
        }
        Command::UpdateBookingNotes { booking_id, notes } => {
            let booking = engine.update_booking_notes(ctx, booking_id, notes).await?;
            Ok(booking_rows(std::slice::from_ref(&booking)))
        }
        Command::CreateAppointment {
            clinician_id,
            start,
            end,
            appointment_type_id,
            pet_name,
            client_name,
            client_email,
            client_phone,
            notes,
        } => {
            let appointment = engine
                .create_appointment(ctx, NewAppointment {
                    clinician_id,
                    span: Span::new(start, end),
                    appointment_type_id,
                    pet_name,
                    client: Holder {
                        name: client_name,
                        email: client_email,
                        phone: client_phone,
                        user_id: None,
                    },
                    notes,
                })
                .await?;
            Ok(appointment_rows(std::slice::from_ref(&appointment)))
        }
        Command::UpdateAppointmentStatus {
            appointment_id,
            status,
        } => {
            let appointment = engine
                .update_appointment_status(ctx, appointment_id, status)
                .await?;
            Ok(appointment_rows(std::slice::from_ref(&appointment)))
        }
        Command::GenerateSessions {
            start_date,
            end_date,
            branch_id,
        } => {
            let created = engine
                .generate_sessions(ctx, start_date, end_date, branch_id)
                .await?;
            Ok(count_row("created", created))
        }
        Command::SetCapacity {
            session_id,
            capacity,
        } => {
            let session = engine.set_capacity(ctx, session_id, capacity).await?;
            Ok(session_rows(std::slice::from_ref(&session)))
        }
        Command::CancelSession { session_id, reason } => {
            let session = engine.cancel_session(ctx, session_id, reason).await?;
            Ok(session_rows(std::slice::from_ref(&session)))
        }
        Command::UpdateSession {
            session_id,
            instructor_id,
            start,
            end,
            capacity,
            notes,
        } => {
            let span = paired_range(start, end)?.map(|(s, e)| Span::new(s, e));
            let session = engine
                .update_session(ctx, session_id, SessionUpdate {
                    instructor_id,
                    span,
                    capacity,
                    notes,
                })
                .await?;
            Ok(session_rows(std::slice::from_ref(&session)))
        }
        Command::UpdateTemplate {
            template_id,
            instructor_id,
            branch_id,
            weekday,
            start_time,
            end_time,
            capacity,
            is_active,
        } => {
            engine
                .update_template(ctx, template_id, TemplateUpdate {
                    instructor_id,
                    branch_id,
                    weekday,
                    start_time,
                    end_time,
                    capacity,
                    is_active,
                })
                .await?;
            Ok(success_row())
        }
        Command::SetTemplateActive {
            template_id,
            active,
        } => {
            engine.set_template_active(ctx, template_id, active).await?;
            Ok(success_row())
        }
        Command::SetTimeZone { zone } => {
            engine.set_time_zone(ctx, &zone).await?;
            Ok(success_row())
        }

        Command::SelectBookings { session_id, status } => {
            let bookings = engine.bookings_for_session(ctx, session_id, status).await?;
            Ok(booking_rows(&bookings))
        }
        Command::SelectBookingByCode { code } => {
            let booking = engine.booking_by_code(ctx, &code).await?;
            Ok(booking_rows(std::slice::from_ref(&booking)))
        }
        Command::ListBookings { filter } => {
            let bookings = engine.list_bookings(ctx, &filter).await?;
            Ok(booking_rows(&bookings))
        }
        Command::SelectSessions {
            start,
            end,
            branch_id,
        } => {
            let sessions = engine.sessions_between(ctx, start, end, branch_id).await?;
            Ok(session_rows(&sessions))
        }
        Command::SelectSessionDetails { id } => {
            let session = engine.session_details(ctx, id).await?;
            Ok(session_rows(std::slice::from_ref(&session)))
        }
        Command::SelectAppointments {
            clinician_id,
            start,
            end,
        } => {
            let range = paired_range(start, end)?;
            let appointments = engine
                .appointments_for_clinician(ctx, clinician_id, range)
                .await?;
            Ok(appointment_rows(&appointments))
        }
        Command::SelectBookingStats { start, end } => {
            let range = paired_range(start, end)?;
            let stats = engine.booking_stats(ctx, range).await?;
            Ok(stats_rows(&stats))
        }
    }
}

fn paired_range(start: Option<Ms>, end: Option<Ms>) -> Result<Option<(Ms, Ms)>, EngineError> {
    match (start, end) {
        (Some(s), Some(e)) => Ok(Some((s, e))),
        (None, None) => Ok(None),
        _ => Err(EngineError::Invalid("start and end filters must be given together")),
    }
}

fn inserted() -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(1))
}

fn deleted() -> Response {
    Response::Execution(Tag::new("DELETE").with_rows(1))
}

// ── Result schemas ───────────────────────────────────────────────

fn text(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn boolean(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::BOOL, FieldFormat::Text)
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("session_id"),
        text("guest_name"),
        text("guest_email"),
        text("guest_phone"),
        text("status"),
        text("confirmation_code"),
        text("notes"),
        int8("created_at"),
        int8("updated_at"),
    ]
}

fn receipt_schema() -> Vec<FieldInfo> {
    let mut fields = booking_schema();
    fields.push(int8("booked_count"));
    fields
}

fn session_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("template_id"),
        text("instructor_id"),
        text("branch_id"),
        int8("start"),
        int8("end"),
        int8("capacity"),
        int8("booked_count"),
        int8("available_spots"),
        boolean("is_cancelled"),
        text("cancel_reason"),
        text("notes"),
    ]
}

fn appointment_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("clinician_id"),
        int8("start"),
        int8("end"),
        text("appointment_type_id"),
        text("pet_name"),
        text("client_name"),
        text("client_email"),
        text("client_phone"),
        text("status"),
        text("notes"),
        int8("created_at"),
        int8("updated_at"),
    ]
}

fn stats_schema() -> Vec<FieldInfo> {
    vec![
        int8("total"),
        int8("confirmed"),
        int8("cancelled"),
        int8("no_show"),
        int8("completed"),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    None,
    Booking,
    Receipt,
    Session,
    Appointment,
    Stats,
    Success,
    Created,
}

/// Result shape of a statement, from its text alone so the extended
/// protocol can describe it before parameters are bound.
fn shape(stmt: &str) -> Shape {
    let s = stmt.to_lowercase();
    if !s.trim_start().starts_with("select") {
        return Shape::None;
    }
    let calls = |name: &str| s.contains(&format!("{name}("));
    if calls("admin_cancel_booking") || calls("update_booking_status") || calls("update_booking_notes") {
        Shape::Booking
    } else if calls("create_booking") {
        Shape::Receipt
    } else if calls("cancel_booking")
        || calls("set_template_active")
        || calls("update_template")
        || calls("set_time_zone")
    {
        Shape::Success
    } else if calls("create_appointment") || calls("update_appointment_status") {
        Shape::Appointment
    } else if calls("generate_sessions") {
        Shape::Created
    } else if calls("set_capacity") || calls("cancel_session") || calls("update_session") {
        Shape::Session
    } else if s.contains("booking_stats") {
        Shape::Stats
    } else if s.contains("bookings") {
        Shape::Booking
    } else if s.contains("session") {
        Shape::Session
    } else if s.contains("appointments") {
        Shape::Appointment
    } else {
        Shape::None
    }
}

fn result_schema(stmt: &str) -> Vec<FieldInfo> {
    match shape(stmt) {
        Shape::None => vec![],
        Shape::Booking => booking_schema(),
        Shape::Receipt => receipt_schema(),
        Shape::Session => session_schema(),
        Shape::Appointment => appointment_schema(),
        Shape::Stats => stats_schema(),
        Shape::Success => success_schema(),
        Shape::Created => vec![int8("created")],
    }
}

fn success_schema() -> Vec<FieldInfo> {
    vec![boolean("success")]
}

// ── Row encoding ─────────────────────────────────────────────────

fn query_response(schema: Arc<Vec<FieldInfo>>, rows: Vec<PgWireResult<DataRow>>) -> Response {
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn encode_booking(encoder: &mut DataRowEncoder, b: &Booking) -> PgWireResult<()> {
    encoder.encode_field(&b.id.to_string())?;
    encoder.encode_field(&b.session_id.to_string())?;
    encoder.encode_field(&b.holder.name)?;
    encoder.encode_field(&b.holder.email)?;
    encoder.encode_field(&b.holder.phone)?;
    encoder.encode_field(&b.status.as_str())?;
    encoder.encode_field(&b.confirmation_code)?;
    encoder.encode_field(&b.notes)?;
    encoder.encode_field(&b.created_at)?;
    encoder.encode_field(&b.updated_at)?;
    Ok(())
}

fn booking_rows(bookings: &[Booking]) -> Response {
    let schema = Arc::new(booking_schema());
    let rows = bookings
        .iter()
        .map(|b| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode_booking(&mut encoder, b)?;
            Ok(encoder.take_row())
        })
        .collect();
    query_response(schema, rows)
}

fn receipt_rows(receipt: &BookingReceipt) -> Response {
    let schema = Arc::new(receipt_schema());
    let mut encoder = DataRowEncoder::new(schema.clone());
    let row = encode_booking(&mut encoder, &receipt.booking)
        .and_then(|_| encoder.encode_field(&i64::from(receipt.booked_count)))
        .map(|_| encoder.take_row());
    query_response(schema, vec![row])
}

fn session_rows(sessions: &[Session]) -> Response {
    let schema = Arc::new(session_schema());
    let rows = sessions
        .iter()
        .map(|s| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&s.id.to_string())?;
            encoder.encode_field(&s.template_id.map(|t| t.to_string()))?;
            encoder.encode_field(&s.instructor_id.to_string())?;
            encoder.encode_field(&s.branch_id.to_string())?;
            encoder.encode_field(&s.span.start)?;
            encoder.encode_field(&s.span.end)?;
            encoder.encode_field(&i64::from(s.capacity))?;
            encoder.encode_field(&i64::from(s.booked_count))?;
            encoder.encode_field(&i64::from(s.available_spots()))?;
            encoder.encode_field(&s.is_cancelled)?;
            encoder.encode_field(&s.cancel_reason)?;
            encoder.encode_field(&s.notes)?;
            Ok(encoder.take_row())
        })
        .collect();
    query_response(schema, rows)
}

fn appointment_rows(appointments: &[Appointment]) -> Response {
    let schema = Arc::new(appointment_schema());
    let rows = appointments
        .iter()
        .map(|a| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&a.id.to_string())?;
            encoder.encode_field(&a.clinician_id.to_string())?;
            encoder.encode_field(&a.span.start)?;
            encoder.encode_field(&a.span.end)?;
            encoder.encode_field(&a.appointment_type_id.to_string())?;
            encoder.encode_field(&a.pet_name)?;
            encoder.encode_field(&a.client.name)?;
            encoder.encode_field(&a.client.email)?;
            encoder.encode_field(&a.client.phone)?;
            encoder.encode_field(&a.status.as_str())?;
            encoder.encode_field(&a.notes)?;
            encoder.encode_field(&a.created_at)?;
            encoder.encode_field(&a.updated_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    query_response(schema, rows)
}

fn stats_rows(stats: &BookingStats) -> Response {
    let schema = Arc::new(stats_schema());
    let mut encoder = DataRowEncoder::new(schema.clone());
    let row = [stats.total, stats.confirmed, stats.cancelled, stats.no_show, stats.completed]
        .into_iter()
        .try_for_each(|n| encoder.encode_field(&(n as i64)))
        .map(|_| encoder.take_row());
    query_response(schema, vec![row])
}

fn success_row() -> Response {
    let schema = Arc::new(success_schema());
    let mut encoder = DataRowEncoder::new(schema.clone());
    let row = encoder.encode_field(&true).map(|_| encoder.take_row());
    query_response(schema, vec![row])
}

fn count_row(column: &str, n: usize) -> Response {
    let schema = Arc::new(vec![int8(column)]);
    let mut encoder = DataRowEncoder::new(schema.clone());
    let row = encoder.encode_field(&(n as i64)).map(|_| encoder.take_row());
    query_response(schema, vec![row])
}

#[async_trait]
impl SimpleQueryHandler for SlotwardHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let (engine, ctx) = self.resolve(client)?;
        Ok(vec![self.run(&engine, &ctx, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotwardQueryParser;

#[async_trait]
impl QueryParser for SlotwardQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(&self, stmt: &String, _column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotwardHandler {
    type Statement = String;
    type QueryParser = SlotwardQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let (engine, ctx) = self.resolve(client)?;
        let sql = substitute_params(portal);
        self.run(&engine, &ctx, &sql).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

fn substitute_params(portal: &Portal<String>) -> String {
    inline_params(&portal.statement.statement, &portal.parameters)
}

/// Inline bound text parameters as quoted literals in one left-to-right
/// pass. Each `$N` outside a quoted literal is replaced exactly once, so
/// placeholder text inside a bound value is never touched again.
fn inline_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.char_indices().peekable();
    let mut quote: Option<char> = None;

    while let Some((i, c)) = chars.next() {
        if let Some(q) = quote {
            out.push(c);
            // A doubled quote closes and reopens, which leaves us inside.
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => {
                quote = Some(c);
                out.push(c);
            }
            '$' => {
                let mut end = i + 1;
                while let Some(&(j, d)) = chars.peek() {
                    if !d.is_ascii_digit() {
                        break;
                    }
                    end = j + 1;
                    chars.next();
                }
                let param = sql[i + 1..end]
                    .parse::<usize>()
                    .ok()
                    .and_then(|n| n.checked_sub(1))
                    .and_then(|idx| params.get(idx));
                match param {
                    Some(Some(bytes)) => {
                        out.push('\'');
                        out.push_str(&String::from_utf8_lossy(bytes.as_ref()).replace('\'', "''"));
                        out.push('\'');
                    }
                    Some(None) => out.push_str("NULL"),
                    None => out.push_str(&sql[i..end]),
                }
            }
            _ => out.push(c),
        }
    }
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotwardFactory {
    handler: Arc<SlotwardHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<SlotwardAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SlotwardFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, identities: Arc<dyn IdentityProvider>) -> Self {
        let auth_source = SlotwardAuthSource::new(identities.clone());
        Self {
            handler: Arc::new(SlotwardHandler::new(tenant_manager, identities)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotwardFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client socket until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    identities: Arc<dyn IdentityProvider>,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = SlotwardFactory::new(tenant_manager, identities);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(sqlstate: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate.into(),
        message,
    )))
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(e.sqlstate(), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_highest_placeholder() {
        assert_eq!(count_params("SELECT create_booking($1, $2, $3)"), 3);
        assert_eq!(count_params("SELECT * FROM bookings WHERE session_id = $12"), 12);
        assert_eq!(count_params("SELECT * FROM booking_stats"), 0);
        assert_eq!(count_params("SELECT '$' || $2"), 2);
    }

    fn bound(values: &[Option<&str>]) -> Vec<Option<Vec<u8>>> {
        values.iter().map(|v| v.map(|s| s.as_bytes().to_vec())).collect()
    }

    #[test]
    fn placeholders_inside_values_are_left_alone() {
        let sql = inline_params(
            "SELECT create_booking($1, $2, $3)",
            &bound(&[Some("01J00000000000000000000000"), Some("Ann costs $1"), Some("a@x.io")]),
        );
        assert_eq!(
            sql,
            "SELECT create_booking('01J00000000000000000000000', 'Ann costs $1', 'a@x.io')"
        );
    }

    #[test]
    fn inlining_handles_tens_quotes_and_nulls() {
        let mut values: Vec<Option<&str>> = vec![Some("v"); 10];
        values[0] = Some("O'Brien");
        values[9] = None;
        let sql = inline_params("SELECT $1, $10, '$2', $11", &bound(&values));
        assert_eq!(sql, "SELECT 'O''Brien', NULL, '$2', $11");
    }

    #[test]
    fn shape_follows_statement() {
        assert_eq!(shape("SELECT cancel_booking($1, $2)"), Shape::Success);
        assert_eq!(shape("SELECT admin_cancel_booking($1)"), Shape::Booking);
        assert_eq!(shape("select create_booking($1, $2, $3)"), Shape::Receipt);
        assert_eq!(shape("SELECT generate_sessions($1, $2)"), Shape::Created);
        assert_eq!(shape("SELECT cancel_session($1)"), Shape::Session);
        assert_eq!(shape("SELECT update_session($1, $2, $3, $4, $5)"), Shape::Session);
        assert_eq!(shape("SELECT update_booking_notes($1, $2)"), Shape::Booking);
        assert_eq!(shape("SELECT update_template($1, $2, $3, $4, $5, $6, $7)"), Shape::Success);
        assert_eq!(shape("DELETE FROM bookings WHERE id = $1"), Shape::None);
        assert_eq!(shape("SELECT * FROM session_details WHERE id = $1"), Shape::Session);
        assert_eq!(shape("SELECT * FROM booking_stats"), Shape::Stats);
        assert_eq!(shape("SELECT * FROM bookings WHERE confirmation_code = $1"), Shape::Booking);
        assert_eq!(shape("INSERT INTO sessions VALUES ($1)"), Shape::None);
        assert_eq!(shape("DELETE FROM templates WHERE id = $1"), Shape::None);
        assert_eq!(result_schema("SELECT create_booking($1, $2, $3)").len(), booking_schema().len() + 1);
    }

    #[test]
    fn engine_errors_keep_sqlstate() {
        match engine_err(EngineError::Full) {
            PgWireError::UserError(info) => {
                let rendered = format!("{info:?}");
                assert!(rendered.contains("SW003"));
                assert!(rendered.contains("now full"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
