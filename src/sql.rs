use chrono::{DateTime, NaiveDate, NaiveTime};
use sqlparser::ast::{
    self, BinaryOperator, Expr, FromTable, FunctionArg, FunctionArgExpr, FunctionArguments,
    ObjectNamePart, SelectItem, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::{BookingFilter, NewExclusion};
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    // ── Admin rows ──
    InsertSession {
        id: Ulid,
        instructor_id: Ulid,
        branch_id: Ulid,
        start: Ms,
        end: Ms,
        capacity: u32,
        notes: Option<String>,
    },
    DeleteSession {
        id: Ulid,
    },
    InsertClinician {
        id: Ulid,
        name: String,
    },
    InsertTemplate {
        id: Ulid,
        instructor_id: Ulid,
        branch_id: Ulid,
        weekday: u8,
        start_time: NaiveTime,
        end_time: NaiveTime,
        capacity: u32,
    },
    DeleteTemplate {
        id: Ulid,
    },
    InsertClinicExclusion {
        exclusion: NewExclusion,
    },
    DeleteClinicExclusion {
        id: Ulid,
    },
    InsertSlotExclusion {
        clinician_id: Ulid,
        exclusion: NewExclusion,
    },
    DeleteSlotExclusion {
        id: Ulid,
    },
    DeleteBooking {
        id: Ulid,
    },
    DeleteAppointment {
        id: Ulid,
    },

    // ── Procedures ──
    CreateBooking {
        session_id: Ulid,
        name: String,
        email: String,
        phone: Option<String>,
    },
    CancelBooking {
        code: String,
        email: String,
    },
    AdminCancelBooking {
        booking_id: Ulid,
    },
    UpdateBookingStatus {
        booking_id: Ulid,
        status: BookingStatus,
    },
    UpdateBookingNotes {
        booking_id: Ulid,
        notes: Option<String>,
    },
    CreateAppointment {
        clinician_id: Ulid,
        start: Ms,
        end: Ms,
        appointment_type_id: Ulid,
        pet_name: String,
        client_name: String,
        client_email: String,
        client_phone: Option<String>,
        notes: Option<String>,
    },
    UpdateAppointmentStatus {
        appointment_id: Ulid,
        status: AppointmentStatus,
    },
    GenerateSessions {
        start_date: NaiveDate,
        end_date: NaiveDate,
        branch_id: Option<Ulid>,
    },
    SetCapacity {
        session_id: Ulid,
        capacity: u32,
    },
    CancelSession {
        session_id: Ulid,
        reason: Option<String>,
    },
    /// `None` fields are left unchanged.
    UpdateSession {
        session_id: Ulid,
        instructor_id: Option<Ulid>,
        start: Option<Ms>,
        end: Option<Ms>,
        capacity: Option<u32>,
        notes: Option<String>,
    },
    /// `None` fields are left unchanged.
    UpdateTemplate {
        template_id: Ulid,
        instructor_id: Option<Ulid>,
        branch_id: Option<Ulid>,
        weekday: Option<u8>,
        start_time: Option<NaiveTime>,
        end_time: Option<NaiveTime>,
        capacity: Option<u32>,
        is_active: Option<bool>,
    },
    SetTemplateActive {
        template_id: Ulid,
        active: bool,
    },
    SetTimeZone {
        zone: String,
    },

    // ── Reads ──
    SelectBookings {
        session_id: Ulid,
        status: Option<BookingStatus>,
    },
    SelectBookingByCode {
        code: String,
    },
    ListBookings {
        filter: BookingFilter,
    },
    SelectSessions {
        start: Ms,
        end: Ms,
        branch_id: Option<Ulid>,
    },
    SelectSessionDetails {
        id: Ulid,
    },
    SelectAppointments {
        clinician_id: Ulid,
        start: Option<Ms>,
        end: Option<Ms>,
    },
    SelectBookingStats {
        start: Option<Ms>,
        end: Option<Ms>,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(first) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match first {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;
    let arity = |min: usize| {
        if values.len() < min {
            Err(SqlError::WrongArity(static_table(&table), min, values.len()))
        } else {
            Ok(())
        }
    };

    match table.as_str() {
        "sessions" => {
            arity(6)?;
            Ok(Command::InsertSession {
                id: parse_ulid(&values[0])?,
                instructor_id: parse_ulid(&values[1])?,
                branch_id: parse_ulid(&values[2])?,
                start: parse_instant(&values[3])?,
                end: parse_instant(&values[4])?,
                capacity: parse_u32(&values[5])?,
                notes: optional(&values, 6, parse_string_or_null)?.flatten(),
            })
        }
        "clinicians" => {
            arity(2)?;
            Ok(Command::InsertClinician {
                id: parse_ulid(&values[0])?,
                name: parse_string(&values[1])?,
            })
        }
        "templates" => {
            arity(7)?;
            Ok(Command::InsertTemplate {
                id: parse_ulid(&values[0])?,
                instructor_id: parse_ulid(&values[1])?,
                branch_id: parse_ulid(&values[2])?,
                weekday: parse_weekday(&values[3])?,
                start_time: parse_time(&values[4])?,
                end_time: parse_time(&values[5])?,
                capacity: parse_u32(&values[6])?,
            })
        }
        "clinic_exclusions" => {
            arity(2)?;
            Ok(Command::InsertClinicExclusion {
                exclusion: parse_exclusion(&values[0], &values[1..])?,
            })
        }
        "slot_exclusions" => {
            arity(3)?;
            Ok(Command::InsertSlotExclusion {
                clinician_id: parse_ulid(&values[1])?,
                exclusion: parse_exclusion(&values[0], &values[2..])?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `(date, start_time, end_time, reason, kind)` after the id; times both
/// NULL (or absent) for an all-day exclusion.
fn parse_exclusion(id: &Expr, rest: &[Expr]) -> Result<NewExclusion, SqlError> {
    let date = parse_date(&rest[0])?;
    let start = optional(rest, 1, parse_time_or_null)?.flatten();
    let end = optional(rest, 2, parse_time_or_null)?.flatten();
    let window = match (start, end) {
        (Some(s), Some(e)) => Some((s, e)),
        (None, None) => None,
        _ => return Err(SqlError::Parse("start_time and end_time must both be set or both NULL".into())),
    };
    let reason = optional(rest, 3, parse_string_or_null)?.flatten();
    let kind = match optional(rest, 4, parse_string_or_null)?.flatten() {
        Some(k) => ExclusionKind::parse(&k).ok_or_else(|| SqlError::Parse(format!("unknown exclusion kind: {k}")))?,
        None => ExclusionKind::Other,
    };
    Ok(NewExclusion {
        id: parse_ulid(id)?,
        date,
        window,
        reason,
        kind,
    })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "sessions" => Ok(Command::DeleteSession { id }),
        "templates" => Ok(Command::DeleteTemplate { id }),
        "clinic_exclusions" => Ok(Command::DeleteClinicExclusion { id }),
        "slot_exclusions" => Ok(Command::DeleteSlotExclusion { id }),
        "bookings" => Ok(Command::DeleteBooking { id }),
        "appointments" => Ok(Command::DeleteAppointment { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return parse_procedure_call(&select.projection);
    }
    let table = table_factor_name(&select.from[0].relation)?;
    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_filters(selection, &mut filters)?;
    }
    let allowed = allowed_filters(&table).ok_or_else(|| SqlError::UnknownTable(table.clone()))?;
    check_filters(&filters, allowed)?;
    let find = |column: &str, op: BinaryOperator| {
        filters
            .iter()
            .find(|f| f.column == column && f.op == op)
            .map(|f| &f.value)
    };

    match table.as_str() {
        "bookings" => {
            if let Some(code) = find("confirmation_code", BinaryOperator::Eq) {
                if filters.len() > 1 {
                    return Err(SqlError::Unsupported(
                        "confirmation_code cannot be combined with other filters".into(),
                    ));
                }
                return Ok(Command::SelectBookingByCode { code: parse_string(code)? });
            }
            let session_id = find("session_id", BinaryOperator::Eq).map(parse_ulid).transpose()?;
            let status = find("status", BinaryOperator::Eq)
                .map(parse_booking_status)
                .transpose()?;
            let start_from = find("start", BinaryOperator::GtEq).map(parse_instant).transpose()?;
            let start_to = find("start", BinaryOperator::LtEq).map(parse_instant).transpose()?;
            let search = find("search", BinaryOperator::Eq).map(parse_string).transpose()?;
            match session_id {
                Some(session_id) if start_from.is_none() && start_to.is_none() && search.is_none() => {
                    Ok(Command::SelectBookings { session_id, status })
                }
                _ => Ok(Command::ListBookings {
                    filter: BookingFilter {
                        start_from,
                        start_to,
                        session_id,
                        status,
                        search,
                    },
                }),
            }
        }
        "sessions" => Ok(Command::SelectSessions {
            start: parse_instant(find("start", BinaryOperator::GtEq).ok_or(SqlError::MissingFilter("start"))?)?,
            end: parse_instant(find("end", BinaryOperator::LtEq).ok_or(SqlError::MissingFilter("end"))?)?,
            branch_id: find("branch_id", BinaryOperator::Eq).map(parse_ulid).transpose()?,
        }),
        "session_details" => Ok(Command::SelectSessionDetails {
            id: parse_ulid(find("id", BinaryOperator::Eq).ok_or(SqlError::MissingFilter("id"))?)?,
        }),
        "appointments" => Ok(Command::SelectAppointments {
            clinician_id: parse_ulid(
                find("clinician_id", BinaryOperator::Eq).ok_or(SqlError::MissingFilter("clinician_id"))?,
            )?,
            start: find("start", BinaryOperator::GtEq).map(parse_instant).transpose()?,
            end: find("end", BinaryOperator::LtEq).map(parse_instant).transpose()?,
        }),
        "booking_stats" => Ok(Command::SelectBookingStats {
            start: find("start", BinaryOperator::GtEq).map(parse_instant).transpose()?,
            end: find("end", BinaryOperator::LtEq).map(parse_instant).transpose()?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `SELECT proc(arg, ...)`.
fn parse_procedure_call(projection: &[SelectItem]) -> Result<Command, SqlError> {
    let func = match projection.first() {
        Some(SelectItem::UnnamedExpr(Expr::Function(func)))
        | Some(SelectItem::ExprWithAlias { expr: Expr::Function(func), .. }) => func,
        _ => return Err(SqlError::Parse("SELECT without FROM must call a procedure".into())),
    };
    let name = object_name_last(&func.name).ok_or_else(|| SqlError::Parse("empty function name".into()))?;
    let args = function_args(&func.args)?;
    let arity = |proc: &'static str, min: usize| {
        if args.len() < min {
            Err(SqlError::WrongArity(proc, min, args.len()))
        } else {
            Ok(())
        }
    };

    match name.as_str() {
        "create_booking" => {
            arity("create_booking", 3)?;
            Ok(Command::CreateBooking {
                session_id: parse_ulid(&args[0])?,
                name: parse_string(&args[1])?,
                email: parse_string(&args[2])?,
                phone: optional(&args, 3, parse_string_or_null)?.flatten(),
            })
        }
        "cancel_booking" => {
            arity("cancel_booking", 2)?;
            Ok(Command::CancelBooking {
                code: parse_string(&args[0])?,
                email: parse_string(&args[1])?,
            })
        }
        "admin_cancel_booking" => {
            arity("admin_cancel_booking", 1)?;
            Ok(Command::AdminCancelBooking { booking_id: parse_ulid(&args[0])? })
        }
        "update_booking_status" => {
            arity("update_booking_status", 2)?;
            Ok(Command::UpdateBookingStatus {
                booking_id: parse_ulid(&args[0])?,
                status: parse_booking_status(&args[1])?,
            })
        }
        "update_booking_notes" => {
            arity("update_booking_notes", 2)?;
            Ok(Command::UpdateBookingNotes {
                booking_id: parse_ulid(&args[0])?,
                notes: parse_string_or_null(&args[1])?,
            })
        }
        "create_appointment" => {
            arity("create_appointment", 7)?;
            Ok(Command::CreateAppointment {
                clinician_id: parse_ulid(&args[0])?,
                start: parse_instant(&args[1])?,
                end: parse_instant(&args[2])?,
                appointment_type_id: parse_ulid(&args[3])?,
                pet_name: parse_string(&args[4])?,
                client_name: parse_string(&args[5])?,
                client_email: parse_string(&args[6])?,
                client_phone: optional(&args, 7, parse_string_or_null)?.flatten(),
                notes: optional(&args, 8, parse_string_or_null)?.flatten(),
            })
        }
        "update_appointment_status" => {
            arity("update_appointment_status", 2)?;
            let raw = parse_string(&args[1])?;
            Ok(Command::UpdateAppointmentStatus {
                appointment_id: parse_ulid(&args[0])?,
                status: AppointmentStatus::parse(&raw)
                    .ok_or_else(|| SqlError::Parse(format!("unknown appointment status: {raw}")))?,
            })
        }
        "generate_sessions" => {
            arity("generate_sessions", 2)?;
            Ok(Command::GenerateSessions {
                start_date: parse_date(&args[0])?,
                end_date: parse_date(&args[1])?,
                branch_id: optional(&args, 2, parse_ulid_or_null)?.flatten(),
            })
        }
        "set_capacity" => {
            arity("set_capacity", 2)?;
            Ok(Command::SetCapacity {
                session_id: parse_ulid(&args[0])?,
                capacity: parse_u32(&args[1])?,
            })
        }
        "cancel_session" => {
            arity("cancel_session", 1)?;
            Ok(Command::CancelSession {
                session_id: parse_ulid(&args[0])?,
                reason: optional(&args, 1, parse_string_or_null)?.flatten(),
            })
        }
        "update_session" => {
            arity("update_session", 5)?;
            Ok(Command::UpdateSession {
                session_id: parse_ulid(&args[0])?,
                instructor_id: parse_ulid_or_null(&args[1])?,
                start: parse_instant_or_null(&args[2])?,
                end: parse_instant_or_null(&args[3])?,
                capacity: parse_u32_or_null(&args[4])?,
                notes: optional(&args, 5, parse_string_or_null)?.flatten(),
            })
        }
        "update_template" => {
            arity("update_template", 7)?;
            Ok(Command::UpdateTemplate {
                template_id: parse_ulid(&args[0])?,
                instructor_id: parse_ulid_or_null(&args[1])?,
                branch_id: parse_ulid_or_null(&args[2])?,
                weekday: or_null(&args[3], parse_weekday)?,
                start_time: parse_time_or_null(&args[4])?,
                end_time: parse_time_or_null(&args[5])?,
                capacity: parse_u32_or_null(&args[6])?,
                is_active: optional(&args, 7, |e| or_null(e, parse_bool))?.flatten(),
            })
        }
        "set_template_active" => {
            arity("set_template_active", 2)?;
            Ok(Command::SetTemplateActive {
                template_id: parse_ulid(&args[0])?,
                active: parse_bool(&args[1])?,
            })
        }
        "set_time_zone" => {
            arity("set_time_zone", 1)?;
            Ok(Command::SetTimeZone { zone: parse_string(&args[0])? })
        }
        _ => Err(SqlError::UnknownProcedure(name)),
    }
}

fn function_args(args: &FunctionArguments) -> Result<Vec<Expr>, SqlError> {
    match args {
        FunctionArguments::None => Ok(Vec::new()),
        FunctionArguments::List(list) => list
            .args
            .iter()
            .map(|arg| match arg {
                FunctionArg::Unnamed(FunctionArgExpr::Expr(e)) => Ok(e.clone()),
                other => Err(SqlError::Unsupported(format!("argument {other}"))),
            })
            .collect(),
        FunctionArguments::Subquery(_) => Err(SqlError::Unsupported("subquery argument".into())),
    }
}

struct Filter {
    column: String,
    op: BinaryOperator,
    value: Expr,
}

/// Flatten an AND-tree of `column <op> value` comparisons. Anything else
/// (OR, functions, column on the right) is rejected.
fn collect_filters(expr: &Expr, out: &mut Vec<Filter>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            collect_filters(left, out)?;
            collect_filters(right, out)
        }
        Expr::BinaryOp { left, op, right } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter {expr}")))?;
            out.push(Filter {
                column,
                op: op.clone(),
                value: (**right).clone(),
            });
            Ok(())
        }
        Expr::Nested(inner) => collect_filters(inner, out),
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

type Allowed = &'static [(&'static str, BinaryOperator)];

const BOOKING_FILTERS: Allowed = &[
    ("confirmation_code", BinaryOperator::Eq),
    ("session_id", BinaryOperator::Eq),
    ("status", BinaryOperator::Eq),
    ("start", BinaryOperator::GtEq),
    ("start", BinaryOperator::LtEq),
    ("search", BinaryOperator::Eq),
];
const SESSION_FILTERS: Allowed = &[
    ("start", BinaryOperator::GtEq),
    ("end", BinaryOperator::LtEq),
    ("branch_id", BinaryOperator::Eq),
];
const SESSION_DETAIL_FILTERS: Allowed = &[("id", BinaryOperator::Eq)];
const APPOINTMENT_FILTERS: Allowed = &[
    ("clinician_id", BinaryOperator::Eq),
    ("start", BinaryOperator::GtEq),
    ("end", BinaryOperator::LtEq),
];
const STATS_FILTERS: Allowed = &[("start", BinaryOperator::GtEq), ("end", BinaryOperator::LtEq)];

/// `(column, operator)` pairs each readable table understands.
fn allowed_filters(table: &str) -> Option<Allowed> {
    match table {
        "bookings" => Some(BOOKING_FILTERS),
        "sessions" => Some(SESSION_FILTERS),
        "session_details" => Some(SESSION_DETAIL_FILTERS),
        "appointments" => Some(APPOINTMENT_FILTERS),
        "booking_stats" => Some(STATS_FILTERS),
        _ => None,
    }
}

/// Every filter must be understood, and each only once.
fn check_filters(filters: &[Filter], allowed: &[(&str, BinaryOperator)]) -> Result<(), SqlError> {
    for (i, f) in filters.iter().enumerate() {
        if !allowed.iter().any(|(column, op)| *column == f.column && *op == f.op) {
            return Err(SqlError::Unsupported(format!("filter {} {}", f.column, f.op)));
        }
        if filters[..i].iter().any(|g| g.column == f.column && g.op == f.op) {
            return Err(SqlError::Unsupported(format!("repeated filter {} {}", f.column, f.op)));
        }
    }
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────

fn static_table(table: &str) -> &'static str {
    match table {
        "sessions" => "sessions",
        "clinicians" => "clinicians",
        "templates" => "templates",
        "clinic_exclusions" => "clinic_exclusions",
        "slot_exclusions" => "slot_exclusions",
        _ => "table",
    }
}

/// Parse `values[idx]` if present.
fn optional<T>(
    values: &[Expr],
    idx: usize,
    parse: impl Fn(&Expr) -> Result<T, SqlError>,
) -> Result<Option<T>, SqlError> {
    values.get(idx).map(parse).transpose()
}

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid(right),
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::DoubleQuotedString(s)) => Ok(s.clone()),
        Some(Value::Number(n, _)) => Ok(n.clone()),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_string(expr).map(Some)
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(s.trim()).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_ulid(expr).map(Some)
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .trim()
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

/// `parse(expr)`, or `None` for a NULL literal.
fn or_null<T>(expr: &Expr, parse: impl Fn(&Expr) -> Result<T, SqlError>) -> Result<Option<T>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse(expr).map(Some)
}

fn parse_u32_or_null(expr: &Expr) -> Result<Option<u32>, SqlError> {
    or_null(expr, parse_u32)
}

fn parse_instant_or_null(expr: &Expr) -> Result<Option<Ms>, SqlError> {
    or_null(expr, parse_instant)
}

fn parse_weekday(expr: &Expr) -> Result<u8, SqlError> {
    let weekday = parse_i64(expr)?;
    u8::try_from(weekday).map_err(|_| SqlError::Parse(format!("bad day_of_week: {weekday}")))
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

/// Unix milliseconds, or an RFC 3339 timestamp string.
fn parse_instant(expr: &Expr) -> Result<Ms, SqlError> {
    if let Ok(ms) = parse_i64(expr) {
        return Ok(ms);
    }
    let s = parse_string(expr)?;
    DateTime::parse_from_rfc3339(s.trim())
        .map(|dt| dt.timestamp_millis())
        .map_err(|e| SqlError::Parse(format!("bad timestamp '{s}': {e}")))
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date '{s}': {e}")))
}

/// `HH:MM` or `HH:MM:SS`.
fn parse_time(expr: &Expr) -> Result<NaiveTime, SqlError> {
    let s = parse_string(expr)?;
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .map_err(|e| SqlError::Parse(format!("bad time '{s}': {e}")))
}

fn parse_time_or_null(expr: &Expr) -> Result<Option<NaiveTime>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_time(expr).map(Some)
}

fn parse_booking_status(expr: &Expr) -> Result<BookingStatus, SqlError> {
    let raw = parse_string(expr)?;
    BookingStatus::parse(&raw).ok_or_else(|| SqlError::Parse(format!("unknown booking status: {raw}")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownProcedure(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownProcedure(p) => write!(f, "unknown procedure: {p}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected at least {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
