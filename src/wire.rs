use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldInfo, QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tracing::error;

use crate::access::RequestContext;
use crate::auth::CampusAuthSource;
use crate::campus::CampusManager;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SqlError};

pub struct CampusHandler {
    campus_manager: Arc<CampusManager>,
    query_parser: Arc<CampusQueryParser>,
}

impl CampusHandler {
    pub fn new(campus_manager: Arc<CampusManager>) -> Self {
        Self {
            campus_manager,
            query_parser: Arc::new(CampusQueryParser),
        }
    }

    /// The campus engine and the acting user for this connection.
    async fn resolve<C: ClientInfo>(&self, client: &C) -> PgWireResult<(Arc<Engine>, RequestContext)> {
        let metadata = client.metadata();
        let user = metadata.get("user").cloned().unwrap_or_default();
        let campus = metadata.get("database").cloned().unwrap_or_else(|| user.clone());
        let engine = self
            .campus_manager
            .get_or_create(&campus)
            .await
            .map_err(|e| user_error("08006", format!("campus error: {e}")))?;
        let ctx = engine.context_for(&user).map_err(engine_err)?;
        Ok((engine, ctx))
    }

    async fn run(&self, engine: &Engine, ctx: &RequestContext, sql: &str, format: &Format) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, ctx, cmd, format).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label).record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        ctx: &RequestContext,
        cmd: Command,
        format: &Format,
    ) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::InsertUser {
                id,
                username,
                role,
                email,
            } => {
                engine
                    .create_user(ctx, id, username, role, email)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteUser { id } => {
                engine.delete_user(ctx, id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertRoom {
                id,
                name,
                capacity,
                category,
                status,
            } => {
                engine
                    .create_room(ctx, id, name, capacity, category, status)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateRoomStatus { id, status } => {
                engine.set_room_status(ctx, id, status).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::InsertBooking {
                id,
                room_id,
                date,
                start,
                end,
                purpose,
            } => {
                let request = BookingRequest::parse(id, room_id, &date, &start, &end, purpose)
                    .map_err(|e| engine_err(e.into()))?;
                engine.book_room(ctx, request).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteBooking { id } => {
                engine.delete_reservation(ctx, id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectUsers => {
                let users = engine.list_users(ctx).map_err(engine_err)?;
                let schema = Arc::new(users_schema(format));
                let rows: Vec<PgWireResult<_>> = users
                    .into_iter()
                    .map(|u| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&u.id.to_string())?;
                        encoder.encode_field(&u.username)?;
                        encoder.encode_field(&u.role.to_string())?;
                        encoder.encode_field(&u.email)?;
                        encoder.encode_field(&u.created_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectRooms { status } => {
                let rooms = engine.list_rooms(ctx, status).await.map_err(engine_err)?;
                let schema = Arc::new(rooms_schema(format));
                let rows: Vec<PgWireResult<_>> = rooms
                    .into_iter()
                    .map(|r| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&r.id.to_string())?;
                        encoder.encode_field(&r.name)?;
                        encoder.encode_field(&i64::from(r.capacity))?;
                        encoder.encode_field(&r.category.to_string())?;
                        encoder.encode_field(&r.status.to_string())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectBookings { room_id, date, user_id } => {
                let date = date
                    .as_deref()
                    .map(parse_date)
                    .transpose()
                    .map_err(|e| engine_err(e.into()))?;
                let filter = ReservationFilter { room_id, date, user_id };
                let bookings = engine.list_reservations(ctx, filter).await.map_err(engine_err)?;
                let schema = Arc::new(bookings_schema(format));
                let rows: Vec<PgWireResult<_>> = bookings
                    .into_iter()
                    .map(|b| {
                        let r = &b.reservation;
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&r.id.to_string())?;
                        encoder.encode_field(&r.room_id.to_string())?;
                        encoder.encode_field(&b.room_name)?;
                        encoder.encode_field(&r.user_id.to_string())?;
                        encoder.encode_field(&b.username)?;
                        encoder.encode_field(&r.date.to_string())?;
                        encoder.encode_field(&r.slot.start.format("%H:%M").to_string())?;
                        encoder.encode_field(&r.slot.end.format("%H:%M").to_string())?;
                        encoder.encode_field(&r.purpose)?;
                        encoder.encode_field(&r.status.to_string())?;
                        encoder.encode_field(&r.created_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
        }
    }
}

// ── Row schemas ──────────────────────────────────────────────────

fn fields(columns: &[(&str, Type)], format: &Format) -> Vec<FieldInfo> {
    columns
        .iter()
        .enumerate()
        .map(|(i, (name, ty))| FieldInfo::new((*name).into(), None, None, ty.clone(), format.format_for(i)))
        .collect()
}

fn users_schema(format: &Format) -> Vec<FieldInfo> {
    fields(
        &[
            ("id", Type::VARCHAR),
            ("username", Type::VARCHAR),
            ("role", Type::VARCHAR),
            ("email", Type::VARCHAR),
            ("created_at", Type::INT8),
        ],
        format,
    )
}

fn rooms_schema(format: &Format) -> Vec<FieldInfo> {
    fields(
        &[
            ("id", Type::VARCHAR),
            ("room_name", Type::VARCHAR),
            ("capacity", Type::INT8),
            ("room_type", Type::VARCHAR),
            ("status", Type::VARCHAR),
        ],
        format,
    )
}

fn bookings_schema(format: &Format) -> Vec<FieldInfo> {
    fields(
        &[
            ("id", Type::VARCHAR),
            ("room_id", Type::VARCHAR),
            ("room_name", Type::VARCHAR),
            ("user_id", Type::VARCHAR),
            ("username", Type::VARCHAR),
            ("booking_date", Type::VARCHAR),
            ("start_time", Type::VARCHAR),
            ("end_time", Type::VARCHAR),
            ("purpose", Type::VARCHAR),
            ("status", Type::VARCHAR),
            ("created_at", Type::INT8),
        ],
        format,
    )
}

/// Row schema of a SELECT, found from the table after FROM. Empty for
/// statements that return no rows.
fn result_schema(sql: &str, format: &Format) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    let mut words = lower.split_whitespace();
    if words.next() != Some("select") {
        return vec![];
    }
    let table = words
        .skip_while(|w| *w != "from")
        .nth(1)
        .map(|t| t.trim_matches(|c| c == ';' || c == '"'));
    match table {
        Some("users") => users_schema(format),
        Some("rooms") => rooms_schema(format),
        Some("bookings") => bookings_schema(format),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for CampusHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let (engine, ctx) = self.resolve(client).await?;
        self.run(&engine, &ctx, query, &Format::UnifiedText).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct CampusQueryParser;

#[async_trait]
impl QueryParser for CampusQueryParser {
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

    fn get_result_schema(&self, stmt: &String, column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt, column_format.unwrap_or(&Format::UnifiedText)))
    }
}

#[async_trait]
impl ExtendedQueryHandler for CampusHandler {
    type Statement = String;
    type QueryParser = CampusQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(&self, client: &mut C, portal: &Portal<Self::Statement>, _max_rows: usize) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let (engine, ctx) = self.resolve(client).await?;
        let sql = substitute_params(portal);
        let mut responses = self.run(&engine, &ctx, &sql, &portal.result_column_format).await?;
        Ok(responses.remove(0))
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
            result_schema(&target.statement, &Format::UnifiedText),
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
            &target.result_column_format,
        )))
    }
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let mut rest = sql;
    while let Some(pos) = rest.find('$') {
        rest = &rest[pos + 1..];
        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        if let Ok(n) = rest[..digits].parse::<usize>() {
            max = max.max(n);
        }
        rest = &rest[digits..];
    }
    max
}

/// Replace `$1`, `$2`, ... with the bound parameters as quoted text.
///
/// One left-to-right pass: placeholders inside quoted literals or identifiers
/// are left alone, and substituted values are never scanned again.
fn substitute_params(portal: &Portal<String>) -> String {
    let params: Vec<Option<&[u8]>> = portal.parameters.iter().map(|p| p.as_deref()).collect();
    bind_params(&portal.statement.statement, &params)
}

fn bind_params(sql: &str, params: &[Option<&[u8]>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut quote: Option<char> = None;
    let mut chars = sql.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        match (quote, c) {
            // A doubled quote inside a literal is an escaped quote; both
            // halves are copied and the literal stays open.
            (Some(q), _) if c == q => {
                out.push(c);
                if chars.peek().is_some_and(|&(_, next)| next == q) {
                    chars.next();
                    out.push(q);
                } else {
                    quote = None;
                }
            }
            (Some(_), _) => out.push(c),
            (None, '\'' | '"') => {
                quote = Some(c);
                out.push(c);
            }
            (None, '$') => {
                let digits = sql[i + 1..].bytes().take_while(u8::is_ascii_digit).count();
                let index = sql[i + 1..i + 1 + digits].parse::<usize>().ok();
                match index.and_then(|n| n.checked_sub(1)).and_then(|n| params.get(n)) {
                    Some(Some(bytes)) => {
                        out.push('\'');
                        out.push_str(&String::from_utf8_lossy(bytes).replace('\'', "''"));
                        out.push('\'');
                    }
                    Some(None) => out.push_str("NULL"),
                    None => out.push_str(&sql[i..i + 1 + digits]),
                }
                for _ in 0..digits {
                    chars.next();
                }
            }
            (None, _) => out.push(c),
        }
    }
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct CampusFactory {
    handler: Arc<CampusHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<CampusAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl CampusFactory {
    pub fn new(campus_manager: Arc<CampusManager>, password: String) -> Self {
        let auth_source = CampusAuthSource::new(campus_manager.clone(), password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(CampusHandler::new(campus_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(auth_source, param_provider)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for CampusFactory {
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

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    campus_manager: Arc<CampusManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = CampusFactory::new(campus_manager, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Error mapping ────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

fn engine_sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Conflict { .. } => "23P01",
        EngineError::InvalidInput(_) => "22007",
        EngineError::PermissionDenied { .. } => "42501",
        EngineError::StorageError(_) => "58030",
        EngineError::NotFound(_) => "P0002",
        EngineError::AlreadyExists(_) | EngineError::UsernameTaken(_) => "23505",
        EngineError::UnknownUser(_) => "28000",
        EngineError::RoomUnavailable(_) => "55000",
        EngineError::LimitExceeded(_) => "54000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    let code = engine_sqlstate(&e);
    let message = match &e {
        EngineError::StorageError(detail) => {
            error!("storage failure: {detail}");
            "could not persist the change".to_string()
        }
        other => other.to_string(),
    };
    user_error(code, message)
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match &e {
        SqlError::Invalid(_) => "22P02",
        SqlError::UnknownTable(_) => "42P01",
        _ => "42601",
    };
    user_error(code, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn count_params_finds_highest_placeholder() {
        assert_eq!(count_params("SELECT * FROM rooms"), 0);
        assert_eq!(count_params("DELETE FROM bookings WHERE id = $1"), 1);
        assert_eq!(
            count_params("INSERT INTO bookings VALUES ($1, $2, $3, $4, $5, $12)"),
            12
        );
    }

    #[test]
    fn bound_values_are_not_rescanned() {
        let sql = "INSERT INTO bookings VALUES ($1, $2)";
        let bound = bind_params(sql, &[Some(&b"costs $2 per head"[..]), Some(&b"it's"[..])]);
        assert_eq!(bound, "INSERT INTO bookings VALUES ('costs $2 per head', 'it''s')");
    }

    #[test]
    fn placeholders_in_literals_are_kept() {
        let sql = "SELECT * FROM bookings WHERE purpose = 'pay $1' AND room_id = $1";
        let bound = bind_params(sql, &[Some(&b"r1"[..])]);
        assert_eq!(bound, "SELECT * FROM bookings WHERE purpose = 'pay $1' AND room_id = 'r1'");

        let escaped = bind_params("VALUES ('a''$1', $1)", &[Some(&b"x"[..])]);
        assert_eq!(escaped, "VALUES ('a''$1', 'x')");
    }

    #[test]
    fn null_and_unbound_placeholders() {
        assert_eq!(bind_params("VALUES ($1, $3)", &[None]), "VALUES (NULL, $3)");
        assert_eq!(bind_params("VALUES ($10)", &[Some(&b"a"[..]); 10]), "VALUES ('a')");
    }

    #[test]
    fn result_schema_by_table() {
        let text = Format::UnifiedText;
        assert_eq!(result_schema("SELECT * FROM bookings WHERE room_id = $1", &text).len(), 11);
        assert_eq!(result_schema("select * from rooms;", &text).len(), 5);
        assert_eq!(result_schema("SELECT * FROM users", &text).len(), 5);
        assert!(result_schema("DELETE FROM bookings WHERE id = $1", &text).is_empty());
    }

    #[test]
    fn sqlstates_are_distinct_per_outcome() {
        let conflict = EngineError::Conflict {
            existing: Ulid::new(),
            date: parse_date("2024-03-01").unwrap(),
            slot: TimeSlot::parse("09:00", "10:00").unwrap(),
        };
        let invalid: EngineError = InvalidValue::new("date", "2024-02-30").into();
        let storage = EngineError::StorageError("disk full".into());
        let codes = [
            engine_sqlstate(&conflict),
            engine_sqlstate(&invalid),
            engine_sqlstate(&storage),
        ];
        assert_eq!(codes, ["23P01", "22007", "58030"]);
    }
}
