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
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use tokio::net::TcpStream;
use tracing::debug;

use crate::auth::{Roles, SeatdAuthSource};
use crate::engine::{Engine, EngineError, NewReservation};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, ReservationQuery, SqlError};

pub struct SeatdHandler {
    engine: Arc<Engine>,
    roles: Arc<Roles>,
    query_parser: Arc<SeatdQueryParser>,
}

impl SeatdHandler {
    pub fn new(engine: Arc<Engine>, roles: Arc<Roles>) -> Self {
        Self {
            engine,
            roles,
            query_parser: Arc::new(SeatdQueryParser),
        }
    }

    fn caller<C: ClientInfo>(&self, client: &C) -> Caller {
        let login = client.metadata().get("user").map(String::as_str).unwrap_or_default();
        self.roles.caller(login)
    }

    async fn run(&self, caller: &Caller, sql_text: &str, format: &Format) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql_text).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(caller, cmd, format).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(
        &self,
        caller: &Caller,
        cmd: Command,
        format: &Format,
    ) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertRestaurant { id, name, address, open_time, close_time } => {
                engine
                    .create_restaurant(caller, id, &name, &address, &open_time, &close_time)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertTable { id, restaurant_id, name, capacity } => {
                engine
                    .create_table(caller, id, restaurant_id, &name, capacity)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertReservation { id, restaurant_id, start, end, guests, table_id } => {
                let req = NewReservation { id, restaurant_id, start, end, guests, table_id };
                engine.create_reservation(caller, req).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::CancelReservation { id } => {
                engine.cancel_reservation(caller, id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectRestaurants { id } => {
                let restaurants = match id {
                    Some(id) => vec![engine.get_restaurant(id).await.map_err(engine_err)?],
                    None => engine.list_restaurants().await.map_err(engine_err)?,
                };
                rows(shaped(restaurant_schema(), format), restaurants, |enc, r| {
                    enc.encode_field(&r.id.to_string())?;
                    enc.encode_field(&r.name)?;
                    enc.encode_field(&r.address)?;
                    enc.encode_field(&r.open_time)?;
                    enc.encode_field(&r.close_time)?;
                    enc.encode_field(&r.created_at)
                })
            }
            Command::SelectTables { restaurant_id, min_capacity } => {
                // Anything below 1 filters nothing.
                let min = min_capacity.map(|m| m.clamp(0, u32::MAX as i64) as u32);
                let tables = engine.list_tables(restaurant_id, min).await.map_err(engine_err)?;
                rows(shaped(table_schema(), format), tables, |enc, t| {
                    enc.encode_field(&t.id.to_string())?;
                    enc.encode_field(&t.restaurant_id.to_string())?;
                    enc.encode_field(&t.name)?;
                    enc.encode_field(&(t.capacity as i32))?;
                    enc.encode_field(&t.created_at)
                })
            }
            Command::SelectAvailability { restaurant_id, start, end, guests } => {
                let free = engine
                    .list_available_tables(restaurant_id, start, end, guests)
                    .await
                    .map_err(engine_err)?;
                rows(shaped(availability_schema(), format), free, |enc, a| {
                    enc.encode_field(&a.table_id.to_string())?;
                    enc.encode_field(&(a.capacity as i32))
                })
            }
            Command::SelectReservations(query) => {
                let reservations = match query {
                    ReservationQuery::Mine => engine.list_my_reservations(caller).await,
                    ReservationQuery::ById(id) => engine.get_reservation(caller, id).await.map(|r| vec![r]),
                    ReservationQuery::Overlap(filter) => engine.find_overlapping(caller, filter).await,
                }
                .map_err(engine_err)?;
                rows(shaped(reservation_schema(), format), reservations, encode_reservation)
            }
        }
    }
}

fn encode_reservation(enc: &mut DataRowEncoder, r: Reservation) -> PgWireResult<()> {
    enc.encode_field(&r.id.to_string())?;
    enc.encode_field(&r.restaurant_id.to_string())?;
    enc.encode_field(&r.table_id.to_string())?;
    enc.encode_field(&r.user_id)?;
    enc.encode_field(&r.span.start)?;
    enc.encode_field(&r.span.end)?;
    enc.encode_field(&(r.guests as i32))?;
    enc.encode_field(&r.status.as_str().to_string())?;
    enc.encode_field(&r.created_at)
}

fn rows<T>(
    schema: Vec<FieldInfo>,
    items: Vec<T>,
    encode: impl Fn(&mut DataRowEncoder, T) -> PgWireResult<()>,
) -> PgWireResult<Response> {
    let schema = Arc::new(schema);
    let data: Vec<PgWireResult<_>> = items
        .into_iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(data))))
}

// ── Result schemas ───────────────────────────────────────────────

fn text(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn int4(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT4, FieldFormat::Text)
}

fn restaurant_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("name"),
        text("address"),
        text("open_time"),
        text("close_time"),
        int8("created_at"),
    ]
}

fn table_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("restaurant_id"),
        text("name"),
        int4("capacity"),
        int8("created_at"),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![text("table_id"), int4("capacity")]
}

fn reservation_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("restaurant_id"),
        text("table_id"),
        text("user_id"),
        int8("start"),
        int8("end"),
        int4("guests"),
        text("status"),
        int8("created_at"),
    ]
}

/// Apply the client's requested result format to each column.
fn shaped(schema: Vec<FieldInfo>, format: &Format) -> Vec<FieldInfo> {
    schema
        .into_iter()
        .enumerate()
        .map(|(i, f)| {
            FieldInfo::new(
                f.name().to_string(),
                f.table_id(),
                f.column_id(),
                f.datatype().clone(),
                format.format_for(i),
            )
        })
        .collect()
}

/// Row shape a statement will produce, judged from its text so it works
/// before parameters are bound.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let words: Vec<String> = sql
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| c == ';' || c == '"').to_lowercase())
        .collect();
    if words.first().map(String::as_str) != Some("select") {
        return vec![];
    }
    let table = words
        .iter()
        .position(|w| w == "from")
        .and_then(|i| words.get(i + 1));
    match table.map(String::as_str) {
        Some("restaurants") => restaurant_schema(),
        Some("tables") => table_schema(),
        Some("availability") => availability_schema(),
        Some("reservations") => reservation_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for SeatdHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let caller = self.caller(client);
        Ok(vec![self.run(&caller, query, &Format::UnifiedText).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SeatdQueryParser;

#[async_trait]
impl QueryParser for SeatdQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        let format = column_format.cloned().unwrap_or(Format::UnifiedText);
        Ok(shaped(result_schema(stmt), &format))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SeatdHandler {
    type Statement = String;
    type QueryParser = SeatdQueryParser;

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
        let caller = self.caller(client);
        let sql = substitute_params(portal);
        self.run(&caller, &sql, &portal.result_column_format).await
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
        Ok(DescribeStatementResponse::new(param_types, result_schema(&target.statement)))
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
        Ok(DescribePortalResponse::new(shaped(
            result_schema(&target.statement.statement),
            &target.result_column_format,
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
        let digits_start = i + 1;
        let mut j = digits_start;
        while j < bytes.len() && bytes[j].is_ascii_digit() {
            j += 1;
        }
        if let Ok(n) = sql[digits_start..j].parse::<usize>() {
            max = max.max(n);
        }
        i = j.max(i + 1);
    }
    max
}

/// Inline bound parameters as quoted text literals. Highest index first so
/// `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut sql = portal.statement.statement.clone();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let literal = match param {
            Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
            None => "NULL".to_string(),
        };
        sql = sql.replace(&format!("${}", i + 1), &literal);
    }
    sql
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SeatdFactory {
    handler: Arc<SeatdHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SeatdAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SeatdFactory {
    pub fn new(engine: Arc<Engine>, password: String, roles: Arc<Roles>) -> Self {
        Self {
            handler: Arc::new(SeatdHandler::new(engine, roles)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                SeatdAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SeatdFactory {
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
    engine: Arc<Engine>,
    password: String,
    roles: Arc<Roles>,
) -> std::io::Result<()> {
    let factory = Arc::new(SeatdFactory::new(engine, password, roles));
    pgwire::tokio::process_socket(socket, None, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::NotFound(_) => "P0002",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::InvalidInput(_) => "22023",
        EngineError::OutOfHours => "23514",
        EngineError::Unavailable(_) => "23P01",
        EngineError::Forbidden => "42501",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    debug!("request failed: {e}");
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_follows_from_clause() {
        assert_eq!(result_schema("SELECT * FROM tables WHERE restaurant_id = $1").len(), 5);
        assert_eq!(result_schema("select * from availability where guests = $1").len(), 2);
        assert_eq!(result_schema("SELECT * FROM \"reservations\";").len(), 9);
        assert!(result_schema("INSERT INTO reservations VALUES ($1)").is_empty());
    }

    #[test]
    fn shaping_follows_requested_format() {
        let binary = shaped(availability_schema(), &Format::UnifiedBinary);
        assert!(binary.iter().all(|f| f.format() == FieldFormat::Binary));
        let text = shaped(availability_schema(), &Format::UnifiedText);
        assert!(text.iter().all(|f| f.format() == FieldFormat::Text));
        assert_eq!(text[1].name(), "capacity");
    }

    #[test]
    fn counts_highest_placeholder() {
        assert_eq!(count_params("SELECT * FROM reservations WHERE id = $1"), 1);
        assert_eq!(count_params("VALUES ($2, $10, $1)"), 10);
        assert_eq!(count_params("no params, just $ signs $"), 0);
    }

    #[test]
    fn every_engine_error_has_a_distinct_sqlstate() {
        let id = ulid::Ulid::new();
        let errors = [
            EngineError::NotFound(id),
            EngineError::AlreadyExists(id),
            EngineError::InvalidInput("x".into()),
            EngineError::OutOfHours,
            EngineError::Unavailable("x".into()),
            EngineError::Forbidden,
        ];
        let mut codes: Vec<&str> = errors.iter().map(sqlstate).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }
}
