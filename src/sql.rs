use chrono::DateTime;
use sqlparser::ast::{
    self, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertRestaurant {
        id: Ulid,
        name: String,
        address: String,
        open_time: String,
        close_time: String,
    },
    InsertTable {
        id: Ulid,
        restaurant_id: Ulid,
        name: String,
        capacity: i64,
    },
    InsertReservation {
        id: Ulid,
        restaurant_id: Ulid,
        start: Ms,
        end: Ms,
        guests: i64,
        table_id: Option<Ulid>,
    },
    /// `DELETE FROM reservations`: the row stays, its status becomes cancelled.
    CancelReservation {
        id: Ulid,
    },
    SelectRestaurants {
        id: Option<Ulid>,
    },
    SelectTables {
        restaurant_id: Ulid,
        min_capacity: Option<i64>,
    },
    SelectAvailability {
        restaurant_id: Ulid,
        start: Ms,
        end: Ms,
        guests: i64,
    },
    SelectReservations(ReservationQuery),
}

#[derive(Debug, PartialEq)]
pub enum ReservationQuery {
    /// No WHERE clause: the caller's own reservations.
    Mine,
    ById(Ulid),
    Overlap(ReservationFilter),
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

/// One VALUES row keyed by column name. Without a column list the table's
/// canonical column order applies.
struct Row {
    table: &'static str,
    columns: Vec<String>,
    values: Vec<Expr>,
}

impl Row {
    fn new(table: &'static str, canonical: &[&str], insert: &ast::Insert) -> Result<Self, SqlError> {
        let values = single_values_row(insert)?;
        let columns: Vec<String> = if insert.columns.is_empty() {
            canonical.iter().map(|c| c.to_string()).collect()
        } else {
            insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
        };
        let arity_ok = if insert.columns.is_empty() {
            values.len() <= columns.len()
        } else {
            values.len() == columns.len()
        };
        if !arity_ok {
            return Err(SqlError::WrongArity(table, columns.len(), values.len()));
        }
        if let Some(unknown) = columns.iter().find(|c| !canonical.contains(&c.as_str())) {
            return Err(SqlError::UnknownColumn(table, unknown.clone()));
        }
        Ok(Self { table, columns, values })
    }

    fn get(&self, column: &str) -> Option<&Expr> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|i| self.values.get(i))
    }

    fn require(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(self.table, column))
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;

    match table.as_str() {
        "restaurants" => {
            let row = Row::new(
                "restaurants",
                &["id", "name", "address", "open_time", "close_time"],
                insert,
            )?;
            Ok(Command::InsertRestaurant {
                id: parse_ulid(row.require("id")?)?,
                name: parse_string(row.require("name")?)?,
                address: row.get("address").map(parse_string_or_null).transpose()?.flatten().unwrap_or_default(),
                open_time: parse_string(row.require("open_time")?)?,
                close_time: parse_string(row.require("close_time")?)?,
            })
        }
        "tables" => {
            let row = Row::new("tables", &["id", "restaurant_id", "name", "capacity"], insert)?;
            Ok(Command::InsertTable {
                id: parse_ulid(row.require("id")?)?,
                restaurant_id: parse_ulid(row.require("restaurant_id")?)?,
                name: parse_string(row.require("name")?)?,
                capacity: parse_i64(row.require("capacity")?)?,
            })
        }
        "reservations" => {
            let row = Row::new(
                "reservations",
                &["id", "restaurant_id", "start", "end", "guests", "table_id"],
                insert,
            )?;
            Ok(Command::InsertReservation {
                id: parse_ulid(row.require("id")?)?,
                restaurant_id: parse_ulid(row.require("restaurant_id")?)?,
                start: parse_instant(row.require("start")?)?,
                end: parse_instant(row.require("end")?)?,
                guests: parse_i64(row.require("guests")?)?,
                table_id: row.get("table_id").map(parse_ulid_or_null).transpose()?.flatten(),
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    if table != "reservations" {
        return Err(SqlError::Unsupported(format!("DELETE FROM {table}")));
    }
    let preds = predicates(delete.selection.as_ref())?;
    match preds.as_slice() {
        [Predicate { column, op: BinaryOperator::Eq, value }] if column == "id" => {
            Ok(Command::CancelReservation { id: parse_ulid(value)? })
        }
        _ => Err(SqlError::MissingFilter("id")),
    }
}

// ── SELECT ────────────────────────────────────────────────────

/// `column <op> value` from a WHERE clause of AND-ed comparisons.
struct Predicate<'a> {
    column: String,
    op: BinaryOperator,
    value: &'a Expr,
}

fn predicates(selection: Option<&Expr>) -> Result<Vec<Predicate<'_>>, SqlError> {
    fn walk<'a>(expr: &'a Expr, out: &mut Vec<Predicate<'a>>) -> Result<(), SqlError> {
        match expr {
            Expr::Nested(inner) => walk(inner, out),
            Expr::BinaryOp { left, op: BinaryOperator::And, right } => {
                walk(left, out)?;
                walk(right, out)
            }
            Expr::BinaryOp { left, op, right } => {
                let column = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("predicate {expr}")))?;
                out.push(Predicate { column, op: op.clone(), value: right });
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("predicate {other}"))),
        }
    }

    let mut out = Vec::new();
    if let Some(expr) = selection {
        walk(expr, &mut out)?;
    }
    Ok(out)
}

fn unsupported_filter(table: &str, p: &Predicate<'_>) -> SqlError {
    SqlError::Unsupported(format!("filter {} {} on {table}", p.column, p.op))
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let preds = predicates(select.selection.as_ref())?;

    match table.as_str() {
        "restaurants" => {
            let mut id = None;
            for p in &preds {
                match (p.column.as_str(), &p.op) {
                    ("id", BinaryOperator::Eq) => id = Some(parse_ulid(p.value)?),
                    _ => return Err(unsupported_filter("restaurants", p)),
                }
            }
            Ok(Command::SelectRestaurants { id })
        }
        "tables" => {
            let (mut restaurant_id, mut min_capacity) = (None, None);
            for p in &preds {
                match (p.column.as_str(), &p.op) {
                    ("restaurant_id", BinaryOperator::Eq) => restaurant_id = Some(parse_ulid(p.value)?),
                    ("capacity", BinaryOperator::GtEq) => min_capacity = Some(parse_i64(p.value)?),
                    _ => return Err(unsupported_filter("tables", p)),
                }
            }
            Ok(Command::SelectTables {
                restaurant_id: restaurant_id.ok_or(SqlError::MissingFilter("restaurant_id"))?,
                min_capacity,
            })
        }
        "availability" => {
            let (mut restaurant_id, mut start, mut end, mut guests) = (None, None, None, None);
            for p in &preds {
                match (p.column.as_str(), &p.op) {
                    ("restaurant_id", BinaryOperator::Eq) => restaurant_id = Some(parse_ulid(p.value)?),
                    ("start", BinaryOperator::GtEq) => start = Some(parse_instant(p.value)?),
                    ("end", BinaryOperator::LtEq) => end = Some(parse_instant(p.value)?),
                    ("guests", BinaryOperator::Eq) => guests = Some(parse_i64(p.value)?),
                    _ => return Err(unsupported_filter("availability", p)),
                }
            }
            Ok(Command::SelectAvailability {
                restaurant_id: restaurant_id.ok_or(SqlError::MissingFilter("restaurant_id"))?,
                start: start.ok_or(SqlError::MissingFilter("start"))?,
                end: end.ok_or(SqlError::MissingFilter("end"))?,
                guests: guests.ok_or(SqlError::MissingFilter("guests"))?,
            })
        }
        "reservations" => parse_reservation_query(&preds).map(Command::SelectReservations),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_reservation_query(preds: &[Predicate<'_>]) -> Result<ReservationQuery, SqlError> {
    if preds.is_empty() {
        return Ok(ReservationQuery::Mine);
    }
    if let [Predicate { column, op: BinaryOperator::Eq, value }] = preds
        && column == "id"
    {
        return Ok(ReservationQuery::ById(parse_ulid(value)?));
    }

    let mut filter = ReservationFilter::default();
    let (mut window_end, mut window_start) = (None, None);
    for p in preds {
        match (p.column.as_str(), &p.op) {
            ("restaurant_id", BinaryOperator::Eq) => filter.restaurant_id = Some(parse_ulid(p.value)?),
            ("table_id", BinaryOperator::Eq) => filter.table_id = Some(parse_ulid(p.value)?),
            ("user_id", BinaryOperator::Eq) => filter.user_id = Some(parse_string(p.value)?),
            // `start < t AND "end" > t'` is the overlap predicate against window [t', t).
            ("start", BinaryOperator::Lt) => window_end = Some(parse_instant(p.value)?),
            ("end", BinaryOperator::Gt) => window_start = Some(parse_instant(p.value)?),
            _ => return Err(unsupported_filter("reservations", p)),
        }
    }
    filter.window_end = window_end.ok_or(SqlError::MissingFilter("start"))?;
    filter.window_start = window_start.ok_or(SqlError::MissingFilter("end"))?;
    Ok(ReservationQuery::Overlap(filter))
}

// ── Helpers ───────────────────────────────────────────────────

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

fn single_values_row(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [row] => Ok(row.clone()),
            [] => Err(SqlError::Parse("empty VALUES".into())),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
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

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    parse_string_or_null(expr)?.ok_or_else(|| SqlError::Parse("unexpected NULL".into()))
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) | Some(Value::DoubleQuotedString(s)) => Ok(Some(s.clone())),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    parse_ulid_or_null(expr)?.ok_or_else(|| SqlError::Parse("unexpected NULL id".into()))
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ulid::from_string(s)
            .map(Some)
            .map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}"))),
        Some(other) => Err(SqlError::Parse(format!("expected ULID string, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp { op: ast::UnaryOperator::Minus, expr } = expr {
        return Ok(-parse_i64(expr)?);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
            .trim()
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
        Some(other) => Err(SqlError::Parse(format!("expected number, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

/// An instant as Unix milliseconds or an RFC 3339 timestamp string.
fn parse_instant(expr: &Expr) -> Result<Ms, SqlError> {
    if let Some(Value::SingleQuotedString(s)) = extract_value(expr) {
        let s = s.trim();
        if let Ok(ms) = s.parse::<i64>() {
            return Ok(ms);
        }
        return DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.timestamp_millis())
            .map_err(|e| SqlError::Parse(format!("bad timestamp {s:?}: {e}")));
    }
    parse_i64(expr)
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(&'static str, String),
    MissingColumn(&'static str, &'static str),
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
            SqlError::UnknownColumn(t, c) => write!(f, "{t}: unknown column {c}"),
            SqlError::MissingColumn(t, c) => write!(f, "{t}: missing column {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
