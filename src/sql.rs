use std::str::FromStr;

use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject,
    TableWithJoins, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::keywords::Keyword;
use sqlparser::parser::{Parser, ParserError};
use thiserror::Error;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
///
/// Booking dates and times stay textual here; the engine parses them so a
/// malformed date is reported as invalid input rather than a syntax error.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertUser {
        id: Ulid,
        username: String,
        role: Role,
        email: Option<String>,
    },
    DeleteUser {
        id: Ulid,
    },
    InsertRoom {
        id: Ulid,
        name: String,
        capacity: u32,
        category: RoomCategory,
        status: RoomStatus,
    },
    UpdateRoomStatus {
        id: Ulid,
        status: RoomStatus,
    },
    InsertBooking {
        id: Ulid,
        room_id: Ulid,
        date: String,
        start: String,
        end: String,
        purpose: Option<String>,
    },
    DeleteBooking {
        id: Ulid,
    },
    SelectUsers,
    SelectRooms {
        status: Option<RoomStatus>,
    },
    SelectBookings {
        room_id: Option<Ulid>,
        date: Option<String>,
        user_id: Option<Ulid>,
    },
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
        Statement::Update { .. } => parse_update(sql),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

/// Default column order used when an INSERT names no columns.
fn default_columns(table: &str) -> &'static [&'static str] {
    match table {
        "users" => &["id", "username", "role", "email"],
        "rooms" => &["id", "room_name", "capacity", "room_type", "status"],
        "bookings" => &["id", "room_id", "booking_date", "start_time", "end_time", "purpose"],
        _ => &[],
    }
}

/// One VALUES row addressed by column name.
struct Row {
    table: &'static str,
    cells: Vec<(String, Expr)>,
}

impl Row {
    fn get(&self, col: &str) -> Option<&Expr> {
        self.cells.iter().find(|(c, _)| c == col).map(|(_, e)| e)
    }

    fn required(&self, col: &'static str) -> Result<&Expr, SqlError> {
        self.get(col).ok_or(SqlError::MissingColumn(self.table, col))
    }

    fn optional_string(&self, col: &str) -> Result<Option<String>, SqlError> {
        self.get(col).map_or(Ok(None), parse_string_or_null)
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let name = insert_table_name(insert)?;
    let table = known_table(&name)?;
    let row = insert_row(insert, table)?;

    match table {
        "users" => Ok(Command::InsertUser {
            id: parse_ulid(row.required("id")?)?,
            username: parse_string(row.required("username")?)?,
            role: parse_enum(row.required("role")?)?,
            email: row.optional_string("email")?,
        }),
        "rooms" => Ok(Command::InsertRoom {
            id: parse_ulid(row.required("id")?)?,
            name: parse_string(row.required("room_name")?)?,
            capacity: parse_u32(row.required("capacity")?)?,
            category: parse_enum(row.required("room_type")?)?,
            status: match row.optional_string("status")? {
                Some(s) => s.parse()?,
                None => RoomStatus::default(),
            },
        }),
        "bookings" => Ok(Command::InsertBooking {
            id: parse_ulid(row.required("id")?)?,
            room_id: parse_ulid(row.required("room_id")?)?,
            date: parse_string(row.required("booking_date")?)?,
            start: parse_string(row.required("start_time")?)?,
            end: parse_string(row.required("end_time")?)?,
            purpose: row.optional_string("purpose")?,
        }),
        _ => Err(SqlError::UnknownTable(name)),
    }
}

fn insert_row(insert: &ast::Insert, table: &'static str) -> Result<Row, SqlError> {
    let values = extract_insert_values(insert)?;
    let known = default_columns(table);
    let columns: Vec<String> = if insert.columns.is_empty() {
        known.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if let Some(col) = columns.iter().find(|c| !known.contains(&c.as_str())) {
        return Err(SqlError::Unsupported(format!("column {table}.{col}")));
    }
    if let Some((i, col)) = columns.iter().enumerate().find(|(i, c)| columns[..*i].contains(*c)) {
        return Err(SqlError::Parse(format!("column {col} given twice (position {})", i + 1)));
    }
    // Positional inserts may omit trailing optional columns.
    let arity_ok = if insert.columns.is_empty() {
        values.len() <= columns.len()
    } else {
        values.len() == columns.len()
    };
    if !arity_ok {
        return Err(SqlError::WrongArity(table, columns.len(), values.len()));
    }
    Ok(Row {
        table,
        cells: columns.into_iter().zip(values).collect(),
    })
}

fn known_table(name: &str) -> Result<&'static str, SqlError> {
    match name {
        "users" => Ok("users"),
        "rooms" => Ok("rooms"),
        "bookings" => Ok("bookings"),
        _ => Err(SqlError::UnknownTable(name.to_string())),
    }
}

// ── DELETE / UPDATE ───────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "users" => Ok(Command::DeleteUser { id }),
        "bookings" => Ok(Command::DeleteBooking { id }),
        "rooms" => Err(SqlError::Unsupported("rooms cannot be deleted".into())),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Re-read an UPDATE through the parser's clause helpers; only
/// `UPDATE <table> SET ... WHERE ...` is accepted.
fn parse_update(sql: &str) -> Result<Command, SqlError> {
    let (table, assignments, selection) = update_clauses(sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let name = table_factor_name(&table.relation)?;
    if name != "rooms" {
        return Err(SqlError::Unsupported(format!("UPDATE {name}")));
    }

    let mut status = None;
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        };
        match column.as_deref() {
            Some("status") => status = Some(parse_enum(&assignment.value)?),
            Some(other) => return Err(SqlError::Unsupported(format!("UPDATE rooms SET {other}"))),
            None => return Err(SqlError::Parse("unsupported assignment target".into())),
        }
    }

    Ok(Command::UpdateRoomStatus {
        id: extract_where_id(&selection)?,
        status: status.ok_or(SqlError::MissingColumn("rooms", "status"))?,
    })
}

fn update_clauses(sql: &str) -> Result<(TableWithJoins, Vec<ast::Assignment>, Option<Expr>), ParserError> {
    let dialect = PostgreSqlDialect {};
    let mut parser = Parser::new(&dialect).try_with_sql(sql)?;
    if !parser.parse_keyword(Keyword::UPDATE) {
        return Err(ParserError::ParserError("expected UPDATE".into()));
    }
    let table = parser.parse_table_and_joins()?;
    if !parser.parse_keyword(Keyword::SET) {
        return Err(ParserError::ParserError("expected SET".into()));
    }
    let assignments = parser.parse_comma_separated(Parser::parse_assignment)?;
    let selection = if parser.parse_keyword(Keyword::WHERE) {
        Some(parser.parse_expr()?)
    } else {
        None
    };
    Ok((table, assignments, selection))
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters)?;
    }
    let filter = |col: &str| filters.iter().find(|(c, _)| c == col).map(|(_, e)| e);
    if let Some((col, _)) = filters
        .iter()
        .find(|(c, _)| !allowed_filters(&table).contains(&c.as_str()))
    {
        return Err(SqlError::Unsupported(format!("filter on {table}.{col}")));
    }

    match table.as_str() {
        "users" => Ok(Command::SelectUsers),
        "rooms" => Ok(Command::SelectRooms {
            status: filter("status").map(parse_enum).transpose()?,
        }),
        "bookings" => Ok(Command::SelectBookings {
            room_id: filter("room_id").map(|e| parse_ulid(e)).transpose()?,
            date: filter("booking_date").map(|e| parse_string(e)).transpose()?,
            user_id: filter("user_id").map(|e| parse_ulid(e)).transpose()?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn allowed_filters(table: &str) -> &'static [&'static str] {
    match table {
        "rooms" => &["status"],
        "bookings" => &["room_id", "booking_date", "user_id"],
        _ => &[],
    }
}

/// Flatten `a = 'x' AND b = 'y'` into `[(a, 'x'), (b, 'y')]`.
fn collect_eq_filters(expr: &Expr, out: &mut Vec<(String, Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_eq_filters(left, out)?;
            collect_eq_filters(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let col = expr_column_name(left).ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
            out.push((col, right.as_ref().clone()));
            Ok(())
        }
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        other => Err(SqlError::Unsupported(format!("WHERE {other}"))),
    }
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

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert.source.as_ref().ok_or(SqlError::Parse("no VALUES".into()))?;
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
    match selection {
        Some(Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        }) if expr_column_name(left).as_deref() == Some("id") => parse_ulid(right),
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

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string(expr).map(Some),
    }
}

fn parse_enum<T: FromStr<Err = InvalidValue>>(expr: &Expr) -> Result<T, SqlError> {
    Ok(parse_string(expr)?.parse()?)
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let raw = match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s,
        _ => return Err(SqlError::Parse(format!("expected number, got {expr}"))),
    };
    raw.parse()
        .map_err(|_| SqlError::Parse(format!("{raw} is not a valid capacity")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("{0}: missing column {1}")]
    MissingColumn(&'static str, &'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error(transparent)]
    Invalid(#[from] InvalidValue),
}
