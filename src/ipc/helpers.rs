use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::results::CalcError;
pub use crate::results::display_name;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::{json, Map};

#[derive(Debug)]
pub struct HandlerErr {
    pub code: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new("bad_params", message)
    }

    pub fn not_found(what: &str) -> Self {
        Self::new("not_found", format!("{} not found", what))
    }

    /// Maps a SQLite failure to `code`, tagging the table involved.
    pub fn db(code: &'static str, table: &'static str) -> impl FnOnce(rusqlite::Error) -> HandlerErr {
        move |e| {
            tracing::error!(code, table, error = %e, "database operation failed");
            HandlerErr::new(code, e.to_string()).with_details(json!({ "table": table }))
        }
    }

    pub fn query(e: rusqlite::Error) -> HandlerErr {
        tracing::error!(error = %e, "query failed");
        HandlerErr::new("db_query_failed", e.to_string())
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, &self.code, self.message, self.details)
    }
}

impl From<CalcError> for HandlerErr {
    fn from(e: CalcError) -> Self {
        Self {
            code: e.code,
            message: e.message,
            details: e.details,
        }
    }
}

pub type HandlerResult = Result<serde_json::Value, HandlerErr>;

pub fn db_conn(state: &AppState) -> Result<&Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

/// Run a workspace-bound handler and wrap its outcome in a response envelope.
pub fn with_conn(
    state: &AppState,
    req: &Request,
    f: fn(&Connection, &serde_json::Value) -> HandlerResult,
) -> serde_json::Value {
    let result = db_conn(state).and_then(|conn| f(conn, &req.params));
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => {
            tracing::debug!(method = %req.method, code = %e.code, "request failed");
            e.response(&req.id)
        }
    }
}

pub fn required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

/// Absent, null and blank all read as `None`; any other non-string is rejected.
pub fn optional_str(params: &serde_json::Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => {
            let s = v
                .as_str()
                .ok_or_else(|| HandlerErr::bad_params(format!("{} must be a string", key)))?;
            let t = s.trim();
            Ok(if t.is_empty() { None } else { Some(t.to_string()) })
        }
    }
}

pub fn optional_i64(params: &serde_json::Value, key: &str) -> Result<Option<i64>, HandlerErr> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be an integer", key))),
    }
}

pub fn required_i64(params: &serde_json::Value, key: &str) -> Result<i64, HandlerErr> {
    optional_i64(params, key)?.ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn required_patch<'a>(params: &'a serde_json::Value) -> Result<&'a Map<String, serde_json::Value>, HandlerErr> {
    params
        .get("patch")
        .and_then(|v| v.as_object())
        .ok_or_else(|| HandlerErr::bad_params("patch must be an object"))
}

/// `table` is always a literal from the calling handler.
pub fn row_exists(conn: &Connection, table: &str, id: &str) -> Result<bool, HandlerErr> {
    let sql = format!("SELECT 1 FROM {} WHERE id = ?", table);
    conn.query_row(&sql, [id], |r| r.get::<_, i64>(0))
        .optional()
        .map(|v| v.is_some())
        .map_err(HandlerErr::query)
}

pub fn require_row(conn: &Connection, table: &str, id: &str, what: &str) -> Result<(), HandlerErr> {
    if row_exists(conn, table, id)? {
        Ok(())
    } else {
        Err(HandlerErr::not_found(what).with_details(json!({ "id": id })))
    }
}

/// Refuse a delete while any `(table, where-clause)` still has rows pointing at `id`.
pub fn refuse_if_referenced(
    conn: &Connection,
    id: &str,
    references: &[(&str, &str)],
) -> Result<(), HandlerErr> {
    for (table, clause) in references {
        let sql = format!("SELECT COUNT(*) FROM {} WHERE {}", table, clause);
        let n: i64 = conn
            .query_row(&sql, [id], |r| r.get(0))
            .map_err(HandlerErr::query)?;
        if n > 0 {
            return Err(
                HandlerErr::new("conflict", format!("still referenced by {}", table))
                    .with_details(json!({ "table": table, "count": n })),
            );
        }
    }
    Ok(())
}

/// Collects `column = ?` assignments from a JSON patch for a single-row UPDATE.
#[derive(Default)]
pub struct SqlPatch {
    sets: Vec<String>,
    binds: Vec<Value>,
}

impl SqlPatch {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, column: &str, value: Value) {
        self.sets.push(format!("{} = ?", column));
        self.binds.push(value);
    }

    pub fn text(&mut self, patch: &Map<String, serde_json::Value>, key: &str, column: &str) -> Result<(), HandlerErr> {
        if let Some(v) = patch.get(key) {
            let s = v
                .as_str()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| HandlerErr::bad_params(format!("{} must be a non-empty string", key)))?;
            self.push(column, Value::Text(s.to_string()));
        }
        Ok(())
    }

    pub fn nullable_text(
        &mut self,
        patch: &Map<String, serde_json::Value>,
        key: &str,
        column: &str,
    ) -> Result<(), HandlerErr> {
        if let Some(v) = patch.get(key) {
            let value = if v.is_null() {
                Value::Null
            } else {
                let s = v
                    .as_str()
                    .ok_or_else(|| HandlerErr::bad_params(format!("{} must be a string or null", key)))?
                    .trim();
                if s.is_empty() {
                    Value::Null
                } else {
                    Value::Text(s.to_string())
                }
            };
            self.push(column, value);
        }
        Ok(())
    }

    pub fn int_range(
        &mut self,
        patch: &Map<String, serde_json::Value>,
        key: &str,
        column: &str,
        min: i64,
        max: i64,
    ) -> Result<(), HandlerErr> {
        if let Some(v) = patch.get(key) {
            let n = v
                .as_i64()
                .filter(|n| (min..=max).contains(n))
                .ok_or_else(|| HandlerErr::bad_params(format!("{} must be an integer in {}..={}", key, min, max)))?;
            self.push(column, Value::Integer(n));
        }
        Ok(())
    }

    pub fn positive_real(
        &mut self,
        patch: &Map<String, serde_json::Value>,
        key: &str,
        column: &str,
    ) -> Result<(), HandlerErr> {
        if let Some(v) = patch.get(key) {
            let n = v
                .as_f64()
                .filter(|n| n.is_finite() && *n > 0.0)
                .ok_or_else(|| HandlerErr::bad_params(format!("{} must be a positive number", key)))?;
            self.push(column, Value::Real(n));
        }
        Ok(())
    }

    pub fn bool(&mut self, patch: &Map<String, serde_json::Value>, key: &str, column: &str) -> Result<(), HandlerErr> {
        if let Some(v) = patch.get(key) {
            let b = v
                .as_bool()
                .ok_or_else(|| HandlerErr::bad_params(format!("{} must be a boolean", key)))?;
            self.push(column, Value::Integer(b as i64));
        }
        Ok(())
    }

    /// Raw value already validated by the caller.
    pub fn set(&mut self, column: &str, value: Value) {
        self.push(column, value);
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    pub fn execute(mut self, conn: &Connection, table: &'static str, id: &str) -> Result<usize, HandlerErr> {
        if self.sets.is_empty() {
            return Ok(0);
        }
        let sql = format!("UPDATE {} SET {} WHERE id = ?", table, self.sets.join(", "));
        self.binds.push(Value::Text(id.to_string()));
        conn.execute(&sql, params_from_iter(self.binds))
            .map_err(HandlerErr::db("db_update_failed", table))
    }
}
