use crate::ipc::helpers::{
    optional_i64, optional_str, refuse_if_referenced, require_row, required_patch, required_str,
    with_conn, HandlerErr, HandlerResult, SqlPatch,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

const MAX_TERMS: i64 = 6;

fn name_taken(conn: &Connection, name: &str, except_id: Option<&str>) -> Result<bool, HandlerErr> {
    let other: Option<String> = conn
        .query_row(
            "SELECT id FROM sessions WHERE name = ? COLLATE NOCASE",
            [name],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::query)?;
    Ok(match (other, except_id) {
        (Some(o), Some(me)) => o != me,
        (Some(_), None) => true,
        (None, _) => false,
    })
}

fn sessions_list(conn: &Connection, _params: &Value) -> HandlerResult {
    let mut stmt = conn
        .prepare(
            "SELECT id, name, start_date, end_date, term_count, is_current
             FROM sessions
             ORDER BY COALESCE(start_date, ''), name",
        )
        .map_err(HandlerErr::query)?;
    let sessions = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "startDate": r.get::<_, Option<String>>(2)?,
                "endDate": r.get::<_, Option<String>>(3)?,
                "termCount": r.get::<_, i64>(4)?,
                "isCurrent": r.get::<_, i64>(5)? != 0,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "sessions": sessions }))
}

fn sessions_create(conn: &Connection, params: &Value) -> HandlerResult {
    let name = required_str(params, "name")?;
    let term_count = optional_i64(params, "termCount")?.unwrap_or(3);
    if !(1..=MAX_TERMS).contains(&term_count) {
        return Err(HandlerErr::bad_params(format!("termCount must be in 1..={}", MAX_TERMS)));
    }
    let start_date = optional_str(params, "startDate")?;
    let end_date = optional_str(params, "endDate")?;
    if name_taken(conn, &name, None)? {
        return Err(HandlerErr::new("conflict", "session name already exists")
            .with_details(json!({ "name": name })));
    }

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO sessions(id, name, start_date, end_date, term_count, is_current)
         VALUES(?, ?, ?, ?, ?, 0)",
        (&id, &name, &start_date, &end_date, term_count),
    )
    .map_err(HandlerErr::db("db_insert_failed", "sessions"))?;
    Ok(json!({ "sessionId": id, "name": name, "termCount": term_count }))
}

fn sessions_update(conn: &Connection, params: &Value) -> HandlerResult {
    let session_id = required_str(params, "sessionId")?;
    let patch = required_patch(params)?;
    require_row(conn, "sessions", &session_id, "session")?;

    if let Some(name) = patch.get("name").and_then(|v| v.as_str()) {
        if name_taken(conn, name.trim(), Some(&session_id))? {
            return Err(HandlerErr::new("conflict", "session name already exists")
                .with_details(json!({ "name": name.trim() })));
        }
    }
    if let Some(n) = patch.get("termCount").and_then(|v| v.as_i64()) {
        let used: Option<i64> = conn
            .query_row(
                "SELECT MAX(term) FROM score_records WHERE session_id = ?",
                [&session_id],
                |r| r.get(0),
            )
            .map_err(HandlerErr::query)?;
        if let Some(max_used) = used.filter(|m| *m > n) {
            return Err(
                HandlerErr::new("conflict", "scores exist for terms beyond the new termCount")
                    .with_details(json!({ "termCount": n, "highestTermInUse": max_used })),
            );
        }
    }

    let mut update = SqlPatch::new();
    update.text(patch, "name", "name")?;
    update.int_range(patch, "termCount", "term_count", 1, MAX_TERMS)?;
    update.nullable_text(patch, "startDate", "start_date")?;
    update.nullable_text(patch, "endDate", "end_date")?;
    update.execute(conn, "sessions", &session_id)?;
    Ok(json!({ "ok": true }))
}

fn sessions_delete(conn: &Connection, params: &Value) -> HandlerResult {
    let session_id = required_str(params, "sessionId")?;
    require_row(conn, "sessions", &session_id, "session")?;
    refuse_if_referenced(
        conn,
        &session_id,
        &[
            ("score_records", "session_id = ?"),
            ("mark_distributions", "session_id = ?"),
            ("attendance_records", "session_id = ?"),
            ("trait_ratings", "session_id = ?"),
            ("promotion_overrides", "session_id = ?"),
            ("promotion_snapshots", "session_id = ?"),
        ],
    )?;
    conn.execute("DELETE FROM sessions WHERE id = ?", [&session_id])
        .map_err(HandlerErr::db("db_delete_failed", "sessions"))?;
    Ok(json!({ "ok": true }))
}

fn sessions_set_current(conn: &Connection, params: &Value) -> HandlerResult {
    let session_id = required_str(params, "sessionId")?;
    require_row(conn, "sessions", &session_id, "session")?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute("UPDATE sessions SET is_current = 0 WHERE is_current <> 0", [])
        .map_err(HandlerErr::db("db_update_failed", "sessions"))?;
    tx.execute("UPDATE sessions SET is_current = 1 WHERE id = ?", [&session_id])
        .map_err(HandlerErr::db("db_update_failed", "sessions"))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tracing::info!(session = %session_id, "current session changed");
    Ok(json!({ "ok": true, "sessionId": session_id }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "sessions.list" => Some(with_conn(state, req, sessions_list)),
        "sessions.create" => Some(with_conn(state, req, sessions_create)),
        "sessions.update" => Some(with_conn(state, req, sessions_update)),
        "sessions.delete" => Some(with_conn(state, req, sessions_delete)),
        "sessions.setCurrent" => Some(with_conn(state, req, sessions_set_current)),
        _ => None,
    }
}
