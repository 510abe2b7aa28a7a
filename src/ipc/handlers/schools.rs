use crate::ipc::helpers::{
    optional_str, refuse_if_referenced, require_row, required_patch, required_str, with_conn,
    HandlerErr, HandlerResult, SqlPatch,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::{json, Value};
use uuid::Uuid;

fn schools_list(conn: &Connection, _params: &Value) -> HandlerResult {
    let mut stmt = conn
        .prepare(
            "SELECT
               s.id, s.name, s.code, s.address,
               (SELECT COUNT(*) FROM classes c WHERE c.school_id = s.id) AS class_count
             FROM schools s
             ORDER BY s.name",
        )
        .map_err(HandlerErr::query)?;
    let schools = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "code": r.get::<_, Option<String>>(2)?,
                "address": r.get::<_, Option<String>>(3)?,
                "classCount": r.get::<_, i64>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "schools": schools }))
}

fn schools_create(conn: &Connection, params: &Value) -> HandlerResult {
    let name = required_str(params, "name")?;
    let code = optional_str(params, "code")?;
    let address = optional_str(params, "address")?;
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO schools(id, name, code, address) VALUES(?, ?, ?, ?)",
        (&id, &name, &code, &address),
    )
    .map_err(HandlerErr::db("db_insert_failed", "schools"))?;
    Ok(json!({ "schoolId": id, "name": name }))
}

fn schools_update(conn: &Connection, params: &Value) -> HandlerResult {
    let school_id = required_str(params, "schoolId")?;
    let patch = required_patch(params)?;
    require_row(conn, "schools", &school_id, "school")?;

    let mut update = SqlPatch::new();
    update.text(patch, "name", "name")?;
    update.nullable_text(patch, "code", "code")?;
    update.nullable_text(patch, "address", "address")?;
    update.execute(conn, "schools", &school_id)?;
    Ok(json!({ "ok": true }))
}

fn schools_delete(conn: &Connection, params: &Value) -> HandlerResult {
    let school_id = required_str(params, "schoolId")?;
    require_row(conn, "schools", &school_id, "school")?;
    refuse_if_referenced(
        conn,
        &school_id,
        &[
            ("classes", "school_id = ?"),
            ("teachers", "school_id = ?"),
            ("subjects", "school_id = ?"),
            ("mark_distributions", "school_id = ?"),
        ],
    )?;
    conn.execute("DELETE FROM schools WHERE id = ?", [&school_id])
        .map_err(HandlerErr::db("db_delete_failed", "schools"))?;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "schools.list" => Some(with_conn(state, req, schools_list)),
        "schools.create" => Some(with_conn(state, req, schools_create)),
        "schools.update" => Some(with_conn(state, req, schools_update)),
        "schools.delete" => Some(with_conn(state, req, schools_delete)),
        _ => None,
    }
}
