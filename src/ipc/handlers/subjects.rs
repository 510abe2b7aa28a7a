use crate::ipc::helpers::{
    optional_str, refuse_if_referenced, require_row, required_patch, required_str, row_exists,
    with_conn, HandlerErr, HandlerResult, SqlPatch,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::{json, Value};
use uuid::Uuid;

fn subjects_list(conn: &Connection, params: &Value) -> HandlerResult {
    let school_id = optional_str(params, "schoolId")?;
    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.name, s.code, s.credit_hours, s.school_id,
                    (SELECT COUNT(*) FROM class_subjects cs WHERE cs.subject_id = s.id)
             FROM subjects s
             WHERE ?1 IS NULL OR s.school_id IS NULL OR s.school_id = ?1
             ORDER BY s.name",
        )
        .map_err(HandlerErr::query)?;
    let subjects = stmt
        .query_map([&school_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "code": r.get::<_, Option<String>>(2)?,
                "creditHours": r.get::<_, f64>(3)?,
                "schoolId": r.get::<_, Option<String>>(4)?,
                "classCount": r.get::<_, i64>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "subjects": subjects }))
}

fn subjects_create(conn: &Connection, params: &Value) -> HandlerResult {
    let name = required_str(params, "name")?;
    let code = optional_str(params, "code")?;
    let school_id = optional_str(params, "schoolId")?;
    let credit_hours = match params.get("creditHours") {
        None | Some(Value::Null) => 1.0,
        Some(v) => v
            .as_f64()
            .filter(|n| n.is_finite() && *n > 0.0)
            .ok_or_else(|| HandlerErr::bad_params("creditHours must be a positive number"))?,
    };
    if let Some(id) = &school_id {
        if !row_exists(conn, "schools", id)? {
            return Err(HandlerErr::bad_params("unknown schoolId"));
        }
    }

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO subjects(id, school_id, name, code, credit_hours) VALUES(?, ?, ?, ?, ?)",
        (&id, &school_id, &name, &code, credit_hours),
    )
    .map_err(HandlerErr::db("db_insert_failed", "subjects"))?;
    Ok(json!({ "subjectId": id, "name": name }))
}

fn subjects_update(conn: &Connection, params: &Value) -> HandlerResult {
    let subject_id = required_str(params, "subjectId")?;
    let patch = required_patch(params)?;
    require_row(conn, "subjects", &subject_id, "subject")?;
    if let Some(id) = patch.get("schoolId").and_then(|v| v.as_str()) {
        if !row_exists(conn, "schools", id)? {
            return Err(HandlerErr::bad_params("unknown schoolId"));
        }
    }

    let mut update = SqlPatch::new();
    update.text(patch, "name", "name")?;
    update.nullable_text(patch, "code", "code")?;
    update.nullable_text(patch, "schoolId", "school_id")?;
    update.positive_real(patch, "creditHours", "credit_hours")?;
    update.execute(conn, "subjects", &subject_id)?;
    Ok(json!({ "ok": true }))
}

fn subjects_delete(conn: &Connection, params: &Value) -> HandlerResult {
    let subject_id = required_str(params, "subjectId")?;
    require_row(conn, "subjects", &subject_id, "subject")?;
    refuse_if_referenced(
        conn,
        &subject_id,
        &[
            ("score_records", "subject_id = ?"),
            ("class_subjects", "subject_id = ?"),
        ],
    )?;
    conn.execute("DELETE FROM subjects WHERE id = ?", [&subject_id])
        .map_err(HandlerErr::db("db_delete_failed", "subjects"))?;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "subjects.list" => Some(with_conn(state, req, subjects_list)),
        "subjects.create" => Some(with_conn(state, req, subjects_create)),
        "subjects.update" => Some(with_conn(state, req, subjects_update)),
        "subjects.delete" => Some(with_conn(state, req, subjects_delete)),
        _ => None,
    }
}
