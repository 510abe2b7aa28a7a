use crate::ipc::helpers::{
    display_name, optional_str, refuse_if_referenced, require_row, required_patch, required_str,
    row_exists, with_conn, HandlerErr, HandlerResult, SqlPatch,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use serde_json::{json, Value};
use uuid::Uuid;

fn check_school(conn: &Connection, school_id: Option<&str>) -> Result<(), HandlerErr> {
    if let Some(id) = school_id {
        if !row_exists(conn, "schools", id)? {
            return Err(HandlerErr::bad_params("unknown schoolId").with_details(json!({ "schoolId": id })));
        }
    }
    Ok(())
}

fn teachers_list(conn: &Connection, params: &Value) -> HandlerResult {
    let school_id = optional_str(params, "schoolId")?;
    let mut sql = String::from(
        "SELECT id, school_id, last_name, first_name, email, phone, active
         FROM teachers",
    );
    let mut binds = Vec::new();
    if let Some(id) = &school_id {
        sql.push_str(" WHERE school_id = ?");
        binds.push(SqlValue::Text(id.clone()));
    }
    sql.push_str(" ORDER BY last_name, first_name");

    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::query)?;
    let teachers = stmt
        .query_map(params_from_iter(binds), |r| {
            let last: String = r.get(2)?;
            let first: String = r.get(3)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "schoolId": r.get::<_, Option<String>>(1)?,
                "lastName": last,
                "firstName": first,
                "displayName": display_name(&last, &first),
                "email": r.get::<_, Option<String>>(4)?,
                "phone": r.get::<_, Option<String>>(5)?,
                "active": r.get::<_, i64>(6)? != 0,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "teachers": teachers }))
}

fn teachers_create(conn: &Connection, params: &Value) -> HandlerResult {
    let last_name = required_str(params, "lastName")?;
    let first_name = required_str(params, "firstName")?;
    let school_id = optional_str(params, "schoolId")?;
    check_school(conn, school_id.as_deref())?;
    let email = optional_str(params, "email")?;
    let phone = optional_str(params, "phone")?;

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO teachers(id, school_id, last_name, first_name, email, phone, active)
         VALUES(?, ?, ?, ?, ?, ?, 1)",
        (&id, &school_id, &last_name, &first_name, &email, &phone),
    )
    .map_err(HandlerErr::db("db_insert_failed", "teachers"))?;
    Ok(json!({ "teacherId": id }))
}

fn teachers_update(conn: &Connection, params: &Value) -> HandlerResult {
    let teacher_id = required_str(params, "teacherId")?;
    let patch = required_patch(params)?;
    require_row(conn, "teachers", &teacher_id, "teacher")?;
    if patch.contains_key("schoolId") {
        check_school(conn, patch.get("schoolId").and_then(|v| v.as_str()))?;
    }

    let mut update = SqlPatch::new();
    update.text(patch, "lastName", "last_name")?;
    update.text(patch, "firstName", "first_name")?;
    update.nullable_text(patch, "schoolId", "school_id")?;
    update.nullable_text(patch, "email", "email")?;
    update.nullable_text(patch, "phone", "phone")?;
    update.bool(patch, "active", "active")?;
    update.execute(conn, "teachers", &teacher_id)?;
    Ok(json!({ "ok": true }))
}

fn teachers_delete(conn: &Connection, params: &Value) -> HandlerResult {
    let teacher_id = required_str(params, "teacherId")?;
    require_row(conn, "teachers", &teacher_id, "teacher")?;
    refuse_if_referenced(
        conn,
        &teacher_id,
        &[
            ("classes", "form_teacher_id = ?"),
            ("class_subjects", "teacher_id = ?"),
        ],
    )?;
    conn.execute("DELETE FROM teachers WHERE id = ?", [&teacher_id])
        .map_err(HandlerErr::db("db_delete_failed", "teachers"))?;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "teachers.list" => Some(with_conn(state, req, teachers_list)),
        "teachers.create" => Some(with_conn(state, req, teachers_create)),
        "teachers.update" => Some(with_conn(state, req, teachers_update)),
        "teachers.delete" => Some(with_conn(state, req, teachers_delete)),
        _ => None,
    }
}
