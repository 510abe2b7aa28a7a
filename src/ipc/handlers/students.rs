use crate::db;
use crate::ipc::helpers::{
    display_name, optional_str, refuse_if_referenced, require_row, required_patch, required_str,
    row_exists, with_conn, HandlerErr, HandlerResult, SqlPatch,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

const GENDERS: &[&str] = &["male", "female"];

fn parse_gender(v: Option<String>) -> Result<Option<String>, HandlerErr> {
    match v {
        None => Ok(None),
        Some(g) => {
            let g = g.to_ascii_lowercase();
            if GENDERS.contains(&g.as_str()) {
                Ok(Some(g))
            } else {
                Err(HandlerErr::bad_params("gender must be one of: male, female"))
            }
        }
    }
}

fn admission_no_taken(conn: &Connection, admission_no: &str, except_id: Option<&str>) -> Result<bool, HandlerErr> {
    let other: Option<String> = conn
        .query_row(
            "SELECT id FROM students WHERE admission_no = ? LIMIT 1",
            [admission_no],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::query)?;
    Ok(other.is_some_and(|o| Some(o.as_str()) != except_id))
}

fn students_list(conn: &Connection, params: &Value) -> HandlerResult {
    let class_id = required_str(params, "classId")?;
    let include_inactive = params
        .get("includeInactive")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);
    require_row(conn, "classes", &class_id, "class")?;

    let mut stmt = conn
        .prepare(
            "SELECT id, last_name, first_name, admission_no, gender, birth_date, active, sort_order
             FROM students
             WHERE class_id = ?
             ORDER BY sort_order",
        )
        .map_err(HandlerErr::query)?;
    let students = stmt
        .query_map([&class_id], |r| {
            let last: String = r.get(1)?;
            let first: String = r.get(2)?;
            let active = r.get::<_, i64>(6)? != 0;
            Ok((
                active,
                json!({
                    "id": r.get::<_, String>(0)?,
                    "lastName": last,
                    "firstName": first,
                    "displayName": display_name(&last, &first),
                    "admissionNo": r.get::<_, Option<String>>(3)?,
                    "gender": r.get::<_, Option<String>>(4)?,
                    "birthDate": r.get::<_, Option<String>>(5)?,
                    "active": active,
                    "sortOrder": r.get::<_, i64>(7)?,
                }),
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?
        .into_iter()
        .filter(|(active, _)| include_inactive || *active)
        .map(|(_, v)| v)
        .collect::<Vec<_>>();
    Ok(json!({ "classId": class_id, "students": students }))
}

fn students_create(conn: &Connection, params: &Value) -> HandlerResult {
    let class_id = required_str(params, "classId")?;
    let last_name = required_str(params, "lastName")?;
    let first_name = required_str(params, "firstName")?;
    let admission_no = optional_str(params, "admissionNo")?;
    let gender = parse_gender(optional_str(params, "gender")?)?;
    let birth_date = optional_str(params, "birthDate")?;
    let active = params.get("active").and_then(|v| v.as_bool()).unwrap_or(true);
    require_row(conn, "classes", &class_id, "class")?;
    if let Some(no) = &admission_no {
        if admission_no_taken(conn, no, None)? {
            return Err(HandlerErr::new("conflict", "admission number already in use")
                .with_details(json!({ "admissionNo": no })));
        }
    }

    let sort_order: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM students WHERE class_id = ?",
            [&class_id],
            |r| r.get(0),
        )
        .map_err(HandlerErr::query)?;
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, class_id, last_name, first_name, admission_no, gender,
                              birth_date, active, sort_order, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &class_id,
            &last_name,
            &first_name,
            &admission_no,
            &gender,
            &birth_date,
            active as i64,
            sort_order,
            db::now_rfc3339(),
        ),
    )
    .map_err(HandlerErr::db("db_insert_failed", "students"))?;
    Ok(json!({ "studentId": id, "sortOrder": sort_order }))
}

fn students_update(conn: &Connection, params: &Value) -> HandlerResult {
    let student_id = required_str(params, "studentId")?;
    let patch = required_patch(params)?;
    require_row(conn, "students", &student_id, "student")?;

    let mut update = SqlPatch::new();
    update.text(patch, "lastName", "last_name")?;
    update.text(patch, "firstName", "first_name")?;
    update.nullable_text(patch, "admissionNo", "admission_no")?;
    update.nullable_text(patch, "birthDate", "birth_date")?;
    update.bool(patch, "active", "active")?;

    if let Some(no) = patch.get("admissionNo").and_then(|v| v.as_str()).map(str::trim) {
        if !no.is_empty() && admission_no_taken(conn, no, Some(&student_id))? {
            return Err(HandlerErr::new("conflict", "admission number already in use")
                .with_details(json!({ "admissionNo": no })));
        }
    }
    if let Some(v) = patch.get("gender") {
        let g = if v.is_null() {
            None
        } else {
            let s = v
                .as_str()
                .ok_or_else(|| HandlerErr::bad_params("gender must be a string or null"))?;
            parse_gender(Some(s.trim().to_string()).filter(|s| !s.is_empty()))?
        };
        update.set("gender", g.map(SqlValue::Text).unwrap_or(SqlValue::Null));
    }
    if let Some(v) = patch.get("classId") {
        let class_id = v
            .as_str()
            .ok_or_else(|| HandlerErr::bad_params("classId must be a string"))?;
        if !row_exists(conn, "classes", class_id)? {
            return Err(HandlerErr::bad_params("unknown classId"));
        }
        let current: String = conn
            .query_row("SELECT class_id FROM students WHERE id = ?", [&student_id], |r| r.get(0))
            .map_err(HandlerErr::query)?;
        if current != class_id {
            let sort_order: i64 = conn
                .query_row(
                    "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM students WHERE class_id = ?",
                    [class_id],
                    |r| r.get(0),
                )
                .map_err(HandlerErr::query)?;
            update.set("class_id", SqlValue::Text(class_id.to_string()));
            update.set("sort_order", SqlValue::Integer(sort_order));
        }
    }

    if update.is_empty() {
        return Ok(json!({ "ok": true, "changed": false }));
    }
    update.set("updated_at", SqlValue::Text(db::now_rfc3339()));
    update.execute(conn, "students", &student_id)?;
    Ok(json!({ "ok": true, "changed": true }))
}

fn students_delete(conn: &Connection, params: &Value) -> HandlerResult {
    let student_id = required_str(params, "studentId")?;
    require_row(conn, "students", &student_id, "student")?;
    refuse_if_referenced(
        conn,
        &student_id,
        &[
            ("score_records", "student_id = ?"),
            ("attendance_records", "student_id = ?"),
            ("trait_ratings", "student_id = ?"),
            ("promotion_overrides", "student_id = ?"),
        ],
    )?;
    conn.execute("DELETE FROM students WHERE id = ?", [&student_id])
        .map_err(HandlerErr::db("db_delete_failed", "students"))?;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(with_conn(state, req, students_list)),
        "students.create" => Some(with_conn(state, req, students_create)),
        "students.update" => Some(with_conn(state, req, students_update)),
        "students.delete" => Some(with_conn(state, req, students_delete)),
        _ => None,
    }
}
