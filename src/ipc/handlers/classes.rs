use crate::ipc::helpers::{
    display_name, optional_i64, optional_str, require_row, required_patch, required_str,
    row_exists, with_conn, HandlerErr, HandlerResult, SqlPatch,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;
use serde_json::{json, Value};
use std::collections::HashSet;
use uuid::Uuid;

fn check_ref(conn: &Connection, table: &str, key: &str, id: Option<&str>) -> Result<(), HandlerErr> {
    if let Some(id) = id {
        if !row_exists(conn, table, id)? {
            return Err(HandlerErr::bad_params(format!("unknown {}", key)).with_details(json!({ key: id })));
        }
    }
    Ok(())
}

fn classes_list(conn: &Connection, params: &Value) -> HandlerResult {
    let school_id = optional_str(params, "schoolId")?;
    // Correlated subqueries keep the counts independent of each other.
    let mut stmt = conn
        .prepare(
            "SELECT
               c.id, c.name, c.school_id, c.level, c.next_class_id, c.form_teacher_id,
               (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id AND s.active = 1),
               (SELECT COUNT(*) FROM class_subjects cs WHERE cs.class_id = c.id)
             FROM classes c
             WHERE ?1 IS NULL OR c.school_id = ?1
             ORDER BY c.level IS NULL, c.level, c.name",
        )
        .map_err(HandlerErr::query)?;
    let classes = stmt
        .query_map([&school_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "schoolId": r.get::<_, Option<String>>(2)?,
                "level": r.get::<_, Option<i64>>(3)?,
                "nextClassId": r.get::<_, Option<String>>(4)?,
                "formTeacherId": r.get::<_, Option<String>>(5)?,
                "studentCount": r.get::<_, i64>(6)?,
                "subjectCount": r.get::<_, i64>(7)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "classes": classes }))
}

fn classes_create(conn: &Connection, params: &Value) -> HandlerResult {
    let name = required_str(params, "name")?;
    let school_id = optional_str(params, "schoolId")?;
    let level = optional_i64(params, "level")?;
    let next_class_id = optional_str(params, "nextClassId")?;
    let form_teacher_id = optional_str(params, "formTeacherId")?;
    check_ref(conn, "schools", "schoolId", school_id.as_deref())?;
    check_ref(conn, "classes", "nextClassId", next_class_id.as_deref())?;
    check_ref(conn, "teachers", "formTeacherId", form_teacher_id.as_deref())?;

    let class_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO classes(id, school_id, name, level, next_class_id, form_teacher_id)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&class_id, &school_id, &name, level, &next_class_id, &form_teacher_id),
    )
    .map_err(HandlerErr::db("db_insert_failed", "classes"))?;
    Ok(json!({ "classId": class_id, "name": name }))
}

fn classes_update(conn: &Connection, params: &Value) -> HandlerResult {
    let class_id = required_str(params, "classId")?;
    let patch = required_patch(params)?;
    require_row(conn, "classes", &class_id, "class")?;

    for (key, table) in [
        ("schoolId", "schools"),
        ("nextClassId", "classes"),
        ("formTeacherId", "teachers"),
    ] {
        check_ref(conn, table, key, patch.get(key).and_then(|v| v.as_str()))?;
    }
    if patch.get("nextClassId").and_then(|v| v.as_str()) == Some(class_id.as_str()) {
        return Err(HandlerErr::bad_params("nextClassId must name a different class"));
    }

    let mut update = SqlPatch::new();
    update.text(patch, "name", "name")?;
    update.nullable_text(patch, "schoolId", "school_id")?;
    update.nullable_text(patch, "nextClassId", "next_class_id")?;
    update.nullable_text(patch, "formTeacherId", "form_teacher_id")?;
    if let Some(v) = patch.get("level") {
        if v.is_null() {
            update.set("level", SqlValue::Null);
        } else {
            update.int_range(patch, "level", "level", 0, 99)?;
        }
    }
    update.execute(conn, "classes", &class_id)?;
    Ok(json!({ "ok": true }))
}

/// Class-owned rows, children first. There is no ON DELETE CASCADE.
const CLASS_DELETE_ORDER: &[(&str, &str)] = &[
    (
        "score_components",
        "DELETE FROM score_components WHERE record_id IN (
           SELECT id FROM score_records
           WHERE class_id = ?1 OR student_id IN (SELECT id FROM students WHERE class_id = ?1))",
    ),
    (
        "score_records",
        "DELETE FROM score_records
         WHERE class_id = ?1 OR student_id IN (SELECT id FROM students WHERE class_id = ?1)",
    ),
    (
        "attendance_records",
        "DELETE FROM attendance_records WHERE student_id IN (SELECT id FROM students WHERE class_id = ?1)",
    ),
    (
        "trait_ratings",
        "DELETE FROM trait_ratings WHERE student_id IN (SELECT id FROM students WHERE class_id = ?1)",
    ),
    (
        "promotion_overrides",
        "DELETE FROM promotion_overrides WHERE student_id IN (SELECT id FROM students WHERE class_id = ?1)",
    ),
    ("promotion_snapshots", "DELETE FROM promotion_snapshots WHERE class_id = ?1"),
    ("class_subjects", "DELETE FROM class_subjects WHERE class_id = ?1"),
    ("students", "DELETE FROM students WHERE class_id = ?1"),
    ("classes", "UPDATE classes SET next_class_id = NULL WHERE next_class_id = ?1"),
    ("classes", "DELETE FROM classes WHERE id = ?1"),
];

fn classes_delete(conn: &Connection, params: &Value) -> HandlerResult {
    let class_id = required_str(params, "classId")?;
    require_row(conn, "classes", &class_id, "class")?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    for (table, sql) in CLASS_DELETE_ORDER {
        if let Err(e) = tx.execute(sql, [&class_id]) {
            let _ = tx.rollback();
            tracing::error!(table, error = %e, "class delete failed");
            return Err(HandlerErr::new("db_delete_failed", e.to_string())
                .with_details(json!({ "table": table })));
        }
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tracing::info!(class = %class_id, "class deleted");
    Ok(json!({ "ok": true }))
}

fn class_subjects_list(conn: &Connection, params: &Value) -> HandlerResult {
    let class_id = required_str(params, "classId")?;
    require_row(conn, "classes", &class_id, "class")?;
    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.name, s.code, s.credit_hours, cs.sort_order,
                    t.id, t.last_name, t.first_name
             FROM class_subjects cs
             JOIN subjects s ON s.id = cs.subject_id
             LEFT JOIN teachers t ON t.id = cs.teacher_id
             WHERE cs.class_id = ?
             ORDER BY cs.sort_order",
        )
        .map_err(HandlerErr::query)?;
    let subjects = stmt
        .query_map([&class_id], |r| {
            let teacher_id: Option<String> = r.get(5)?;
            let teacher = match teacher_id {
                Some(id) => {
                    let last: String = r.get(6)?;
                    let first: String = r.get(7)?;
                    json!({ "id": id, "displayName": display_name(&last, &first) })
                }
                None => Value::Null,
            };
            Ok(json!({
                "subjectId": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "code": r.get::<_, Option<String>>(2)?,
                "creditHours": r.get::<_, f64>(3)?,
                "sortOrder": r.get::<_, i64>(4)?,
                "teacher": teacher,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "classId": class_id, "subjects": subjects }))
}

/// Replaces the class's subject offering; array order becomes sort order.
fn class_subjects_set(conn: &Connection, params: &Value) -> HandlerResult {
    let class_id = required_str(params, "classId")?;
    require_row(conn, "classes", &class_id, "class")?;
    let Some(items) = params.get("subjects").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("subjects must be an array"));
    };

    let mut rows: Vec<(String, Option<String>)> = Vec::with_capacity(items.len());
    let mut seen = HashSet::new();
    for (i, item) in items.iter().enumerate() {
        let subject_id = required_str(item, "subjectId")
            .map_err(|e| e.with_details(json!({ "index": i })))?;
        let teacher_id = optional_str(item, "teacherId")?;
        if !seen.insert(subject_id.clone()) {
            return Err(HandlerErr::bad_params("duplicate subjectId")
                .with_details(json!({ "index": i, "subjectId": subject_id })));
        }
        check_ref(conn, "subjects", "subjectId", Some(&subject_id))?;
        check_ref(conn, "teachers", "teacherId", teacher_id.as_deref())?;
        rows.push((subject_id, teacher_id));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute("DELETE FROM class_subjects WHERE class_id = ?", [&class_id])
        .map_err(HandlerErr::db("db_delete_failed", "class_subjects"))?;
    for (i, (subject_id, teacher_id)) in rows.iter().enumerate() {
        tx.execute(
            "INSERT INTO class_subjects(class_id, subject_id, teacher_id, sort_order)
             VALUES(?, ?, ?, ?)",
            (&class_id, subject_id, teacher_id, i as i64),
        )
        .map_err(HandlerErr::db("db_insert_failed", "class_subjects"))?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    Ok(json!({ "ok": true, "count": rows.len() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "classes.list" => Some(with_conn(state, req, classes_list)),
        "classes.create" => Some(with_conn(state, req, classes_create)),
        "classes.update" => Some(with_conn(state, req, classes_update)),
        "classes.delete" => Some(with_conn(state, req, classes_delete)),
        "classes.subjects.list" => Some(with_conn(state, req, class_subjects_list)),
        "classes.subjects.set" => Some(with_conn(state, req, class_subjects_set)),
        _ => None,
    }
}
