use crate::grading;
use crate::ipc::helpers::{required_i64, required_str, row_exists, with_conn, HandlerErr, HandlerResult};
use crate::ipc::types::{AppState, Request};
use crate::results::{self, AttendanceSummary};
use rusqlite::Connection;
use serde_json::{json, Map, Value};
use std::collections::HashMap;

const MAX_DAYS_OPEN: i64 = 366;
const MAX_TRAIT_NAME: usize = 60;

fn session_term(conn: &Connection, params: &Value) -> Result<(String, i64), HandlerErr> {
    let session_id = required_str(params, "sessionId")?;
    let term = required_i64(params, "term")?;
    let session = results::load_session(conn, &session_id)?;
    results::check_term(&session, term)?;
    Ok((session.id, term))
}

fn rows_param(params: &Value) -> Result<&Vec<Value>, HandlerErr> {
    params
        .get("rows")
        .and_then(|v| v.as_array())
        .ok_or_else(|| HandlerErr::bad_params("rows must be an array"))
}

fn require_student(conn: &Connection, student_id: &str, row: usize) -> Result<(), HandlerErr> {
    if row_exists(conn, "students", student_id)? {
        Ok(())
    } else {
        Err(HandlerErr::not_found("student").with_details(json!({ "row": row, "studentId": student_id })))
    }
}

fn attendance_get(conn: &Connection, params: &Value) -> HandlerResult {
    let class_id = required_str(params, "classId")?;
    let (session_id, term) = session_term(conn, params)?;
    let roster = results::load_roster(conn, &class_id, true)?;

    let mut stmt = conn
        .prepare(
            "SELECT a.student_id, a.days_open, a.days_present
             FROM attendance_records a
             JOIN students s ON s.id = a.student_id
             WHERE s.class_id = ? AND a.session_id = ? AND a.term = ?",
        )
        .map_err(HandlerErr::query)?;
    let stored: HashMap<String, (i64, i64)> = stmt
        .query_map((&class_id, &session_id, term), |r| {
            Ok((r.get::<_, String>(0)?, (r.get::<_, i64>(1)?, r.get::<_, i64>(2)?)))
        })
        .and_then(|it| it.collect::<Result<HashMap<_, _>, _>>())
        .map_err(HandlerErr::query)?;

    let rows: Vec<Value> = roster
        .iter()
        .map(|st| {
            let summary = stored
                .get(&st.id)
                .map(|(open, present)| AttendanceSummary::new(*open, *present));
            json!({
                "studentId": st.id,
                "displayName": st.display_name,
                "attendance": summary,
            })
        })
        .collect();
    Ok(json!({ "classId": class_id, "sessionId": session_id, "term": term, "rows": rows }))
}

fn attendance_set(conn: &Connection, params: &Value) -> HandlerResult {
    let (session_id, term) = session_term(conn, params)?;
    let items = rows_param(params)?;

    let mut parsed = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let student_id = required_str(item, "studentId")?;
        let open = required_i64(item, "daysOpen")?;
        let present = required_i64(item, "daysPresent")?;
        if !(0..=MAX_DAYS_OPEN).contains(&open) || !(0..=open).contains(&present) {
            return Err(
                HandlerErr::bad_params("need 0 <= daysPresent <= daysOpen <= 366")
                    .with_details(json!({ "row": i, "daysOpen": open, "daysPresent": present })),
            );
        }
        require_student(conn, &student_id, i)?;
        parsed.push((student_id, open, present));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    for (student_id, open, present) in &parsed {
        tx.execute(
            "INSERT INTO attendance_records(student_id, session_id, term, days_open, days_present)
             VALUES(?, ?, ?, ?, ?)
             ON CONFLICT(student_id, session_id, term) DO UPDATE SET
               days_open = excluded.days_open,
               days_present = excluded.days_present",
            (student_id, &session_id, term, open, present),
        )
        .map_err(HandlerErr::db("db_update_failed", "attendance_records"))?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    Ok(json!({ "ok": true, "count": parsed.len() }))
}

fn traits_get(conn: &Connection, params: &Value) -> HandlerResult {
    let class_id = required_str(params, "classId")?;
    let (session_id, term) = session_term(conn, params)?;
    let roster = results::load_roster(conn, &class_id, true)?;

    let mut rows = Vec::with_capacity(roster.len());
    for st in &roster {
        let traits = results::load_traits(conn, &st.id, &session_id, term)?;
        rows.push(json!({
            "studentId": st.id,
            "displayName": st.display_name,
            "traits": traits,
        }));
    }
    Ok(json!({ "classId": class_id, "sessionId": session_id, "term": term, "rows": rows }))
}

fn parse_traits(raw: Option<&Value>, row: usize) -> Result<Vec<(String, Option<i64>)>, HandlerErr> {
    let Some(obj) = raw.and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("traits must be an object").with_details(json!({ "row": row })));
    };
    parse_trait_map(obj, row)
}

fn parse_trait_map(obj: &Map<String, Value>, row: usize) -> Result<Vec<(String, Option<i64>)>, HandlerErr> {
    let mut out = Vec::with_capacity(obj.len());
    for (name, v) in obj {
        let name = name.trim();
        if name.is_empty() || name.chars().count() > MAX_TRAIT_NAME {
            return Err(HandlerErr::bad_params("trait names must be 1..=60 characters")
                .with_details(json!({ "row": row })));
        }
        let rating = if v.is_null() {
            None
        } else {
            let r = v.as_i64().filter(|r| (1..=5).contains(r)).ok_or_else(|| {
                HandlerErr::bad_params("trait rating must be an integer in 1..=5 or null")
                    .with_details(json!({ "row": row, "trait": name }))
            })?;
            Some(r)
        };
        out.push((name.to_string(), rating));
    }
    Ok(out)
}

/// A `null` rating removes that trait for the student.
fn traits_set(conn: &Connection, params: &Value) -> HandlerResult {
    let (session_id, term) = session_term(conn, params)?;
    let items = rows_param(params)?;

    let mut parsed = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let student_id = required_str(item, "studentId")?;
        require_student(conn, &student_id, i)?;
        parsed.push((student_id, parse_traits(item.get("traits"), i)?));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let mut written = 0usize;
    for (student_id, traits) in &parsed {
        for (name, rating) in traits {
            match rating {
                Some(r) => {
                    tx.execute(
                        "INSERT INTO trait_ratings(student_id, session_id, term, trait, rating)
                         VALUES(?, ?, ?, ?, ?)
                         ON CONFLICT(student_id, session_id, term, trait) DO UPDATE SET
                           rating = excluded.rating",
                        (student_id, &session_id, term, name, r),
                    )
                    .map_err(HandlerErr::db("db_update_failed", "trait_ratings"))?;
                }
                None => {
                    tx.execute(
                        "DELETE FROM trait_ratings
                         WHERE student_id = ? AND session_id = ? AND term = ? AND trait = ?",
                        (student_id, &session_id, term, name),
                    )
                    .map_err(HandlerErr::db("db_delete_failed", "trait_ratings"))?;
                }
            }
            written += 1;
        }
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    Ok(json!({ "ok": true, "count": written, "scale": rating_scale() }))
}

fn rating_scale() -> Value {
    (1..=5)
        .rev()
        .map(|r| json!({ "rating": r, "label": grading::trait_rating_label(r) }))
        .collect()
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.get" => Some(with_conn(state, req, attendance_get)),
        "attendance.set" => Some(with_conn(state, req, attendance_set)),
        "traits.get" => Some(with_conn(state, req, traits_get)),
        "traits.set" => Some(with_conn(state, req, traits_set)),
        _ => None,
    }
}
