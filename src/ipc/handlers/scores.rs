use crate::calc::RawComponent;
use crate::db;
use crate::ipc::helpers::{require_row, required_str, with_conn, HandlerErr, HandlerResult};
use crate::ipc::types::{AppState, Request};
use crate::results::{self, ResultsScope};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use std::collections::HashSet;
use uuid::Uuid;

const MAX_COMPONENTS_PER_ROW: usize = 20;

struct RowInput {
    student_id: String,
    components: Vec<RawComponent>,
}

fn parse_rows(params: &Value) -> Result<Vec<RowInput>, HandlerErr> {
    let Some(items) = params.get("rows").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("rows must be an array"));
    };
    let mut out = Vec::with_capacity(items.len());
    let mut seen = HashSet::new();
    for (i, item) in items.iter().enumerate() {
        let student_id = required_str(item, "studentId")
            .map_err(|e| e.with_details(json!({ "row": i })))?;
        if !seen.insert(student_id.clone()) {
            return Err(HandlerErr::bad_params("duplicate studentId in rows")
                .with_details(json!({ "row": i, "studentId": student_id })));
        }
        let Some(raw) = item.get("components").and_then(|v| v.as_array()) else {
            return Err(HandlerErr::bad_params("components must be an array")
                .with_details(json!({ "row": i })));
        };
        if raw.len() > MAX_COMPONENTS_PER_ROW {
            return Err(HandlerErr::bad_params("too many components")
                .with_details(json!({ "row": i, "max": MAX_COMPONENTS_PER_ROW })));
        }
        let mut components = Vec::with_capacity(raw.len());
        for (j, c) in raw.iter().enumerate() {
            let at = |msg: &str| {
                HandlerErr::bad_params(msg.to_string()).with_details(json!({ "row": i, "component": j }))
            };
            let comp: RawComponent = serde_json::from_value(c.clone())
                .map_err(|e| at(&format!("invalid component: {}", e)))?;
            if comp.label.trim().is_empty() && comp.component_id.is_none() {
                return Err(at("component needs a componentId or a label"));
            }
            if !comp.score.is_finite() || !comp.max_score.is_finite() {
                return Err(at("score and maxScore must be finite numbers"));
            }
            components.push(comp);
        }
        out.push(RowInput { student_id, components });
    }
    Ok(out)
}

fn check_students_in_class(conn: &Connection, class_id: &str, rows: &[RowInput]) -> Result<(), HandlerErr> {
    for row in rows {
        let class_of: Option<String> = conn
            .query_row(
                "SELECT class_id FROM students WHERE id = ?",
                [&row.student_id],
                |r| r.get(0),
            )
            .optional()
            .map_err(HandlerErr::query)?;
        match class_of {
            None => {
                return Err(HandlerErr::not_found("student")
                    .with_details(json!({ "studentId": row.student_id })))
            }
            Some(c) if c != class_id => {
                return Err(HandlerErr::bad_params("student is not in this class")
                    .with_details(json!({ "studentId": row.student_id, "classId": c })))
            }
            Some(_) => {}
        }
    }
    Ok(())
}

fn scores_sheet_open(conn: &Connection, params: &Value) -> HandlerResult {
    let scope = results::parse_scope(params)?;
    let subject_id = required_str(params, "subjectId")?;
    let sheet = results::compute_score_sheet(conn, &scope, &subject_id)?;
    serde_json::to_value(sheet).map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}

fn upsert_record(
    conn: &Connection,
    scope: &ResultsScope,
    subject_id: &str,
    row: &RowInput,
) -> Result<String, HandlerErr> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM score_records
             WHERE student_id = ? AND subject_id = ? AND exam_type = ? AND term = ? AND session_id = ?",
            (
                &row.student_id,
                subject_id,
                scope.exam_type.as_str(),
                scope.term,
                &scope.session_id,
            ),
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::query)?;

    let record_id = match existing {
        Some(id) => {
            conn.execute("DELETE FROM score_components WHERE record_id = ?", [&id])
                .map_err(HandlerErr::db("db_delete_failed", "score_components"))?;
            conn.execute(
                "UPDATE score_records SET class_id = ?, updated_at = ? WHERE id = ?",
                (&scope.class_id, db::now_rfc3339(), &id),
            )
            .map_err(HandlerErr::db("db_update_failed", "score_records"))?;
            id
        }
        None => {
            let id = Uuid::new_v4().to_string();
            conn.execute(
                "INSERT INTO score_records(id, class_id, student_id, subject_id, exam_type, term, session_id, updated_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
                (
                    &id,
                    &scope.class_id,
                    &row.student_id,
                    subject_id,
                    scope.exam_type.as_str(),
                    scope.term,
                    &scope.session_id,
                    db::now_rfc3339(),
                ),
            )
            .map_err(HandlerErr::db("db_insert_failed", "score_records"))?;
            id
        }
    };

    for (i, c) in row.components.iter().enumerate() {
        conn.execute(
            "INSERT INTO score_components(id, record_id, component_id, label, score, max_score, sort_order)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                &record_id,
                &c.component_id,
                c.label.trim(),
                c.score,
                c.max_score,
                i as i64,
            ),
        )
        .map_err(HandlerErr::db("db_insert_failed", "score_components"))?;
    }
    Ok(record_id)
}

/// Stores raw components as submitted; alignment happens on every read, and the
/// response carries the freshly aligned sheet.
fn scores_save(conn: &Connection, params: &Value) -> HandlerResult {
    let scope = results::parse_scope(params)?;
    let subject_id = required_str(params, "subjectId")?;
    let class = results::load_class(conn, &scope.class_id)?;
    let session = results::load_session(conn, &scope.session_id)?;
    results::check_term(&session, scope.term)?;
    require_row(conn, "subjects", &subject_id, "subject")?;
    let rows = parse_rows(params)?;
    check_students_in_class(conn, &class.id, &rows)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let mut saved = Vec::with_capacity(rows.len());
    for row in &rows {
        let record_id = upsert_record(&tx, &scope, &subject_id, row)?;
        saved.push(json!({ "studentId": row.student_id, "recordId": record_id }));
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tracing::info!(
        class = %class.id,
        subject = %subject_id,
        exam_type = scope.exam_type.as_str(),
        term = scope.term,
        rows = saved.len(),
        "scores saved"
    );

    let sheet = results::compute_score_sheet(conn, &scope, &subject_id)?;
    Ok(json!({
        "saved": saved,
        "sheet": serde_json::to_value(sheet).map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?,
    }))
}

fn scores_delete(conn: &Connection, params: &Value) -> HandlerResult {
    let record_id = required_str(params, "recordId")?;
    require_row(conn, "score_records", &record_id, "score record")?;
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute("DELETE FROM score_components WHERE record_id = ?", [&record_id])
        .map_err(HandlerErr::db("db_delete_failed", "score_components"))?;
    tx.execute("DELETE FROM score_records WHERE id = ?", [&record_id])
        .map_err(HandlerErr::db("db_delete_failed", "score_records"))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "scores.sheetOpen" => Some(with_conn(state, req, scores_sheet_open)),
        "scores.save" => Some(with_conn(state, req, scores_save)),
        "scores.delete" => Some(with_conn(state, req, scores_delete)),
        _ => None,
    }
}
