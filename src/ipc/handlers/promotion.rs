use crate::calc::PromotionDecision;
use crate::db;
use crate::ipc::helpers::{optional_str, require_row, required_str, with_conn, HandlerErr, HandlerResult};
use crate::ipc::types::{AppState, Request};
use crate::results;
use rusqlite::Connection;
use serde_json::{json, Value};
use uuid::Uuid;

fn promotion_candidates(conn: &Connection, params: &Value) -> HandlerResult {
    let class_id = required_str(params, "classId")?;
    let session_id = required_str(params, "sessionId")?;
    let model = results::compute_promotion_model(conn, &class_id, &session_id)?;
    serde_json::to_value(model).map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}

/// `decision: null` clears the override and the student reverts to the automatic outcome.
fn promotion_set_override(conn: &Connection, params: &Value) -> HandlerResult {
    let student_id = required_str(params, "studentId")?;
    let session_id = required_str(params, "sessionId")?;
    require_row(conn, "students", &student_id, "student")?;
    require_row(conn, "sessions", &session_id, "session")?;

    let decision = match params.get("decision") {
        None => return Err(HandlerErr::bad_params("missing decision")),
        Some(Value::Null) => None,
        Some(v) => Some(
            v.as_str()
                .and_then(PromotionDecision::parse)
                .ok_or_else(|| HandlerErr::bad_params("decision must be promote, hold or null"))?,
        ),
    };

    match decision {
        None => {
            conn.execute(
                "DELETE FROM promotion_overrides WHERE student_id = ? AND session_id = ?",
                (&student_id, &session_id),
            )
            .map_err(HandlerErr::db("db_delete_failed", "promotion_overrides"))?;
        }
        Some(d) => {
            let note = optional_str(params, "note")?;
            conn.execute(
                "INSERT INTO promotion_overrides(student_id, session_id, decision, note, updated_at)
                 VALUES(?, ?, ?, ?, ?)
                 ON CONFLICT(student_id, session_id) DO UPDATE SET
                   decision = excluded.decision,
                   note = excluded.note,
                   updated_at = excluded.updated_at",
                (&student_id, &session_id, d.as_str(), &note, db::now_rfc3339()),
            )
            .map_err(HandlerErr::db("db_update_failed", "promotion_overrides"))?;
        }
    }
    tracing::info!(
        student = %student_id,
        session = %session_id,
        decision = decision.map(|d| d.as_str()).unwrap_or("auto"),
        "promotion override set"
    );
    Ok(json!({ "ok": true, "decision": decision }))
}

fn promotion_finalize(conn: &Connection, params: &Value) -> HandlerResult {
    let class_id = required_str(params, "classId")?;
    let session_id = required_str(params, "sessionId")?;
    let apply_moves = params
        .get("applyMoves")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let model = results::compute_promotion_model(conn, &class_id, &session_id)?;
    let next_class_id = model.class.next_class_id.clone();
    if apply_moves && next_class_id.is_none() {
        return Err(HandlerErr::bad_params("class has no nextClassId to move promoted students into"));
    }

    let payload = serde_json::to_string(&model)
        .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;
    let snapshot_id = Uuid::new_v4().to_string();
    let finalized_at = db::now_rfc3339();

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute(
        "INSERT INTO promotion_snapshots(id, class_id, session_id, finalized_at, payload)
         VALUES(?, ?, ?, ?, ?)",
        (&snapshot_id, &class_id, &session_id, &finalized_at, &payload),
    )
    .map_err(HandlerErr::db("db_insert_failed", "promotion_snapshots"))?;

    let mut moved = 0usize;
    if let (true, Some(next)) = (apply_moves, next_class_id.as_deref()) {
        for c in model.candidates.iter().filter(|c| c.promoted) {
            // Candidates who already left the class stay where they are.
            moved += tx
                .execute(
                    "UPDATE students
                     SET class_id = ?1,
                         sort_order = (SELECT COALESCE(MAX(sort_order) + 1, 0) FROM students WHERE class_id = ?1),
                         updated_at = ?2
                     WHERE id = ?3 AND class_id = ?4",
                    (next, &finalized_at, &c.student_id, &class_id),
                )
                .map_err(HandlerErr::db("db_update_failed", "students"))?;
        }
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    let promoted = model.candidates.iter().filter(|c| c.promoted).count();
    tracing::info!(
        class = %class_id,
        session = %session_id,
        promoted,
        held = model.candidates.len() - promoted,
        moved,
        "promotion finalized"
    );
    Ok(json!({
        "snapshotId": snapshot_id,
        "finalizedAt": finalized_at,
        "promotedCount": promoted,
        "heldCount": model.candidates.len() - promoted,
        "movedCount": moved,
        "nextClassId": next_class_id,
    }))
}

fn promotion_snapshots(conn: &Connection, params: &Value) -> HandlerResult {
    let class_id = required_str(params, "classId")?;
    let session_id = optional_str(params, "sessionId")?;
    let mut stmt = conn
        .prepare(
            "SELECT id, session_id, finalized_at, payload
             FROM promotion_snapshots
             WHERE class_id = ?1 AND (?2 IS NULL OR session_id = ?2)
             ORDER BY finalized_at DESC, id",
        )
        .map_err(HandlerErr::query)?;
    let rows = stmt
        .query_map((&class_id, &session_id), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;

    let mut snapshots = Vec::with_capacity(rows.len());
    for (id, session_id, finalized_at, payload) in rows {
        let model: Value = match serde_json::from_str(&payload) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(snapshot = %id, error = %e, "unreadable promotion snapshot");
                Value::Null
            }
        };
        snapshots.push(json!({
            "id": id,
            "sessionId": session_id,
            "finalizedAt": finalized_at,
            "candidates": model.get("candidates").cloned().unwrap_or(Value::Null),
            "threshold": model.get("threshold").cloned().unwrap_or(Value::Null),
        }));
    }
    Ok(json!({ "classId": class_id, "snapshots": snapshots }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "promotion.candidates" => Some(with_conn(state, req, promotion_candidates)),
        "promotion.setOverride" => Some(with_conn(state, req, promotion_set_override)),
        "promotion.finalize" => Some(with_conn(state, req, promotion_finalize)),
        "promotion.snapshots" => Some(with_conn(state, req, promotion_snapshots)),
        _ => None,
    }
}
