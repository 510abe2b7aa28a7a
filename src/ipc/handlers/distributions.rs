use crate::calc::{self, ComponentKind, DistributionQuery, ExamType, MarkDistribution};
use crate::db;
use crate::ipc::helpers::{
    optional_i64, optional_str, require_row, required_patch, required_str, row_exists, with_conn,
    HandlerErr, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use crate::results;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use serde_json::{json, Value};
use std::collections::HashSet;
use uuid::Uuid;

const MAX_COMPONENTS: usize = 20;

#[derive(Debug)]
struct ComponentInput {
    id: Option<String>,
    label: String,
    weight: i64,
    kind: ComponentKind,
}

fn parse_exam_type(params: &Value) -> Result<ExamType, HandlerErr> {
    let raw = required_str(params, "examType")?;
    ExamType::parse(&raw).ok_or_else(|| {
        HandlerErr::bad_params("examType must be one of: midterm, final")
            .with_details(json!({ "examType": raw }))
    })
}

fn parse_components(raw: &Value, exam_type: ExamType) -> Result<Vec<ComponentInput>, HandlerErr> {
    let Some(items) = raw.as_array() else {
        return Err(HandlerErr::bad_params("components must be an array"));
    };
    if items.is_empty() || items.len() > MAX_COMPONENTS {
        return Err(HandlerErr::bad_params(format!(
            "components must contain 1..={} entries",
            MAX_COMPONENTS
        )));
    }

    let mut out = Vec::with_capacity(items.len());
    let mut labels = HashSet::new();
    for (i, item) in items.iter().enumerate() {
        let at = |msg: &str| HandlerErr::bad_params(msg.to_string()).with_details(json!({ "index": i }));
        let label = required_str(item, "label").map_err(|_| at("component label is required"))?;
        if !labels.insert(label.to_ascii_lowercase()) {
            return Err(at("component labels must be unique"));
        }
        let weight = item
            .get("weight")
            .and_then(|v| v.as_i64())
            .filter(|w| (0..=100).contains(w))
            .ok_or_else(|| at("component weight must be an integer in 0..=100"))?;
        let kind = match item.get("kind").and_then(|v| v.as_str()) {
            None => ComponentKind::Regular,
            Some(k) => ComponentKind::parse(k).ok_or_else(|| at("component kind must be regular or carry_forward"))?,
        };
        if kind == ComponentKind::CarryForward && exam_type != ExamType::Final {
            return Err(at("carry_forward components are only valid on final distributions"));
        }
        let id = optional_str(item, "id")?;
        out.push(ComponentInput { id, label, weight, kind });
    }
    if out.iter().filter(|c| c.kind == ComponentKind::CarryForward).count() > 1 {
        return Err(HandlerErr::bad_params("at most one carry_forward component is allowed"));
    }
    Ok(out)
}

/// Weights are expected to total 100; other totals are stored but reported.
fn weight_warnings(components: &[ComponentInput]) -> Vec<Value> {
    let total: i64 = components.iter().map(|c| c.weight).sum();
    if total == 100 {
        Vec::new()
    } else {
        vec![json!({ "code": "weights_not_100", "totalWeight": total })]
    }
}

fn check_scope(conn: &Connection, session_id: Option<&str>, term: Option<i64>, school_id: Option<&str>) -> Result<(), HandlerErr> {
    if let Some(id) = session_id {
        let session = results::load_session(conn, id).map_err(|e| match e.code.as_str() {
            "not_found" => HandlerErr::bad_params("unknown sessionId"),
            _ => HandlerErr::from(e),
        })?;
        if let Some(t) = term {
            results::check_term(&session, t)?;
        }
    }
    if let Some(t) = term {
        if t < 1 {
            return Err(HandlerErr::bad_params("term must be >= 1"));
        }
    }
    if let Some(id) = school_id {
        if !row_exists(conn, "schools", id)? {
            return Err(HandlerErr::bad_params("unknown schoolId"));
        }
    }
    Ok(())
}

fn insert_components(conn: &Connection, distribution_id: &str, components: &[ComponentInput]) -> Result<(), HandlerErr> {
    for (i, c) in components.iter().enumerate() {
        let id = c.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
        conn.execute(
            "INSERT INTO mark_distribution_components(id, distribution_id, sort_order, label, weight, kind)
             VALUES(?, ?, ?, ?, ?, ?)",
            (&id, distribution_id, i as i64, &c.label, c.weight, c.kind.as_str()),
        )
        .map_err(HandlerErr::db("db_insert_failed", "mark_distribution_components"))?;
    }
    Ok(())
}

fn find(conn: &Connection, distribution_id: &str) -> Result<MarkDistribution, HandlerErr> {
    results::load_distributions(conn)?
        .into_iter()
        .find(|d| d.id == distribution_id)
        .ok_or_else(|| HandlerErr::not_found("distribution"))
}

fn distribution_json(d: &MarkDistribution) -> Value {
    let mut v = serde_json::to_value(d).unwrap_or(Value::Null);
    v["totalWeight"] = json!(d.total_weight());
    v
}

fn distributions_list(conn: &Connection, params: &Value) -> HandlerResult {
    let exam_type = match optional_str(params, "examType")? {
        None => None,
        Some(raw) => Some(
            ExamType::parse(&raw).ok_or_else(|| HandlerErr::bad_params("examType must be one of: midterm, final"))?,
        ),
    };
    let session_id = optional_str(params, "sessionId")?;
    let list: Vec<Value> = results::load_distributions(conn)?
        .iter()
        .filter(|d| exam_type.map_or(true, |t| d.exam_type == t))
        .filter(|d| session_id.is_none() || d.session_id == session_id)
        .map(distribution_json)
        .collect();
    Ok(json!({ "distributions": list }))
}

fn distributions_open(conn: &Connection, params: &Value) -> HandlerResult {
    let id = required_str(params, "distributionId")?;
    let d = find(conn, &id)?;
    Ok(json!({ "distribution": distribution_json(&d) }))
}

fn distributions_create(conn: &Connection, params: &Value) -> HandlerResult {
    let name = required_str(params, "name")?;
    let exam_type = parse_exam_type(params)?;
    let session_id = optional_str(params, "sessionId")?;
    let term = optional_i64(params, "term")?;
    let school_id = optional_str(params, "schoolId")?;
    check_scope(conn, session_id.as_deref(), term, school_id.as_deref())?;
    let components = parse_components(params.get("components").unwrap_or(&Value::Null), exam_type)?;

    let id = Uuid::new_v4().to_string();
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute(
        "INSERT INTO mark_distributions(id, name, exam_type, session_id, term, school_id, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (&id, &name, exam_type.as_str(), &session_id, term, &school_id, db::now_rfc3339()),
    )
    .map_err(HandlerErr::db("db_insert_failed", "mark_distributions"))?;
    insert_components(&tx, &id, &components)?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    tracing::info!(distribution = %id, exam_type = exam_type.as_str(), "distribution created");
    Ok(json!({ "distributionId": id, "warnings": weight_warnings(&components) }))
}

fn distributions_update(conn: &Connection, params: &Value) -> HandlerResult {
    let id = required_str(params, "distributionId")?;
    let patch = required_patch(params)?;
    let current = find(conn, &id)?;
    let patch_value = Value::Object(patch.clone());

    let session_id = if patch.contains_key("sessionId") {
        optional_str(&patch_value, "sessionId")?
    } else {
        current.session_id.clone()
    };
    let term = if patch.contains_key("term") {
        optional_i64(&patch_value, "term")?
    } else {
        current.term
    };
    let school_id = if patch.contains_key("schoolId") {
        optional_str(&patch_value, "schoolId")?
    } else {
        current.school_id.clone()
    };
    check_scope(conn, session_id.as_deref(), term, school_id.as_deref())?;
    let name = if patch.contains_key("name") {
        required_str(&patch_value, "name")?
    } else {
        current.name.clone()
    };
    let components = match patch.get("components") {
        Some(raw) => Some(parse_components(raw, current.exam_type)?),
        None => None,
    };

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute(
        "UPDATE mark_distributions SET name = ?, session_id = ?, term = ?, school_id = ? WHERE id = ?",
        params_from_iter([
            SqlValue::Text(name),
            session_id.map(SqlValue::Text).unwrap_or(SqlValue::Null),
            term.map(SqlValue::Integer).unwrap_or(SqlValue::Null),
            school_id.map(SqlValue::Text).unwrap_or(SqlValue::Null),
            SqlValue::Text(id.clone()),
        ]),
    )
    .map_err(HandlerErr::db("db_update_failed", "mark_distributions"))?;
    let mut warnings = Vec::new();
    if let Some(components) = &components {
        tx.execute(
            "DELETE FROM mark_distribution_components WHERE distribution_id = ?",
            [&id],
        )
        .map_err(HandlerErr::db("db_delete_failed", "mark_distribution_components"))?;
        insert_components(&tx, &id, components)?;
        warnings = weight_warnings(components);
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    Ok(json!({ "ok": true, "warnings": warnings }))
}

fn distributions_delete(conn: &Connection, params: &Value) -> HandlerResult {
    let id = required_str(params, "distributionId")?;
    require_row(conn, "mark_distributions", &id, "distribution")?;
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute(
        "DELETE FROM mark_distribution_components WHERE distribution_id = ?",
        [&id],
    )
    .map_err(HandlerErr::db("db_delete_failed", "mark_distribution_components"))?;
    tx.execute("DELETE FROM mark_distributions WHERE id = ?", [&id])
        .map_err(HandlerErr::db("db_delete_failed", "mark_distributions"))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    Ok(json!({ "ok": true }))
}

fn distributions_resolve(conn: &Connection, params: &Value) -> HandlerResult {
    let exam_type = parse_exam_type(params)?;
    let session_id = optional_str(params, "sessionId")?;
    let term = optional_i64(params, "term")?;
    let school_id = match optional_str(params, "classId")? {
        Some(class_id) => results::load_class(conn, &class_id)?.school_id,
        None => optional_str(params, "schoolId")?,
    };

    let all = results::load_distributions(conn)?;
    let found = calc::resolve_distribution(
        &all,
        &DistributionQuery {
            exam_type,
            session_id: session_id.as_deref(),
            term,
            school_id: school_id.as_deref(),
        },
    );
    Ok(json!({ "distribution": found.map(distribution_json) }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "distributions.list" => Some(with_conn(state, req, distributions_list)),
        "distributions.open" => Some(with_conn(state, req, distributions_open)),
        "distributions.create" => Some(with_conn(state, req, distributions_create)),
        "distributions.update" => Some(with_conn(state, req, distributions_update)),
        "distributions.delete" => Some(with_conn(state, req, distributions_delete)),
        "distributions.resolve" => Some(with_conn(state, req, distributions_resolve)),
        _ => None,
    }
}
