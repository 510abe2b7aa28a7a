use crate::config::{self, SetupSection};
use crate::db;
use crate::ipc::helpers::{required_str, with_conn, HandlerErr, HandlerResult};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::{json, Map, Value};

fn setup_get(conn: &Connection, _params: &Value) -> HandlerResult {
    let mut out = Map::new();
    for section in SetupSection::ALL {
        let v = config::load_section(conn, section)
            .map_err(|e| HandlerErr::new("db_query_failed", format!("{e:#}")))?;
        out.insert(section.name().to_string(), v);
    }
    Ok(Value::Object(out))
}

fn setup_update(conn: &Connection, params: &Value) -> HandlerResult {
    let section_raw = required_str(params, "section")?;
    let Some(section) = SetupSection::parse(&section_raw) else {
        return Err(HandlerErr::bad_params("unknown section")
            .with_details(json!({ "section": section_raw })));
    };
    let Some(patch) = params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("patch must be an object"));
    };

    let mut current = config::load_section(conn, section)
        .map_err(|e| HandlerErr::new("db_query_failed", format!("{e:#}")))?;
    config::merge_section_patch(section, &mut current, patch)
        .map_err(|msg| HandlerErr::bad_params(msg).with_details(json!({ "section": section.name() })))?;
    db::settings_set_json(conn, section.key(), &current)
        .map_err(|e| HandlerErr::new("db_update_failed", format!("{e:#}")))?;
    tracing::info!(section = section.name(), "setup section updated");
    Ok(json!({ "ok": true, "section": section.name(), "values": current }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(with_conn(state, req, setup_get)),
        "setup.update" => Some(with_conn(state, req, setup_update)),
        _ => None,
    }
}
