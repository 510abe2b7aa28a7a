use crate::ipc::helpers::{required_str, with_conn, HandlerErr, HandlerResult};
use crate::ipc::types::{AppState, Request};
use crate::results;
use rusqlite::Connection;
use serde::Serialize;
use serde_json::Value;

fn to_result<T: Serialize>(model: T) -> HandlerResult {
    serde_json::to_value(model).map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}

fn class_summary(conn: &Connection, params: &Value) -> HandlerResult {
    let scope = results::parse_scope(params)?;
    to_result(results::compute_class_results(conn, &scope)?)
}

fn report_card_model(conn: &Connection, params: &Value) -> HandlerResult {
    let scope = results::parse_scope(params)?;
    let student_id = required_str(params, "studentId")?;
    to_result(results::compose_report_card(conn, &scope, &student_id)?)
}

fn broadsheet_model(conn: &Connection, params: &Value) -> HandlerResult {
    let scope = results::parse_scope(params)?;
    to_result(results::compute_broadsheet(conn, &scope)?)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "results.classSummary" => Some(with_conn(state, req, class_summary)),
        "reports.reportCardModel" => Some(with_conn(state, req, report_card_model)),
        "reports.broadsheetModel" => Some(with_conn(state, req, broadsheet_model)),
        _ => None,
    }
}
