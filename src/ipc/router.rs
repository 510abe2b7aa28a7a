use super::handlers;
use super::types::{AppState, Request};
use crate::ipc::error::err;

type TryHandle = fn(&mut AppState, &Request) -> Option<serde_json::Value>;

const FAMILIES: &[TryHandle] = &[
    handlers::core::try_handle,
    handlers::setup::try_handle,
    handlers::schools::try_handle,
    handlers::sessions::try_handle,
    handlers::teachers::try_handle,
    handlers::classes::try_handle,
    handlers::subjects::try_handle,
    handlers::students::try_handle,
    handlers::distributions::try_handle,
    handlers::scores::try_handle,
    handlers::results::try_handle,
    handlers::promotion::try_handle,
    handlers::attendance::try_handle,
    handlers::backup::try_handle,
];

pub fn handle_request(state: &mut AppState, req: Request) -> serde_json::Value {
    tracing::debug!(id = %req.id, method = %req.method, "request");
    for family in FAMILIES {
        if let Some(resp) = family(state, &req) {
            return resp;
        }
    }

    tracing::warn!(method = %req.method, "unknown method");
    err(
        &req.id,
        "not_implemented",
        format!("unknown method: {}", req.method),
        None,
    )
}
