use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use serde_json::json;

const VALUE_TYPES: [&str; 4] = ["string", "boolean", "integer", "float"];

fn handle_settings_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let category = match req.params.get("category").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing category", None),
    };
    let key = match req.params.get("key").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing key", None),
    };

    match state.settings.get(conn, &category, &key) {
        Ok(value) => ok(&req.id, json!({ "value": value })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_settings_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let category = match req.params.get("category").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.to_string(),
        _ => return err(&req.id, "bad_params", "missing category", None),
    };
    let key = match req.params.get("key").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.to_string(),
        _ => return err(&req.id, "bad_params", "missing key", None),
    };
    let value = match req.params.get("value").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing value", None),
    };
    let value_type = req
        .params
        .get("valueType")
        .and_then(|v| v.as_str())
        .unwrap_or("string");
    if !VALUE_TYPES.contains(&value_type) {
        return err(
            &req.id,
            "bad_params",
            "valueType must be one of: string, boolean, integer, float",
            Some(json!({ "valueType": value_type })),
        );
    }
    let description = req.params.get("description").and_then(|v| v.as_str());

    match state.settings.set(
        conn,
        &category,
        &key,
        &value,
        value_type,
        description,
        &Utc::now().to_rfc3339(),
    ) {
        Ok(()) => ok(&req.id, json!({ "ok": true })),
        Err(e) => err(&req.id, "db_insert_failed", e.to_string(), None),
    }
}

fn handle_settings_category(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let category = match req.params.get("category").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing category", None),
    };

    match state.settings.category(conn, &category) {
        Ok(values) => ok(
            &req.id,
            json!({ "settings": serde_json::to_value(values).unwrap_or_else(|_| json!({})) }),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "settings.get" => Some(handle_settings_get(state, req)),
        "settings.set" => Some(handle_settings_set(state, req)),
        "settings.category" => Some(handle_settings_category(state, req)),
        _ => None,
    }
}
