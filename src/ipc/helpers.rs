use rusqlite::Connection;
use serde_json::Value;

use crate::ipc::error::{err, ok};
use crate::ipc::types::AppState;
use crate::scoring::EngineError;

pub fn get_required_str(params: &Value, key: &str) -> Result<String, EngineError> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| EngineError::new("bad_params", format!("missing {}", key)))
}

pub fn open_conn(state: &AppState) -> Result<&Connection, EngineError> {
    state
        .db
        .as_ref()
        .ok_or_else(|| EngineError::new("no_workspace", "select a workspace first"))
}

pub fn respond(id: &str, result: Result<Value, EngineError>) -> Value {
    match result {
        Ok(v) => ok(id, v),
        Err(e) => err(id, &e.code, e.message, None),
    }
}

pub fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, EngineError> {
    serde_json::to_value(value).map_err(|e| EngineError::new("internal", e.to_string()))
}
