use crate::db;
use crate::ipc::helpers::{open_conn, respond};
use crate::ipc::types::{AppState, Request};
use crate::scoring::{EngineError, DEFAULT_ACADEMIC_YEAR};
use serde_json::{json, Map, Value};

const SCORING_KEY: &str = "setup.scoring";

fn default_scoring() -> Value {
    json!({
        "currentAcademicYear": DEFAULT_ACADEMIC_YEAR,
        "currentCalendarYear": null
    })
}

fn merge_scoring_patch(current: &mut Value, patch: &Map<String, Value>) -> Result<(), String> {
    let obj = current
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())?;
    for (k, v) in patch {
        match k.as_str() {
            "currentAcademicYear" => {
                let n = v
                    .as_i64()
                    .ok_or_else(|| "currentAcademicYear must be integer".to_string())?;
                if !(1..=8).contains(&n) {
                    return Err("currentAcademicYear must be in 1..=8".to_string());
                }
                obj.insert(k.clone(), Value::from(n));
            }
            "currentCalendarYear" => {
                if v.is_null() {
                    obj.insert(k.clone(), Value::Null);
                    continue;
                }
                let n = v
                    .as_i64()
                    .ok_or_else(|| "currentCalendarYear must be integer or null".to_string())?;
                if !(1900..=2200).contains(&n) {
                    return Err("currentCalendarYear must be in 1900..=2200".to_string());
                }
                obj.insert(k.clone(), Value::from(n));
            }
            _ => return Err(format!("unknown scoring field: {}", k)),
        }
    }
    Ok(())
}

fn load_scoring(conn: &rusqlite::Connection) -> Result<Value, EngineError> {
    let mut current = default_scoring();
    if let Some(saved) = db::settings_get_json(conn, SCORING_KEY)
        .map_err(|e| EngineError::new("db_query_failed", e.to_string()))?
    {
        if let Some(saved_obj) = saved.as_object() {
            // Best-effort apply: malformed historical values should not block setup.
            let _ = merge_scoring_patch(&mut current, saved_obj);
        }
    }
    Ok(current)
}

fn handle_scoring_get(state: &AppState) -> Result<Value, EngineError> {
    let conn = open_conn(state)?;
    load_scoring(conn)
}

fn handle_scoring_update(state: &AppState, req: &Request) -> Result<Value, EngineError> {
    let conn = open_conn(state)?;
    let patch = req
        .params
        .get("patch")
        .and_then(|v| v.as_object())
        .ok_or_else(|| EngineError::new("bad_params", "patch must be an object"))?;

    let mut current = load_scoring(conn)?;
    merge_scoring_patch(&mut current, patch).map_err(|m| EngineError::new("bad_params", m))?;
    db::settings_set_json(conn, SCORING_KEY, &current)
        .map_err(|e| EngineError::new("db_update_failed", e.to_string()))?;
    Ok(current)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.scoringGet" => Some(respond(&req.id, handle_scoring_get(state))),
        "setup.scoringUpdate" => Some(respond(&req.id, handle_scoring_update(state, req))),
        _ => None,
    }
}
