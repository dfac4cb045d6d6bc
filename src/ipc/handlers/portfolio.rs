use serde_json::{json, Value};

use crate::grader;
use crate::ipc::helpers::{get_required_str, open_conn, respond, to_json};
use crate::ipc::types::{AppState, Request};
use crate::scoring::EngineError;

fn handle_get(state: &AppState, req: &Request) -> Result<Value, EngineError> {
    let conn = open_conn(state)?;
    let student_id = get_required_str(&req.params, "studentId")?;

    let rows = grader::portfolio_rows(conn, &student_id)?;
    if rows.is_empty() {
        return Err(EngineError::new(
            "not_found",
            format!("no portfolio found for student {}", student_id),
        ));
    }
    Ok(json!({ "studentId": student_id, "portfolio": to_json(&rows)? }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "portfolio.get" => Some(respond(&req.id, handle_get(state, req))),
        _ => None,
    }
}
