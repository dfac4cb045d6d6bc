use serde_json::{json, Value};

use crate::ipc::helpers::{get_required_str, open_conn, respond, to_json};
use crate::ipc::types::{AppState, Request};
use crate::scoring::{self, EngineError, ScoringConfig};

fn handle_recompute(state: &AppState, req: &Request) -> Result<Value, EngineError> {
    let conn = open_conn(state)?;
    let student_id = get_required_str(&req.params, "studentId")?;

    let cfg = ScoringConfig::load(conn);
    let summary = scoring::recompute_claimed_skills(conn, &cfg, &student_id)?;
    if summary.skills_computed == 0 {
        return Err(EngineError::new(
            "not_found",
            format!(
                "no courses or skill mappings found for student {}",
                student_id
            ),
        ));
    }

    Ok(json!({
        "studentId": summary.student_id,
        "skillsComputed": summary.skills_computed,
        "evidenceRows": summary.evidence_rows,
        "claimed": to_json(&summary.claimed)?
    }))
}

fn handle_claimed(state: &AppState, req: &Request) -> Result<Value, EngineError> {
    let conn = open_conn(state)?;
    let student_id = get_required_str(&req.params, "studentId")?;

    let claimed = scoring::claimed_profile(conn, &student_id)?;
    if claimed.is_empty() {
        return Err(EngineError::new(
            "not_found",
            format!("no claimed skills found for student {}", student_id),
        ));
    }
    Ok(json!({ "studentId": student_id, "claimed": to_json(&claimed)? }))
}

fn handle_explain(state: &AppState, req: &Request) -> Result<Value, EngineError> {
    let conn = open_conn(state)?;
    let student_id = get_required_str(&req.params, "studentId")?;
    let skill_name = get_required_str(&req.params, "skillName")?;

    let Some((summary, evidence)) = scoring::explain_skill(conn, &student_id, &skill_name)? else {
        return Err(EngineError::new(
            "not_found",
            format!("skill '{}' not found for student {}", skill_name, student_id),
        ));
    };

    Ok(json!({
        "skillSummary": to_json(&summary)?,
        "evidence": to_json(&evidence)?
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "skills.recompute" => Some(respond(&req.id, handle_recompute(state, req))),
        "skills.claimed" => Some(respond(&req.id, handle_claimed(state, req))),
        "skills.explain" => Some(respond(&req.id, handle_explain(state, req))),
        _ => None,
    }
}
