use serde_json::Value;

use crate::grader::{self, SubmittedAnswer};
use crate::ipc::helpers::{get_required_str, open_conn, respond, to_json};
use crate::ipc::types::{AppState, Request};
use crate::planner;
use crate::sampler;
use crate::scoring::EngineError;

fn handle_plan_create(state: &AppState, req: &Request) -> Result<Value, EngineError> {
    let conn = open_conn(state)?;
    let student_id = get_required_str(&req.params, "studentId")?;

    let selected_skills = match req.params.get("selectedSkills") {
        None | Some(Value::Null) => None,
        Some(v) => {
            let arr = v
                .as_array()
                .ok_or_else(|| EngineError::new("bad_params", "selectedSkills must be an array"))?;
            let mut names = Vec::with_capacity(arr.len());
            for item in arr {
                let name = item.as_str().map(str::trim).filter(|s| !s.is_empty()).ok_or_else(
                    || EngineError::new("bad_params", "selectedSkills entries must be strings"),
                )?;
                names.push(name.to_string());
            }
            Some(names)
        }
    };

    let plan = planner::create_plan(conn, &student_id, selected_skills)?;
    to_json(&plan)
}

fn handle_plan_latest(state: &AppState, req: &Request) -> Result<Value, EngineError> {
    let conn = open_conn(state)?;
    let student_id = get_required_str(&req.params, "studentId")?;

    let Some(plan) = planner::latest_plan(conn, &student_id)? else {
        return Err(EngineError::new(
            "not_found",
            format!("no quiz plan found for student {}", student_id),
        ));
    };
    to_json(&plan)
}

/// Draw a quiz from the bank against the student's latest plan; the attempt
/// and its frozen questions are persisted before the response goes out.
fn handle_sample(state: &AppState, req: &Request) -> Result<Value, EngineError> {
    let conn = open_conn(state)?;
    let student_id = get_required_str(&req.params, "studentId")?;

    let Some(plan) = planner::latest_plan(conn, &student_id)? else {
        return Err(EngineError::new(
            "not_found",
            format!("no quiz plan found for student {}", student_id),
        ));
    };
    let quiz = sampler::sample_from_plan(conn, &plan)?;
    to_json(&quiz)
}

fn handle_submit(state: &AppState, req: &Request) -> Result<Value, EngineError> {
    let conn = open_conn(state)?;
    let student_id = get_required_str(&req.params, "studentId")?;
    let attempt_id = get_required_str(&req.params, "attemptId")?;
    let raw = req
        .params
        .get("answers")
        .and_then(|v| v.as_array())
        .ok_or_else(|| EngineError::new("bad_params", "answers must be an array"))?;

    let mut answers = Vec::with_capacity(raw.len());
    for (idx, row) in raw.iter().enumerate() {
        let question_id = row
            .get("questionId")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                EngineError::new("bad_params", format!("answer {}: missing questionId", idx + 1))
            })?;
        let selected_option = row
            .get("selectedOption")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                EngineError::new(
                    "bad_params",
                    format!("answer {}: missing selectedOption", idx + 1),
                )
            })?;
        answers.push(SubmittedAnswer {
            question_id: question_id.to_string(),
            selected_option: selected_option.to_string(),
        });
    }

    let result = grader::submit_attempt(conn, &student_id, &attempt_id, &answers)?;
    to_json(&result)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "quiz.planCreate" => Some(respond(&req.id, handle_plan_create(state, req))),
        "quiz.planLatest" => Some(respond(&req.id, handle_plan_latest(state, req))),
        "quiz.sample" => Some(respond(&req.id, handle_sample(state, req))),
        "quiz.submit" => Some(respond(&req.id, handle_submit(state, req))),
        _ => None,
    }
}
