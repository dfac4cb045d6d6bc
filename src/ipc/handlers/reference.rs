use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::ipc::helpers::{open_conn, respond};
use crate::ipc::types::{AppState, Request};
use crate::sampler::Difficulty;
use crate::scoring::EngineError;

/// Replace the course -> skill reference table from a seeding payload.
/// Bad rows (missing fields, out-of-range weight) are skipped with a warning,
/// never fatal to the load.
fn handle_skill_map_replace(state: &AppState, req: &Request) -> Result<Value, EngineError> {
    let conn = open_conn(state)?;
    let rows = req
        .params
        .get("mappings")
        .and_then(|v| v.as_array())
        .ok_or_else(|| EngineError::new("bad_params", "mappings must be an array"))?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| EngineError::new("db_tx_failed", e.to_string()))?;
    tx.execute("DELETE FROM course_skill_map", [])
        .map_err(EngineError::db)?;

    let mut inserted = 0_i64;
    let mut warnings: Vec<String> = Vec::new();
    for (idx, row) in rows.iter().enumerate() {
        let course_code = row
            .get("courseCode")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .unwrap_or("");
        let skill_name = row
            .get("skillName")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .unwrap_or("");
        if course_code.is_empty() || skill_name.is_empty() {
            warnings.push(format!("row {}: missing courseCode or skillName", idx + 1));
            continue;
        }
        let Some(map_weight) = row.get("mapWeight").and_then(|v| v.as_f64()) else {
            warnings.push(format!("row {}: invalid mapWeight", idx + 1));
            continue;
        };
        if !(0.0..=1.0).contains(&map_weight) {
            warnings.push(format!(
                "row {}: mapWeight {} is outside [0, 1] for {}/{}",
                idx + 1,
                map_weight,
                course_code,
                skill_name
            ));
            continue;
        }

        let changed = tx
            .execute(
                "INSERT OR IGNORE INTO course_skill_map(id, course_code, skill_name, map_weight)
                 VALUES(?, ?, ?, ?)",
                (
                    Uuid::new_v4().to_string(),
                    course_code,
                    skill_name,
                    map_weight,
                ),
            )
            .map_err(|e| EngineError::new("db_insert_failed", e.to_string()))?;
        if changed == 0 {
            warnings.push(format!(
                "row {}: duplicate mapping {}/{} skipped",
                idx + 1,
                course_code,
                skill_name
            ));
        } else {
            inserted += 1;
        }
    }

    tx.commit()
        .map_err(|e| EngineError::new("db_tx_failed", e.to_string()))?;

    Ok(json!({ "inserted": inserted, "warnings": warnings }))
}

fn handle_skill_map_list(state: &AppState) -> Result<Value, EngineError> {
    let conn = open_conn(state)?;
    let mut stmt = conn
        .prepare(
            "SELECT course_code, skill_name, map_weight
             FROM course_skill_map
             ORDER BY course_code, skill_name",
        )
        .map_err(EngineError::db)?;
    let mappings = stmt
        .query_map([], |r| {
            Ok(json!({
                "courseCode": r.get::<_, String>(0)?,
                "skillName": r.get::<_, String>(1)?,
                "mapWeight": r.get::<_, f64>(2)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(EngineError::db)?;
    Ok(json!({ "mappings": mappings }))
}

/// Accept pre-generated questions from the external generator. The sampler
/// only ever reads this table.
fn handle_bank_add(state: &AppState, req: &Request) -> Result<Value, EngineError> {
    let conn = open_conn(state)?;
    let rows = req
        .params
        .get("questions")
        .and_then(|v| v.as_array())
        .ok_or_else(|| EngineError::new("bad_params", "questions must be an array"))?;

    let now = Utc::now().to_rfc3339();
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| EngineError::new("db_tx_failed", e.to_string()))?;

    let mut inserted = 0_i64;
    let mut duplicates_skipped = 0_i64;
    let mut warnings: Vec<String> = Vec::new();
    for (idx, row) in rows.iter().enumerate() {
        let skill_name = row
            .get("skillName")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .unwrap_or("");
        let question_text = row
            .get("questionText")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .unwrap_or("");
        if skill_name.is_empty() || question_text.is_empty() {
            warnings.push(format!("row {}: missing skillName or questionText", idx + 1));
            continue;
        }
        let Some(difficulty) = row
            .get("difficulty")
            .and_then(|v| v.as_str())
            .and_then(Difficulty::parse)
        else {
            warnings.push(format!(
                "row {}: difficulty must be one of easy, medium, hard",
                idx + 1
            ));
            continue;
        };
        let correct_option = row
            .get("correctOption")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_ascii_uppercase())
            .unwrap_or_default();
        if !matches!(correct_option.as_str(), "A" | "B" | "C" | "D") {
            warnings.push(format!(
                "row {}: correctOption must be one of A, B, C, D",
                idx + 1
            ));
            continue;
        }
        let Some(options) = row.get("options").and_then(|v| v.as_object()) else {
            warnings.push(format!("row {}: options must be an object", idx + 1));
            continue;
        };
        if !["A", "B", "C", "D"].iter().all(|k| {
            options
                .get(*k)
                .and_then(|v| v.as_str())
                .map(|s| !s.trim().is_empty())
                .unwrap_or(false)
        }) {
            warnings.push(format!(
                "row {}: options must carry non-empty A, B, C and D texts",
                idx + 1
            ));
            continue;
        }
        let explanation = row
            .get("explanation")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        let model_name = row.get("modelName").and_then(|v| v.as_str());

        let options_json = Value::Object(options.clone()).to_string();
        let changed = tx
            .execute(
                "INSERT OR IGNORE INTO question_bank(
                    id, skill_name, difficulty, question_text, options_json,
                    correct_option, explanation, model_name, created_at
                 ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
                (
                    Uuid::new_v4().to_string(),
                    skill_name,
                    difficulty.as_str(),
                    question_text,
                    &options_json,
                    &correct_option,
                    explanation,
                    model_name,
                    &now,
                ),
            )
            .map_err(|e| EngineError::new("db_insert_failed", e.to_string()))?;
        if changed == 0 {
            duplicates_skipped += 1;
        } else {
            inserted += 1;
        }
    }

    tx.commit()
        .map_err(|e| EngineError::new("db_tx_failed", e.to_string()))?;

    Ok(json!({
        "inserted": inserted,
        "duplicatesSkipped": duplicates_skipped,
        "warnings": warnings
    }))
}

fn handle_bank_stats(state: &AppState) -> Result<Value, EngineError> {
    let conn = open_conn(state)?;
    let total: i64 = conn
        .query_row("SELECT COUNT(*) FROM question_bank", [], |r| r.get(0))
        .map_err(EngineError::db)?;

    let mut stmt = conn
        .prepare(
            "SELECT skill_name, difficulty, COUNT(*)
             FROM question_bank
             GROUP BY skill_name, difficulty
             ORDER BY skill_name, difficulty",
        )
        .map_err(EngineError::db)?;
    let rows: Vec<(String, String, i64)> = stmt
        .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(EngineError::db)?;

    let mut by_skill = serde_json::Map::new();
    for (skill_name, difficulty, count) in rows {
        let entry = by_skill.entry(skill_name).or_insert_with(|| {
            json!({ "easy": 0, "medium": 0, "hard": 0, "total": 0 })
        });
        let total = entry["total"].as_i64().unwrap_or(0) + count;
        entry[difficulty.as_str()] = json!(count);
        entry["total"] = json!(total);
    }

    Ok(json!({
        "totalQuestions": total,
        "bySkill": Value::Object(by_skill)
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "skillMap.replace" => Some(respond(&req.id, handle_skill_map_replace(state, req))),
        "skillMap.list" => Some(respond(&req.id, handle_skill_map_list(state))),
        "bank.add" => Some(respond(&req.id, handle_bank_add(state, req))),
        "bank.stats" => Some(respond(&req.id, handle_bank_stats(state))),
        _ => None,
    }
}
