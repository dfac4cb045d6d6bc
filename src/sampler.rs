use chrono::Utc;
use rusqlite::{params_from_iter, types::Value, Connection};
use serde::Serialize;
use uuid::Uuid;

use crate::planner::QuizPlan;
use crate::scoring::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

impl Difficulty {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "easy" => Some(Self::Easy),
            "medium" => Some(Self::Medium),
            "hard" => Some(Self::Hard),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Easy => "easy",
            Self::Medium => "medium",
            Self::Hard => "hard",
        }
    }

    /// Substitution order when a cell runs dry. The table is asymmetric on
    /// purpose: medium prefers easier material, easy climbs to medium first.
    pub fn fallback_order(self) -> [Self; 2] {
        match self {
            Self::Hard => [Self::Medium, Self::Easy],
            Self::Medium => [Self::Easy, Self::Hard],
            Self::Easy => [Self::Medium, Self::Hard],
        }
    }
}

#[derive(Debug, Clone)]
pub struct SlotRequest {
    pub skill_name: String,
    pub difficulty: Difficulty,
    pub count: i64,
}

/// One slot per non-empty (skill, difficulty) cell, skills in plan order,
/// difficulties easy -> medium -> hard.
pub fn flatten_plan(plan: &QuizPlan) -> Vec<SlotRequest> {
    let mut slots = Vec::new();
    for sm in &plan.difficulty_mix {
        for (difficulty, count) in [
            (Difficulty::Easy, sm.mix.easy),
            (Difficulty::Medium, sm.mix.medium),
            (Difficulty::Hard, sm.mix.hard),
        ] {
            if count > 0 {
                slots.push(SlotRequest {
                    skill_name: sm.skill_name.clone(),
                    difficulty,
                    count,
                });
            }
        }
    }
    slots
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleWarning {
    pub skill: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone)]
struct BankRow {
    id: String,
    skill_name: String,
    difficulty: String,
    question_text: String,
    options_json: String,
    correct_option: String,
    explanation: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedQuestion {
    pub question_id: String,
    pub skill_name: String,
    pub difficulty: String,
    pub question_text: String,
    pub options: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SampledQuiz {
    pub attempt_id: String,
    pub questions: Vec<IssuedQuestion>,
    pub warnings: Vec<SampleWarning>,
}

/// Uniform draw without replacement from one bank cell, excluding rows
/// already picked for this quiz so a fallback can never issue a duplicate.
fn sample_cell(
    conn: &Connection,
    skill_name: &str,
    difficulty: Difficulty,
    limit: i64,
    exclude: &[String],
) -> Result<Vec<BankRow>, EngineError> {
    let placeholders = std::iter::repeat("?")
        .take(exclude.len())
        .collect::<Vec<_>>()
        .join(",");
    let sql = if exclude.is_empty() {
        "SELECT id, skill_name, difficulty, question_text, options_json, correct_option, explanation
         FROM question_bank
         WHERE skill_name = ? AND difficulty = ?
         ORDER BY RANDOM()
         LIMIT ?"
            .to_string()
    } else {
        format!(
            "SELECT id, skill_name, difficulty, question_text, options_json, correct_option, explanation
             FROM question_bank
             WHERE skill_name = ? AND difficulty = ? AND id NOT IN ({})
             ORDER BY RANDOM()
             LIMIT ?",
            placeholders
        )
    };

    let mut bind_values: Vec<Value> = Vec::with_capacity(exclude.len() + 3);
    bind_values.push(Value::Text(skill_name.to_string()));
    bind_values.push(Value::Text(difficulty.as_str().to_string()));
    for id in exclude {
        bind_values.push(Value::Text(id.clone()));
    }
    bind_values.push(Value::Integer(limit));

    let mut stmt = conn.prepare(&sql).map_err(EngineError::db)?;
    stmt.query_map(params_from_iter(bind_values), |r| {
        Ok(BankRow {
            id: r.get(0)?,
            skill_name: r.get(1)?,
            difficulty: r.get(2)?,
            question_text: r.get(3)?,
            options_json: r.get(4)?,
            correct_option: r.get(5)?,
            explanation: r.get(6)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(EngineError::db)
}

/// Sample a quiz for the plan and persist it as a new attempt with frozen
/// questions. Partial fulfillment is the normal success path; the request
/// fails only when no slot could be filled at all.
pub fn sample_from_plan(conn: &Connection, plan: &QuizPlan) -> Result<SampledQuiz, EngineError> {
    let slots = flatten_plan(plan);
    let mut picked: Vec<BankRow> = Vec::new();
    let mut picked_ids: Vec<String> = Vec::new();
    let mut warnings: Vec<SampleWarning> = Vec::new();

    for slot in &slots {
        let exact = sample_cell(conn, &slot.skill_name, slot.difficulty, slot.count, &picked_ids)?;

        if exact.is_empty() {
            warnings.push(SampleWarning {
                skill: slot.skill_name.clone(),
                difficulty: Some(slot.difficulty.as_str().to_string()),
                message: format!(
                    "no {} questions available for {}",
                    slot.difficulty.as_str(),
                    slot.skill_name
                ),
            });

            let mut substituted = false;
            for fb in slot.difficulty.fallback_order() {
                let rows = sample_cell(conn, &slot.skill_name, fb, slot.count, &picked_ids)?;
                if rows.is_empty() {
                    continue;
                }
                warnings.push(SampleWarning {
                    skill: slot.skill_name.clone(),
                    difficulty: None,
                    message: format!(
                        "used {} {} questions instead of {}",
                        rows.len(),
                        fb.as_str(),
                        slot.difficulty.as_str()
                    ),
                });
                for row in rows {
                    picked_ids.push(row.id.clone());
                    picked.push(row);
                }
                substituted = true;
                break;
            }
            if !substituted {
                warnings.push(SampleWarning {
                    skill: slot.skill_name.clone(),
                    difficulty: None,
                    message: format!(
                        "skipping {} - no questions available in any difficulty",
                        slot.skill_name
                    ),
                });
            }
            continue;
        }

        let found = exact.len() as i64;
        for row in exact {
            picked_ids.push(row.id.clone());
            picked.push(row);
        }

        let mut remaining = slot.count - found;
        if remaining > 0 {
            warnings.push(SampleWarning {
                skill: slot.skill_name.clone(),
                difficulty: Some(slot.difficulty.as_str().to_string()),
                message: format!(
                    "only {}/{} {} questions available for {}",
                    found,
                    slot.count,
                    slot.difficulty.as_str(),
                    slot.skill_name
                ),
            });
            for fb in slot.difficulty.fallback_order() {
                let rows = sample_cell(conn, &slot.skill_name, fb, remaining, &picked_ids)?;
                if rows.is_empty() {
                    continue;
                }
                warnings.push(SampleWarning {
                    skill: slot.skill_name.clone(),
                    difficulty: None,
                    message: format!("filled {} with {} difficulty", rows.len(), fb.as_str()),
                });
                remaining -= rows.len() as i64;
                for row in rows {
                    picked_ids.push(row.id.clone());
                    picked.push(row);
                }
                if remaining <= 0 {
                    break;
                }
            }
        }
    }

    if picked.is_empty() {
        return Err(EngineError::new(
            "empty_bank",
            "question bank has no matching questions for the quiz plan",
        ));
    }

    let attempt_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| EngineError::new("db_tx_failed", e.to_string()))?;
    tx.execute(
        "INSERT INTO quiz_attempt(attempt_id, student_id, plan_id, source, created_at)
         VALUES(?, ?, ?, ?, ?)",
        (&attempt_id, &plan.student_id, &plan.id, "bank", &now),
    )
    .map_err(|e| EngineError::new("db_insert_failed", e.to_string()))?;

    let mut questions = Vec::with_capacity(picked.len());
    for row in &picked {
        let question_id = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO quiz_question(
                question_id, attempt_id, student_id, skill_name, difficulty,
                question_text, options_json, correct_option, explanation
             ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
            (
                &question_id,
                &attempt_id,
                &plan.student_id,
                &row.skill_name,
                &row.difficulty,
                &row.question_text,
                &row.options_json,
                &row.correct_option,
                &row.explanation,
            ),
        )
        .map_err(|e| EngineError::new("db_insert_failed", e.to_string()))?;

        // Answers stay server-side; the issued question carries only what the
        // student is allowed to see.
        let options: serde_json::Value =
            serde_json::from_str(&row.options_json).unwrap_or(serde_json::Value::Null);
        questions.push(IssuedQuestion {
            question_id,
            skill_name: row.skill_name.clone(),
            difficulty: row.difficulty.clone(),
            question_text: row.question_text.clone(),
            options,
        });
    }
    tx.commit()
        .map_err(|e| EngineError::new("db_tx_failed", e.to_string()))?;

    Ok(SampledQuiz {
        attempt_id,
        questions,
        warnings,
    })
}
