use chrono::Utc;
use rusqlite::Connection;
use serde::Serialize;
use serde_json::json;
use std::cmp::Ordering;
use uuid::Uuid;

use crate::scoring::{ClaimedSkill, EngineError};

pub const MAX_SKILLS_ALLOWED: usize = 5;
pub const QUESTIONS_PER_SKILL: i64 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DifficultyMix {
    pub easy: i64,
    pub medium: i64,
    pub hard: i64,
}

/// Mix derives from the claimed score alone: strong skills get probed with
/// harder questions, weak skills stay on easy/medium ground.
pub fn difficulty_mix_for_score(score: f64) -> DifficultyMix {
    if score >= 85.0 {
        DifficultyMix {
            easy: 1,
            medium: 1,
            hard: 2,
        }
    } else if score >= 70.0 {
        DifficultyMix {
            easy: 2,
            medium: 1,
            hard: 1,
        }
    } else {
        DifficultyMix {
            easy: 2,
            medium: 2,
            hard: 0,
        }
    }
}

/// Auto-pick priority: least-confident first, then closest to the contestable
/// 70 zone, then highest score as the final tiebreak.
pub fn rank_for_auto_selection(skills: &mut [ClaimedSkill]) {
    skills.sort_by(|a, b| {
        a.confidence
            .partial_cmp(&b.confidence)
            .unwrap_or(Ordering::Equal)
            .then_with(|| {
                let da = (a.claimed_score - 70.0).abs();
                let db = (b.claimed_score - 70.0).abs();
                da.partial_cmp(&db).unwrap_or(Ordering::Equal)
            })
            .then_with(|| {
                b.claimed_score
                    .partial_cmp(&a.claimed_score)
                    .unwrap_or(Ordering::Equal)
            })
    });
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizPlan {
    pub id: String,
    pub student_id: String,
    pub skills: Vec<String>,
    pub difficulty_mix: Vec<SkillMix>,
    pub questions_per_skill: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillMix {
    pub skill_name: String,
    pub mix: DifficultyMix,
}

/// Create (and persist) a plan for the student, replacing any prior plan in
/// the same transaction so exactly one plan is active per student.
pub fn create_plan(
    conn: &Connection,
    student_id: &str,
    selected_skills: Option<Vec<String>>,
) -> Result<QuizPlan, EngineError> {
    let mut claimed = crate::scoring::claimed_profile(conn, student_id)?;
    if claimed.is_empty() {
        return Err(EngineError::new(
            "not_found",
            format!("no claimed skills found for student {}", student_id),
        ));
    }

    let selected: Vec<ClaimedSkill> = match selected_skills {
        Some(names) => {
            if names.len() > MAX_SKILLS_ALLOWED {
                return Err(EngineError::new(
                    "too_many_skills",
                    format!(
                        "too many skills selected: maximum {}, got {}",
                        MAX_SKILLS_ALLOWED,
                        names.len()
                    ),
                ));
            }
            let mut picked = Vec::with_capacity(names.len());
            for name in &names {
                match claimed.iter().find(|s| &s.skill_name == name) {
                    Some(s) => picked.push(s.clone()),
                    None => {
                        return Err(EngineError::new(
                            "skill_not_found",
                            format!("skill '{}' not found for student {}", name, student_id),
                        ))
                    }
                }
            }
            picked
        }
        None => {
            rank_for_auto_selection(&mut claimed);
            claimed.into_iter().take(MAX_SKILLS_ALLOWED).collect()
        }
    };

    let skills: Vec<String> = selected.iter().map(|s| s.skill_name.clone()).collect();
    let difficulty_mix: Vec<SkillMix> = selected
        .iter()
        .map(|s| SkillMix {
            skill_name: s.skill_name.clone(),
            mix: difficulty_mix_for_score(s.claimed_score),
        })
        .collect();

    let mix_json = {
        let mut obj = serde_json::Map::new();
        for sm in &difficulty_mix {
            obj.insert(
                sm.skill_name.clone(),
                json!({ "easy": sm.mix.easy, "medium": sm.mix.medium, "hard": sm.mix.hard }),
            );
        }
        serde_json::Value::Object(obj).to_string()
    };
    let skills_json = serde_json::to_string(&skills)
        .map_err(|e| EngineError::new("internal", e.to_string()))?;

    let plan = QuizPlan {
        id: Uuid::new_v4().to_string(),
        student_id: student_id.to_string(),
        skills,
        difficulty_mix,
        questions_per_skill: QUESTIONS_PER_SKILL,
        created_at: Utc::now().to_rfc3339(),
    };

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| EngineError::new("db_tx_failed", e.to_string()))?;
    tx.execute("DELETE FROM quiz_plan WHERE student_id = ?", [student_id])
        .map_err(EngineError::db)?;
    tx.execute(
        "INSERT INTO quiz_plan(
            id, student_id, skills_json, difficulty_mix_json, questions_per_skill, created_at
         ) VALUES(?, ?, ?, ?, ?, ?)",
        (
            &plan.id,
            student_id,
            &skills_json,
            &mix_json,
            plan.questions_per_skill,
            &plan.created_at,
        ),
    )
    .map_err(|e| EngineError::new("db_insert_failed", e.to_string()))?;
    tx.commit()
        .map_err(|e| EngineError::new("db_tx_failed", e.to_string()))?;

    Ok(plan)
}

pub fn latest_plan(conn: &Connection, student_id: &str) -> Result<Option<QuizPlan>, EngineError> {
    use rusqlite::OptionalExtension;

    let row: Option<(String, String, String, i64, String)> = conn
        .query_row(
            "SELECT id, skills_json, difficulty_mix_json, questions_per_skill, created_at
             FROM quiz_plan
             WHERE student_id = ?
             ORDER BY created_at DESC
             LIMIT 1",
            [student_id],
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                ))
            },
        )
        .optional()
        .map_err(EngineError::db)?;
    let Some((id, skills_json, mix_json, questions_per_skill, created_at)) = row else {
        return Ok(None);
    };

    let skills: Vec<String> = serde_json::from_str(&skills_json)
        .map_err(|e| EngineError::new("internal", format!("bad skills_json: {}", e)))?;
    let mix_value: serde_json::Value = serde_json::from_str(&mix_json)
        .map_err(|e| EngineError::new("internal", format!("bad difficulty_mix_json: {}", e)))?;

    let mut difficulty_mix = Vec::with_capacity(skills.len());
    for name in &skills {
        let m = mix_value.get(name);
        let get = |k: &str| m.and_then(|v| v.get(k)).and_then(|v| v.as_i64()).unwrap_or(0);
        difficulty_mix.push(SkillMix {
            skill_name: name.clone(),
            mix: DifficultyMix {
                easy: get("easy"),
                medium: get("medium"),
                hard: get("hard"),
            },
        });
    }

    Ok(Some(QuizPlan {
        id,
        student_id: student_id.to_string(),
        skills,
        difficulty_mix,
        questions_per_skill,
        created_at,
    }))
}
