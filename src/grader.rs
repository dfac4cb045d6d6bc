use chrono::Utc;
use rusqlite::Connection;
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::scoring::{level_for_score, EngineError};

pub const UNANSWERED: &str = "UNANSWERED";
pub const QUIZ_WEIGHT_BASE: f64 = 0.50;
pub const QUIZ_WEIGHT_PER_QUESTION: f64 = 0.05;
pub const QUIZ_WEIGHT_CAP: f64 = 0.80;

/// More questions answered for a skill earns quiz evidence more trust,
/// capped at 80% so the transcript never fully drops out.
pub fn quiz_weight(total_questions: i64) -> f64 {
    (QUIZ_WEIGHT_BASE + QUIZ_WEIGHT_PER_QUESTION * total_questions as f64).min(QUIZ_WEIGHT_CAP)
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[derive(Debug, Clone)]
pub struct SubmittedAnswer {
    pub question_id: String,
    pub selected_option: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillResult {
    pub skill_name: String,
    pub correct: i64,
    pub total_questions: i64,
    pub verified_score: f64,
    pub verified_level: String,
    pub claimed_score: f64,
    pub quiz_weight: f64,
    pub claimed_weight: f64,
    pub final_score: f64,
    pub final_level: String,
    pub explanation: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioRow {
    pub skill_name: String,
    pub claimed_score: f64,
    pub verified_score: f64,
    pub quiz_weight: f64,
    pub claimed_weight: f64,
    pub final_score: f64,
    pub final_level: String,
    pub correct_count: i64,
    pub total_questions: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionResult {
    pub attempt_id: String,
    pub total_questions: i64,
    pub questions_correct: i64,
    pub overall_verified_score: f64,
    pub average_final_score: f64,
    pub per_skill: Vec<SkillResult>,
    pub portfolio: Vec<PortfolioRow>,
}

#[derive(Debug, Clone)]
struct AttemptQuestion {
    skill_name: String,
    correct_option: String,
}

#[derive(Debug, Clone, Copy, Default)]
struct SkillTally {
    correct: i64,
    total: i64,
}

/// Grade one attempt and fold the result into the portfolio of record.
///
/// The whole submission is one transaction: answers are replaced (never
/// appended), every question in the attempt lands in the denominator, and the
/// portfolio upsert rides the (student_id, skill_name) unique key so a
/// resubmission converges on identical rows.
pub fn submit_attempt(
    conn: &Connection,
    student_id: &str,
    attempt_id: &str,
    answers: &[SubmittedAnswer],
) -> Result<SubmissionResult, EngineError> {
    let questions: BTreeMap<String, AttemptQuestion> = {
        let mut stmt = conn
            .prepare(
                "SELECT question_id, skill_name, correct_option
                 FROM quiz_question
                 WHERE attempt_id = ? AND student_id = ?",
            )
            .map_err(EngineError::db)?;
        stmt.query_map((attempt_id, student_id), |r| {
            Ok((
                r.get::<_, String>(0)?,
                AttemptQuestion {
                    skill_name: r.get(1)?,
                    correct_option: r.get(2)?,
                },
            ))
        })
        .and_then(|it| it.collect::<Result<BTreeMap<_, _>, _>>())
        .map_err(EngineError::db)?
    };

    if questions.is_empty() {
        return Err(EngineError::new(
            "attempt_not_found",
            format!(
                "quiz attempt {} not found for student {}",
                attempt_id, student_id
            ),
        ));
    }

    // Validate the whole submission before touching any row.
    let mut selected: BTreeMap<&str, String> = BTreeMap::new();
    let mut unknown: Vec<&str> = Vec::new();
    for ans in answers {
        if !questions.contains_key(&ans.question_id) {
            unknown.push(&ans.question_id);
            continue;
        }
        let option = ans.selected_option.trim().to_ascii_uppercase();
        if !matches!(option.as_str(), "A" | "B" | "C" | "D") {
            return Err(EngineError::new(
                "bad_params",
                format!(
                    "selected option for question {} must be one of A, B, C, D",
                    ans.question_id
                ),
            ));
        }
        selected.insert(ans.question_id.as_str(), option);
    }
    if !unknown.is_empty() {
        unknown.sort_unstable();
        return Err(EngineError::new(
            "invalid_question_id",
            format!("invalid question ids for this attempt: {}", unknown.join(", ")),
        ));
    }

    let claimed_scores: BTreeMap<String, f64> = {
        let mut stmt = conn
            .prepare(
                "SELECT skill_name, claimed_score
                 FROM skill_profile_claimed
                 WHERE student_id = ?",
            )
            .map_err(EngineError::db)?;
        stmt.query_map([student_id], |r| Ok((r.get(0)?, r.get(1)?)))
            .and_then(|it| it.collect::<Result<BTreeMap<_, _>, _>>())
            .map_err(EngineError::db)?
    };

    let now = Utc::now().to_rfc3339();
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| EngineError::new("db_tx_failed", e.to_string()))?;

    tx.execute(
        "DELETE FROM quiz_answer WHERE attempt_id = ? AND student_id = ?",
        (attempt_id, student_id),
    )
    .map_err(EngineError::db)?;

    let mut tallies: BTreeMap<String, SkillTally> = BTreeMap::new();
    for (question_id, q) in &questions {
        let (option, is_correct) = match selected.get(question_id.as_str()) {
            Some(opt) => (opt.clone(), *opt == q.correct_option),
            // Unanswered counts against the skill, never drops out.
            None => (UNANSWERED.to_string(), false),
        };
        tx.execute(
            "INSERT INTO quiz_answer(
                id, attempt_id, question_id, student_id, selected_option, is_correct, created_at
             ) VALUES(?, ?, ?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                attempt_id,
                question_id,
                student_id,
                &option,
                is_correct as i64,
                &now,
            ),
        )
        .map_err(|e| EngineError::new("db_insert_failed", e.to_string()))?;

        let tally = tallies.entry(q.skill_name.clone()).or_default();
        tally.total += 1;
        if is_correct {
            tally.correct += 1;
        }
    }

    let mut per_skill: Vec<SkillResult> = Vec::with_capacity(tallies.len());
    for (skill_name, tally) in &tallies {
        let verified_score = 100.0 * tally.correct as f64 / tally.total as f64;
        let claimed_score = claimed_scores.get(skill_name).copied().unwrap_or(0.0);
        let w_quiz = quiz_weight(tally.total);
        let w_claimed = 1.0 - w_quiz;
        let final_score = w_quiz * verified_score + w_claimed * claimed_score;
        let final_level = level_for_score(final_score).to_string();

        tx.execute(
            "INSERT INTO student_skill_portfolio(
                id, student_id, skill_name, claimed_score, verified_score,
                quiz_weight, claimed_weight, final_score, final_level,
                correct_count, total_questions, updated_at
             ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(student_id, skill_name) DO UPDATE SET
                claimed_score = excluded.claimed_score,
                verified_score = excluded.verified_score,
                quiz_weight = excluded.quiz_weight,
                claimed_weight = excluded.claimed_weight,
                final_score = excluded.final_score,
                final_level = excluded.final_level,
                correct_count = excluded.correct_count,
                total_questions = excluded.total_questions,
                updated_at = excluded.updated_at",
            (
                Uuid::new_v4().to_string(),
                student_id,
                skill_name,
                claimed_score,
                verified_score,
                w_quiz,
                w_claimed,
                final_score,
                &final_level,
                tally.correct,
                tally.total,
                &now,
            ),
        )
        .map_err(|e| EngineError::new("db_insert_failed", e.to_string()))?;

        per_skill.push(SkillResult {
            skill_name: skill_name.clone(),
            correct: tally.correct,
            total_questions: tally.total,
            verified_score: round2(verified_score),
            verified_level: level_for_score(verified_score).to_string(),
            claimed_score: round2(claimed_score),
            quiz_weight: w_quiz,
            claimed_weight: w_claimed,
            final_score: round2(final_score),
            final_level,
            explanation: format!(
                "Final score blends {}% quiz ({}) with {}% transcript ({}); quiz weight grows with question count.",
                (w_quiz * 100.0).round(),
                round2(verified_score),
                (w_claimed * 100.0).round(),
                round2(claimed_score)
            ),
        });
    }

    tx.commit()
        .map_err(|e| EngineError::new("db_tx_failed", e.to_string()))?;

    let total_questions: i64 = tallies.values().map(|t| t.total).sum();
    let questions_correct: i64 = tallies.values().map(|t| t.correct).sum();
    let overall_verified_score = if total_questions > 0 {
        100.0 * questions_correct as f64 / total_questions as f64
    } else {
        0.0
    };
    let average_final_score = if per_skill.is_empty() {
        0.0
    } else {
        per_skill.iter().map(|s| s.final_score).sum::<f64>() / per_skill.len() as f64
    };

    Ok(SubmissionResult {
        attempt_id: attempt_id.to_string(),
        total_questions,
        questions_correct,
        overall_verified_score: round2(overall_verified_score),
        average_final_score: round2(average_final_score),
        per_skill,
        portfolio: portfolio_rows(conn, student_id)?,
    })
}

pub fn portfolio_rows(conn: &Connection, student_id: &str) -> Result<Vec<PortfolioRow>, EngineError> {
    let mut stmt = conn
        .prepare(
            "SELECT skill_name, claimed_score, verified_score, quiz_weight, claimed_weight,
                    final_score, final_level, correct_count, total_questions
             FROM student_skill_portfolio
             WHERE student_id = ?
             ORDER BY final_score DESC, skill_name",
        )
        .map_err(EngineError::db)?;
    stmt.query_map([student_id], |r| {
        Ok(PortfolioRow {
            skill_name: r.get(0)?,
            claimed_score: r.get(1)?,
            verified_score: r.get(2)?,
            quiz_weight: r.get(3)?,
            claimed_weight: r.get(4)?,
            final_score: r.get(5)?,
            final_level: r.get(6)?,
            correct_count: r.get(7)?,
            total_questions: r.get(8)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(EngineError::db)
}
