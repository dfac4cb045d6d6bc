use chrono::{Datelike, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::db;

pub const DEFAULT_CREDITS: f64 = 3.0;
pub const RECENCY_DECAY: f64 = 0.4;
pub const CONFIDENCE_FACTOR: f64 = 0.25;
pub const DEFAULT_ACADEMIC_YEAR: i64 = 4;

/// Letter grade on the 4.0 scale. Grades outside the table score 0.0.
pub fn grade_points(grade: &str) -> f64 {
    match grade.trim().to_ascii_uppercase().as_str() {
        "A+" | "A" => 4.0,
        "A-" => 3.7,
        "B+" => 3.3,
        "B" => 3.0,
        "B-" => 2.7,
        "C+" => 2.3,
        "C" => 2.0,
        "C-" => 1.7,
        "D+" => 1.3,
        "D" => 1.0,
        "F" => 0.0,
        _ => 0.0,
    }
}

pub fn is_known_grade(grade: &str) -> bool {
    matches!(
        grade.trim().to_ascii_uppercase().as_str(),
        "A+" | "A" | "A-" | "B+" | "B" | "B-" | "C+" | "C" | "C-" | "D+" | "D" | "F"
    )
}

pub fn level_for_score(score: f64) -> &'static str {
    if score < 50.0 {
        "Beginner"
    } else if score < 75.0 {
        "Intermediate"
    } else {
        "Advanced"
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineError {
    pub code: String,
    pub message: String,
}

impl EngineError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn db(e: impl std::fmt::Display) -> Self {
        Self::new("db_query_failed", e.to_string())
    }
}

/// Recency inputs are explicit configuration, reloaded per request from the
/// settings store. The academic calendar does not advance by itself; callers
/// patch `currentAcademicYear` via setup.scoringUpdate as cohorts move on.
#[derive(Debug, Clone, Copy)]
pub struct ScoringConfig {
    pub current_academic_year: i64,
    pub current_calendar_year: Option<i64>,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            current_academic_year: DEFAULT_ACADEMIC_YEAR,
            current_calendar_year: None,
        }
    }
}

impl ScoringConfig {
    pub fn load(conn: &Connection) -> Self {
        let mut cfg = Self::default();
        if let Ok(Some(saved)) = db::settings_get_json(conn, "setup.scoring") {
            if let Some(n) = saved.get("currentAcademicYear").and_then(|v| v.as_i64()) {
                if (1..=8).contains(&n) {
                    cfg.current_academic_year = n;
                }
            }
            if let Some(n) = saved.get("currentCalendarYear").and_then(|v| v.as_i64()) {
                cfg.current_calendar_year = Some(n);
            }
        }
        cfg
    }

    fn effective_calendar_year(&self) -> i64 {
        self.current_calendar_year
            .unwrap_or_else(|| i64::from(Utc::now().year()))
    }
}

/// Exponential decay against the configured "now". Prefers the academic year
/// (1-based within the program), falls back to the calendar year the course
/// was taken, and applies no penalty when neither is known.
pub fn recency(cfg: &ScoringConfig, academic_year: Option<i64>, year_taken: Option<i64>) -> f64 {
    if let Some(ay) = academic_year {
        let years_since = (cfg.current_academic_year - ay).max(0);
        (-RECENCY_DECAY * years_since as f64).exp()
    } else if let Some(yt) = year_taken {
        let years_since = (cfg.effective_calendar_year() - yt).max(0);
        (-RECENCY_DECAY * years_since as f64).exp()
    } else {
        1.0
    }
}

/// Courses coded like IT1010 carry their academic year as the first digit.
/// Only 1..=4 is trusted; anything else means the code carries no year.
pub fn academic_year_from_course_code(code: &str) -> Option<i64> {
    let trimmed = code.trim();
    let digits: String = trimmed
        .chars()
        .skip_while(|c| c.is_ascii_alphabetic())
        .collect();
    let prefix_len = trimmed.len() - digits.len();
    if prefix_len == 0 || digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let first = i64::from(digits.as_bytes()[0] - b'0');
    if (1..=4).contains(&first) {
        Some(first)
    } else {
        None
    }
}

pub fn confidence(total_weight: f64) -> f64 {
    1.0 - (-CONFIDENCE_FACTOR * total_weight).exp()
}

#[derive(Debug, Clone, Default)]
struct SkillAccumulator {
    total_contribution: f64,
    total_weight: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimedSkill {
    pub skill_name: String,
    pub claimed_score: f64,
    pub claimed_level: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvidenceDetail {
    pub course_code: String,
    pub grade: String,
    pub grade_norm: f64,
    pub credits: f64,
    pub map_weight: f64,
    pub academic_year: Option<i64>,
    pub recency: f64,
    pub evidence_weight: f64,
    pub contribution: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecomputeSummary {
    pub student_id: String,
    pub skills_computed: usize,
    pub evidence_rows: usize,
    pub claimed: Vec<ClaimedSkill>,
}

#[derive(Debug, Clone)]
struct CourseRow {
    course_code: String,
    grade: String,
    credits: Option<f64>,
    academic_year: Option<i64>,
    year_taken: Option<i64>,
}

struct EvidenceRow {
    skill_name: String,
    course_code: String,
    grade: String,
    grade_norm: f64,
    credits: f64,
    academic_year: Option<i64>,
    recency: f64,
    map_weight: f64,
    evidence_weight: f64,
    contribution: f64,
}

/// Rebuild a student's evidence and claimed profile from their transcript.
///
/// Replace semantics: prior skill_evidence and skill_profile_claimed rows for
/// the student are deleted and the new set inserted inside one transaction.
/// Courses without a skill mapping contribute nothing; a skill whose summed
/// evidence weight is zero is dropped rather than stored as a placeholder.
pub fn recompute_claimed_skills(
    conn: &Connection,
    cfg: &ScoringConfig,
    student_id: &str,
) -> Result<RecomputeSummary, EngineError> {
    let tx = conn.unchecked_transaction().map_err(EngineError::db)?;

    tx.execute(
        "DELETE FROM skill_profile_claimed WHERE student_id = ?",
        [student_id],
    )
    .map_err(EngineError::db)?;
    tx.execute(
        "DELETE FROM skill_evidence WHERE student_id = ?",
        [student_id],
    )
    .map_err(EngineError::db)?;

    let courses: Vec<CourseRow> = {
        let mut stmt = tx
            .prepare(
                "SELECT course_code, grade, credits, academic_year, year_taken
                 FROM courses_taken
                 WHERE student_id = ?
                 ORDER BY rowid",
            )
            .map_err(EngineError::db)?;
        stmt.query_map([student_id], |r| {
            Ok(CourseRow {
                course_code: r.get(0)?,
                grade: r.get(1)?,
                credits: r.get(2)?,
                academic_year: r.get(3)?,
                year_taken: r.get(4)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(EngineError::db)?
    };

    let mut evidence: Vec<EvidenceRow> = Vec::new();
    {
        let mut map_stmt = tx
            .prepare(
                "SELECT skill_name, map_weight
                 FROM course_skill_map
                 WHERE course_code = ?
                 ORDER BY skill_name",
            )
            .map_err(EngineError::db)?;

        for course in &courses {
            let mappings: Vec<(String, f64)> = map_stmt
                .query_map([&course.course_code], |r| Ok((r.get(0)?, r.get(1)?)))
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
                .map_err(EngineError::db)?;
            if mappings.is_empty() {
                continue;
            }

            let grade_norm = grade_points(&course.grade) / 4.0;
            let credits = match course.credits {
                Some(c) if c > 0.0 => c,
                _ => DEFAULT_CREDITS,
            };
            let academic_year = course
                .academic_year
                .or_else(|| academic_year_from_course_code(&course.course_code));
            let rec = recency(cfg, academic_year, course.year_taken);

            for (skill_name, map_weight) in mappings {
                let evidence_weight = map_weight * credits * rec;
                evidence.push(EvidenceRow {
                    skill_name,
                    course_code: course.course_code.clone(),
                    grade: course.grade.clone(),
                    grade_norm,
                    credits,
                    academic_year,
                    recency: rec,
                    map_weight,
                    evidence_weight,
                    contribution: evidence_weight * grade_norm,
                });
            }
        }
    }

    let mut aggregates: BTreeMap<String, SkillAccumulator> = BTreeMap::new();
    for row in &evidence {
        let acc = aggregates.entry(row.skill_name.clone()).or_default();
        acc.total_contribution += row.contribution;
        acc.total_weight += row.evidence_weight;
    }

    let now = Utc::now().to_rfc3339();
    let mut claimed: Vec<ClaimedSkill> = Vec::new();
    for (skill_name, acc) in &aggregates {
        if acc.total_weight == 0.0 {
            // Zero accumulated weight carries no signal; dropping the skill
            // here is what keeps NaN out of claimed_score.
            continue;
        }
        let claimed_score = 100.0 * (acc.total_contribution / acc.total_weight);
        claimed.push(ClaimedSkill {
            skill_name: skill_name.clone(),
            claimed_score,
            claimed_level: level_for_score(claimed_score).to_string(),
            confidence: confidence(acc.total_weight),
        });
    }

    for row in &evidence {
        tx.execute(
            "INSERT INTO skill_evidence(
                id, student_id, skill_name, course_code, grade, grade_norm,
                credits, academic_year, recency, map_weight, evidence_weight, contribution
             ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                student_id,
                &row.skill_name,
                &row.course_code,
                &row.grade,
                row.grade_norm,
                row.credits,
                row.academic_year,
                row.recency,
                row.map_weight,
                row.evidence_weight,
                row.contribution,
            ),
        )
        .map_err(|e| EngineError::new("db_insert_failed", e.to_string()))?;
    }
    for skill in &claimed {
        tx.execute(
            "INSERT INTO skill_profile_claimed(
                id, student_id, skill_name, claimed_score, claimed_level, confidence, created_at
             ) VALUES(?, ?, ?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                student_id,
                &skill.skill_name,
                skill.claimed_score,
                &skill.claimed_level,
                skill.confidence,
                &now,
            ),
        )
        .map_err(|e| EngineError::new("db_insert_failed", e.to_string()))?;
    }

    tx.commit().map_err(|e| EngineError::new("db_tx_failed", e.to_string()))?;

    claimed.sort_by(|a, b| {
        b.claimed_score
            .partial_cmp(&a.claimed_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    Ok(RecomputeSummary {
        student_id: student_id.to_string(),
        skills_computed: claimed.len(),
        evidence_rows: evidence.len(),
        claimed,
    })
}

pub fn claimed_profile(conn: &Connection, student_id: &str) -> Result<Vec<ClaimedSkill>, EngineError> {
    let mut stmt = conn
        .prepare(
            "SELECT skill_name, claimed_score, claimed_level, confidence
             FROM skill_profile_claimed
             WHERE student_id = ?
             ORDER BY claimed_score DESC, skill_name",
        )
        .map_err(EngineError::db)?;
    stmt.query_map([student_id], |r| {
        Ok(ClaimedSkill {
            skill_name: r.get(0)?,
            claimed_score: r.get(1)?,
            claimed_level: r.get(2)?,
            confidence: r.get(3)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(EngineError::db)
}

pub fn explain_skill(
    conn: &Connection,
    student_id: &str,
    skill_name: &str,
) -> Result<Option<(ClaimedSkill, Vec<EvidenceDetail>)>, EngineError> {
    let summary: Option<ClaimedSkill> = conn
        .query_row(
            "SELECT skill_name, claimed_score, claimed_level, confidence
             FROM skill_profile_claimed
             WHERE student_id = ? AND skill_name = ?",
            (student_id, skill_name),
            |r| {
                Ok(ClaimedSkill {
                    skill_name: r.get(0)?,
                    claimed_score: r.get(1)?,
                    claimed_level: r.get(2)?,
                    confidence: r.get(3)?,
                })
            },
        )
        .optional()
        .map_err(EngineError::db)?;
    let Some(summary) = summary else {
        return Ok(None);
    };

    let mut stmt = conn
        .prepare(
            "SELECT course_code, grade, grade_norm, credits, map_weight,
                    academic_year, recency, evidence_weight, contribution
             FROM skill_evidence
             WHERE student_id = ? AND skill_name = ?
             ORDER BY contribution DESC",
        )
        .map_err(EngineError::db)?;
    let evidence = stmt
        .query_map((student_id, skill_name), |r| {
            Ok(EvidenceDetail {
                course_code: r.get(0)?,
                grade: r.get(1)?,
                grade_norm: r.get(2)?,
                credits: r.get(3)?,
                map_weight: r.get(4)?,
                academic_year: r.get(5)?,
                recency: r.get(6)?,
                evidence_weight: r.get(7)?,
                contribution: r.get(8)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(EngineError::db)?;

    Ok(Some((summary, evidence)))
}
