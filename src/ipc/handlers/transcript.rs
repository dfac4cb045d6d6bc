use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::ipc::helpers::{get_required_str, open_conn, respond, to_json};
use crate::ipc::types::{AppState, Request};
use crate::scoring::{self, EngineError, ScoringConfig};

struct IncomingCourse {
    course_code: String,
    course_name: Option<String>,
    grade: String,
    credits: Option<f64>,
    academic_year: Option<i64>,
    year_taken: Option<i64>,
}

/// The ingestion collaborator sends validated rows; anything malformed here
/// rejects the whole request so a bad upload can never half-apply.
fn parse_courses(raw: &[Value]) -> Result<Vec<IncomingCourse>, EngineError> {
    let mut courses = Vec::with_capacity(raw.len());
    for (idx, row) in raw.iter().enumerate() {
        let course_code = row
            .get("courseCode")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                EngineError::new("bad_params", format!("course {}: missing courseCode", idx + 1))
            })?
            .to_string();
        let grade = row
            .get("grade")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_ascii_uppercase())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                EngineError::new("bad_params", format!("course {}: missing grade", idx + 1))
            })?;
        if !scoring::is_known_grade(&grade) {
            return Err(EngineError::new(
                "bad_params",
                format!("course {}: unknown grade '{}'", idx + 1, grade),
            ));
        }
        let credits = match row.get("credits") {
            None | Some(Value::Null) => None,
            Some(v) => {
                let c = v.as_f64().ok_or_else(|| {
                    EngineError::new("bad_params", format!("course {}: credits must be numeric", idx + 1))
                })?;
                if c <= 0.0 {
                    return Err(EngineError::new(
                        "bad_params",
                        format!("course {}: credits must be positive", idx + 1),
                    ));
                }
                Some(c)
            }
        };
        let academic_year = match row.get("academicYear") {
            None | Some(Value::Null) => None,
            Some(v) => Some(v.as_i64().ok_or_else(|| {
                EngineError::new(
                    "bad_params",
                    format!("course {}: academicYear must be integer", idx + 1),
                )
            })?),
        };
        let year_taken = match row.get("yearTaken") {
            None | Some(Value::Null) => None,
            Some(v) => Some(v.as_i64().ok_or_else(|| {
                EngineError::new(
                    "bad_params",
                    format!("course {}: yearTaken must be integer", idx + 1),
                )
            })?),
        };

        courses.push(IncomingCourse {
            course_code,
            course_name: row
                .get("courseName")
                .and_then(|v| v.as_str())
                .map(|s| s.trim().to_string()),
            grade,
            credits,
            academic_year,
            year_taken,
        });
    }
    Ok(courses)
}

/// Replace a student's transcript wholesale, then rebuild evidence and the
/// claimed profile as one unit. Zero resulting skills is a legitimate
/// outcome here (nothing mapped yet), reported in the summary.
fn handle_transcript_replace(state: &AppState, req: &Request) -> Result<Value, EngineError> {
    let conn = open_conn(state)?;
    let student_id = get_required_str(&req.params, "studentId")?;
    let raw = req
        .params
        .get("courses")
        .and_then(|v| v.as_array())
        .ok_or_else(|| EngineError::new("bad_params", "courses must be an array"))?;
    let courses = parse_courses(raw)?;
    let student_name = req.params.get("studentName").and_then(|v| v.as_str());

    let now = Utc::now().to_rfc3339();
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| EngineError::new("db_tx_failed", e.to_string()))?;
    tx.execute(
        "INSERT INTO students(student_id, name, created_at) VALUES(?, ?, ?)
         ON CONFLICT(student_id) DO UPDATE SET name = COALESCE(excluded.name, name)",
        (&student_id, student_name, &now),
    )
    .map_err(|e| EngineError::new("db_insert_failed", e.to_string()))?;
    tx.execute("DELETE FROM courses_taken WHERE student_id = ?", [&student_id])
        .map_err(EngineError::db)?;
    for c in &courses {
        tx.execute(
            "INSERT INTO courses_taken(
                id, student_id, course_code, course_name, grade, credits, academic_year, year_taken
             ) VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                &student_id,
                &c.course_code,
                &c.course_name,
                &c.grade,
                c.credits,
                c.academic_year,
                c.year_taken,
            ),
        )
        .map_err(|e| EngineError::new("db_insert_failed", e.to_string()))?;
    }
    tx.commit()
        .map_err(|e| EngineError::new("db_tx_failed", e.to_string()))?;

    let cfg = ScoringConfig::load(conn);
    let summary = scoring::recompute_claimed_skills(conn, &cfg, &student_id)?;

    Ok(json!({
        "studentId": student_id,
        "coursesStored": courses.len(),
        "skillsComputed": summary.skills_computed,
        "evidenceRows": summary.evidence_rows,
        "claimed": to_json(&summary.claimed)?
    }))
}

fn handle_transcript_get(state: &AppState, req: &Request) -> Result<Value, EngineError> {
    let conn = open_conn(state)?;
    let student_id = get_required_str(&req.params, "studentId")?;

    let mut stmt = conn
        .prepare(
            "SELECT course_code, course_name, grade, credits, academic_year, year_taken
             FROM courses_taken
             WHERE student_id = ?
             ORDER BY rowid",
        )
        .map_err(EngineError::db)?;
    let courses: Vec<Value> = stmt
        .query_map([&student_id], |r| {
            Ok(json!({
                "courseCode": r.get::<_, String>(0)?,
                "courseName": r.get::<_, Option<String>>(1)?,
                "grade": r.get::<_, String>(2)?,
                "credits": r.get::<_, Option<f64>>(3)?,
                "academicYear": r.get::<_, Option<i64>>(4)?,
                "yearTaken": r.get::<_, Option<i64>>(5)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(EngineError::db)?;

    if courses.is_empty() {
        return Err(EngineError::new(
            "not_found",
            format!("no transcript found for student {}", student_id),
        ));
    }

    Ok(json!({ "studentId": student_id, "courses": courses }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "transcript.replace" => Some(respond(&req.id, handle_transcript_replace(state, req))),
        "transcript.get" => Some(respond(&req.id, handle_transcript_get(state, req))),
        _ => None,
    }
}
