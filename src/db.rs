use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("skillbook.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            student_id TEXT PRIMARY KEY,
            name TEXT,
            created_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS courses_taken(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            course_code TEXT NOT NULL,
            course_name TEXT,
            grade TEXT NOT NULL,
            credits REAL,
            academic_year INTEGER,
            year_taken INTEGER,
            FOREIGN KEY(student_id) REFERENCES students(student_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_courses_taken_student ON courses_taken(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_courses_taken_code ON courses_taken(course_code)",
        [],
    )?;

    // Static reference data, not student-owned.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS course_skill_map(
            id TEXT PRIMARY KEY,
            course_code TEXT NOT NULL,
            skill_name TEXT NOT NULL,
            map_weight REAL NOT NULL,
            UNIQUE(course_code, skill_name)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_course_skill_map_code ON course_skill_map(course_code)",
        [],
    )?;

    // Derived rows, recreated wholesale per student on every recompute.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS skill_evidence(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            skill_name TEXT NOT NULL,
            course_code TEXT NOT NULL,
            grade TEXT NOT NULL,
            grade_norm REAL NOT NULL,
            credits REAL NOT NULL,
            academic_year INTEGER,
            recency REAL NOT NULL,
            map_weight REAL NOT NULL,
            evidence_weight REAL NOT NULL,
            contribution REAL NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_skill_evidence_student ON skill_evidence(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_skill_evidence_skill ON skill_evidence(student_id, skill_name)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS skill_profile_claimed(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            skill_name TEXT NOT NULL,
            claimed_score REAL NOT NULL,
            claimed_level TEXT NOT NULL,
            confidence REAL NOT NULL,
            created_at TEXT,
            UNIQUE(student_id, skill_name)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_skill_profile_claimed_student ON skill_profile_claimed(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS quiz_plan(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            skills_json TEXT NOT NULL,
            difficulty_mix_json TEXT NOT NULL,
            questions_per_skill INTEGER NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_quiz_plan_student ON quiz_plan(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS quiz_attempt(
            attempt_id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            plan_id TEXT,
            source TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_quiz_attempt_student ON quiz_attempt(student_id)",
        [],
    )?;

    // correct_option and explanation are frozen at sample time; later bank
    // edits never change an already-issued question.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS quiz_question(
            question_id TEXT PRIMARY KEY,
            attempt_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            skill_name TEXT NOT NULL,
            difficulty TEXT NOT NULL,
            question_text TEXT NOT NULL,
            options_json TEXT NOT NULL,
            correct_option TEXT NOT NULL,
            explanation TEXT NOT NULL,
            FOREIGN KEY(attempt_id) REFERENCES quiz_attempt(attempt_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_quiz_question_attempt ON quiz_question(attempt_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS quiz_answer(
            id TEXT PRIMARY KEY,
            attempt_id TEXT NOT NULL,
            question_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            selected_option TEXT NOT NULL,
            is_correct INTEGER NOT NULL,
            created_at TEXT,
            UNIQUE(attempt_id, question_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_quiz_answer_attempt ON quiz_answer(attempt_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS question_bank(
            id TEXT PRIMARY KEY,
            skill_name TEXT NOT NULL,
            difficulty TEXT NOT NULL,
            question_text TEXT NOT NULL,
            options_json TEXT NOT NULL,
            correct_option TEXT NOT NULL,
            explanation TEXT NOT NULL,
            model_name TEXT,
            created_at TEXT,
            UNIQUE(skill_name, difficulty, question_text)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_question_bank_cell ON question_bank(skill_name, difficulty)",
        [],
    )?;

    // The one long-lived skill-of-record; upserted, never deleted.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_skill_portfolio(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            skill_name TEXT NOT NULL,
            claimed_score REAL NOT NULL DEFAULT 0,
            verified_score REAL NOT NULL DEFAULT 0,
            quiz_weight REAL NOT NULL DEFAULT 0.5,
            claimed_weight REAL NOT NULL DEFAULT 0.5,
            final_score REAL NOT NULL DEFAULT 0,
            final_level TEXT NOT NULL DEFAULT 'Beginner',
            correct_count INTEGER NOT NULL DEFAULT 0,
            total_questions INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT,
            UNIQUE(student_id, skill_name)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_portfolio_student ON student_skill_portfolio(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    Ok(conn)
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row("SELECT value FROM settings WHERE key = ?", [key], |r| {
            r.get(0)
        })
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    let raw = serde_json::to_string(value)?;
    conn.execute(
        "INSERT INTO settings(key, value) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        (key, &raw),
    )?;
    Ok(())
}
