use rusqlite::Connection;
use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_skillbookd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn skillbookd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request_raw(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request_raw(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> &str {
    assert_eq!(value.get("ok").and_then(|v| v.as_bool()), Some(false));
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .expect("error code")
}

fn insert_claimed(conn: &Connection, student_id: &str, skill: &str, score: f64, confidence: f64) {
    let level = if score < 50.0 {
        "Beginner"
    } else if score < 75.0 {
        "Intermediate"
    } else {
        "Advanced"
    };
    conn.execute(
        "INSERT INTO skill_profile_claimed(
            id, student_id, skill_name, claimed_score, claimed_level, confidence, created_at
         ) VALUES(?, ?, ?, ?, ?, ?, '2025-01-01T00:00:00Z')",
        (
            format!("{}-{}", student_id, skill),
            student_id,
            skill,
            score,
            level,
            confidence,
        ),
    )
    .expect("insert claimed");
}

#[test]
fn auto_selection_picks_least_confident_contestable_skills() {
    let workspace = temp_dir("skillbook-plan-auto");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let db_path = workspace.join("skillbook.sqlite3");
    let conn = Connection::open(&db_path).expect("open db");
    insert_claimed(&conn, "s1", "Well Established", 72.0, 0.95);
    insert_claimed(&conn, "s1", "Shaky Near Seventy", 68.0, 0.10);
    insert_claimed(&conn, "s1", "Shaky Far Low", 20.0, 0.10);
    insert_claimed(&conn, "s1", "Shaky Far High", 96.0, 0.10);
    insert_claimed(&conn, "s1", "Mid Confidence", 70.0, 0.50);
    insert_claimed(&conn, "s1", "Also Established", 88.0, 0.90);

    let plan = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "quiz.planCreate",
        json!({ "studentId": "s1" }),
    );

    // Confidence ascending first, then distance from 70, then score descending.
    // "Shaky Far High" (|96-70|=26) beats "Shaky Far Low" (|20-70|=50).
    let skills: Vec<&str> = plan
        .get("skills")
        .and_then(|v| v.as_array())
        .expect("skills")
        .iter()
        .map(|v| v.as_str().expect("skill name"))
        .collect();
    assert_eq!(
        skills,
        vec![
            "Shaky Near Seventy",
            "Shaky Far High",
            "Shaky Far Low",
            "Mid Confidence",
            "Also Established"
        ]
    );

    // Difficulty mix follows the score bands.
    let mix = plan
        .get("difficultyMix")
        .and_then(|v| v.as_array())
        .expect("difficultyMix");
    let find = |name: &str| {
        mix.iter()
            .find(|m| m.get("skillName").and_then(|v| v.as_str()) == Some(name))
            .and_then(|m| m.get("mix"))
            .cloned()
            .expect("mix entry")
    };
    assert_eq!(
        find("Shaky Far High"),
        json!({ "easy": 1, "medium": 1, "hard": 2 })
    );
    assert_eq!(
        find("Mid Confidence"),
        json!({ "easy": 2, "medium": 1, "hard": 1 })
    );
    assert_eq!(
        find("Shaky Far Low"),
        json!({ "easy": 2, "medium": 2, "hard": 0 })
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn explicit_selection_is_validated_not_truncated() {
    let workspace = temp_dir("skillbook-plan-explicit");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let db_path = workspace.join("skillbook.sqlite3");
    let conn = Connection::open(&db_path).expect("open db");
    for (i, skill) in ["A", "B", "C", "D", "E", "F"].iter().enumerate() {
        insert_claimed(&conn, "s1", skill, 40.0 + i as f64, 0.3);
    }

    let resp = request_raw(
        &mut stdin,
        &mut reader,
        "2",
        "quiz.planCreate",
        json!({ "studentId": "s1", "selectedSkills": ["A", "B", "C", "D", "E", "F"] }),
    );
    assert_eq!(error_code(&resp), "too_many_skills");

    let resp = request_raw(
        &mut stdin,
        &mut reader,
        "3",
        "quiz.planCreate",
        json!({ "studentId": "s1", "selectedSkills": ["A", "Nonexistent"] }),
    );
    assert_eq!(error_code(&resp), "skill_not_found");

    let plan = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "quiz.planCreate",
        json!({ "studentId": "s1", "selectedSkills": ["C", "A"] }),
    );
    let skills: Vec<&str> = plan
        .get("skills")
        .and_then(|v| v.as_array())
        .expect("skills")
        .iter()
        .map(|v| v.as_str().expect("skill"))
        .collect();
    assert_eq!(skills, vec!["C", "A"]);

    // A student with no claimed profile cannot be planned for.
    let resp = request_raw(
        &mut stdin,
        &mut reader,
        "5",
        "quiz.planCreate",
        json!({ "studentId": "nobody" }),
    );
    assert_eq!(error_code(&resp), "not_found");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn plan_creation_replaces_the_previous_plan() {
    let workspace = temp_dir("skillbook-plan-replace");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let db_path = workspace.join("skillbook.sqlite3");
    let conn = Connection::open(&db_path).expect("open db");
    insert_claimed(&conn, "s1", "SQL", 40.0, 0.3);
    insert_claimed(&conn, "s1", "Networking", 80.0, 0.6);

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "quiz.planCreate",
        json!({ "studentId": "s1", "selectedSkills": ["SQL"] }),
    );
    let second = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "quiz.planCreate",
        json!({ "studentId": "s1", "selectedSkills": ["Networking"] }),
    );
    assert_ne!(first.get("id"), second.get("id"));

    let plan_count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM quiz_plan WHERE student_id = 's1'",
            [],
            |r| r.get(0),
        )
        .expect("count plans");
    assert_eq!(plan_count, 1, "exactly one active plan per student");

    let latest = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "quiz.planLatest",
        json!({ "studentId": "s1" }),
    );
    assert_eq!(latest.get("id"), second.get("id"));
    assert_eq!(
        latest.get("skills"),
        Some(&json!(["Networking"]))
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
