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

fn request_ok(
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
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn seed_attempt(conn: &Connection, student_id: &str, attempt_id: &str) -> Vec<String> {
    conn.execute(
        "INSERT INTO skill_profile_claimed(
            id, student_id, skill_name, claimed_score, claimed_level, confidence, created_at
         ) VALUES(?, ?, 'SQL', 40.0, 'Beginner', 0.4, '2025-01-01T00:00:00Z')",
        (format!("claimed-{}", student_id), student_id),
    )
    .expect("insert claimed");
    conn.execute(
        "INSERT INTO quiz_attempt(attempt_id, student_id, plan_id, source, created_at)
         VALUES(?, ?, NULL, 'bank', '2025-01-01T00:00:00Z')",
        (attempt_id, student_id),
    )
    .expect("insert attempt");

    let mut question_ids = Vec::new();
    for i in 0..4 {
        let qid = format!("{}-q{}", attempt_id, i);
        conn.execute(
            "INSERT INTO quiz_question(
                question_id, attempt_id, student_id, skill_name, difficulty,
                question_text, options_json, correct_option, explanation
             ) VALUES(?, ?, ?, 'SQL', 'easy', ?, '{\"A\":\"a\",\"B\":\"b\",\"C\":\"c\",\"D\":\"d\"}', 'C', 'because')",
            (&qid, attempt_id, student_id, format!("question {}", i)),
        )
        .expect("insert question");
        question_ids.push(qid);
    }
    question_ids
}

fn portfolio_snapshot(conn: &Connection, student_id: &str) -> Vec<(String, String, String, i64, i64)> {
    let mut stmt = conn
        .prepare(
            "SELECT skill_name,
                    printf('%.9f', final_score),
                    printf('%.9f', quiz_weight),
                    correct_count, total_questions
             FROM student_skill_portfolio
             WHERE student_id = ?
             ORDER BY skill_name",
        )
        .expect("prepare portfolio");
    stmt.query_map([student_id], |r| {
        Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .expect("collect portfolio")
}

#[test]
fn resubmitting_the_same_answers_changes_nothing() {
    let workspace = temp_dir("skillbook-resubmit");
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
    let qids = seed_attempt(&conn, "s1", "a1");

    let answers = json!([
        { "questionId": &qids[0], "selectedOption": "C" },
        { "questionId": &qids[1], "selectedOption": "C" },
        { "questionId": &qids[2], "selectedOption": "A" },
        { "questionId": &qids[3], "selectedOption": "B" }
    ]);

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "quiz.submit",
        json!({ "studentId": "s1", "attemptId": "a1", "answers": answers.clone() }),
    );
    let after_first = portfolio_snapshot(&conn, "s1");
    let answers_after_first: i64 = conn
        .query_row("SELECT COUNT(*) FROM quiz_answer WHERE attempt_id = 'a1'", [], |r| {
            r.get(0)
        })
        .expect("count answers");

    let second = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "quiz.submit",
        json!({ "studentId": "s1", "attemptId": "a1", "answers": answers.clone() }),
    );
    let after_second = portfolio_snapshot(&conn, "s1");
    let answers_after_second: i64 = conn
        .query_row("SELECT COUNT(*) FROM quiz_answer WHERE attempt_id = 'a1'", [], |r| {
            r.get(0)
        })
        .expect("count answers");

    // Same grading, same portfolio, no duplicate answer rows.
    assert_eq!(first.get("perSkill"), second.get("perSkill"));
    assert_eq!(after_first, after_second);
    assert_eq!(answers_after_first, 4);
    assert_eq!(answers_after_second, 4);

    let portfolio_rows: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM student_skill_portfolio WHERE student_id = 's1'",
            [],
            |r| r.get(0),
        )
        .expect("count portfolio");
    assert_eq!(portfolio_rows, 1, "upsert must not duplicate the skill row");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn resubmission_with_different_answers_overwrites_last_write_wins() {
    let workspace = temp_dir("skillbook-rewrite");
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
    let qids = seed_attempt(&conn, "s1", "a1");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "quiz.submit",
        json!({ "studentId": "s1", "attemptId": "a1", "answers": [
            { "questionId": &qids[0], "selectedOption": "C" },
            { "questionId": &qids[1], "selectedOption": "C" },
            { "questionId": &qids[2], "selectedOption": "C" },
            { "questionId": &qids[3], "selectedOption": "C" }
        ] }),
    );
    let perfect: f64 = conn
        .query_row(
            "SELECT verified_score FROM student_skill_portfolio WHERE student_id = 's1'",
            [],
            |r| r.get(0),
        )
        .expect("verified");
    assert!((perfect - 100.0).abs() < 1e-9);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "quiz.submit",
        json!({ "studentId": "s1", "attemptId": "a1", "answers": [
            { "questionId": &qids[0], "selectedOption": "C" },
            { "questionId": &qids[1], "selectedOption": "A" },
            { "questionId": &qids[2], "selectedOption": "A" },
            { "questionId": &qids[3], "selectedOption": "A" }
        ] }),
    );
    let (verified, correct_count): (f64, i64) = conn
        .query_row(
            "SELECT verified_score, correct_count FROM student_skill_portfolio WHERE student_id = 's1'",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .expect("verified");
    assert!((verified - 25.0).abs() < 1e-9, "verified {}", verified);
    assert_eq!(correct_count, 1);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
