use std::path::Path;
use std::process::{Command, Output};

use tempfile::tempdir;

fn deckprio(db: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_deckprio"))
        .args(args)
        .arg("--db")
        .arg(db)
        .env("RUST_LOG", "off")
        .env_remove("DECKPRIO_CONFIG")
        .output()
        .unwrap()
}

fn stdout(output: &Output) -> String {
    assert!(
        output.status.success(),
        "command failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout.clone()).unwrap()
}

const CARDS: &str = r#"{"id": 1, "path": "Bio", "fields": ["What is ATP?", "Energy currency"]}
{"id": 2, "path": "Bio::Cells", "fields": ["Nucleus?", "Holds DNA"], "tags": ["prio:1"]}
{"id": 3, "path": "Bio::Cells", "fields": ["Ribosome?", "Makes protein"], "tags": ["prio:3", "exam"]}
{"id": 4, "path": "Chem", "fields": ["H2O?", "Water"]}
"#;

#[test]
fn import_then_list_decks_and_stats() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("cards.sqlite");
    let input = dir.path().join("cards.jsonl");
    std::fs::write(&input, CARDS).unwrap();

    let out = stdout(&deckprio(
        &db,
        &["import", "--input", input.to_str().unwrap(), "--current", "Bio"],
    ));
    assert_eq!(out.trim(), "imported 4 cards");

    let out = stdout(&deckprio(&db, &["decks"]));
    let lines: Vec<&str> = out.lines().collect();
    assert_eq!(lines, vec!["Bio\t3", "Bio::Cells\t2", "Chem\t1"]);

    let out = stdout(&deckprio(&db, &["stats", "--deck", "Bio"]));
    let lines: Vec<&str> = out.lines().collect();
    assert_eq!(lines[0], "Bio: 3 cards, 1 unprioritized");
    assert!(lines.contains(&"  prio:1\t1"));
    assert!(lines.contains(&"  prio:3\t1"));
}

#[test]
fn prioritize_without_credentials_fails_before_prompting() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("cards.sqlite");

    let output = Command::new(env!("CARGO_BIN_EXE_deckprio"))
        .args(["prioritize", "--deck", "Bio", "--yes", "--db"])
        .arg(&db)
        .env("RUST_LOG", "off")
        .env_remove("DECKPRIO_CONFIG")
        .env_remove("DECKPRIO_PROVIDER")
        .env_remove("OPENAI_API_KEY")
        .env_remove("GEMINI_API_KEY")
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("no API key for OpenAI; set `openai_api_key`"),
        "stderr: {stderr}"
    );
    assert!(stderr.contains("OPENAI_API_KEY environment variable"), "stderr: {stderr}");
    assert!(!stderr.contains("MissingApiKey"), "stderr: {stderr}");
}
