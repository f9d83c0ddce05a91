//! End-to-end tests for the kgraph CLI.
//!
//! Tests invoke the `kgraph` binary as a subprocess and verify its output.

use std::path::Path;
use std::process::{Command, Output};

use tempfile::TempDir;

const PEOPLE: &str = "id,name,age,company\np1,Ada,36,acme\np2,Grace,unknown,acme\np3,Linus,28,globex\n";

const MAPPING: &str = r#"{
  "entities": [
    {
      "entity_type": "Person",
      "id_column": "id",
      "source_columns": ["id", "name", "age"],
      "transformations": [{"op": "cast", "column": "age", "to": "integer"}]
    },
    {"entity_type": "Company", "id_column": "company", "source_columns": ["company"]}
  ],
  "relations": [
    {"relation_type": "WORKS_FOR", "source_entity_column": "id", "target_entity_column": "company"}
  ]
}"#;

fn kgraph() -> Command {
    Command::new(env!("CARGO_BIN_EXE_kgraph"))
}

fn kgraph_in(dir: &Path) -> Command {
    let mut cmd = kgraph();
    cmd.current_dir(dir);
    cmd
}

fn run_ok(dir: &Path, args: &[&str]) -> Output {
    let output = kgraph_in(dir).args(args).output().unwrap();
    assert!(
        output.status.success(),
        "{args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    output
}

fn json(dir: &Path, args: &[&str]) -> serde_json::Value {
    serde_json::from_slice(&run_ok(dir, args).stdout).unwrap()
}

fn init_store() -> TempDir {
    let dir = TempDir::new().unwrap();
    run_ok(dir.path(), &["init", "."]);
    dir
}

/// Initialized store with the people file imported for tenant `acme`.
fn imported_store() -> TempDir {
    let dir = init_store();
    std::fs::write(dir.path().join("people.csv"), PEOPLE).unwrap();
    std::fs::write(dir.path().join("mapping.json"), MAPPING).unwrap();
    run_ok(
        dir.path(),
        &["--tenant", "acme", "import", "people.csv", "--mapping", "mapping.json"],
    );
    dir
}

// === Init ===

#[test]
fn e2e_init_creates_store() {
    let dir = TempDir::new().unwrap();
    let output = run_ok(dir.path(), &["init", "."]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Initialized kgraph store"));

    let store = dir.path().join(".kgraph");
    assert!(store.join("config.toml").exists());
    assert!(store.join("graph.db").exists());
}

#[test]
fn e2e_init_twice_fails() {
    let dir = init_store();
    let output = kgraph_in(dir.path()).args(["init", "."]).output().unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("already exists"));
}

#[test]
fn e2e_commands_require_a_store() {
    let dir = TempDir::new().unwrap();
    let output = kgraph_in(dir.path()).arg("stats").output().unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("kgraph init"));
}

// === Import ===

#[test]
fn e2e_import_records_bad_rows() {
    let dir = init_store();
    std::fs::write(dir.path().join("people.csv"), PEOPLE).unwrap();
    std::fs::write(dir.path().join("mapping.json"), MAPPING).unwrap();

    let result = json(
        dir.path(),
        &["--tenant", "acme", "import", "people.csv", "--mapping", "mapping.json"],
    );
    assert_eq!(result["rows_processed"], 3);
    assert_eq!(result["entities_added"], 4);
    assert_eq!(result["relations_added"], 2);
    let errors = result["errors"].as_array().unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["row"], 2);
}

#[test]
fn e2e_import_fail_fast_aborts() {
    let dir = init_store();
    std::fs::write(dir.path().join("people.csv"), PEOPLE).unwrap();
    std::fs::write(dir.path().join("mapping.json"), MAPPING).unwrap();

    let output = kgraph_in(dir.path())
        .args(["import", "people.csv", "--mapping", "mapping.json", "--fail-fast"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("row 2"));
}

#[test]
fn e2e_import_is_idempotent() {
    let dir = imported_store();
    run_ok(
        dir.path(),
        &["--tenant", "acme", "import", "people.csv", "--mapping", "mapping.json"],
    );
    let stats = json(dir.path(), &["--tenant", "acme", "stats"]);
    assert_eq!(stats["entity_count"], 4);
    assert_eq!(stats["relation_count"], 2);
}

// === Get / Delete ===

#[test]
fn e2e_get_returns_typed_properties() {
    let dir = imported_store();
    let entity = json(dir.path(), &["--tenant", "acme", "get", "p1"]);
    assert_eq!(entity["entity_type"], "Person");
    assert_eq!(entity["properties"]["name"], "Ada");
    assert_eq!(entity["properties"]["age"], 36);

    let relation = json(
        dir.path(),
        &["--tenant", "acme", "get", "--relation", "p1:WORKS_FOR:acme"],
    );
    assert_eq!(relation["target_id"], "acme");
}

#[test]
fn e2e_get_missing_fails() {
    let dir = imported_store();
    let output = kgraph_in(dir.path())
        .args(["--tenant", "acme", "get", "p2"])
        .output()
        .unwrap();
    assert!(!output.status.success());
}

#[test]
fn e2e_delete_cascades_relations() {
    let dir = imported_store();
    run_ok(dir.path(), &["--tenant", "acme", "delete", "p1"]);

    let stats = json(dir.path(), &["--tenant", "acme", "stats"]);
    assert_eq!(stats["entity_count"], 3);
    assert_eq!(stats["relation_count"], 1);
}

#[test]
fn e2e_batch_delete_ignores_missing() {
    let dir = imported_store();
    let result = json(dir.path(), &["--tenant", "acme", "delete", "p1", "p3", "ghost"]);
    assert_eq!(result["requested"], 3);
    assert_eq!(result["deleted"], 2);
}

// === Tenants ===

#[test]
fn e2e_tenants_are_isolated() {
    let dir = imported_store();
    let stats = json(dir.path(), &["--tenant", "other", "stats"]);
    assert_eq!(stats["entity_count"], 0);
    assert_eq!(stats["tenant"], "other");

    let output = kgraph_in(dir.path())
        .args(["--tenant", "other", "get", "p1"])
        .output()
        .unwrap();
    assert!(!output.status.success());
}

// === Search ===

#[test]
fn e2e_graph_search_from_seed() {
    let dir = imported_store();
    let response = json(
        dir.path(),
        &["--tenant", "acme", "search", "graph", "--seed", "p1", "--depth", "1"],
    );
    assert_eq!(response["strategy"], "graph");
    let hits = response["hits"].as_array().unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0]["entity"]["id"], "acme");
    assert_eq!(hits[0]["depth"], 1);
}

#[test]
fn e2e_filtered_search_by_property() {
    let dir = imported_store();
    let response = json(
        dir.path(),
        &["--tenant", "acme", "search", "filtered", "--type", "Person", "--property", "age=28"],
    );
    let hits = response["hits"].as_array().unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0]["entity"]["id"], "p3");
}

#[test]
fn e2e_search_accepts_request_json() {
    let dir = imported_store();
    let response = json(
        dir.path(),
        &[
            "--tenant",
            "acme",
            "search",
            "--request",
            r#"{"strategy": "traverse", "seeds": ["p3"], "relation_types": ["WORKS_FOR"]}"#,
        ],
    );
    assert_eq!(response["hits"][0]["entity"]["id"], "globex");
}

#[test]
fn e2e_unknown_strategy_fails() {
    let dir = imported_store();
    let output = kgraph_in(dir.path())
        .args(["search", "bogus", "--seed", "p1"])
        .output()
        .unwrap();
    assert!(!output.status.success());

    let output = kgraph_in(dir.path())
        .args(["search", "--request", r#"{"strategy": "bogus"}"#])
        .output()
        .unwrap();
    assert!(!output.status.success());
}

#[test]
fn e2e_search_rejects_excessive_depth() {
    let dir = imported_store();
    let output = kgraph_in(dir.path())
        .args(["--tenant", "acme", "search", "graph", "--seed", "p1", "--depth", "50"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("depth"));
}

// === Output formats ===

#[test]
fn e2e_table_and_markdown_output() {
    let dir = imported_store();
    let args = ["--tenant", "acme", "search", "graph", "--seed", "p1"];

    let table = run_ok(dir.path(), &[&["--format", "table"], &args[..]].concat());
    let table = String::from_utf8_lossy(&table.stdout);
    assert!(table.contains("acme"));
    assert!(table.contains("score"));

    let markdown = run_ok(dir.path(), &[&["--format", "markdown"], &args[..]].concat());
    let markdown = String::from_utf8_lossy(&markdown.stdout);
    assert!(markdown.lines().next().unwrap().starts_with('|'));
    assert!(markdown.contains("acme"));
}

// === Advise ===

#[test]
fn e2e_advise_reports_json() {
    let dir = imported_store();
    std::fs::write(
        dir.path().join("workload.json"),
        r#"[{"strategy": "filtered", "properties": {"name": "Ada"}}]"#,
    )
    .unwrap();
    let report = json(
        dir.path(),
        &["--tenant", "acme", "advise", "--workload", "workload.json"],
    );
    assert!(report["recommendations"].is_array());
}

// === Completions ===

#[test]
fn e2e_completions_bash() {
    let dir = TempDir::new().unwrap();
    let output = run_ok(dir.path(), &["completions", "bash"]);
    assert!(String::from_utf8_lossy(&output.stdout).contains("kgraph"));
}
