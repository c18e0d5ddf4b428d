use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn folio_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("folio");
    path
}

struct TestEnv {
    _tmp: TempDir,
    root: PathBuf,
    config: PathBuf,
}

impl TestEnv {
    fn files(&self) -> PathBuf {
        self.root.join("files")
    }
}

fn setup_test_env() -> TestEnv {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().canonicalize().unwrap();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let files_dir = root.join("files");
    fs::create_dir_all(&files_dir).unwrap();
    fs::write(
        files_dir.join("alpha.md"),
        "# Alpha Document\n\nThis is the alpha document about Rust programming.\n\nIt contains information about cargo and crates.",
    )
    .unwrap();
    fs::write(
        files_dir.join("beta.md"),
        "# Beta Document\n\nThis document discusses Python and machine learning.\n\nDeep learning frameworks like PyTorch are covered.",
    )
    .unwrap();
    fs::write(
        files_dir.join("gamma.txt"),
        "Gamma plain text file.\n\nContains notes about deployment and infrastructure.\n\nKubernetes and Docker are mentioned here.",
    )
    .unwrap();

    let config_content = format!(
        r#"[data]
dir = "{}/data"

[embedding]
provider = "hash"
dims = 512

[retrieval]
default_k = 5
"#,
        root.display()
    );

    let config = config_dir.join("folio.toml");
    fs::write(&config, config_content).unwrap();

    TestEnv {
        _tmp: tmp,
        root,
        config,
    }
}

fn run_folio(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = folio_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run folio binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

/// init + register the files folder with the default container.
fn setup_indexed() -> TestEnv {
    let env = setup_test_env();
    run_folio(&env.config, &["init"]);
    let files = env.files();
    let (stdout, stderr, ok) = run_folio(&env.config, &["path", "add", files.to_str().unwrap()]);
    assert!(ok, "path add failed: {} {}", stdout, stderr);
    let (stdout, stderr, ok) = run_folio(&env.config, &["index"]);
    assert!(ok, "index failed: {} {}", stdout, stderr);
    env
}

fn search_json(config: &Path, args: &[&str]) -> Vec<serde_json::Value> {
    let mut all = vec!["search"];
    all.extend_from_slice(args);
    all.push("--json");
    let (stdout, stderr, ok) = run_folio(config, &all);
    assert!(ok, "search failed: {} {}", stdout, stderr);
    serde_json::from_str(&stdout).unwrap()
}

#[test]
fn test_init_creates_registry() {
    let env = setup_test_env();
    let (stdout, stderr, success) = run_folio(&env.config, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Initialized"));
    assert!(stdout.contains("active container: Default"));
    assert!(env.root.join("data/registry.json").exists());
    assert!(env.root.join("data/containers/c_Default.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let env = setup_test_env();
    let (_, _, first) = run_folio(&env.config, &["init"]);
    assert!(first, "First init failed");
    let (_, _, second) = run_folio(&env.config, &["init"]);
    assert!(second, "Second init failed (not idempotent)");
}

#[test]
fn test_index_reports_added_documents() {
    let env = setup_test_env();
    run_folio(&env.config, &["init"]);
    run_folio(&env.config, &["path", "add", env.files().to_str().unwrap()]);

    let (stdout, stderr, success) = run_folio(&env.config, &["index"]);
    assert!(success, "index failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("index Default: done"), "{}", stdout);
    assert!(stdout.contains("added 3"), "{}", stdout);
}

#[test]
fn test_second_index_changes_nothing() {
    let env = setup_indexed();
    let (stdout, _, success) = run_folio(&env.config, &["index"]);
    assert!(success);
    assert!(
        stdout.contains("added 0  updated 0  deleted 0  unchanged 3"),
        "{}",
        stdout
    );
}

#[test]
fn test_index_picks_up_changes_and_deletions() {
    let env = setup_indexed();
    fs::write(
        env.files().join("alpha.md"),
        "# Alpha Document\n\nRewritten: now about tokio and async runtimes.",
    )
    .unwrap();
    fs::remove_file(env.files().join("beta.md")).unwrap();
    fs::write(env.files().join("delta.md"), "Delta notes on sqlite.").unwrap();

    let (stdout, _, success) = run_folio(&env.config, &["index"]);
    assert!(success);
    assert!(
        stdout.contains("added 1  updated 1  deleted 1  unchanged 1"),
        "{}",
        stdout
    );

    let results = search_json(&env.config, &["python machine learning pytorch"]);
    assert!(results
        .iter()
        .all(|r| !r["path"].as_str().unwrap().ends_with("beta.md")));
}

#[test]
fn test_search_finds_relevant_document() {
    let env = setup_indexed();
    let results = search_json(&env.config, &["kubernetes docker deployment"]);
    assert!(!results.is_empty());
    let top = results[0]["path"].as_str().unwrap();
    assert!(top.ends_with("gamma.txt"), "top result was {}", top);
    assert!(results[0]["snippet"].as_str().unwrap().contains("Kubernetes"));
}

#[test]
fn test_keyword_and_hybrid_search_modes() {
    let env = setup_indexed();
    for mode in ["keyword", "hybrid"] {
        let results = search_json(&env.config, &["pytorch", "--mode", mode]);
        assert!(!results.is_empty(), "{}", mode);
        let top = results[0]["path"].as_str().unwrap();
        assert!(top.ends_with("beta.md"), "{} top result was {}", mode, top);
    }

    let (_, stderr, success) = run_folio(&env.config, &["search", "pytorch", "--mode", "fuzzy"]);
    assert!(!success);
    assert!(stderr.contains("unknown search mode"), "{}", stderr);
}

#[test]
fn test_search_deterministic() {
    let env = setup_indexed();
    let first = search_json(&env.config, &["document about programming"]);
    let second = search_json(&env.config, &["document about programming"]);
    assert_eq!(first, second);
}

#[test]
fn test_search_returns_one_result_per_document() {
    let env = setup_indexed();
    let results = search_json(&env.config, &["document", "-k", "10"]);
    let mut paths: Vec<&str> = results.iter().map(|r| r["path"].as_str().unwrap()).collect();
    let total = paths.len();
    paths.dedup();
    assert_eq!(paths.len(), total);
    assert!(total <= 3);
}

#[test]
fn test_search_empty_query() {
    let env = setup_test_env();
    run_folio(&env.config, &["init"]);
    let (stdout, _, success) = run_folio(&env.config, &["search", "   "]);
    assert!(success);
    assert!(stdout.contains("No results."));
}

#[test]
fn test_search_unindexed_container_fails() {
    let env = setup_test_env();
    run_folio(&env.config, &["init"]);
    let (_, stderr, success) = run_folio(&env.config, &["search", "anything"]);
    assert!(!success);
    assert!(stderr.contains("has no indexed documents"), "{}", stderr);
}

#[test]
fn test_default_container_cannot_be_deleted() {
    let env = setup_test_env();
    run_folio(&env.config, &["init"]);
    let (_, stderr, success) = run_folio(&env.config, &["container", "delete", "Default"]);
    assert!(!success);
    assert!(stderr.contains("cannot be deleted"), "{}", stderr);
}

#[test]
fn test_path_conflict_between_containers() {
    let env = setup_test_env();
    run_folio(&env.config, &["init"]);
    run_folio(&env.config, &["container", "create", "work"]);
    let files = env.files();
    let (_, _, ok) = run_folio(&env.config, &["path", "add", files.to_str().unwrap()]);
    assert!(ok);

    let (_, stderr, success) = run_folio(
        &env.config,
        &["path", "add", files.to_str().unwrap(), "--container", "work"],
    );
    assert!(!success);
    assert!(stderr.contains("already registered to container 'Default'"), "{}", stderr);
}

#[test]
fn test_add_missing_path_fails() {
    let env = setup_test_env();
    run_folio(&env.config, &["init"]);
    let missing = env.root.join("nope");
    let (_, stderr, success) = run_folio(&env.config, &["path", "add", missing.to_str().unwrap()]);
    assert!(!success);
    assert!(stderr.contains("invalid path"), "{}", stderr);
}

#[test]
fn test_containers_are_isolated() {
    let env = setup_indexed();
    let other = env.root.join("other");
    fs::create_dir_all(&other).unwrap();
    fs::write(other.join("kube.md"), "kubernetes docker deployment runbook").unwrap();

    run_folio(&env.config, &["container", "create", "ops"]);
    run_folio(&env.config, &["path", "add", other.to_str().unwrap(), "--container", "ops"]);
    let (_, _, ok) = run_folio(&env.config, &["index", "--container", "ops"]);
    assert!(ok);

    let ops = search_json(&env.config, &["kubernetes", "--container", "ops"]);
    assert_eq!(ops.len(), 1);
    assert!(ops[0]["path"].as_str().unwrap().ends_with("kube.md"));

    let default = search_json(&env.config, &["kubernetes"]);
    assert!(default
        .iter()
        .all(|r| !r["path"].as_str().unwrap().ends_with("kube.md")));
}

#[test]
fn test_container_use_and_list() {
    let env = setup_test_env();
    run_folio(&env.config, &["init"]);
    run_folio(&env.config, &["container", "create", "notes", "--description", "my notes"]);
    let (_, _, ok) = run_folio(&env.config, &["container", "use", "notes"]);
    assert!(ok);

    let (stdout, _, ok) = run_folio(&env.config, &["container", "list"]);
    assert!(ok);
    let notes_line = stdout.lines().find(|l| l.contains("notes")).unwrap();
    assert!(notes_line.contains('*'));
    assert!(notes_line.contains("my notes"));
}

#[test]
fn test_status_json() {
    let env = setup_indexed();
    let (stdout, _, ok) = run_folio(&env.config, &["status", "--json"]);
    assert!(ok);
    let status: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(status["name"], "Default");
    assert_eq!(status["stats"]["documents"], 3);
    assert_eq!(status["stats"]["indexed"], 3);
    assert_eq!(status["stats"]["dims"], 512);
    assert!(status["paths"][0]["last_scan_at"].is_i64());
}

#[test]
fn test_reset_empties_index() {
    let env = setup_indexed();
    let (_, _, ok) = run_folio(&env.config, &["reset"]);
    assert!(ok);
    let (_, stderr, success) = run_folio(&env.config, &["search", "alpha"]);
    assert!(!success);
    assert!(stderr.contains("has no indexed documents"), "{}", stderr);
}

#[test]
fn test_rebuild_reembeds_everything() {
    let env = setup_indexed();
    let (stdout, _, ok) = run_folio(&env.config, &["rebuild"]);
    assert!(ok);
    assert!(stdout.contains("rebuild Default: done"), "{}", stdout);
    assert!(stdout.contains("updated 3"), "{}", stdout);
}

#[test]
fn test_unknown_config_key_fails() {
    let env = setup_test_env();
    fs::write(&env.config, "[db]\npath = \"x.sqlite\"\n").unwrap();
    let (_, _, success) = run_folio(&env.config, &["init"]);
    assert!(!success);
}
