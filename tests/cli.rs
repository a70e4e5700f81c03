//! CLI tests that drive the compiled `folio` binary end to end.
//!
//! The embedding endpoint in the test config points at a dead port, so these
//! tests cover every path that does not need a model server, plus the
//! failure path when the server is unreachable.

use std::fs;
use std::io::Cursor;
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

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    // A tiny real PNG for ingestion tests.
    let img = image::RgbImage::from_pixel(4, 4, image::Rgb([10, 20, 30]));
    let mut png = Cursor::new(Vec::new());
    img.write_to(&mut png, image::ImageFormat::Png).unwrap();
    fs::write(root.join("page.png"), png.into_inner()).unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/folio.sqlite"

[blob]
backend = "fs"
root = "{root}/blobs"

[queue]
partitions = 2
poll_interval_ms = 25

[index]
dim = 4
ef_construction = 16

[embedding]
endpoint = "http://127.0.0.1:1"
max_retries = 0
timeout_secs = 2
"#,
        root = root.display()
    );

    let config_path = config_dir.join("folio.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
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
    let success = output.status.success();
    (stdout, stderr, success)
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_folio(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data").join("folio.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_folio(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_folio(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_init_write_config_creates_starter_file() {
    let tmp = TempDir::new().unwrap();
    let config_path = tmp.path().join("config").join("folio.toml");

    let (stdout, stderr, success) = run_folio(&config_path, &["init", "--write-config"]);
    assert!(
        success,
        "init --write-config failed: stdout={}, stderr={}",
        stdout, stderr
    );
    assert!(stdout.contains("starter config"));
    assert!(config_path.exists());

    // Second run keeps the existing file.
    let (stdout, _, success) = run_folio(&config_path, &["init", "--write-config"]);
    assert!(success);
    assert!(stdout.contains("already exists"));
}

#[test]
fn test_kb_create_list_rename_delete() {
    let (_tmp, config_path) = setup_test_env();
    run_folio(&config_path, &["init"]);

    let (stdout, stderr, success) =
        run_folio(&config_path, &["kb", "create", "alice", "research"]);
    assert!(success, "kb create failed: {}", stderr);
    let kb_id = stdout.trim().to_string();
    assert!(!kb_id.is_empty(), "kb create must print the new id");

    let (stdout, _, success) = run_folio(&config_path, &["kb", "list", "alice"]);
    assert!(success);
    assert!(stdout.contains(&kb_id));
    assert!(stdout.contains("research"));

    let (_, _, success) = run_folio(&config_path, &["kb", "rename", &kb_id, "papers"]);
    assert!(success);
    let (stdout, _, _) = run_folio(&config_path, &["kb", "list", "alice"]);
    assert!(stdout.contains("papers"));
    assert!(!stdout.contains("research"));

    let (_, _, success) = run_folio(&config_path, &["kb", "delete", &kb_id]);
    assert!(success);
    let (stdout, _, _) = run_folio(&config_path, &["kb", "list", "alice"]);
    assert!(!stdout.contains(&kb_id), "deleted kb still listed");
}

#[test]
fn test_ingest_prints_job_id_and_status_sees_it() {
    let (tmp, config_path) = setup_test_env();
    run_folio(&config_path, &["init"]);

    let (stdout, _, _) = run_folio(&config_path, &["kb", "create", "alice", "research"]);
    let kb_id = stdout.trim().to_string();

    let page = tmp.path().join("page.png");
    let (stdout, stderr, success) =
        run_folio(&config_path, &["ingest", &kb_id, page.to_str().unwrap()]);
    assert!(success, "ingest failed: {}", stderr);
    let job_id = stdout.trim().to_string();
    assert!(
        job_id.starts_with("alice_"),
        "job id carries the submitting user, got: {}",
        job_id
    );

    // Nothing has processed it yet.
    let (stdout, _, success) = run_folio(&config_path, &["status", &job_id]);
    assert!(success);
    assert!(stdout.contains("processing"));
    assert!(stdout.contains("0 / 1"));

    let (stdout, _, success) = run_folio(&config_path, &["status", &job_id, "--json"]);
    assert!(success);
    assert!(stdout.contains("\"processed\":0"));
    assert!(stdout.contains("\"total\":1"));
}

#[test]
fn test_status_unknown_job_fails() {
    let (_tmp, config_path) = setup_test_env();
    run_folio(&config_path, &["init"]);

    let (_, stderr, success) = run_folio(&config_path, &["status", "alice_nope"]);
    assert!(!success, "status of unknown job should fail");
    assert!(stderr.contains("not found"), "got: {}", stderr);
}

#[test]
fn test_ingest_unknown_kb_fails() {
    let (tmp, config_path) = setup_test_env();
    run_folio(&config_path, &["init"]);

    let page = tmp.path().join("page.png");
    let (_, stderr, success) = run_folio(&config_path, &["ingest", "ghost", page.to_str().unwrap()]);
    assert!(!success, "ingest into unknown kb should fail");
    assert!(stderr.contains("not found"), "got: {}", stderr);
}

#[test]
fn test_worker_drain_exits_on_empty_queue() {
    let (_tmp, config_path) = setup_test_env();
    run_folio(&config_path, &["init"]);

    let (_, stderr, success) = run_folio(&config_path, &["worker", "--drain"]);
    assert!(success, "drain on empty queue failed: {}", stderr);
}

#[test]
fn test_worker_without_model_server_fails_the_job_once() {
    let (tmp, config_path) = setup_test_env();
    run_folio(&config_path, &["init"]);

    let (stdout, _, _) = run_folio(&config_path, &["kb", "create", "alice", "research"]);
    let kb_id = stdout.trim().to_string();
    let page = tmp.path().join("page.png");
    let (stdout, _, _) = run_folio(&config_path, &["ingest", &kb_id, page.to_str().unwrap()]);
    let job_id = stdout.trim().to_string();

    // The embedding endpoint is unreachable; the worker must record the
    // failure on the job and still drain cleanly.
    let (_, stderr, success) = run_folio(&config_path, &["worker", "--drain"]);
    assert!(success, "worker --drain crashed: {}", stderr);

    let (stdout, _, _) = run_folio(&config_path, &["status", &job_id]);
    assert!(stdout.contains("failed"), "got: {}", stdout);
    assert!(stdout.contains("0 / 1"));

    // The message was acknowledged; a second drain finds nothing to redo.
    let (_, _, success) = run_folio(&config_path, &["worker", "--drain"]);
    assert!(success);
    let (stdout, _, _) = run_folio(&config_path, &["status", &job_id]);
    assert!(stdout.contains("failed"));
}

#[test]
fn test_files_delete_ignores_foreign_ids() {
    let (_tmp, config_path) = setup_test_env();
    run_folio(&config_path, &["init"]);

    let (stdout, _, _) = run_folio(&config_path, &["kb", "create", "alice", "research"]);
    let kb_id = stdout.trim().to_string();

    let (stdout, _, success) =
        run_folio(&config_path, &["files", "delete", &kb_id, "not-a-file-id"]);
    assert!(success);
    assert!(stdout.contains("Deleted 0 file(s)"));
}
