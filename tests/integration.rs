use axum::extract::Query;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::mpsc;
use tempfile::TempDir;

fn dmx_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("dmx");
    path
}

async fn users() -> Json<Value> {
    Json(json!([
        {"uid": "1", "name": "a"},
        {"uid": "1", "name": "a"}
    ]))
}

async fn paged(Query(params): Query<HashMap<String, String>>) -> Json<Value> {
    let page = params.get("page").cloned().unwrap_or_else(|| "0".to_string());
    Json(json!({
        "code": 0,
        "data": {
            "list": [
                {"uid": format!("{}-a", page), "name": "x"},
                {"uid": format!("{}-b", page), "name": "y"}
            ],
            "total": 2
        }
    }))
}

async fn search(Json(body): Json<Value>) -> Json<Value> {
    let city = body
        .get("city")
        .and_then(Value::as_str)
        .unwrap_or("none")
        .to_string();
    Json(json!({"list": [{"uid": city.clone(), "name": city}]}))
}

async fn broken() -> (StatusCode, &'static str) {
    (StatusCode::SERVICE_UNAVAILABLE, "upstream down")
}

/// Starts the fixture API on an ephemeral port in a background thread.
fn start_fixture_server() -> SocketAddr {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async move {
            let app = Router::new()
                .route("/users", get(users))
                .route("/paged", get(paged))
                .route("/search", post(search))
                .route("/broken", get(broken));
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            tx.send(listener.local_addr().unwrap()).unwrap();
            axum::serve(listener, app).await.unwrap();
        });
    });
    rx.recv().unwrap()
}

fn setup_test_env() -> (TempDir, PathBuf, SocketAddr) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config_content = format!(
        r#"[db]
data_dir = "{}/data"

[pool]
main_max_connections = 4
tenant_max_connections = 2

[fetch]
timeout_secs = 5

[runner]
concurrency = 2
"#,
        root.display()
    );

    let config_path = config_dir.join("dmx.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path, start_fixture_server())
}

fn run_dmx(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = dmx_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run dmx binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

/// Writes a project definition file and creates the project; returns its id.
fn create_project(config_path: &Path, definition: Value) -> String {
    let file = config_path.with_file_name("project.json");
    fs::write(&file, definition.to_string()).unwrap();

    let (stdout, stderr, success) =
        run_dmx(config_path, &["project", "create", "--file", file.to_str().unwrap()]);
    assert!(success, "project create failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("at version 1"));

    // "Created project <id> (<name>) at version 1."
    stdout.split_whitespace().nth(2).unwrap().to_string()
}

fn users_definition(addr: SocketAddr, path: &str) -> Value {
    json!({
        "name": "users",
        "api_url": format!("http://{}{}", addr, path),
        "method": "GET",
        "request_params": [{"key": "page", "type": "number", "default": 1}],
        "response_structure": [
            {"key": "uid", "type": "text", "primary": true, "nullable": true},
            {"key": "name", "type": "text", "nullable": false}
        ]
    })
}

fn query_json(config_path: &Path, args: &[&str]) -> Value {
    let mut full = vec!["query"];
    full.extend_from_slice(args);
    let (stdout, stderr, success) = run_dmx(config_path, &full);
    assert!(success, "query failed: stdout={}, stderr={}", stdout, stderr);
    serde_json::from_str(&stdout).unwrap()
}

#[test]
fn test_init_creates_catalog() {
    let (tmp, config_path, _) = setup_test_env();

    let (stdout, stderr, success) = run_dmx(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data").join("catalog.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path, _) = setup_test_env();

    let (_, _, success1) = run_dmx(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_dmx(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_project_create_provisions_units() {
    let (tmp, config_path, addr) = setup_test_env();
    run_dmx(&config_path, &["init"]);

    let id = create_project(&config_path, users_definition(addr, "/users"));
    let data = tmp.path().join("data");
    assert!(data.join(format!("project_{}_config.sqlite", id)).exists());
    assert!(data.join(format!("project_{}_data_v1.sqlite", id)).exists());

    let (stdout, _, success) = run_dmx(&config_path, &["project", "list"]);
    assert!(success);
    assert!(stdout.contains(&id));
    assert!(stdout.contains("users"));
}

#[test]
fn test_crawl_dedups_across_runs() {
    let (_tmp, config_path, addr) = setup_test_env();
    run_dmx(&config_path, &["init"]);
    let id = create_project(&config_path, users_definition(addr, "/users"));

    let (stdout, stderr, success) = run_dmx(&config_path, &["task", "crawl", &id]);
    assert!(success, "crawl failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("2 fetched, 1 inserted"));

    let (stdout, _, success) = run_dmx(&config_path, &["task", "crawl", &id]);
    assert!(success);
    assert!(stdout.contains("2 fetched, 0 inserted"));

    let result = query_json(&config_path, &[&id]);
    assert_eq!(result["total"], json!(1));
    assert_eq!(result["version"], json!(1));
    assert_eq!(result["data"][0]["uid"], json!("1"));

    let (stdout, _, _) = run_dmx(&config_path, &["task", "list", "--project", &id]);
    assert_eq!(stdout.matches("completed").count(), 2);
}

#[test]
fn test_task_params_reach_query_string() {
    let (_tmp, config_path, addr) = setup_test_env();
    run_dmx(&config_path, &["init"]);
    let id = create_project(&config_path, users_definition(addr, "/paged"));

    let (stdout, stderr, success) =
        run_dmx(&config_path, &["task", "crawl", &id, "--param", "page=7"]);
    assert!(success, "crawl failed: stdout={}, stderr={}", stdout, stderr);

    let result = query_json(&config_path, &[&id, "--filter", "uid LIKE 7-", "--order-by", "uid"]);
    assert_eq!(result["total"], json!(2));
    assert_eq!(result["data"][0]["uid"], json!("7-a"));
    assert_eq!(result["data"][1]["uid"], json!("7-b"));
}

#[test]
fn test_post_sends_json_body() {
    let (_tmp, config_path, addr) = setup_test_env();
    run_dmx(&config_path, &["init"]);
    let id = create_project(
        &config_path,
        json!({
            "name": "cities",
            "api_url": format!("http://{}/search", addr),
            "method": "POST",
            "request_params": [
                {"key": "city", "type": "text", "default": "oslo", "save_to_database": true}
            ],
            "response_structure": [
                {"key": "uid", "type": "text", "primary": true},
                {"key": "name", "type": "text"}
            ]
        }),
    );

    let (_, stderr, success) = run_dmx(&config_path, &["task", "crawl", &id, "--param", "city=bergen"]);
    assert!(success, "crawl failed: {}", stderr);

    let result = query_json(&config_path, &[&id]);
    assert_eq!(result["data"][0]["uid"], json!("bergen"));
    assert_eq!(result["data"][0]["city"], json!("bergen"));
}

#[test]
fn test_failed_fetch_marks_task_failed() {
    let (_tmp, config_path, addr) = setup_test_env();
    run_dmx(&config_path, &["init"]);
    let id = create_project(&config_path, users_definition(addr, "/broken"));

    let (_, stderr, success) = run_dmx(&config_path, &["task", "crawl", &id]);
    assert!(!success);
    assert!(stderr.contains("503"));

    let (stdout, _, success) = run_dmx(&config_path, &["task", "list", "--project", &id]);
    assert!(success);
    assert!(stdout.contains("failed"));
    assert!(stdout.contains("error:"));
}

#[test]
fn test_run_pending_executes_queue() {
    let (_tmp, config_path, addr) = setup_test_env();
    run_dmx(&config_path, &["init"]);
    let id = create_project(&config_path, users_definition(addr, "/paged"));

    for page in ["1", "2", "3"] {
        let param = format!("page={}", page);
        let (_, stderr, success) = run_dmx(&config_path, &["task", "create", &id, "--param", &param]);
        assert!(success, "task create failed: {}", stderr);
    }

    let (stdout, stderr, success) = run_dmx(&config_path, &["task", "run-pending"]);
    assert!(success, "run-pending failed: {}", stderr);
    assert!(stdout.contains("3 completed, 0 failed."));

    let result = query_json(&config_path, &[&id, "--limit", "2"]);
    assert_eq!(result["total"], json!(6));
    assert_eq!(result["data"].as_array().unwrap().len(), 2);
}

#[test]
fn test_schema_update_bumps_version() {
    let (_tmp, config_path, addr) = setup_test_env();
    run_dmx(&config_path, &["init"]);
    let id = create_project(&config_path, users_definition(addr, "/users"));
    run_dmx(&config_path, &["task", "crawl", &id]);

    let patch = config_path.with_file_name("patch.json");
    fs::write(
        &patch,
        json!({
            "response_structure": [
                {"key": "uid", "type": "text", "primary": true},
                {"key": "name", "type": "text"},
                {"key": "score", "type": "decimal"}
            ]
        })
        .to_string(),
    )
    .unwrap();
    let (stdout, stderr, success) =
        run_dmx(&config_path, &["project", "update", &id, "--file", patch.to_str().unwrap()]);
    assert!(success, "update failed: {}", stderr);
    assert!(stdout.contains("now at version 2"));

    let (stdout, _, _) = run_dmx(&config_path, &["project", "versions", &id]);
    assert_eq!(stdout.lines().collect::<Vec<_>>(), vec!["1", "2"]);

    assert_eq!(query_json(&config_path, &[&id])["total"], json!(0));
    assert_eq!(query_json(&config_path, &[&id, "--version", "1"])["total"], json!(1));
}

#[test]
fn test_invalid_schema_rejected() {
    let (_tmp, config_path, addr) = setup_test_env();
    run_dmx(&config_path, &["init"]);

    let file = config_path.with_file_name("bad.json");
    fs::write(
        &file,
        json!({
            "name": "bad",
            "api_url": format!("http://{}/users", addr),
            "method": "GET",
            "response_structure": [{"key": "project_id", "type": "text"}]
        })
        .to_string(),
    )
    .unwrap();

    let (_, stderr, success) =
        run_dmx(&config_path, &["project", "create", "--file", file.to_str().unwrap()]);
    assert!(!success);
    assert!(stderr.contains("reserved"));
}

#[test]
fn test_query_unknown_field_errors() {
    let (_tmp, config_path, addr) = setup_test_env();
    run_dmx(&config_path, &["init"]);
    let id = create_project(&config_path, users_definition(addr, "/users"));

    let (_, stderr, success) = run_dmx(&config_path, &["query", &id, "--filter", "password = x"]);
    assert!(!success);
    assert!(stderr.contains("unknown field"));
}

#[test]
fn test_show_missing_task() {
    let (_tmp, config_path, _) = setup_test_env();
    run_dmx(&config_path, &["init"]);

    let (_, stderr, success) = run_dmx(&config_path, &["task", "show", "nope"]);
    assert!(!success);
    assert!(stderr.contains("not found"));
}
