//! HTTP tool server tests.
//!
//! Each test starts a real server on a free port and talks to it with
//! `reqwest`, covering the built-in container tools, error mapping, and a
//! custom tool registered through the `Tool` trait.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

use folio::config::Config;
use folio::container::ContainerManager;
use folio::server::{router, run_server};
use folio::traits::{Tool, ToolContext, ToolRegistry};

// ─── Test Tool ──────────────────────────────────────────────────────

/// Reports how many containers exist and which one is active.
struct ContainerCountTool;

#[async_trait]
impl Tool for ContainerCountTool {
    fn name(&self) -> &str {
        "container_count"
    }

    fn description(&self) -> &str {
        "Count registered containers"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "label": { "type": "string", "default": "containers" }
            }
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let count = ctx.manager.list().await.len();
        Ok(json!({
            "label": params["label"],
            "count": count,
            "active": ctx.manager.active().await,
        }))
    }
}

// ─── Helpers ────────────────────────────────────────────────────────

struct Fixture {
    _tmp: TempDir,
    files: PathBuf,
    manager: Arc<ContainerManager>,
}

fn fixture(port: u16) -> Fixture {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().canonicalize().unwrap();
    let files = root.join("files");
    fs::create_dir_all(&files).unwrap();
    fs::write(
        files.join("auth.md"),
        "JWT tokens and OAuth2 flows for secure authentication.",
    )
    .unwrap();
    fs::write(
        files.join("deploy.md"),
        "Deploying services with Kubernetes and Helm charts.",
    )
    .unwrap();

    let mut config = Config::default();
    config.data.dir = root.join("data");
    config.server.bind = format!("127.0.0.1:{}", port);
    let manager = Arc::new(ContainerManager::from_config(config).unwrap());

    Fixture {
        _tmp: tmp,
        files,
        manager,
    }
}

fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn wait_for_server(port: u16) {
    let client = reqwest::Client::new();
    let url = format!("http://127.0.0.1:{}/health", port);
    for _ in 0..50 {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        if let Ok(resp) = client.get(&url).send().await {
            if resp.status().is_success() {
                return;
            }
        }
    }
    panic!("Server did not become ready within 5 seconds");
}

async fn start(fx: &Fixture, port: u16) -> tokio::task::JoinHandle<()> {
    let manager = fx.manager.clone();
    let handle = tokio::spawn(async move {
        run_server(manager).await.ok();
    });
    wait_for_server(port).await;
    handle
}

async fn call(port: u16, tool: &str, body: Value) -> (u16, Value) {
    let resp = reqwest::Client::new()
        .post(format!("http://127.0.0.1:{}/tools/{}", port, tool))
        .json(&body)
        .send()
        .await
        .unwrap();
    let status = resp.status().as_u16();
    (status, resp.json().await.unwrap())
}

// ─── Tests ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_health_and_tool_list() {
    let port = find_free_port();
    let fx = fixture(port);
    let server = start(&fx, port).await;

    let client = reqwest::Client::new();
    let health: Value = client
        .get(format!("http://127.0.0.1:{}/health", port))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");

    let resp = client
        .get(format!("http://127.0.0.1:{}/tools/list", port))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    let names: Vec<&str> = body["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert_eq!(names.len(), 10);
    for expected in ["search", "index", "rebuild", "stop", "add_path", "delete_container"] {
        assert!(names.contains(&expected), "missing tool {}", expected);
    }
    let index = body["tools"]
        .as_array()
        .unwrap()
        .iter()
        .find(|t| t["name"] == "index")
        .unwrap();
    assert!(index["side_effects"].as_str().unwrap().contains("writes"));

    server.abort();
}

#[tokio::test]
async fn test_index_and_search_over_http() {
    let port = find_free_port();
    let fx = fixture(port);
    let server = start(&fx, port).await;

    let (status, body) = call(port, "create_container", json!({ "name": "kb" })).await;
    assert_eq!(status, 200, "{}", body);

    let (status, body) = call(
        port,
        "add_path",
        json!({ "path": fx.files.to_str().unwrap(), "container": "kb" }),
    )
    .await;
    assert_eq!(status, 200, "{}", body);

    let (status, body) = call(port, "index", json!({ "container": "kb" })).await;
    assert_eq!(status, 200, "{}", body);
    assert_eq!(body["result"]["added"], 2);
    assert_eq!(body["result"]["cancelled"], false);

    let (status, body) = call(
        port,
        "search",
        json!({ "query": "kubernetes helm", "container": "kb", "k": 1 }),
    )
    .await;
    assert_eq!(status, 200, "{}", body);
    let results = body["result"]["results"].as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0]["path"].as_str().unwrap().ends_with("deploy.md"));

    let (status, body) = call(
        port,
        "search",
        json!({ "query": "kubernetes", "container": "kb", "k": 1, "mode": "keyword" }),
    )
    .await;
    assert_eq!(status, 200, "{}", body);
    let results = body["result"]["results"].as_array().unwrap();
    assert!(results[0]["path"].as_str().unwrap().ends_with("deploy.md"));

    let (status, body) = call(
        port,
        "search",
        json!({ "query": "kubernetes", "container": "kb", "mode": "fuzzy" }),
    )
    .await;
    assert_eq!(status, 400, "{}", body);
    assert_eq!(body["error"]["code"], "bad_request");

    let (status, body) = call(port, "status", json!({ "container": "kb" })).await;
    assert_eq!(status, 200);
    assert_eq!(body["result"]["stats"]["documents"], 2);
    assert!(body["result"]["job"].is_null());

    server.abort();
}

#[tokio::test]
async fn test_error_codes() {
    let port = find_free_port();
    let fx = fixture(port);
    let server = start(&fx, port).await;

    let (status, body) = call(port, "no_such_tool", json!({})).await;
    assert_eq!(status, 404);
    assert_eq!(body["error"]["code"], "not_found");

    let (status, body) = call(port, "search", json!({})).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "bad_request");

    let (status, body) = call(port, "delete_container", json!({ "name": "Default" })).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "default_container");

    let (status, body) = call(port, "status", json!({ "container": "ghost" })).await;
    assert_eq!(status, 404);
    assert_eq!(body["error"]["code"], "container_not_found");

    let files = fx.files.to_str().unwrap();
    call(port, "create_container", json!({ "name": "a" })).await;
    call(port, "create_container", json!({ "name": "b" })).await;
    let (status, _) = call(port, "add_path", json!({ "path": files, "container": "a" })).await;
    assert_eq!(status, 200);
    let (status, body) = call(port, "add_path", json!({ "path": files, "container": "b" })).await;
    assert_eq!(status, 409);
    assert_eq!(body["error"]["code"], "path_conflict");
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("container 'a'"));

    let (status, body) = call(port, "search", json!({ "query": "oauth", "container": "b" })).await;
    assert_eq!(status, 409);
    assert_eq!(body["error"]["code"], "empty_index");

    server.abort();
}

#[tokio::test]
async fn test_custom_tool_via_router() {
    let port = find_free_port();
    let fx = fixture(port);

    let mut tools = ToolRegistry::with_builtins();
    tools.register(Box::new(ContainerCountTool));
    let app = router(fx.manager.clone(), Arc::new(tools));
    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port))
        .await
        .unwrap();
    let server = tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    wait_for_server(port).await;

    let (status, body) = call(port, "container_count", json!({})).await;
    assert_eq!(status, 200, "{}", body);
    assert_eq!(body["result"]["count"], 1);
    assert_eq!(body["result"]["active"], "Default");
    assert_eq!(body["result"]["label"], "containers");

    server.abort();
}
