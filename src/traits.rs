//! Tool surface.
//!
//! Every container operation an agent or script may call is a [`Tool`]:
//! a name, a description, the side effects it has, a JSON Schema for its
//! parameters, and an async `execute`. The [`ToolRegistry`] holds them and
//! is served over HTTP by [`crate::server`]; any other protocol front end
//! can wrap the same registry.
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                 ToolRegistry                  │
//! │  search  index  rebuild  stop  status         │
//! │  list_containers  create_container           │
//! │  delete_container  add_path  remove_path     │
//! └──────────────────────┬────────────────────────┘
//!                        ▼
//!               ToolContext → ContainerManager
//! ```
//!
//! Tools return `anyhow::Result`. Domain failures are [`FolioError`]s
//! inside the `anyhow::Error`, so callers can downcast them to choose a
//! status code.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;

use folio_core::reconcile::DeltaMode;
use folio_core::search::{SearchMode, SearchOptions};

use crate::container::ContainerManager;

/// A callable operation exposed to agents.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Route name, e.g. `POST /tools/search`.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// What calling the tool changes, in one line. `"none"` for reads.
    fn side_effects(&self) -> &str {
        "none"
    }

    /// JSON Schema (`type: "object"`) for the parameters.
    fn parameters_schema(&self) -> Value;

    /// Run the tool. The result is wrapped in `{ "result": ... }` by the
    /// server.
    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value>;
}

/// What a tool can reach while it runs.
#[derive(Clone)]
pub struct ToolContext {
    pub manager: Arc<ContainerManager>,
}

impl ToolContext {
    pub fn new(manager: Arc<ContainerManager>) -> Self {
        Self { manager }
    }

    /// The `container` parameter, or the active container.
    async fn container(&self, params: &Value) -> String {
        self.manager
            .resolve(params.get("container").and_then(|c| c.as_str()))
            .await
    }
}

/// Serializable tool description for `GET /tools/list`.
#[derive(Debug, Clone, Serialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub side_effects: String,
    pub parameters: Value,
}

impl ToolInfo {
    pub fn of(tool: &dyn Tool) -> Self {
        Self {
            name: tool.name().to_string(),
            description: tool.description().to_string(),
            side_effects: tool.side_effects().to_string(),
            parameters: tool.parameters_schema(),
        }
    }
}

fn container_param() -> Value {
    json!({ "type": "string", "description": "Container name (defaults to the active container)" })
}

fn required_str<'a>(params: &'a Value, key: &str) -> Result<&'a str> {
    match params.get(key).and_then(|v| v.as_str()) {
        Some(s) if !s.trim().is_empty() => Ok(s),
        _ => bail!("{} must not be empty", key),
    }
}

// ============ search ============

pub struct SearchTool;

#[async_trait]
impl Tool for SearchTool {
    fn name(&self) -> &str {
        "search"
    }

    fn description(&self) -> &str {
        "Semantic, keyword, or hybrid search over one container"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Search query" },
                "container": container_param(),
                "k": { "type": "integer", "description": "Max results" },
                "multi_chunk": { "type": "boolean", "default": false,
                                 "description": "Return several chunks per document" },
                "prefix": { "type": "string", "description": "Only documents under this folder" },
                "mode": { "type": "string", "enum": ["semantic", "keyword", "hybrid"],
                          "description": "Ranking mode (defaults to retrieval.mode)" }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let query = params["query"].as_str().unwrap_or("");
        let container = ctx.container(&params).await;
        let k = params
            .get("k")
            .and_then(|k| k.as_u64())
            .map(|k| k as usize)
            .unwrap_or(ctx.manager.config().retrieval.default_k);
        let mode = match params.get("mode").and_then(|m| m.as_str()) {
            Some(m) => m.parse::<SearchMode>().map_err(anyhow::Error::msg)?,
            None => ctx.manager.config().retrieval.mode,
        };
        let opts = SearchOptions {
            mode,
            multi_chunk: params["multi_chunk"].as_bool().unwrap_or(false),
            prefix: params
                .get("prefix")
                .and_then(|p| p.as_str())
                .map(|p| {
                    let p = PathBuf::from(p);
                    p.canonicalize().unwrap_or(p)
                }),
        };

        let results = ctx.manager.search(&container, query, k, &opts).await?;
        Ok(json!({ "container": container, "results": results }))
    }
}

// ============ index / rebuild / stop ============

/// Incremental index or full rebuild, depending on `rebuild`.
pub struct IndexTool {
    rebuild: bool,
}

impl IndexTool {
    pub fn incremental() -> Self {
        Self { rebuild: false }
    }

    pub fn rebuild() -> Self {
        Self { rebuild: true }
    }
}

#[async_trait]
impl Tool for IndexTool {
    fn name(&self) -> &str {
        if self.rebuild {
            "rebuild"
        } else {
            "index"
        }
    }

    fn description(&self) -> &str {
        if self.rebuild {
            "Re-extract and re-embed every file of a container"
        } else {
            "Bring a container's index up to date with its folders"
        }
    }

    fn side_effects(&self) -> &str {
        "writes the container's index; may cancel a running job under the supersede policy"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "container": container_param(),
                "wait": { "type": "boolean", "default": true,
                          "description": "Wait for the pass to finish and return its report" }
            }
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let container = ctx.container(&params).await;
        let mode = if self.rebuild {
            DeltaMode::Rebuild
        } else {
            DeltaMode::Incremental
        };

        let job = ctx.manager.spawn_index(&container, mode).await?;
        if params["wait"].as_bool().unwrap_or(true) {
            let report = job.wait().await?;
            Ok(serde_json::to_value(report)?)
        } else {
            Ok(json!({ "container": job.container, "job_id": job.id, "started": true }))
        }
    }
}

pub struct StopTool;

#[async_trait]
impl Tool for StopTool {
    fn name(&self) -> &str {
        "stop"
    }

    fn description(&self) -> &str {
        "Cancel a container's running index job"
    }

    fn side_effects(&self) -> &str {
        "the job halts before its next file; applied changes stay"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "container": container_param() }
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let container = ctx.container(&params).await;
        let stopped = ctx.manager.stop(&container);
        Ok(json!({ "container": container, "stopped": stopped }))
    }
}

// ============ status ============

pub struct StatusTool;

#[async_trait]
impl Tool for StatusTool {
    fn name(&self) -> &str {
        "status"
    }

    fn description(&self) -> &str {
        "Document counts, paths, and job state of a container"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "container": container_param() }
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let container = ctx.container(&params).await;
        let status = ctx.manager.status(&container).await?;
        Ok(serde_json::to_value(status)?)
    }
}

// ============ containers ============

pub struct ListContainersTool;

#[async_trait]
impl Tool for ListContainersTool {
    fn name(&self) -> &str {
        "list_containers"
    }

    fn description(&self) -> &str {
        "List containers and the active one"
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _params: Value, ctx: &ToolContext) -> Result<Value> {
        Ok(json!({
            "active": ctx.manager.active().await,
            "containers": ctx.manager.list().await,
        }))
    }
}

pub struct CreateContainerTool;

#[async_trait]
impl Tool for CreateContainerTool {
    fn name(&self) -> &str {
        "create_container"
    }

    fn description(&self) -> &str {
        "Create an empty container"
    }

    fn side_effects(&self) -> &str {
        "adds the container to the registry"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": { "type": "string" },
                "description": { "type": "string", "default": "" }
            },
            "required": ["name"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let name = required_str(&params, "name")?;
        let description = params["description"].as_str().unwrap_or("");
        let record = ctx.manager.create(name, description).await?;
        Ok(serde_json::to_value(record)?)
    }
}

pub struct DeleteContainerTool;

#[async_trait]
impl Tool for DeleteContainerTool {
    fn name(&self) -> &str {
        "delete_container"
    }

    fn description(&self) -> &str {
        "Delete a container and its index"
    }

    fn side_effects(&self) -> &str {
        "cancels its job, removes it from the registry, deletes its database files"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "name": { "type": "string" } },
            "required": ["name"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let name = required_str(&params, "name")?;
        ctx.manager.delete(name).await?;
        Ok(json!({ "deleted": name }))
    }
}

// ============ paths ============

pub struct AddPathTool;

#[async_trait]
impl Tool for AddPathTool {
    fn name(&self) -> &str {
        "add_path"
    }

    fn description(&self) -> &str {
        "Register a folder with a container"
    }

    fn side_effects(&self) -> &str {
        "updates the registry; files are indexed on the next index call"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Folder to index" },
                "container": container_param()
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let path = PathBuf::from(required_str(&params, "path")?);
        let container = ctx.container(&params).await;
        let root = ctx.manager.add_path(&container, &path).await?;
        Ok(json!({ "container": container, "path": root }))
    }
}

pub struct RemovePathTool;

#[async_trait]
impl Tool for RemovePathTool {
    fn name(&self) -> &str {
        "remove_path"
    }

    fn description(&self) -> &str {
        "Unregister a folder and drop its documents"
    }

    fn side_effects(&self) -> &str {
        "updates the registry and deletes the folder's documents from the index"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "container": container_param()
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let path = PathBuf::from(required_str(&params, "path")?);
        let container = ctx.container(&params).await;
        let removed = ctx.manager.remove_path(&container, &path).await?;
        Ok(json!({ "container": container, "documents_removed": removed }))
    }
}

// ============ registry ============

/// Named collection of tools.
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// All built-in container tools.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(SearchTool));
        registry.register(Box::new(IndexTool::incremental()));
        registry.register(Box::new(IndexTool::rebuild()));
        registry.register(Box::new(StopTool));
        registry.register(Box::new(StatusTool));
        registry.register(Box::new(ListContainersTool));
        registry.register(Box::new(CreateContainerTool));
        registry.register(Box::new(DeleteContainerTool));
        registry.register(Box::new(AddPathTool));
        registry.register(Box::new(RemovePathTool));
        registry
    }

    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn tools(&self) -> &[Box<dyn Tool>] {
        &self.tools
    }

    pub fn find(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|t| t.name() == name)
            .map(|t| t.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate incoming JSON parameters against a tool's schema.
///
/// Checks required fields, types, and enum constraints, and fills in
/// defaults for missing optional fields.
pub fn validate_params(schema: &Value, params: &Value) -> Result<Value> {
    let params_obj = match params {
        Value::Object(map) => map.clone(),
        Value::Null => serde_json::Map::new(),
        other => bail!("parameters must be a JSON object, got {}", json_type_name(other)),
    };

    let properties = schema
        .get("properties")
        .and_then(|p| p.as_object())
        .cloned()
        .unwrap_or_default();

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for field in required.iter().filter_map(|v| v.as_str()) {
            if !params_obj.contains_key(field) {
                bail!("missing required parameter: {}", field);
            }
        }
    }

    let mut result = params_obj.clone();
    for (prop_name, prop_schema) in &properties {
        match params_obj.get(prop_name) {
            Some(value) => {
                if let Some(expected) = prop_schema.get("type").and_then(|t| t.as_str()) {
                    let type_ok = match expected {
                        "string" => value.is_string(),
                        "integer" => value.is_i64() || value.is_u64(),
                        "number" => value.is_number(),
                        "boolean" => value.is_boolean(),
                        "array" => value.is_array(),
                        "object" => value.is_object(),
                        _ => true,
                    };
                    if !type_ok {
                        bail!(
                            "parameter '{}' must be of type '{}', got {}",
                            prop_name,
                            expected,
                            json_type_name(value)
                        );
                    }
                }
                if let Some(allowed) = prop_schema.get("enum").and_then(|e| e.as_array()) {
                    if !allowed.contains(value) {
                        bail!("parameter '{}' has invalid value {}", prop_name, value);
                    }
                }
            }
            None => {
                if let Some(default) = prop_schema.get("default") {
                    result.insert(prop_name.clone(), default.clone());
                }
            }
        }
    }

    Ok(Value::Object(result))
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_registered() {
        let registry = ToolRegistry::with_builtins();
        let names: Vec<&str> = registry.tools().iter().map(|t| t.name()).collect();
        assert_eq!(
            names,
            [
                "search",
                "index",
                "rebuild",
                "stop",
                "status",
                "list_containers",
                "create_container",
                "delete_container",
                "add_path",
                "remove_path"
            ]
        );
        assert!(registry.find("rebuild").is_some());
        assert!(registry.find("get").is_none());
    }

    #[test]
    fn test_schemas_are_objects() {
        for tool in ToolRegistry::with_builtins().tools() {
            assert_eq!(tool.parameters_schema()["type"], "object", "{}", tool.name());
        }
    }

    #[test]
    fn test_validate_params_defaults_and_required() {
        let schema = SearchTool.parameters_schema();
        let out = validate_params(&schema, &json!({ "query": "q" })).unwrap();
        assert_eq!(out["multi_chunk"], false);

        let err = validate_params(&schema, &json!({})).unwrap_err();
        assert!(err.to_string().contains("missing required parameter: query"));

        let err = validate_params(&schema, &json!({ "query": "q", "k": "ten" })).unwrap_err();
        assert!(err.to_string().contains("must be of type 'integer'"));
    }

    #[test]
    fn test_validate_params_accepts_null_body() {
        let schema = StatusTool.parameters_schema();
        assert_eq!(validate_params(&schema, &Value::Null).unwrap(), json!({}));
    }
}
