//! Tool manifest, registry, and dispatch (spec component C).
//!
//! Builds on `aigent-tools`'s `{Tool, ToolSpec, ToolRegistry}` shape
//! (`crates/tools/src/lib.rs` — a `Vec<Box<dyn Tool>>` registry with
//! `spec()`/`run()` on an async trait, first-match-wins on duplicate
//! names) and extends it with manifest-driven stub registration, input
//! schema validation, and workspace injection per `requires_workspace`.

pub mod builtins;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use okcvm_workspace::WorkspaceManager;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("invalid input for tool {tool}: {reason}")]
    ToolInputInvalid { tool: String, reason: String },
    #[error("tool {tool} execution failed: {message}")]
    ToolExecError { tool: String, message: String },
}

pub type Result<T> = std::result::Result<T, ToolError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// A JSON Schema object describing the tool's input shape.
    pub input_schema: Value,
    pub requires_workspace: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    pub success: bool,
    pub output: String,
}

/// One declared entry in the static tool manifest. `ToolRegistry::from_manifest`
/// binds each entry to a concrete implementation if one is registered, or a
/// stub otherwise — every manifest entry ends up callable either way.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub requires_workspace: bool,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;

    /// Invoke the tool. `workspace` is `Some` whenever `spec().requires_workspace`
    /// is true; the registry guarantees this before calling in.
    async fn invoke(&self, input: Value, workspace: Option<&WorkspaceManager>) -> Result<ToolOutput>;
}

/// A tool declared in the manifest with no concrete implementation
/// registered. Invoking it always succeeds at the dispatch level but
/// reports `success: false` with a "not implemented" message, matching
/// §4.C's "stub whose invocation returns a structured not-implemented
/// result" contract.
struct StubTool {
    spec: ToolSpec,
}

#[async_trait]
impl Tool for StubTool {
    fn spec(&self) -> ToolSpec {
        self.spec.clone()
    }

    async fn invoke(&self, _input: Value, _workspace: Option<&WorkspaceManager>) -> Result<ToolOutput> {
        Ok(ToolOutput {
            success: false,
            output: format!("tool '{}' is not implemented", self.spec.name),
        })
    }
}

/// Checks that `input` carries every field the schema's top-level `required`
/// array names, and that present fields match the schema's declared
/// `properties[name].type` when one is given.
///
/// This is a deliberately small, hand-rolled subset of JSON Schema
/// validation (required-field presence + primitive type checking) rather
/// than a dependency on a full `jsonschema` validator crate — neither the
/// teacher nor the wider example pack pulls one in, and the manifest's
/// schemas are simple enough (flat objects, primitive fields) that the
/// subset covers every declared tool.
fn validate_against_schema(tool_name: &str, schema: &Value, input: &Value) -> Result<()> {
    let Some(schema_obj) = schema.as_object() else {
        return Ok(());
    };

    if let Some(required) = schema_obj.get("required").and_then(Value::as_array) {
        let input_obj = input.as_object();
        for name in required {
            let Some(name) = name.as_str() else { continue };
            let present = input_obj.map(|o| o.contains_key(name)).unwrap_or(false);
            if !present {
                return Err(ToolError::ToolInputInvalid {
                    tool: tool_name.to_string(),
                    reason: format!("missing required field: {name}"),
                });
            }
        }
    }

    if let (Some(properties), Some(input_obj)) = (schema_obj.get("properties").and_then(Value::as_object), input.as_object()) {
        for (field, field_value) in input_obj {
            let Some(expected_type) = properties.get(field).and_then(|p| p.get("type")).and_then(Value::as_str) else {
                continue;
            };
            if !json_type_matches(expected_type, field_value) {
                return Err(ToolError::ToolInputInvalid {
                    tool: tool_name.to_string(),
                    reason: format!("field '{field}' expected type '{expected_type}'"),
                });
            }
        }
    }

    Ok(())
}

fn json_type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}

/// Binds tool implementations, validates inputs against their manifest
/// schema, and injects the workspace for tools that declare they need one.
///
/// Tool lookup is a linear scan over a `Vec`, same as the teacher's
/// registry — the catalogue is small (dozens of tools at most) and the
/// manifest-declared order doubles as the stable listing order §4.C
/// requires for reproducible streaming and history.
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.push(tool);
    }

    /// Builds a registry from a manifest and a set of concrete
    /// implementations keyed by tool name. Manifest entries without a
    /// matching implementation are registered as stubs, so `List()` always
    /// reflects the full manifest regardless of what's actually wired up.
    pub fn from_manifest(manifest: Vec<ManifestEntry>, mut implementations: HashMap<String, Box<dyn Tool>>) -> Self {
        let mut registry = Self::new();
        for entry in manifest {
            if let Some(tool) = implementations.remove(&entry.name) {
                registry.register(tool);
            } else {
                registry.register(Box::new(StubTool {
                    spec: ToolSpec {
                        name: entry.name,
                        description: entry.description,
                        input_schema: entry.input_schema,
                        requires_workspace: entry.requires_workspace,
                    },
                }));
            }
        }
        registry
    }

    /// Manifest-order listing of every registered tool, concrete or stub.
    pub fn list(&self) -> Vec<ToolSpec> {
        self.tools.iter().map(|t| t.spec()).collect()
    }

    /// Render the registry as an OpenAI-style tool-schema array, the shape
    /// the bound LLM driver expects to bind against (§6.3).
    pub fn as_llm_tools(&self) -> Value {
        Value::Array(
            self.tools
                .iter()
                .map(|t| {
                    let spec = t.spec();
                    serde_json::json!({
                        "type": "function",
                        "function": {
                            "name": spec.name,
                            "description": spec.description,
                            "parameters": spec.input_schema,
                        }
                    })
                })
                .collect(),
        )
    }

    fn find(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.iter().find(|t| t.spec().name == name).map(|b| b.as_ref())
    }

    /// Direct invocation used outside the LLM tool-calling loop as well as
    /// from within it. Validates `input` against the tool's declared schema
    /// before dispatch and supplies the workspace when required.
    pub async fn call(&self, name: &str, input: Value, workspace: Option<&WorkspaceManager>) -> Result<ToolOutput> {
        let tool = self.find(name).ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;
        let spec = tool.spec();

        validate_against_schema(name, &spec.input_schema, &input)?;

        if spec.requires_workspace && workspace.is_none() {
            return Err(ToolError::ToolExecError {
                tool: name.to_string(),
                message: "tool requires a workspace but none was supplied".to_string(),
            });
        }

        tool.invoke(input, workspace).await.map_err(|e| match e {
            ToolError::ToolExecError { tool, message } => ToolError::ToolExecError { tool, message },
            other => other,
        })
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DummyTool;

    #[async_trait]
    impl Tool for DummyTool {
        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: "dummy".to_string(),
                description: "echoes its input".to_string(),
                input_schema: serde_json::json!({
                    "type": "object",
                    "properties": { "text": { "type": "string" } },
                    "required": ["text"],
                }),
                requires_workspace: false,
            }
        }

        async fn invoke(&self, input: Value, _workspace: Option<&WorkspaceManager>) -> Result<ToolOutput> {
            let text = input.get("text").and_then(Value::as_str).unwrap_or_default();
            Ok(ToolOutput { success: true, output: text.to_string() })
        }
    }

    fn registry_with_dummy() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(DummyTool));
        registry
    }

    #[tokio::test]
    async fn call_unknown_tool_errors() {
        let registry = registry_with_dummy();
        let err = registry.call("nonexistent", serde_json::json!({}), None).await.unwrap_err();
        assert!(matches!(err, ToolError::UnknownTool(_)));
    }

    #[tokio::test]
    async fn call_validates_required_fields() {
        let registry = registry_with_dummy();
        let err = registry.call("dummy", serde_json::json!({}), None).await.unwrap_err();
        assert!(matches!(err, ToolError::ToolInputInvalid { .. }));
    }

    #[tokio::test]
    async fn call_runs_matching_tool() {
        let registry = registry_with_dummy();
        let out = registry.call("dummy", serde_json::json!({"text": "hi"}), None).await.unwrap();
        assert_eq!(out.output, "hi");
    }

    #[test]
    fn list_reflects_manifest_order_including_stubs() {
        let manifest = vec![
            ManifestEntry {
                name: "dummy".to_string(),
                description: "d".to_string(),
                input_schema: serde_json::json!({}),
                requires_workspace: false,
            },
            ManifestEntry {
                name: "unimplemented_tool".to_string(),
                description: "u".to_string(),
                input_schema: serde_json::json!({}),
                requires_workspace: false,
            },
        ];
        let mut implementations: HashMap<String, Box<dyn Tool>> = HashMap::new();
        implementations.insert("dummy".to_string(), Box::new(DummyTool));

        let registry = ToolRegistry::from_manifest(manifest, implementations);
        let specs = registry.list();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].name, "dummy");
        assert_eq!(specs[1].name, "unimplemented_tool");
    }

    #[tokio::test]
    async fn stub_tool_reports_not_implemented() {
        let manifest = vec![ManifestEntry {
            name: "unimplemented_tool".to_string(),
            description: "u".to_string(),
            input_schema: serde_json::json!({}),
            requires_workspace: false,
        }];
        let registry = ToolRegistry::from_manifest(manifest, HashMap::new());
        let out = registry.call("unimplemented_tool", serde_json::json!({}), None).await.unwrap();
        assert!(!out.success);
        assert!(out.output.contains("not implemented"));
    }
}
