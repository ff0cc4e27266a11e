//! Tool dispatch: lookup, input checking, execution, and result encoding.

use parley_core::error::ToolError;
use parley_core::tool::{ToolCall, ToolRegistry, ToolResult};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// Executes tool calls requested by the model against a [`ToolRegistry`].
///
/// The per-turn call ceiling is the orchestrator's concern, not the
/// dispatcher's.
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Run one tool call and encode its output for the backend.
    pub async fn dispatch(&self, call: &ToolCall) -> Result<ToolResult, ToolError> {
        if call.name.trim().is_empty() {
            return Err(ToolError::NotFound("(empty tool name)".into()));
        }
        let tool = self
            .registry
            .get(&call.name)
            .ok_or_else(|| ToolError::NotFound(call.name.clone()))?;

        // Missing arguments are treated as an empty object
        let input = match &call.input {
            Value::Null => Value::Object(Default::default()),
            other => other.clone(),
        };
        check_input(&call.name, &tool.input_schema(), &input)?;

        debug!(tool = %call.name, call_id = %call.id, "Dispatching tool call");
        let output = tool.execute(input.clone()).await.inspect_err(|e| {
            warn!(tool = %call.name, error = %e, "Tool call failed");
        })?;
        let content = serde_json::to_string(&output)
            .map_err(|e| ToolError::failed(&call.name, format!("result is not serializable: {e}")))?;

        Ok(ToolResult {
            tool_use_id: call.id.clone(),
            tool_name: call.name.clone(),
            input,
            content,
            is_error: false,
        })
    }
}

/// Check `input` against the tool's declared JSON Schema.
pub fn check_input(tool_name: &str, schema: &Value, input: &Value) -> Result<(), ToolError> {
    if let Value::String(raw) = input {
        return Err(ToolError::invalid_input(
            tool_name,
            format!("arguments are not a JSON object: {raw}"),
        ));
    }
    let validator = jsonschema::draft202012::new(schema)
        .map_err(|e| ToolError::failed(tool_name, format!("invalid input schema: {e}")))?;

    let errors: Vec<String> = validator.iter_errors(input).map(|e| e.to_string()).collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ToolError::invalid_input(tool_name, errors.join("; ")))
    }
}
