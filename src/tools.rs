//! Tool schema offered to the upstream model.
//!
//! The relay exposes exactly one tool, `sequentialthinking`, whose implementation
//! lives in the external tool process. This module only describes it: the
//! [`ToolDefinition`] is rendered into the OpenAI function calling format for
//! every tool-bearing upstream request.
//!
//! ## Output Format
//!
//! ```json
//! {
//!   "type": "function",
//!   "function": {
//!     "name": "sequentialthinking",
//!     "description": "...",
//!     "parameters": { "type": "object", "properties": { ... }, "required": [ ... ] }
//!   }
//! }
//! ```

use serde_json::{Value, json};

/// Name of the sequential-thinking tool, as registered by the tool process.
pub const SEQUENTIAL_THINKING: &str = "sequentialthinking";

const SEQUENTIAL_THINKING_DESCRIPTION: &str = "A detailed tool for dynamic and reflective \
problem-solving through thoughts. Each thought can build on, question, or revise previous \
insights as understanding deepens. Set nextThoughtNeeded to false only when a satisfactory \
answer has been reached.";

/// Name, description and JSON Schema of a tool the model may call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    name: String,
    description: String,
    input_schema: Value,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }

    /// The `sequentialthinking` tool and its parameter contract.
    pub fn sequential_thinking() -> Self {
        Self::new(
            SEQUENTIAL_THINKING,
            SEQUENTIAL_THINKING_DESCRIPTION,
            json!({
                "type": "object",
                "properties": {
                    "thought": {
                        "type": "string",
                        "description": "Your current thinking step"
                    },
                    "nextThoughtNeeded": {
                        "type": "boolean",
                        "description": "Whether another thought step is needed"
                    },
                    "thoughtNumber": {
                        "type": "integer",
                        "description": "Current thought number",
                        "minimum": 1
                    },
                    "totalThoughts": {
                        "type": "integer",
                        "description": "Estimated total thoughts needed",
                        "minimum": 1
                    },
                    "isRevision": {
                        "type": "boolean",
                        "description": "Whether this revises previous thinking"
                    },
                    "revisesThought": {
                        "type": "integer",
                        "description": "Which thought is being reconsidered",
                        "minimum": 1
                    },
                    "branchFromThought": {
                        "type": "integer",
                        "description": "Branching point thought number",
                        "minimum": 1
                    },
                    "branchId": {
                        "type": "string",
                        "description": "Branch identifier"
                    }
                },
                "required": ["thought", "nextThoughtNeeded", "thoughtNumber", "totalThoughts"]
            }),
        )
    }

    /// Convert the definition to OpenAI's function calling format.
    pub fn to_openai_format(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.input_schema
            }
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn input_schema(&self) -> &Value {
        &self.input_schema
    }
}

/// Reads `nextThoughtNeeded` from a tool result.
///
/// Anything that is not a JSON object with a boolean `nextThoughtNeeded` field
/// counts as "thinking complete".
pub fn next_thought_needed(result_text: &str) -> bool {
    match serde_json::from_str::<Value>(result_text) {
        Ok(value) => value
            .get("nextThoughtNeeded")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        Err(e) => {
            log::debug!("Tool result is not JSON ({}), treating thinking as complete", e);
            false
        }
    }
}
