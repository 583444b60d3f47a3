//! Tool-call delta aggregation.
//!
//! Tool calls arrive as **incremental fragments** spread over many stream chunks:
//!
//! ```text
//! Chunk 1: { id: "call_abc", name: "sequentialthinking", arguments: "" }
//! Chunk 2: { id: "call_abc", arguments: "{\"thou" }
//! Chunk 3: { id: "call_abc", arguments: "ght\":\"x\",...}" }
//! ```
//!
//! [`ToolCallAccumulator`] merges fragments per call id by concatenating their
//! argument text in arrival order, and [`AssistantTurnBuffer`] keeps everything the
//! assistant produced in one turn so the exact message can be replayed into the
//! history before the next upstream request.
//!
//! Only the first complete call of a turn is executed. Parallel tool calls are
//! not supported; the extra calls are logged and dropped.

use crate::types::{ConversationMessage, ToolCall};
use std::collections::HashMap;

/// A partial tool call as seen in one stream chunk, or the merged state of all
/// chunks for one call id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolCallFragment {
    /// Upstream call id, stable across chunks of the same call
    pub id: String,
    /// Function name; may be empty on continuation fragments
    pub name: String,
    /// Argument text; only valid JSON once every fragment has been merged
    pub arguments: String,
}

impl ToolCallFragment {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }

    /// A call is complete once it has an id, a name and some argument text.
    pub fn is_complete(&self) -> bool {
        !self.id.is_empty() && !self.name.is_empty() && !self.arguments.is_empty()
    }

    fn to_tool_call(&self) -> ToolCall {
        ToolCall::new(&self.id, &self.name, &self.arguments)
    }
}

/// Merges tool-call fragments keyed by call id.
///
/// The first fragment for an id is stored verbatim. Later fragments append to
/// `arguments` and fill `name` if it was still empty. Insertion order of ids is
/// preserved so "first call" is well defined.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    order: Vec<String>,
    calls: HashMap<String, ToolCallFragment>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, fragment: ToolCallFragment) {
        match self.calls.get_mut(&fragment.id) {
            Some(entry) => {
                entry.arguments.push_str(&fragment.arguments);
                if entry.name.is_empty() && !fragment.name.is_empty() {
                    entry.name = fragment.name;
                }
            }
            None => {
                self.order.push(fragment.id.clone());
                self.calls.insert(fragment.id.clone(), fragment);
            }
        }
    }

    pub fn extend(&mut self, fragments: impl IntoIterator<Item = ToolCallFragment>) {
        for fragment in fragments {
            self.push(fragment);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Merged state of a single call id.
    pub fn get(&self, id: &str) -> Option<&ToolCallFragment> {
        self.calls.get(id)
    }

    /// All merged calls in order of first appearance.
    pub fn calls(&self) -> impl Iterator<Item = &ToolCallFragment> {
        self.order.iter().filter_map(|id| self.calls.get(id))
    }

    /// Every complete call, in order of first appearance.
    pub fn complete_calls(&self) -> Vec<ToolCall> {
        self.calls()
            .filter(|call| call.is_complete())
            .map(ToolCallFragment::to_tool_call)
            .collect()
    }

    /// The call to act on this turn, if any.
    pub fn first_complete(&self) -> Option<ToolCall> {
        let mut complete = self.complete_calls().into_iter();
        let first = complete.next()?;
        let ignored: Vec<String> = complete.map(|call| call.function.name).collect();
        if !ignored.is_empty() {
            log::warn!(
                "Model requested {} additional tool call(s) in one turn; only the first is executed (ignored: {:?})",
                ignored.len(),
                ignored
            );
        }
        Some(first)
    }
}

/// Everything the assistant produced during one streamed turn.
#[derive(Debug, Default)]
pub struct AssistantTurnBuffer {
    content: String,
    tool_calls: ToolCallAccumulator,
}

impl AssistantTurnBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_content(&mut self, text: &str) {
        self.content.push_str(text);
    }

    pub fn push_tool_fragments(&mut self, fragments: impl IntoIterator<Item = ToolCallFragment>) {
        self.tool_calls.extend(fragments);
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn tool_calls(&self) -> &ToolCallAccumulator {
        &self.tool_calls
    }

    /// True once any tool-call fragment has been seen this turn.
    pub fn has_tool_activity(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    /// Rebuilds the assistant message that requested `call`.
    ///
    /// Only the executed call is included: the chat API expects a tool answer
    /// for every call id present on the assistant message.
    pub fn to_message(&self, call: &ToolCall) -> ConversationMessage {
        ConversationMessage::assistant_with_tool_calls(&self.content, vec![call.clone()])
    }
}
