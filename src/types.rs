//! Core types for the relay
//!
//! Conversation messages are a tagged enum keyed by `role`, so a `tool` message
//! always carries its `tool_call_id` and only assistant messages can hold
//! `tool_calls`. The same types serialize directly into the OpenAI chat
//! completions wire format.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Message role in the conversation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A message in the conversation history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum ConversationMessage {
    System {
        content: MessageContent,
    },
    User {
        content: MessageContent,
    },
    Assistant {
        /// Always serialized; the chat API rejects assistant messages without it
        #[serde(default, deserialize_with = "nullable_content")]
        content: MessageContent,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
    },
    Tool {
        tool_call_id: String,
        content: String,
    },
}

impl ConversationMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self::System {
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::User {
            content: MessageContent::Text(text.into()),
        }
    }

    /// User message with a text part followed by an image part.
    pub fn user_with_image(text: impl Into<String>, image_url: impl Into<String>) -> Self {
        Self::User {
            content: MessageContent::Parts(vec![
                ContentPart::text(text),
                ContentPart::image_url(image_url),
            ]),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::Assistant {
            content: MessageContent::Text(text.into()),
            tool_calls: Vec::new(),
        }
    }

    /// Assistant message that requested tool calls.
    pub fn assistant_with_tool_calls(text: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self::Assistant {
            content: MessageContent::Text(text.into()),
            tool_calls,
        }
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::Tool {
            tool_call_id: tool_call_id.into(),
            content: content.into(),
        }
    }

    pub fn role(&self) -> MessageRole {
        match self {
            Self::System { .. } => MessageRole::System,
            Self::User { .. } => MessageRole::User,
            Self::Assistant { .. } => MessageRole::Assistant,
            Self::Tool { .. } => MessageRole::Tool,
        }
    }
}

fn nullable_content<'de, D>(deserializer: D) -> Result<MessageContent, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<MessageContent>::deserialize(deserializer)?.unwrap_or_default())
}

/// Message content: plain text or an ordered list of multimodal parts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Text(String::new())
    }
}

impl MessageContent {
    /// Concatenated text of the content, ignoring image parts.
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// One part of a multimodal message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    pub fn image_url(url: impl Into<String>) -> Self {
        ContentPart::ImageUrl {
            image_url: ImageUrl {
                url: url.into(),
                detail: None,
            },
        }
    }
}

/// Image reference: an https URL or a `data:` URL.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageUrl {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// A complete tool call as stored on an assistant message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_type")]
    pub call_type: String,
    pub function: FunctionCall,
}

fn function_type() -> String {
    "function".to_string()
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            call_type: function_type(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

/// Function name plus its raw JSON argument string.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
}

/// Streaming chat completion request sent upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ConversationMessage>,
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,
}

impl ChatCompletionRequest {
    /// Request that offers `tools` with `tool_choice = "auto"`.
    pub fn with_tools(model: impl Into<String>, messages: Vec<ConversationMessage>, tools: Vec<Value>) -> Self {
        Self {
            model: model.into(),
            messages,
            stream: true,
            tools: Some(tools),
            tool_choice: Some("auto".to_string()),
        }
    }

    /// Request without any tool schema, forcing a plain text answer.
    pub fn without_tools(model: impl Into<String>, messages: Vec<ConversationMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            stream: true,
            tools: None,
            tool_choice: None,
        }
    }

    pub fn offers_tools(&self) -> bool {
        self.tools.as_ref().is_some_and(|tools| !tools.is_empty())
    }
}

/// One `data:` payload of the upstream stream.
///
/// Every field is optional on the wire; providers differ in what they send.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatChunk {
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
    #[serde(default)]
    pub error: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChunkChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub delta: ChunkDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChunkDelta {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCallDeltaWire>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolCallDeltaWire {
    #[serde(default)]
    pub index: Option<u32>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub function: Option<FunctionDeltaWire>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FunctionDeltaWire {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

/// Body of `POST /chat`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub prompt: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub image_data: Option<String>,
    #[serde(default)]
    pub messages: Vec<ConversationMessage>,
}

impl ChatRequest {
    /// Checks the required fields and returns `(api_key, model_id)`.
    pub fn credentials(&self) -> crate::Result<(&str, &str)> {
        let api_key = self.api_key.as_deref().map(str::trim).unwrap_or_default();
        let model_id = self.model_id.as_deref().map(str::trim).unwrap_or_default();
        if api_key.is_empty() || model_id.is_empty() {
            return Err(crate::Error::invalid_input("apiKey and modelId are required"));
        }
        Ok((api_key, model_id))
    }

    /// Prior history followed by the new user turn.
    pub fn conversation(&self) -> Vec<ConversationMessage> {
        let mut messages = self.messages.clone();
        let user = match self.image_data.as_deref().filter(|d| !d.is_empty()) {
            Some(image) => ConversationMessage::user_with_image(&self.prompt, image),
            None => ConversationMessage::user(&self.prompt),
        };
        messages.push(user);
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_role_serialization() {
        assert_eq!(serde_json::to_string(&MessageRole::User).unwrap(), "\"user\"");
        assert_eq!(serde_json::to_string(&MessageRole::Tool).unwrap(), "\"tool\"");
    }

    #[test]
    fn test_user_message_wire_format() {
        let msg = ConversationMessage::user("2+2?");
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"role": "user", "content": "2+2?"})
        );
        assert_eq!(msg.role(), MessageRole::User);
    }

    #[test]
    fn test_user_message_with_image_keeps_part_order() {
        let msg = ConversationMessage::user_with_image("What is this?", "data:image/png;base64,AAAA");
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({
                "role": "user",
                "content": [
                    {"type": "text", "text": "What is this?"},
                    {"type": "image_url", "image_url": {"url": "data:image/png;base64,AAAA"}}
                ]
            })
        );
    }

    #[test]
    fn test_assistant_tool_call_message_has_content() {
        let call = ToolCall::new("call_1", "sequentialthinking", r#"{"thought":"x"}"#);
        let msg = ConversationMessage::assistant_with_tool_calls("", vec![call]);
        let value = serde_json::to_value(&msg).unwrap();

        assert_eq!(value["role"], "assistant");
        assert_eq!(value["content"], "");
        assert_eq!(value["tool_calls"][0]["id"], "call_1");
        assert_eq!(value["tool_calls"][0]["type"], "function");
        assert_eq!(value["tool_calls"][0]["function"]["name"], "sequentialthinking");
        assert_eq!(value["tool_calls"][0]["function"]["arguments"], r#"{"thought":"x"}"#);
    }

    #[test]
    fn test_plain_assistant_omits_tool_calls() {
        let value = serde_json::to_value(ConversationMessage::assistant("4")).unwrap();
        assert!(value.get("tool_calls").is_none());
    }

    #[test]
    fn test_tool_message_wire_format() {
        let msg = ConversationMessage::tool("call_1", "ok");
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"role": "tool", "tool_call_id": "call_1", "content": "ok"})
        );
    }

    #[test]
    fn test_history_deserialization_from_client() {
        let history: Vec<ConversationMessage> = serde_json::from_value(json!([
            {"role": "system", "content": "be brief"},
            {"role": "user", "content": "hi"},
            {"role": "assistant", "content": null, "tool_calls": [
                {"id": "c1", "type": "function", "function": {"name": "sequentialthinking", "arguments": "{}"}}
            ]},
            {"role": "tool", "tool_call_id": "c1", "content": "done"},
            {"role": "assistant", "content": "hello"}
        ]))
        .unwrap();

        assert_eq!(history.len(), 5);
        assert_eq!(history[0].role(), MessageRole::System);
        match &history[2] {
            ConversationMessage::Assistant { content, tool_calls } => {
                assert_eq!(content, &MessageContent::Text(String::new()));
                assert_eq!(tool_calls[0].id, "c1");
            }
            other => panic!("Expected assistant message, got {:?}", other),
        }
    }

    #[test]
    fn test_tool_message_requires_call_id() {
        let result: Result<ConversationMessage, _> =
            serde_json::from_value(json!({"role": "tool", "content": "x"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_content_text_skips_images() {
        let content = MessageContent::Parts(vec![
            ContentPart::text("a"),
            ContentPart::image_url("https://example.com/x.png"),
            ContentPart::text("b"),
        ]);
        assert_eq!(content.text(), "a\nb");
    }

    #[test]
    fn test_request_with_and_without_tools() {
        let messages = vec![ConversationMessage::user("hi")];
        let tooled = ChatCompletionRequest::with_tools("m", messages.clone(), vec![json!({"type": "function"})]);
        let plain = ChatCompletionRequest::without_tools("m", messages);

        let tooled_json = serde_json::to_value(&tooled).unwrap();
        assert_eq!(tooled_json["tool_choice"], "auto");
        assert_eq!(tooled_json["stream"], true);
        assert!(tooled.offers_tools());

        let plain_json = serde_json::to_value(&plain).unwrap();
        assert!(plain_json.get("tools").is_none());
        assert!(plain_json.get("tool_choice").is_none());
        assert!(!plain.offers_tools());
    }

    #[test]
    fn test_chunk_deserialization_is_lenient() {
        let chunk: ChatChunk = serde_json::from_str(
            r#"{"id":"x","choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"a"}}]}}]}"#,
        )
        .unwrap();
        let calls = chunk.choices[0].delta.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].index, Some(0));
        assert!(calls[0].id.is_none());
        assert_eq!(calls[0].function.as_ref().unwrap().arguments.as_deref(), Some("{\"a"));

        let empty: ChatChunk = serde_json::from_str("{}").unwrap();
        assert!(empty.choices.is_empty());
    }

    #[test]
    fn test_chat_request_conversation_and_credentials() {
        let request: ChatRequest = serde_json::from_value(json!({
            "prompt": "describe",
            "apiKey": "sk-test",
            "modelId": "openai/gpt-4o",
            "imageData": "data:image/png;base64,AAAA",
            "messages": [{"role": "user", "content": "earlier"}, {"role": "assistant", "content": "ok"}]
        }))
        .unwrap();

        assert_eq!(request.credentials().unwrap(), ("sk-test", "openai/gpt-4o"));
        let conversation = request.conversation();
        assert_eq!(conversation.len(), 3);
        assert!(matches!(
            &conversation[2],
            ConversationMessage::User { content: MessageContent::Parts(parts) } if parts.len() == 2
        ));
    }

    #[test]
    fn test_chat_request_missing_credentials() {
        let request: ChatRequest =
            serde_json::from_value(json!({"prompt": "hi", "apiKey": "  "})).unwrap();
        assert!(matches!(request.credentials(), Err(crate::Error::InvalidInput(_))));
        assert_eq!(request.conversation(), vec![ConversationMessage::user("hi")]);
    }
}
