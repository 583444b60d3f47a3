//! Client-facing events and the channel that carries them.
//!
//! Each [`ClientEvent`] is one wire message on the browser's event stream. The
//! orchestrator pushes events through an [`EventEmitter`]; the HTTP layer
//! drains the matching receiver and writes every event as its own SSE frame.
//!
//! Wire shapes:
//!
//! ```json
//! {"role":"assistant","content":"Hel"}
//! {"type":"tool_call_start","id":"call_1","name":"sequentialthinking","arguments":{...}}
//! {"type":"tool_call_response","id":"call_1","name":"sequentialthinking","content":"...","isError":false}
//! {"type":"error","code":"iteration_limit","message":"..."}
//! ```

use crate::error::ErrorCode;
use crate::types::MessageRole;
use crate::{Error, Result};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

/// Buffer between the orchestrator and the HTTP writer.
pub const DEFAULT_EVENT_BUFFER: usize = 32;

/// One outbound message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ClientEvent {
    /// Assistant text, forwarded as it streams
    Content { role: MessageRole, content: String },
    /// Tool activity and errors, discriminated by `type`
    Activity(ActivityEvent),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActivityEvent {
    ToolCallStart {
        id: String,
        name: String,
        arguments: Value,
    },
    ToolCallResponse {
        id: String,
        name: String,
        content: String,
        #[serde(rename = "isError")]
        is_error: bool,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
}

impl ClientEvent {
    pub fn content(text: impl Into<String>) -> Self {
        ClientEvent::Content {
            role: MessageRole::Assistant,
            content: text.into(),
        }
    }

    pub fn tool_call_start(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        ClientEvent::Activity(ActivityEvent::ToolCallStart {
            id: id.into(),
            name: name.into(),
            arguments,
        })
    }

    pub fn tool_call_response(
        id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        ClientEvent::Activity(ActivityEvent::ToolCallResponse {
            id: id.into(),
            name: name.into(),
            content: content.into(),
            is_error,
        })
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ClientEvent::Activity(ActivityEvent::Error {
            code,
            message: message.into(),
        })
    }

    /// Error event describing `error`.
    pub fn from_error(error: &Error) -> Self {
        Self::error(error.code(), error.to_string())
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ClientEvent::Activity(ActivityEvent::Error { .. }))
    }
}

/// Sending half of a request's event stream.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    tx: mpsc::Sender<ClientEvent>,
}

/// Create a connected emitter/receiver pair.
pub fn event_channel(buffer: usize) -> (EventEmitter, mpsc::Receiver<ClientEvent>) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    (EventEmitter { tx }, rx)
}

impl EventEmitter {
    /// Deliver one event.
    ///
    /// Fails with [`Error::ClientDisconnected`] once the receiving side is
    /// gone, which tells the producer to stop.
    pub async fn emit(&self, event: ClientEvent) -> Result<()> {
        self.tx.send(event).await.map_err(|_| {
            log::debug!("Client event stream closed, dropping event");
            Error::ClientDisconnected
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves when the receiving side is dropped.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_content_event_wire_format() {
        assert_eq!(
            serde_json::to_value(ClientEvent::content("4")).unwrap(),
            json!({"role": "assistant", "content": "4"})
        );
    }

    #[test]
    fn test_tool_events_wire_format() {
        let start = ClientEvent::tool_call_start("call_1", "sequentialthinking", json!({"thought": "x"}));
        assert_eq!(
            serde_json::to_value(&start).unwrap(),
            json!({
                "type": "tool_call_start",
                "id": "call_1",
                "name": "sequentialthinking",
                "arguments": {"thought": "x"}
            })
        );

        let response = ClientEvent::tool_call_response("call_1", "sequentialthinking", "ok", false);
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({
                "type": "tool_call_response",
                "id": "call_1",
                "name": "sequentialthinking",
                "content": "ok",
                "isError": false
            })
        );
    }

    #[test]
    fn test_error_event_wire_format() {
        let event = ClientEvent::from_error(&Error::tool_unavailable("tool process is failed"));
        assert!(event.is_error());
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "type": "error",
                "code": "tool_unavailable",
                "message": "Tool unavailable: tool process is failed"
            })
        );
    }

    #[tokio::test]
    async fn test_events_arrive_in_order() {
        let (emitter, mut rx) = event_channel(4);
        for text in ["a", "b", "c"] {
            emitter.emit(ClientEvent::content(text)).await.unwrap();
        }
        drop(emitter);

        let mut received = Vec::new();
        while let Some(event) = rx.recv().await {
            received.push(event);
        }
        assert_eq!(
            received,
            vec![
                ClientEvent::content("a"),
                ClientEvent::content("b"),
                ClientEvent::content("c")
            ]
        );
    }

    #[tokio::test]
    async fn test_emit_after_client_disconnect_fails() {
        let (emitter, rx) = event_channel(4);
        assert!(!emitter.is_closed());
        drop(rx);

        assert!(emitter.is_closed());
        let err = emitter.emit(ClientEvent::content("late")).await.unwrap_err();
        assert!(matches!(err, Error::ClientDisconnected));
    }
}
