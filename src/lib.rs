//! # thinking-relay
//!
//! A streaming chat relay that sits between a browser client and an
//! OpenAI-compatible chat API, and lets the model think step by step through
//! a `sequentialthinking` tool served by a local JSON-RPC process.
//!
//! ## Overview
//!
//! For each `POST /chat` the relay:
//!
//! 1. Sends the conversation upstream with the tool offered and streams the
//!    response back to the client as it arrives.
//! 2. When the model calls the tool, forwards the call to the tool process,
//!    reports the call and its result to the client, and appends both to the
//!    conversation.
//! 3. Repeats while the tool says another thought is needed, up to a fixed
//!    number of iterations.
//! 4. Makes one last upstream call without tools so the model writes its
//!    answer.
//!
//! ## Embedding
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use thinking_relay::{
//!     AppState, HttpChatBackend, Orchestrator, RelayConfig, ToolProcessManager, server,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RelayConfig::builder().bind_addr("127.0.0.1:8000").build()?;
//!
//!     let tools = Arc::new(ToolProcessManager::new(config.tool_process()));
//!     tools.connect().await?;
//!
//!     let backend = Arc::new(HttpChatBackend::from_config(&config)?);
//!     let orchestrator = Arc::new(Orchestrator::from_config(&config, backend.clone(), tools.clone()));
//!     let state = AppState::new(orchestrator, backend, tools.clone());
//!
//!     server::serve(&config, state, server::shutdown_signal()).await?;
//!     tools.disconnect().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **stream**: Line framing and decoding of upstream streaming chunks
//! - **aggregator**: Reassembly of tool calls split across chunks
//! - **orchestrator**: The turn / tool / finalization loop
//! - **mcp**: Lifecycle and JSON-RPC correlation for the tool process
//! - **emitter**: Client event types and the per-request channel
//! - **upstream**: HTTP backend for chat completions and model listing
//! - **server**: axum routes, CORS and graceful shutdown
//! - **config**, **error**, **types**, **tools**, **retry**: supporting pieces

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

/// Accumulation of streamed tool-call fragments and assistant text.
mod aggregator;

/// Service configuration with environment overrides.
mod config;

/// Client-visible events and the channel that delivers them.
mod emitter;

/// Crate-wide `Error` enum and `Result<T>` alias.
mod error;

/// Tool process manager speaking JSON-RPC 2.0 over stdio.
mod mcp;

/// The per-request conversation loop.
mod orchestrator;

/// Parsing of upstream streaming responses.
mod stream;

/// The sequential-thinking tool schema and result inspection.
mod tools;

/// Conversation and wire types.
mod types;

/// Upstream chat API client.
mod upstream;

// ============================================================================
// PUBLIC EXPORTS
// ============================================================================

/// Backoff helpers for idempotent upstream calls.
pub mod retry;

/// HTTP routes and the serve loop.
pub mod server;

// --- Configuration ---

pub use config::{
    DEFAULT_CORS_ORIGIN, DEFAULT_MAX_ITERATIONS, DEFAULT_TOOL_ARGS, DEFAULT_TOOL_COMMAND,
    DEFAULT_UPSTREAM_URL, RelayConfig, RelayConfigBuilder,
};

// --- Error Handling ---

pub use error::{Error, ErrorCode, Result};

// --- Conversation Types ---

pub use types::{
    ChatCompletionRequest, ChatRequest, ContentPart, ConversationMessage, FunctionCall, ImageUrl,
    MessageContent, MessageRole, ToolCall,
};

// --- Streaming ---

pub use aggregator::{AssistantTurnBuffer, ToolCallAccumulator, ToolCallFragment};
pub use stream::{
    EventStream, LineStream, MAX_LINE_LENGTH, SseLineCodec, StreamChunkParser, StreamEvent,
    decode_events, lines_from_bytes,
};

// --- Tool Process ---

pub use mcp::{
    PROTOCOL_VERSION, SessionStatus, ToolInvoker, ToolOutput, ToolProcessConfig,
    ToolProcessManager,
};
pub use tools::{SEQUENTIAL_THINKING, ToolDefinition, next_thought_needed};

// --- Orchestration ---

pub use emitter::{ActivityEvent, ClientEvent, DEFAULT_EVENT_BUFFER, EventEmitter, event_channel};
pub use orchestrator::{OrchestrationState, Orchestrator, Phase};

// --- Upstream ---

pub use server::AppState;
pub use upstream::{
    ChatBackend, HttpChatBackend, ModelCatalog, ModelInfo, ModelPricing, parse_model_list,
};

// ============================================================================
// CONVENIENCE PRELUDE
// ============================================================================

/// The types needed to embed the relay or drive an orchestration directly.
pub mod prelude {
    pub use crate::{
        AppState, ChatBackend, ClientEvent, ConversationMessage, Error, EventEmitter,
        HttpChatBackend, Orchestrator, RelayConfig, Result, ToolInvoker, ToolProcessManager,
        event_channel,
    };
}
