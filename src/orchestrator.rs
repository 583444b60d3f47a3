//! The tool-call orchestration loop.
//!
//! One [`Orchestrator`] is shared by the whole service; every client request
//! gets its own [`OrchestrationState`] and runs the loop below on a single
//! task, awaiting each step before the next.
//!
//! # State machine
//!
//! ```text
//! AwaitFirstResponse -> StreamingContent -> ToolCallPending -> ToolExecuting
//!        ^                    |                                     |
//!        |                    +--(no tool call)--> Done             |
//!  AwaitNextResponse <---- nextThoughtNeeded && iteration < max ----+
//!                                                                   |
//!                          Finalizing <------- otherwise -----------+
//!                              |
//!                             Done            (Error reachable from anywhere)
//! ```
//!
//! - Content deltas are forwarded immediately until the first tool-call delta
//!   of a turn; after that the turn's content is only buffered.
//! - A turn without a complete tool call ends the run. Its content has
//!   already been delivered.
//! - Finalization is one request without the tool schema, streamed to the
//!   client. No tool-bearing request is ever made after it starts.
//! - Hitting the iteration bound emits an `iteration_limit` error event and
//!   still finalizes.
//! - Every other failure emits one error event and aborts the run.

use crate::aggregator::AssistantTurnBuffer;
use crate::config::{DEFAULT_MAX_ITERATIONS, RelayConfig};
use crate::emitter::{ClientEvent, EventEmitter};
use crate::error::ErrorCode;
use crate::mcp::ToolInvoker;
use crate::stream::{StreamEvent, decode_events};
use crate::tools::{ToolDefinition, next_thought_needed};
use crate::types::{ChatCompletionRequest, ConversationMessage};
use crate::upstream::ChatBackend;
use crate::{Error, Result};
use futures::StreamExt;
use log::{debug, info, trace, warn};
use serde_json::Value;
use std::sync::Arc;

/// Phase of one orchestration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AwaitFirstResponse,
    StreamingContent,
    ToolCallPending,
    ToolExecuting,
    AwaitNextResponse,
    Finalizing,
    Done,
    Error,
}

/// Per-request state: the conversation and the loop counters.
#[derive(Debug)]
pub struct OrchestrationState {
    messages: Vec<ConversationMessage>,
    iteration: u32,
    max_iterations: u32,
    more_thinking: bool,
    phase: Phase,
}

impl OrchestrationState {
    pub fn new(messages: Vec<ConversationMessage>, max_iterations: u32) -> Self {
        Self {
            messages,
            iteration: 1,
            max_iterations: max_iterations.max(1),
            more_thinking: false,
            phase: Phase::AwaitFirstResponse,
        }
    }

    pub fn messages(&self) -> &[ConversationMessage] {
        &self.messages
    }

    /// Current tool round, starting at 1.
    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    /// `nextThoughtNeeded` of the latest tool result.
    pub fn more_thinking(&self) -> bool {
        self.more_thinking
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn transition(&mut self, next: Phase) {
        if self.phase != next {
            debug!(
                "Orchestration phase {:?} -> {:?} (iteration {}/{})",
                self.phase, next, self.iteration, self.max_iterations
            );
            self.phase = next;
        }
    }
}

/// Drives upstream turns and tool calls for client requests.
pub struct Orchestrator {
    backend: Arc<dyn ChatBackend>,
    tools: Arc<dyn ToolInvoker>,
    tool_schema: Vec<Value>,
    max_iterations: u32,
    system_prompt: Option<String>,
}

impl Orchestrator {
    pub fn new(backend: Arc<dyn ChatBackend>, tools: Arc<dyn ToolInvoker>) -> Self {
        Self {
            backend,
            tools,
            tool_schema: vec![ToolDefinition::sequential_thinking().to_openai_format()],
            max_iterations: DEFAULT_MAX_ITERATIONS,
            system_prompt: None,
        }
    }

    pub fn from_config(
        config: &RelayConfig,
        backend: Arc<dyn ChatBackend>,
        tools: Arc<dyn ToolInvoker>,
    ) -> Self {
        Self::new(backend, tools)
            .with_max_iterations(config.max_iterations)
            .with_system_prompt(config.system_prompt.clone())
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    pub fn with_system_prompt(mut self, system_prompt: Option<String>) -> Self {
        self.system_prompt = system_prompt.filter(|p| !p.trim().is_empty());
        self
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    /// Fresh state for a request, with the configured system prompt in front
    /// unless the history already opens with one.
    pub fn new_state(&self, mut messages: Vec<ConversationMessage>) -> OrchestrationState {
        if let Some(prompt) = &self.system_prompt {
            if !matches!(messages.first(), Some(ConversationMessage::System { .. })) {
                messages.insert(0, ConversationMessage::system(prompt));
            }
        }
        OrchestrationState::new(messages, self.max_iterations)
    }

    /// Run the loop to completion.
    ///
    /// Failures are reported to the client as an error event before being
    /// returned, except [`Error::ClientDisconnected`], which just stops the run.
    pub async fn run(
        &self,
        model: &str,
        api_key: &str,
        state: &mut OrchestrationState,
        emitter: &EventEmitter,
    ) -> Result<()> {
        let result = self.drive(model, api_key, state, emitter).await;

        if let Err(e) = &result {
            state.transition(Phase::Error);
            match e {
                Error::ClientDisconnected => info!(
                    "Client disconnected, abandoning run at iteration {}",
                    state.iteration
                ),
                other => {
                    warn!("Orchestration failed at iteration {}: {}", state.iteration, other);
                    if emitter.emit(ClientEvent::from_error(other)).await.is_err() {
                        debug!("Could not report error, client already gone");
                    }
                }
            }
        }
        result
    }

    async fn drive(
        &self,
        model: &str,
        api_key: &str,
        state: &mut OrchestrationState,
        emitter: &EventEmitter,
    ) -> Result<()> {
        loop {
            let request =
                ChatCompletionRequest::with_tools(model, state.messages.clone(), self.tool_schema.clone());
            let turn = self.stream_turn(&request, api_key, state, emitter).await?;

            let Some(call) = turn.tool_calls().first_complete() else {
                if turn.has_tool_activity() {
                    warn!("Turn ended with only incomplete tool calls; treating as no tool call");
                }
                state.transition(Phase::Done);
                return Ok(());
            };
            state.transition(Phase::ToolCallPending);

            let arguments: Value = serde_json::from_str(&call.function.arguments).map_err(|e| {
                Error::invalid_arguments(format!(
                    "arguments for {} are not valid JSON ({})",
                    call.function.name, e
                ))
            })?;

            state.transition(Phase::ToolExecuting);
            emitter
                .emit(ClientEvent::tool_call_start(
                    &call.id,
                    &call.function.name,
                    arguments.clone(),
                ))
                .await?;

            let output = self.tools.invoke(&call.function.name, arguments).await?;
            if output.is_error {
                warn!("Tool {} reported an error: {}", call.function.name, output.text);
            }

            emitter
                .emit(ClientEvent::tool_call_response(
                    &call.id,
                    &call.function.name,
                    &output.text,
                    output.is_error,
                ))
                .await?;

            state.messages.push(turn.to_message(&call));
            state
                .messages
                .push(ConversationMessage::tool(&call.id, &output.text));

            state.more_thinking = next_thought_needed(&output.text);
            if !state.more_thinking {
                debug!("Thinking complete after iteration {}", state.iteration);
                break;
            }

            if state.iteration >= state.max_iterations {
                warn!(
                    "Reached {} thinking iterations without a final thought",
                    state.max_iterations
                );
                emitter
                    .emit(ClientEvent::error(
                        ErrorCode::IterationLimit,
                        format!(
                            "Stopped after {} thinking steps; answering with what was gathered so far",
                            state.max_iterations
                        ),
                    ))
                    .await?;
                break;
            }

            state.iteration += 1;
            state.transition(Phase::AwaitNextResponse);
        }

        state.transition(Phase::Finalizing);
        let request = ChatCompletionRequest::without_tools(model, state.messages.clone());
        let turn = self.stream_turn(&request, api_key, state, emitter).await?;
        debug!("Final answer streamed ({} chars)", turn.content().len());

        state.transition(Phase::Done);
        Ok(())
    }

    /// Issue one upstream request and consume its stream.
    async fn stream_turn(
        &self,
        request: &ChatCompletionRequest,
        api_key: &str,
        state: &mut OrchestrationState,
        emitter: &EventEmitter,
    ) -> Result<AssistantTurnBuffer> {
        let lines = self.backend.stream_chat(request, api_key).await?;
        let mut events = decode_events(lines);
        let mut turn = AssistantTurnBuffer::new();

        while let Some(event) = events.next().await {
            match event? {
                StreamEvent::ContentDelta(text) => {
                    turn.push_content(&text);
                    if turn.has_tool_activity() {
                        trace!("Suppressing content after tool call: {:?}", text);
                        continue;
                    }
                    if matches!(state.phase, Phase::AwaitFirstResponse | Phase::AwaitNextResponse) {
                        state.transition(Phase::StreamingContent);
                    }
                    emitter.emit(ClientEvent::content(text)).await?;
                }
                StreamEvent::ToolCallDelta(fragments) => {
                    if !request.offers_tools() {
                        warn!("Ignoring tool call in a response to a request without tools");
                        continue;
                    }
                    turn.push_tool_fragments(fragments);
                }
                StreamEvent::Done => break,
            }
        }

        Ok(turn)
    }
}
