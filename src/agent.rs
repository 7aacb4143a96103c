//! Agent Loop
//!
//! Drives the model turn by turn:
//! 1. Stream the response, showing only text that cannot still become a tag
//! 2. Keep at most one tool call per response
//! 3. Run the call through the approval gate
//! 4. Invoke the tool and feed the result back
//! 5. Repeat until the model answers without a tool call

use crate::approval::{ApprovalDecision, ApprovalGate, Authorization};
use crate::config::AgentConfig;
use crate::error::{AgentError, AgentFailure, Result};
use crate::history::{Compactor, History};
use crate::llm::{ModelRequest, ModelTransport, StreamEvent};
use crate::parser::{self, StreamingText};
use crate::tools::{is_error_result, ToolContext, ToolDescriptor, ToolExecutor};
use crate::types::{ContentBlock, HistoryEntry, TokenUsage, ToolUse, ToolUseResult};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Tool result content recorded when a call is refused
pub const DENIED_MESSAGE: &str = "The user denied this tool call.";

/// Events emitted during agent execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AgentEvent {
    #[serde(rename = "agent_start")]
    Start { prompt: String },

    #[serde(rename = "turn_start")]
    TurnStart { turn: usize },

    /// Visible response text, already tag-suppressed
    #[serde(rename = "text_delta")]
    TextDelta { text: String },

    #[serde(rename = "reasoning_delta")]
    ReasoningDelta { text: String },

    /// Final text of a turn, once the response is complete
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "tool_use")]
    ToolUse { tool_use: ToolUse },

    /// The call is waiting on the escalation channel
    #[serde(rename = "approval_required")]
    ApprovalRequired {
        call_id: String,
        tool_name: String,
        params: Value,
        timeout_ms: u64,
    },

    #[serde(rename = "tool_result")]
    ToolResult { result: ToolUseResult },

    #[serde(rename = "turn_end")]
    TurnEnd { turn: usize, usage: TokenUsage },

    #[serde(rename = "compacted")]
    Compacted { before: usize, after: usize },

    #[serde(rename = "agent_end")]
    End { text: String, usage: TokenUsage },

    #[serde(rename = "error")]
    Error { code: String, message: String },
}

/// Successful run summary
#[derive(Debug, Clone, PartialEq)]
pub struct AgentResult {
    /// Last text surfaced to the caller
    pub text: String,
    pub usage: TokenUsage,
    pub turns: usize,
    pub tool_calls_count: usize,
    pub tool_results: Vec<ToolUseResult>,
}

/// Mutable state carried across the turns of one run
#[derive(Default)]
struct RunState {
    usage: TokenUsage,
    last_input_tokens: Option<usize>,
    last_text: String,
    tool_calls_count: usize,
    tool_results: Vec<ToolUseResult>,
}

enum TurnOutcome {
    Continue,
    Finished,
    Failed(AgentError),
}

/// How a tool call was settled
enum Dispatched {
    /// Executed, or answered with an error result without executing
    Ran(ToolUseResult),
    /// Refused by the approval gate
    Denied(ToolUseResult),
}

/// Send an event unless the run is canceled while the channel is full
async fn emit(
    event_tx: &Option<mpsc::Sender<AgentEvent>>,
    cancel: &CancellationToken,
    event: AgentEvent,
) {
    let Some(tx) = event_tx else {
        return;
    };
    tokio::select! {
        biased;
        sent = tx.send(event) => {
            sent.ok();
        }
        _ = cancel.cancelled() => {
            tracing::debug!("Event consumer stalled after cancellation; event dropped");
        }
    }
}

/// Agent loop executor
pub struct AgentLoop {
    transport: Arc<dyn ModelTransport>,
    tools: Arc<dyn ToolExecutor>,
    tool_context: ToolContext,
    gate: Arc<ApprovalGate>,
    compactor: Option<Arc<dyn Compactor>>,
    config: AgentConfig,
}

impl AgentLoop {
    pub fn new(
        transport: Arc<dyn ModelTransport>,
        tools: Arc<dyn ToolExecutor>,
        tool_context: ToolContext,
        config: AgentConfig,
    ) -> Self {
        let gate = Arc::new(ApprovalGate::new(&config.approval));
        Self {
            transport,
            tools,
            tool_context,
            gate,
            compactor: None,
            config,
        }
    }

    pub fn builder() -> AgentLoopBuilder {
        AgentLoopBuilder::default()
    }

    /// The session's approval gate; use it to answer escalations
    pub fn gate(&self) -> &Arc<ApprovalGate> {
        &self.gate
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Run the loop for one user prompt
    ///
    /// The prompt is appended to `history` before the first turn. On failure
    /// the returned [`AgentFailure`] carries a snapshot of the history and
    /// the usage accumulated so far.
    #[tracing::instrument(
        name = "a3s.agent.execute",
        skip(self, history, prompt, event_tx, cancel),
        fields(
            a3s.session.id = self.tool_context.session_id.as_deref().unwrap_or("none"),
            a3s.agent.max_turns = self.config.max_turns,
            a3s.agent.tool_calls_count = tracing::field::Empty,
            a3s.llm.total_tokens = tracing::field::Empty,
        )
    )]
    pub async fn execute(
        &self,
        history: &mut History,
        prompt: &str,
        event_tx: Option<mpsc::Sender<AgentEvent>>,
        cancel: &CancellationToken,
    ) -> Result<AgentResult> {
        emit(
            &event_tx,
            cancel,
            AgentEvent::Start {
                prompt: prompt.to_string(),
            },
        )
        .await;

        history.push(HistoryEntry::user(prompt));

        let system_prompt = crate::prompts::build_system_prompt(
            self.config.system_prompt.as_deref(),
            &self.tools.definitions(),
        );

        let mut state = RunState::default();
        let mut turn = 0;

        loop {
            turn += 1;

            if turn > self.config.max_turns {
                let error = AgentError::MaxTurnsExceeded {
                    max_turns: self.config.max_turns,
                };
                return Err(self.fail(error, history, &state, turn, &event_tx, cancel).await);
            }

            // Checked between turns too, so a run canceled during a tool call stops here
            if cancel.is_cancelled() {
                return Err(self
                    .fail(AgentError::Canceled, history, &state, turn, &event_tx, cancel)
                    .await);
            }

            self.maybe_compact(history, &state, &event_tx, cancel).await;

            emit(&event_tx, cancel, AgentEvent::TurnStart { turn }).await;
            tracing::info!(
                turn = turn,
                max_turns = self.config.max_turns,
                "Agent turn started"
            );

            let turn_span = tracing::info_span!(
                "a3s.agent.turn",
                a3s.agent.turn_number = turn as i64,
                a3s.llm.total_tokens = tracing::field::Empty,
            );
            let outcome = self
                .run_turn(turn, &system_prompt, history, &mut state, &event_tx, cancel)
                .instrument(turn_span)
                .await;

            match outcome {
                TurnOutcome::Continue => continue,
                TurnOutcome::Finished => break,
                TurnOutcome::Failed(error) => {
                    return Err(self.fail(error, history, &state, turn, &event_tx, cancel).await);
                }
            }
        }

        let span = tracing::Span::current();
        span.record(
            crate::telemetry::ATTR_TOOL_CALLS_COUNT,
            state.tool_calls_count as i64,
        );
        span.record(crate::telemetry::ATTR_LLM_TOTAL_TOKENS, state.usage.total() as i64);

        emit(
            &event_tx,
            cancel,
            AgentEvent::End {
                text: state.last_text.clone(),
                usage: state.usage,
            },
        )
        .await;

        tracing::info!(
            turns = turn,
            tool_calls = state.tool_calls_count,
            total_tokens = state.usage.total(),
            "Agent run completed"
        );

        Ok(AgentResult {
            text: state.last_text,
            usage: state.usage,
            turns: turn,
            tool_calls_count: state.tool_calls_count,
            tool_results: state.tool_results,
        })
    }

    /// Run on a background task, streaming events through a fresh channel
    ///
    /// The task hands the history back together with the result.
    pub fn spawn(
        self: Arc<Self>,
        mut history: History,
        prompt: String,
        cancel: CancellationToken,
    ) -> (
        mpsc::Receiver<AgentEvent>,
        tokio::task::JoinHandle<(History, Result<AgentResult>)>,
    ) {
        let (tx, rx) = mpsc::channel(self.config.event_buffer_size);
        let handle = tokio::spawn(async move {
            let result = self.execute(&mut history, &prompt, Some(tx), &cancel).await;
            (history, result)
        });
        (rx, handle)
    }

    async fn fail(
        &self,
        error: AgentError,
        history: &History,
        state: &RunState,
        turns: usize,
        event_tx: &Option<mpsc::Sender<AgentEvent>>,
        cancel: &CancellationToken,
    ) -> AgentFailure {
        tracing::warn!(code = error.code(), turns = turns, "Agent run failed: {}", error);
        emit(
            event_tx,
            cancel,
            AgentEvent::Error {
                code: error.code().to_string(),
                message: error.to_string(),
            },
        )
        .await;
        AgentFailure {
            error,
            history: history.entries().to_vec(),
            usage: state.usage,
            turns,
        }
    }

    async fn maybe_compact(
        &self,
        history: &mut History,
        state: &RunState,
        event_tx: &Option<mpsc::Sender<AgentEvent>>,
        cancel: &CancellationToken,
    ) {
        let (Some(threshold), Some(compactor), Some(input)) = (
            self.config.compaction_threshold,
            self.compactor.as_ref(),
            state.last_input_tokens,
        ) else {
            return;
        };
        if input < threshold {
            return;
        }

        match history.compact_with(compactor.as_ref(), &state.usage).await {
            Ok(before) => {
                emit(
                    event_tx,
                    cancel,
                    AgentEvent::Compacted {
                        before,
                        after: history.len(),
                    },
                )
                .await;
            }
            Err(e) => {
                tracing::warn!(input_tokens = input, "Compaction failed, continuing: {}", e);
            }
        }
    }

    async fn run_turn(
        &self,
        turn: usize,
        system_prompt: &str,
        history: &mut History,
        state: &mut RunState,
        event_tx: &Option<mpsc::Sender<AgentEvent>>,
        cancel: &CancellationToken,
    ) -> TurnOutcome {
        let request = ModelRequest {
            system_prompt: system_prompt.to_string(),
            history: history.entries().to_vec(),
            tools: self.tools.definitions(),
        };

        let llm_span = tracing::info_span!(
            "a3s.llm.completion",
            a3s.llm.prompt_tokens = tracing::field::Empty,
            a3s.llm.completion_tokens = tracing::field::Empty,
            a3s.llm.total_tokens = tracing::field::Empty,
        );
        let (raw_text, usage) = match self
            .stream_response(&request, event_tx, cancel)
            .instrument(llm_span)
            .await
        {
            Ok(response) => response,
            Err(error) => return TurnOutcome::Failed(error),
        };

        state.usage.accumulate(&usage);
        state.last_input_tokens = Some(usage.input_tokens);
        tracing::Span::current().record(crate::telemetry::ATTR_LLM_TOTAL_TOKENS, usage.total() as i64);

        let closings = parser::count_tool_closings(&raw_text);
        if closings > 1 {
            tracing::warn!(
                tool_calls = closings,
                "Response contained several tool calls; keeping the first"
            );
        }
        let text = parser::truncate_to_single_tool_use(&raw_text);
        let blocks = parser::parse(text);

        if let Some(ContentBlock::Text { content, .. }) = blocks.first() {
            if !content.is_empty() {
                history.push(HistoryEntry::assistant_text(content.clone()));
                state.last_text = content.clone();
                emit(
                    event_tx,
                    cancel,
                    AgentEvent::Text {
                        text: content.clone(),
                    },
                )
                .await;
            }
        }

        let tool_block = blocks.into_iter().find_map(|block| match block {
            ContentBlock::ToolUse {
                name,
                params,
                partial,
                ..
            } => Some((name, params, partial)),
            ContentBlock::Text { .. } => None,
        });

        let Some((name, params, partial)) = tool_block else {
            emit(event_tx, cancel, AgentEvent::TurnEnd { turn, usage }).await;
            return TurnOutcome::Finished;
        };

        let tool_use = ToolUse::new(name, params);
        history.push(HistoryEntry::Assistant {
            content: vec![tool_use.to_block()],
        });
        emit(
            event_tx,
            cancel,
            AgentEvent::ToolUse {
                tool_use: tool_use.clone(),
            },
        )
        .await;

        let (result, denied) = match self
            .dispatch(&tool_use, partial, event_tx, cancel)
            .await
        {
            Ok(Dispatched::Ran(result)) => (result, false),
            Ok(Dispatched::Denied(result)) => (result, true),
            Err(error) => return TurnOutcome::Failed(error),
        };

        history.push(result.to_history_entry());
        state.tool_results.push(result.clone());
        emit(
            event_tx,
            cancel,
            AgentEvent::ToolResult {
                result: result.clone(),
            },
        )
        .await;

        if denied {
            emit(event_tx, cancel, AgentEvent::TurnEnd { turn, usage }).await;
            return TurnOutcome::Failed(AgentError::ToolDenied {
                call_id: tool_use.call_id.clone(),
                tool_name: tool_use.name.clone(),
            });
        }
        if result.approved {
            state.tool_calls_count += 1;
        }

        emit(event_tx, cancel, AgentEvent::TurnEnd { turn, usage }).await;
        TurnOutcome::Continue
    }

    /// Consume one streamed response
    ///
    /// Returns the raw response text and this turn's usage.
    async fn stream_response(
        &self,
        request: &ModelRequest,
        event_tx: &Option<mpsc::Sender<AgentEvent>>,
        cancel: &CancellationToken,
    ) -> std::result::Result<(String, TokenUsage), AgentError> {
        let mut rx = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AgentError::Canceled),
            opened = self.transport.stream(request) => opened.map_err(AgentError::Api)?,
        };

        let mut visible = StreamingText::new();
        let mut usage = TokenUsage::default();

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AgentError::Canceled),
                event = rx.recv() => event,
            };

            match event {
                Some(StreamEvent::TextDelta { delta }) => {
                    if let Some(text) = visible.push(&delta) {
                        emit(event_tx, cancel, AgentEvent::TextDelta { text }).await;
                    }
                }
                Some(StreamEvent::Reasoning { delta }) => {
                    emit(event_tx, cancel, AgentEvent::ReasoningDelta { text: delta }).await;
                }
                Some(StreamEvent::Finish { usage: reported }) => {
                    usage = reported;
                    crate::telemetry::record_llm_usage(&usage);
                }
                Some(StreamEvent::Error { error }) => {
                    tracing::error!(
                        status = ?error.status,
                        code = error.code.as_deref().unwrap_or(""),
                        "Model stream failed: {}",
                        error.message
                    );
                    return Err(AgentError::Api(error));
                }
                None => break,
            }
        }

        if let Some(text) = visible.finish() {
            emit(event_tx, cancel, AgentEvent::TextDelta { text }).await;
        }

        Ok((visible.into_text(), usage))
    }

    /// Decide and run a tool call
    ///
    /// `Err` means the run must stop without a tool result (cancellation).
    async fn dispatch(
        &self,
        tool_use: &ToolUse,
        partial: bool,
        event_tx: &Option<mpsc::Sender<AgentEvent>>,
        cancel: &CancellationToken,
    ) -> std::result::Result<Dispatched, AgentError> {
        if let Some(problem) = malformed_reason(tool_use, partial) {
            tracing::warn!(
                call_id = tool_use.call_id.as_str(),
                "Malformed tool call: {}",
                problem
            );
            return Ok(Dispatched::Ran(error_result(
                tool_use,
                format!("Malformed tool call: {}", problem),
                false,
            )));
        }

        let Some(descriptor) = self.tools.descriptor(&tool_use.name) else {
            return Ok(Dispatched::Ran(error_result(
                tool_use,
                format!("Unknown tool: {}", tool_use.name),
                false,
            )));
        };

        let params = tool_use.params_value();
        match self.authorize(tool_use, &descriptor, &params, event_tx, cancel).await {
            Authorization::Approved(source) => {
                tracing::debug!(
                    call_id = tool_use.call_id.as_str(),
                    source = ?source,
                    "Tool call approved"
                );
            }
            Authorization::Denied { reason } => {
                tracing::info!(
                    call_id = tool_use.call_id.as_str(),
                    tool_name = tool_use.name.as_str(),
                    reason = reason.as_str(),
                    "Tool call denied"
                );
                return Ok(Dispatched::Denied(ToolUseResult {
                    tool_use: tool_use.clone(),
                    result: json!({
                        "success": false,
                        "content": DENIED_MESSAGE,
                        "denied": true,
                        "reason": reason,
                    }),
                    approved: false,
                    is_error: true,
                }));
            }
            Authorization::Canceled => return Err(AgentError::Canceled),
        }

        // Dispatched calls run to completion; cancellation is honored at the next turn
        let args_json = serde_json::to_string(&tool_use.params).unwrap_or_else(|_| "{}".to_string());
        let result = match self
            .tools
            .invoke(&tool_use.name, &args_json, &self.tool_context)
            .await
            .with_context(|| format!("Tool '{}' failed", tool_use.name))
        {
            Ok(value) => {
                let is_error = is_error_result(&value);
                ToolUseResult {
                    tool_use: tool_use.clone(),
                    result: value,
                    approved: true,
                    is_error,
                }
            }
            Err(e) => {
                tracing::warn!(call_id = tool_use.call_id.as_str(), "{:#}", e);
                error_result(tool_use, format!("{:#}", e), true)
            }
        };
        Ok(Dispatched::Ran(result))
    }

    async fn authorize(
        &self,
        tool_use: &ToolUse,
        descriptor: &ToolDescriptor,
        params: &Value,
        event_tx: &Option<mpsc::Sender<AgentEvent>>,
        cancel: &CancellationToken,
    ) -> Authorization {
        let tools = &self.tools;
        let decision = self.gate.check(descriptor, params, |mode| {
            tools.needs_approval(&tool_use.name, params, mode)
        });
        match decision {
            ApprovalDecision::Approved(source) => Authorization::Approved(source),
            ApprovalDecision::NeedsConfirmation => {
                // Registered before the event goes out so an immediate submit finds it
                let rx = match self.gate.request(&tool_use.call_id, descriptor, params) {
                    Ok(rx) => rx,
                    Err(e) => return ApprovalGate::rejected(e),
                };
                emit(
                    event_tx,
                    cancel,
                    AgentEvent::ApprovalRequired {
                        call_id: tool_use.call_id.clone(),
                        tool_name: tool_use.name.clone(),
                        params: params.clone(),
                        timeout_ms: self.gate.pending_timeout().as_millis() as u64,
                    },
                )
                .await;
                self.gate.wait_for(&tool_use.call_id, rx, cancel).await
            }
        }
    }
}

fn malformed_reason(tool_use: &ToolUse, partial: bool) -> Option<String> {
    if partial {
        return Some("the tool block was not closed with </use_tool>".to_string());
    }
    if tool_use.name.is_empty() {
        return Some("missing <tool_name>".to_string());
    }
    tool_use.parse_error().map(|e| match tool_use.params.get("_raw") {
        Some(Value::String(raw)) => format!("{} in arguments: {}", e, raw),
        _ => e.to_string(),
    })
}

fn error_result(tool_use: &ToolUse, message: String, approved: bool) -> ToolUseResult {
    ToolUseResult {
        tool_use: tool_use.clone(),
        result: json!({"success": false, "content": message}),
        approved,
        is_error: true,
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`AgentLoop`]
#[derive(Default)]
pub struct AgentLoopBuilder {
    transport: Option<Arc<dyn ModelTransport>>,
    tools: Option<Arc<dyn ToolExecutor>>,
    tool_context: Option<ToolContext>,
    gate: Option<Arc<ApprovalGate>>,
    compactor: Option<Arc<dyn Compactor>>,
    config: Option<AgentConfig>,
}

impl AgentLoopBuilder {
    pub fn transport(mut self, transport: Arc<dyn ModelTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn tools(mut self, tools: Arc<dyn ToolExecutor>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn tool_context(mut self, ctx: ToolContext) -> Self {
        self.tool_context = Some(ctx);
        self
    }

    /// Share an existing gate (and its memory) instead of creating one
    pub fn approval_gate(mut self, gate: Arc<ApprovalGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn compactor(mut self, compactor: Arc<dyn Compactor>) -> Self {
        self.compactor = Some(compactor);
        self
    }

    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn build(self) -> anyhow::Result<AgentLoop> {
        let transport = self.transport.context("transport is required")?;
        let tools = self.tools.context("tools is required")?;
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let gate = self
            .gate
            .unwrap_or_else(|| Arc::new(ApprovalGate::new(&config.approval)));

        Ok(AgentLoop {
            transport,
            tools,
            tool_context: self.tool_context.unwrap_or_default(),
            gate,
            compactor: self.compactor,
            config,
        })
    }
}
