//! Agent loop integration tests
//!
//! End-to-end runs against a scripted transport and real registry tools.
//! Covers tag suppression while streaming, the one-call-per-turn rule,
//! approval memory across turns, turn budget, cancellation, and compaction.

use a3s_agent_loop::approval::ApprovalEvent;
use a3s_agent_loop::{
    AgentConfig, AgentEvent, AgentLoop, ApprovalMode, Compactor, ContentBlock, History,
    HistoryEntry, ModelRequest, ModelTransport, Remember, StreamEvent, TokenUsage, Tool,
    ToolCategory, ToolContext, ToolOutput, ToolRegistry, TransportError,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

// ─── Fixtures ────────────────────────────────────────────────────

/// Replays scripted responses; the last one repeats forever
struct ScriptedTransport {
    script: Mutex<Vec<Vec<StreamEvent>>>,
    calls: AtomicUsize,
}

impl ScriptedTransport {
    fn new(script: Vec<Vec<StreamEvent>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            calls: AtomicUsize::new(0),
        })
    }

    /// One response per string, each streamed in `chunk`-sized pieces
    fn chunked(responses: &[String], chunk: usize) -> Arc<Self> {
        Self::new(
            responses
                .iter()
                .map(|text| {
                    let chars: Vec<char> = text.chars().collect();
                    let mut events: Vec<StreamEvent> = chars
                        .chunks(chunk)
                        .map(|c| StreamEvent::text(c.iter().collect::<String>()))
                        .collect();
                    events.push(StreamEvent::Finish {
                        usage: TokenUsage::new(100, 20),
                    });
                    events
                })
                .collect(),
        )
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelTransport for ScriptedTransport {
    async fn stream(
        &self,
        _request: &ModelRequest,
    ) -> Result<mpsc::Receiver<StreamEvent>, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let events = {
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                script.remove(0)
            } else {
                script.first().cloned().unwrap_or_default()
            }
        };
        let (tx, rx) = mpsc::channel(events.len().max(1));
        for event in events {
            tx.try_send(event).unwrap();
        }
        Ok(rx)
    }
}

/// Sends one delta, then never finishes
struct StallingTransport {
    held: Mutex<Vec<mpsc::Sender<StreamEvent>>>,
}

#[async_trait]
impl ModelTransport for StallingTransport {
    async fn stream(
        &self,
        _request: &ModelRequest,
    ) -> Result<mpsc::Receiver<StreamEvent>, TransportError> {
        let (tx, rx) = mpsc::channel(4);
        tx.try_send(StreamEvent::text("Thinking about")).unwrap();
        self.held.lock().unwrap().push(tx);
        Ok(rx)
    }
}

/// Write-category tool that records every path it was called with
struct WriteTool {
    seen: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Tool for WriteTool {
    fn name(&self) -> &str {
        "write"
    }

    fn description(&self) -> &str {
        "Write a file"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"path": {"type": "string"}, "content": {"type": "string"}},
            "required": ["path"]
        })
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Write
    }

    async fn execute(&self, args: &Value, _ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let path = args["path"].as_str().unwrap_or_default().to_string();
        self.seen.lock().unwrap().push(path.clone());
        if path == "readonly.txt" {
            return Ok(ToolOutput::error("permission denied"));
        }
        if path == "crash.txt" {
            anyhow::bail!("disk on fire");
        }
        Ok(ToolOutput::success(format!("wrote {}", path)))
    }
}

struct NoopTool;

#[async_trait]
impl Tool for NoopTool {
    fn name(&self) -> &str {
        "noop"
    }

    fn description(&self) -> &str {
        "Does nothing"
    }

    fn parameters(&self) -> Value {
        json!({"type": "object"})
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Read
    }

    async fn execute(&self, _args: &Value, _ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        Ok(ToolOutput::success("ok"))
    }
}

struct SummaryCompactor {
    calls: AtomicUsize,
}

#[async_trait]
impl Compactor for SummaryCompactor {
    async fn compact(
        &self,
        _entries: &[HistoryEntry],
        _usage: &TokenUsage,
    ) -> anyhow::Result<Vec<HistoryEntry>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![HistoryEntry::user("[conversation summary]")])
    }
}

fn call(name: &str, args: Value) -> String {
    format!(
        "<use_tool>\n  <tool_name>{}</tool_name>\n  <arguments>\n    {}\n  </arguments>\n</use_tool>",
        name, args
    )
}

fn registry(seen: &Arc<Mutex<Vec<String>>>) -> Arc<ToolRegistry> {
    Arc::new(
        ToolRegistry::new()
            .with_tool(Arc::new(WriteTool { seen: seen.clone() }))
            .with_tool(Arc::new(NoopTool)),
    )
}

fn agent(transport: Arc<dyn ModelTransport>, seen: &Arc<Mutex<Vec<String>>>, config: AgentConfig) -> AgentLoop {
    AgentLoop::builder()
        .transport(transport)
        .tools(registry(seen))
        .config(config)
        .build()
        .unwrap()
}

fn drain(rx: &mut mpsc::Receiver<AgentEvent>) -> Vec<AgentEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Answer every escalation with the given decision
fn auto_answer(
    agent: &AgentLoop,
    approved: bool,
    remember: Remember,
) -> (Arc<AtomicUsize>, tokio::task::JoinHandle<()>) {
    let gate = agent.gate().clone();
    let mut events = gate.subscribe();
    let count = Arc::new(AtomicUsize::new(0));
    let counter = count.clone();
    let handle = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let ApprovalEvent::Required { call_id, .. } = event {
                counter.fetch_add(1, Ordering::SeqCst);
                gate.submit(&call_id, approved, remember);
            }
        }
    });
    (count, handle)
}

// ─── Streaming & Parsing ─────────────────────────────────────────

#[tokio::test]
async fn test_char_by_char_stream_never_leaks_tags() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let response = format!(
        "I'll create the file now. {}",
        call("noop", json!({}))
    );
    let transport = ScriptedTransport::chunked(&[response, "All done.".to_string()], 1);
    let agent = agent(transport, &seen, AgentConfig::default());
    let (tx, mut rx) = mpsc::channel(10_000);

    assert_ok!(
        agent
            .execute(&mut History::new(), "go", Some(tx), &CancellationToken::new())
            .await
    );

    let deltas: Vec<String> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            AgentEvent::TextDelta { text } => Some(text),
            _ => None,
        })
        .collect();
    for delta in &deltas {
        assert!(!delta.contains('<'), "leaked tag fragment in {:?}", delta);
    }
    assert_eq!(deltas.concat(), "I'll create the file now.All done.");
}

#[tokio::test]
async fn test_two_tool_calls_keep_only_the_first() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let response = format!(
        "{}\n{}",
        call("write", json!({"path": "one.txt"})),
        call("write", json!({"path": "two.txt"}))
    );
    let transport = ScriptedTransport::chunked(&[response, "Finished.".to_string()], 7);
    let mut config = AgentConfig::default();
    config.approval.mode = ApprovalMode::AutoEdit;
    let agent = agent(transport, &seen, config);
    let mut history = History::new();

    let result = agent
        .execute(&mut history, "write both", None, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(*seen.lock().unwrap(), vec!["one.txt"]);
    assert_eq!(result.tool_calls_count, 1);

    let tool_blocks: Vec<&ContentBlock> = history
        .entries()
        .iter()
        .filter_map(|e| match e {
            HistoryEntry::Assistant { content } => Some(content.iter()),
            _ => None,
        })
        .flatten()
        .filter(|b| b.is_tool_use())
        .collect();
    assert_eq!(tool_blocks.len(), 1);
}

#[tokio::test]
async fn test_repaired_arguments_are_executed() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let response =
        "<use_tool><tool_name>write</tool_name><arguments>{\"path\":\"fixed.txt\",}</arguments></use_tool>"
            .to_string();
    let transport = ScriptedTransport::chunked(&[response, "ok".to_string()], 3);
    let agent = agent(transport, &seen, AgentConfig {
        approval: a3s_agent_loop::ApprovalConfig {
            mode: ApprovalMode::Yolo,
            ..Default::default()
        },
        ..Default::default()
    });

    assert_ok!(
        agent
            .execute(&mut History::new(), "go", None, &CancellationToken::new())
            .await
    );
    assert_eq!(*seen.lock().unwrap(), vec!["fixed.txt"]);
}

#[tokio::test]
async fn test_reasoning_is_forwarded_verbatim() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let transport = ScriptedTransport::new(vec![vec![
        StreamEvent::reasoning("consider <use_tool> syntax"),
        StreamEvent::text("Answer."),
        StreamEvent::Finish {
            usage: TokenUsage::new(5, 1),
        },
    ]]);
    let agent = agent(transport, &seen, AgentConfig::default());
    let (tx, mut rx) = mpsc::channel(100);
    let mut history = History::new();

    let result = agent
        .execute(&mut history, "q", Some(tx), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.text, "Answer.");
    assert!(drain(&mut rx).contains(&AgentEvent::ReasoningDelta {
        text: "consider <use_tool> syntax".to_string()
    }));
    assert_eq!(history.len(), 2);
}

#[tokio::test]
async fn test_unterminated_tool_block_is_reported_to_model() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let cut_off = "<use_tool><tool_name>write</tool_name><arguments>{\"path\": \"a".to_string();
    let transport = ScriptedTransport::chunked(&[cut_off, "Let me retry.".to_string()], 5);
    let agent = agent(transport, &seen, AgentConfig::default());

    let result = agent
        .execute(&mut History::new(), "go", None, &CancellationToken::new())
        .await
        .unwrap();
    assert!(seen.lock().unwrap().is_empty());
    assert!(result.tool_results[0].is_error);
    assert!(result.tool_results[0]
        .content()
        .contains("not closed with </use_tool>"));
    assert_eq!(result.text, "Let me retry.");
}

// ─── Tool Results ────────────────────────────────────────────────

#[tokio::test]
async fn test_tool_errors_do_not_abort_the_session() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let transport = ScriptedTransport::chunked(
        &[
            call("write", json!({"path": "readonly.txt"})),
            call("write", json!({"path": "crash.txt"})),
            call("write", json!({"content": "no path"})),
            "Giving up.".to_string(),
        ],
        16,
    );
    let mut config = AgentConfig::default();
    config.approval.mode = ApprovalMode::AutoEdit;
    let agent = agent(transport, &seen, config);

    let result = agent
        .execute(&mut History::new(), "go", None, &CancellationToken::new())
        .await
        .unwrap();

    let contents: Vec<String> = result.tool_results.iter().map(|r| r.content()).collect();
    assert!(result.tool_results.iter().all(|r| r.is_error));
    assert_eq!(contents[0], "permission denied");
    assert!(contents[1].contains("disk on fire"));
    assert!(contents[2].contains("missing required parameter 'path'"));
    assert_eq!(result.text, "Giving up.");
}

// ─── Approval ────────────────────────────────────────────────────

#[tokio::test]
async fn test_always_tool_approval_covers_new_params() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let transport = ScriptedTransport::chunked(
        &[
            call("write", json!({"path": "a.txt"})),
            call("write", json!({"path": "b.txt"})),
            "done".to_string(),
        ],
        32,
    );
    let agent = agent(transport, &seen, AgentConfig::default());
    let (escalations, responder) = auto_answer(&agent, true, Remember::AlwaysTool);

    assert_ok!(
        agent
            .execute(&mut History::new(), "go", None, &CancellationToken::new())
            .await
    );
    assert_eq!(*seen.lock().unwrap(), vec!["a.txt", "b.txt"]);
    assert_eq!(escalations.load(Ordering::SeqCst), 1);
    responder.abort();
}

#[tokio::test]
async fn test_once_approval_escalates_again() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let same = call("write", json!({"path": "a.txt"}));
    let transport =
        ScriptedTransport::chunked(&[same.clone(), same, "done".to_string()], 32);
    let agent = agent(transport, &seen, AgentConfig::default());
    let (escalations, responder) = auto_answer(&agent, true, Remember::Once);

    assert_ok!(
        agent
            .execute(&mut History::new(), "go", None, &CancellationToken::new())
            .await
    );
    assert_eq!(escalations.load(Ordering::SeqCst), 2);
    responder.abort();
}

#[tokio::test]
async fn test_denial_records_exactly_one_result() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let transport = ScriptedTransport::chunked(
        &[call("write", json!({"path": "x"})), "unreachable".to_string()],
        8,
    );
    let agent = agent(transport.clone(), &seen, AgentConfig::default());
    let (_, responder) = auto_answer(&agent, false, Remember::Once);
    let (tx, mut rx) = mpsc::channel(1000);

    let failure = assert_err!(
        agent
            .execute(&mut History::new(), "go", Some(tx), &CancellationToken::new())
            .await
    );
    assert_eq!(failure.code(), "tool_denied");
    assert_eq!(transport.calls(), 1);
    assert_eq!(
        failure.history.iter().filter(|e| e.is_tool_result()).count(),
        1
    );

    let events = drain(&mut rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, AgentEvent::ApprovalRequired { tool_name, .. } if tool_name == "write")));
    assert!(matches!(
        events.last(),
        Some(AgentEvent::Error { code, .. }) if code == "tool_denied"
    ));
    responder.abort();
}

#[tokio::test]
async fn test_pre_approved_call_skips_escalation() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let transport = ScriptedTransport::chunked(
        &[call("write", json!({"path": "a.txt"})), "done".to_string()],
        32,
    );
    let agent = agent(transport, &seen, AgentConfig::default());
    agent
        .gate()
        .pre_approve("write", &json!({"path": "a.txt"}), Remember::Always);

    assert_ok!(
        agent
            .execute(&mut History::new(), "go", None, &CancellationToken::new())
            .await
    );
    assert_eq!(*seen.lock().unwrap(), vec!["a.txt"]);
    assert_eq!(agent.gate().pending_count(), 0);
}

// ─── Termination ─────────────────────────────────────────────────

#[tokio::test]
async fn test_turn_budget_is_exact() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let transport = ScriptedTransport::chunked(&[call("noop", json!({}))], 64);
    let config = AgentConfig {
        max_turns: 4,
        ..Default::default()
    };
    let agent = agent(transport.clone(), &seen, config);

    let failure = assert_err!(
        agent
            .execute(&mut History::new(), "loop forever", None, &CancellationToken::new())
            .await
    );
    assert_eq!(failure.code(), "max_turns_exceeded");
    assert_eq!(failure.turns, 5);
    assert_eq!(transport.calls(), 4);
    assert_eq!(failure.usage, TokenUsage::new(400, 80));
    assert_eq!(
        failure.history.iter().filter(|e| e.is_tool_result()).count(),
        4
    );
}

#[tokio::test]
async fn test_cancel_mid_stream_leaves_no_turn_entry() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let transport = Arc::new(StallingTransport {
        held: Mutex::new(Vec::new()),
    });
    let agent = agent(transport, &seen, AgentConfig::default());
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let mut history = History::new();
    let failure = assert_err!(agent.execute(&mut history, "go", None, &cancel).await);
    assert_eq!(failure.code(), "canceled");
    assert_eq!(history.entries(), &[HistoryEntry::user("go")]);
}

#[tokio::test]
async fn test_cancel_while_awaiting_approval() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let transport = ScriptedTransport::chunked(&[call("write", json!({"path": "x"}))], 32);
    let agent = agent(transport, &seen, AgentConfig::default());
    let cancel = CancellationToken::new();

    let mut approvals = agent.gate().subscribe();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if let Ok(ApprovalEvent::Required { .. }) = approvals.recv().await {
            trigger.cancel();
        }
    });

    let mut history = History::new();
    let failure = assert_err!(agent.execute(&mut history, "go", None, &cancel).await);
    assert_eq!(failure.code(), "canceled");
    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(agent.gate().pending_count(), 0);
    assert!(!history.entries().iter().any(HistoryEntry::is_tool_result));
}

#[tokio::test]
async fn test_transport_failure_to_open() {
    struct Down;

    #[async_trait]
    impl ModelTransport for Down {
        async fn stream(
            &self,
            _request: &ModelRequest,
        ) -> Result<mpsc::Receiver<StreamEvent>, TransportError> {
            Err(TransportError::new("unauthorized")
                .with_status(401)
                .with_code("authentication_error"))
        }
    }

    let seen = Arc::new(Mutex::new(Vec::new()));
    let agent = agent(Arc::new(Down), &seen, AgentConfig::default());
    let failure = assert_err!(
        agent
            .execute(&mut History::new(), "go", None, &CancellationToken::new())
            .await
    );
    assert_eq!(failure.code(), "api_error");
    match failure.error {
        a3s_agent_loop::AgentError::Api(e) => {
            assert_eq!(e.status, Some(401));
            assert_eq!(e.code.as_deref(), Some("authentication_error"));
        }
        other => panic!("unexpected {:?}", other),
    }
}

// ─── Compaction & Background Runs ────────────────────────────────

#[tokio::test]
async fn test_compaction_runs_when_threshold_crossed() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let transport = ScriptedTransport::chunked(
        &[call("noop", json!({})), "after compaction".to_string()],
        64,
    );
    let compactor = Arc::new(SummaryCompactor {
        calls: AtomicUsize::new(0),
    });
    let agent = AgentLoop::builder()
        .transport(transport)
        .tools(registry(&seen))
        .compactor(compactor.clone())
        .config(AgentConfig {
            compaction_threshold: Some(50),
            ..Default::default()
        })
        .build()
        .unwrap();
    let (tx, mut rx) = mpsc::channel(1000);
    let mut history = History::new();

    let result = agent
        .execute(&mut history, "go", Some(tx), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.text, "after compaction");
    assert_eq!(compactor.calls.load(Ordering::SeqCst), 1);
    assert_eq!(history.entries()[0], HistoryEntry::user("[conversation summary]"));
    assert!(drain(&mut rx).contains(&AgentEvent::Compacted {
        before: 3,
        after: 1
    }));
}

#[tokio::test]
async fn test_spawned_run_streams_events_and_returns_history() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let transport = ScriptedTransport::chunked(&["Background answer.".to_string()], 4);
    let agent = Arc::new(agent(transport, &seen, AgentConfig::default()));

    let (mut rx, handle) = agent.spawn(History::new(), "hi".to_string(), CancellationToken::new());
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    let (history, result) = handle.await.unwrap();

    assert_eq!(result.unwrap().text, "Background answer.");
    assert_eq!(history.len(), 2);
    assert!(matches!(events.first(), Some(AgentEvent::Start { .. })));
    assert!(matches!(events.last(), Some(AgentEvent::End { .. })));
}
