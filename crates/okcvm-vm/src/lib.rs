//! Per-session conversation history and the tool-calling chat loop (spec
//! component D).
//!
//! Generalises `aigent-runtime::tool_loop::run_tool_loop` (the
//! `MAX_TOOL_ROUNDS`-bounded loop, parallel tool execution via
//! `futures::future::join_all`, streamed `BackendEvent`s) and
//! `aigent-runtime::history` (an append-only transcript) into the spec's
//! namespaced, replaceable, arena-style `HistoryEntry` model. Unlike the
//! teacher's single process-wide `DaemonState`, a `VirtualMachine` here is
//! one per session; the per-session serialization the teacher got for free
//! from its single `Mutex<DaemonState>` is reproduced with a dedicated
//! `tokio::sync::Mutex` held for the duration of one `respond` call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use okcvm_llm::{ChatDriver, ChatMessage};
use okcvm_tools::ToolRegistry;
use okcvm_workspace::WorkspaceManager;

/// Bounds tool-call → result → re-prompt iterations before the model is
/// forced to produce a final text answer.
const MAX_TOOL_ROUNDS: usize = 5;
/// `meta.summary` is truncated to this many bytes (§9 open-question decision).
const SUMMARY_MAX_BYTES: usize = 160;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryRole {
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvocationStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub invocation_id: String,
    pub tool_name: String,
    pub input: Value,
    pub output: Option<String>,
    pub error: Option<String>,
    pub status: InvocationStatus,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub step_index: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    pub role: HistoryRole,
    pub content: String,
    #[serde(default)]
    pub tool_invocations: Vec<ToolInvocation>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMeta {
    pub model: String,
    pub timestamp: DateTime<Utc>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub latency_ms: u64,
    pub summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurnResult {
    pub reply: String,
    pub meta: ChatMeta,
    pub tool_calls: Vec<ToolInvocation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmInfo {
    pub system_prompt: String,
    pub tools: Vec<okcvm_tools::ToolSpec>,
    pub history_length: usize,
    pub workspace_id: String,
    pub workspace_mount: String,
    pub workspace_output: String,
    pub history_namespace: String,
}

/// Streaming event emitted during a `respond` call, forwarded to the
/// Streaming Bridge (§4.G) over whatever channel it was given.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VmEvent {
    Token { delta: String },
    ToolStarted { invocation_id: String, tool_name: String, input: Value },
    ToolCompleted { invocation_id: String, status: InvocationStatus, duration_ms: u64, output: Option<String>, error: Option<String> },
}

struct VmState {
    entries: Vec<HistoryEntry>,
    next_seq: u32,
}

fn append_entry(state: &mut VmState, namespace: &str, role: HistoryRole, content: String, tool_invocations: Vec<ToolInvocation>) -> HistoryEntry {
    state.next_seq += 1;
    let entry = HistoryEntry {
        id: format!("{namespace}-{:04}", state.next_seq),
        role,
        content,
        tool_invocations,
        timestamp: Utc::now(),
    };
    state.entries.push(entry.clone());
    entry
}

/// Builds the ephemeral per-turn message list the driver sees from the
/// persisted transcript. Tool-role entries are not replayed — their
/// function-call/result exchange was already resolved into the assistant
/// reply that followed them, and replaying orphaned tool messages without
/// a live `tool_call_id` would confuse (or be rejected by) the driver.
fn entry_to_chat_message(entry: &HistoryEntry) -> Option<ChatMessage> {
    match entry.role {
        HistoryRole::User => Some(ChatMessage::user(entry.content.clone())),
        HistoryRole::Assistant => Some(ChatMessage::assistant(entry.content.clone())),
        HistoryRole::Tool => None,
    }
}

/// Owns one session's conversation history and drives its tool-calling
/// chat turns against a bound [`ChatDriver`] and [`ToolRegistry`].
pub struct VirtualMachine {
    namespace: String,
    system_prompt: String,
    driver: Arc<dyn ChatDriver>,
    registry: Arc<ToolRegistry>,
    tool_timeout: Duration,
    state: Mutex<VmState>,
}

impl VirtualMachine {
    pub fn new(namespace: impl Into<String>, system_prompt: impl Into<String>, driver: Arc<dyn ChatDriver>, registry: Arc<ToolRegistry>, tool_timeout: Duration) -> Self {
        Self {
            namespace: namespace.into(),
            system_prompt: system_prompt.into(),
            driver,
            registry,
            tool_timeout,
            state: Mutex::new(VmState { entries: Vec::new(), next_seq: 0 }),
        }
    }

    pub async fn append_user(&self, text: &str) -> HistoryEntry {
        let mut state = self.state.lock().await;
        append_entry(&mut state, &self.namespace, HistoryRole::User, text.to_string(), vec![])
    }

    pub async fn append_assistant(&self, text: &str, tool_invocations: Vec<ToolInvocation>) -> HistoryEntry {
        let mut state = self.state.lock().await;
        append_entry(&mut state, &self.namespace, HistoryRole::Assistant, text.to_string(), tool_invocations)
    }

    pub async fn append_tool(&self, invocation: ToolInvocation) -> HistoryEntry {
        let mut state = self.state.lock().await;
        let content = invocation.output.clone().unwrap_or_else(|| invocation.error.clone().unwrap_or_default());
        append_entry(&mut state, &self.namespace, HistoryRole::Tool, content, vec![invocation])
    }

    pub async fn get_history(&self, id: &str) -> Option<HistoryEntry> {
        let state = self.state.lock().await;
        state.entries.iter().find(|e| e.id == id).cloned()
    }

    pub async fn recent_history(&self, n: usize) -> Vec<HistoryEntry> {
        let state = self.state.lock().await;
        let start = state.entries.len().saturating_sub(n);
        state.entries[start..].to_vec()
    }

    pub async fn history_length(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn clear_history(&self) {
        let mut state = self.state.lock().await;
        state.entries.clear();
        state.next_seq = 0;
    }

    pub async fn describe(&self, workspace: &WorkspaceManager) -> VmInfo {
        let state = self.state.lock().await;
        let paths = workspace.paths();
        VmInfo {
            system_prompt: self.system_prompt.clone(),
            tools: self.registry.list(),
            history_length: state.entries.len(),
            workspace_id: paths.session_id.clone(),
            workspace_mount: paths.mount.clone(),
            workspace_output: paths.output.clone(),
            history_namespace: self.namespace.clone(),
        }
    }

    /// Drives one chat turn to completion: optionally replaces the last
    /// user/assistant pair, appends the new user turn, runs the bounded
    /// tool-calling loop against the driver, and records the final
    /// assistant entry with every tool invocation attached.
    ///
    /// Holds the state lock for the entire call, which is what gives the
    /// VM its "one `Respond` in flight per session, FIFO" guarantee (§4.D,
    /// §5) — a second concurrent call simply waits for the lock.
    pub async fn respond(
        &self,
        message: &str,
        replace_last: bool,
        workspace: Option<&WorkspaceManager>,
        on_event: Option<mpsc::Sender<VmEvent>>,
    ) -> anyhow::Result<ChatTurnResult> {
        let started = Instant::now();
        let mut state = self.state.lock().await;

        if replace_last {
            if matches!(state.entries.last().map(|e| e.role), Some(HistoryRole::Assistant)) {
                state.entries.pop();
            }
            if matches!(state.entries.last().map(|e| e.role), Some(HistoryRole::User)) {
                state.entries.pop();
            }
        }

        append_entry(&mut state, &self.namespace, HistoryRole::User, message.to_string(), vec![]);

        let mut llm_messages: Vec<ChatMessage> = state.entries.iter().filter_map(entry_to_chat_message).collect();

        let tools_json = self.registry.as_llm_tools();
        let has_tools = matches!(&tools_json, Value::Array(arr) if !arr.is_empty());

        let mut all_invocations: Vec<ToolInvocation> = Vec::new();
        let mut final_content = String::new();
        let mut last_model = String::new();
        let mut step_index = 0usize;
        // Set once the SSE sink closes (client disconnected). Checked at the
        // top of each round — the next safe point — so in-flight tool calls
        // still finish and get persisted, but no new round is started (§5
        // cancellation).
        let cancelled = Arc::new(AtomicBool::new(false));

        for round in 0..MAX_TOOL_ROUNDS {
            if cancelled.load(Ordering::Relaxed) {
                info!(namespace = %self.namespace, round, "sse sink closed, stopping before issuing further tool calls");
                break;
            }

            let effective_tools = if has_tools && round < MAX_TOOL_ROUNDS - 1 {
                Some(&tools_json)
            } else {
                if round == MAX_TOOL_ROUNDS - 1 {
                    warn!(namespace = %self.namespace, "tool loop hit max rounds, forcing text response");
                }
                None
            };

            let (token_tx, mut token_rx) = mpsc::channel::<String>(64);
            let forward_sink = on_event.clone();
            let forward_cancelled = Arc::clone(&cancelled);
            let forward = tokio::spawn(async move {
                while let Some(delta) = token_rx.recv().await {
                    if let Some(sink) = &forward_sink {
                        if sink.send(VmEvent::Token { delta }).await.is_err() {
                            forward_cancelled.store(true, Ordering::Relaxed);
                        }
                    }
                }
            });

            let response = self.driver.chat(&self.system_prompt, &llm_messages, effective_tools, Some(token_tx)).await?;
            let _ = forward.await;
            last_model = response.model.clone();

            if response.tool_calls.is_empty() {
                final_content = response.content;
                break;
            }

            info!(namespace = %self.namespace, round, count = response.tool_calls.len(), "model requested tool calls");

            llm_messages.push(ChatMessage::assistant_tool_calls(response.tool_calls.clone()));

            for call in &response.tool_calls {
                if let Some(sink) = &on_event {
                    let sent = sink
                        .send(VmEvent::ToolStarted { invocation_id: call.id.clone(), tool_name: call.name.clone(), input: call.arguments.clone() })
                        .await;
                    if sent.is_err() {
                        cancelled.store(true, Ordering::Relaxed);
                    }
                }
            }

            let futs = response.tool_calls.iter().map(|call| {
                let registry = Arc::clone(&self.registry);
                let name = call.name.clone();
                let input = call.arguments.clone();
                let id = call.id.clone();
                let timeout = self.tool_timeout;
                let started_at = Utc::now();
                let step = step_index;
                async move {
                    let outcome = tokio::time::timeout(timeout, registry.call(&name, input.clone(), workspace)).await;
                    let duration_ms = (Utc::now() - started_at).num_milliseconds().max(0) as u64;
                    match outcome {
                        Ok(Ok(output)) => ToolInvocation {
                            invocation_id: id,
                            tool_name: name,
                            input,
                            output: Some(output.output),
                            error: None,
                            status: if output.success { InvocationStatus::Success } else { InvocationStatus::Error },
                            started_at,
                            duration_ms,
                            step_index: step,
                        },
                        Ok(Err(e)) => ToolInvocation {
                            invocation_id: id,
                            tool_name: name,
                            input,
                            output: None,
                            error: Some(e.to_string()),
                            status: InvocationStatus::Error,
                            started_at,
                            duration_ms,
                            step_index: step,
                        },
                        Err(_) => ToolInvocation {
                            invocation_id: id,
                            tool_name: name,
                            input,
                            output: None,
                            error: Some(format!("tool execution timed out after {}s", timeout.as_secs())),
                            status: InvocationStatus::Error,
                            started_at,
                            duration_ms,
                            step_index: step,
                        },
                    }
                }
            });

            let executions: Vec<ToolInvocation> = futures::future::join_all(futs).await;
            step_index += 1;

            for invocation in &executions {
                if let Some(sink) = &on_event {
                    let sent = sink
                        .send(VmEvent::ToolCompleted {
                            invocation_id: invocation.invocation_id.clone(),
                            status: invocation.status,
                            duration_ms: invocation.duration_ms,
                            output: invocation.output.clone(),
                            error: invocation.error.clone(),
                        })
                        .await;
                    if sent.is_err() {
                        cancelled.store(true, Ordering::Relaxed);
                    }
                }
                let result_text = invocation.output.clone().unwrap_or_else(|| invocation.error.clone().unwrap_or_default());
                llm_messages.push(ChatMessage::tool_result(invocation.invocation_id.clone(), result_text));
            }

            all_invocations.extend(executions);
        }

        if final_content.is_empty() && !all_invocations.is_empty() {
            final_content = all_invocations
                .iter()
                .map(|inv| {
                    let text = inv.output.as_deref().or(inv.error.as_deref()).unwrap_or_default();
                    let end = text.len().min(500);
                    format!("[{}]: {}", inv.tool_name, &text[..end])
                })
                .collect::<Vec<_>>()
                .join("\n\n");
        }

        append_entry(&mut state, &self.namespace, HistoryRole::Assistant, final_content.clone(), all_invocations.clone());
        drop(state);

        let summary = last_successful_summary(&all_invocations);

        Ok(ChatTurnResult {
            reply: final_content,
            meta: ChatMeta {
                model: last_model,
                timestamp: Utc::now(),
                prompt_tokens: 0,
                completion_tokens: 0,
                latency_ms: started.elapsed().as_millis() as u64,
                summary,
            },
            tool_calls: all_invocations,
        })
    }
}

fn last_successful_summary(invocations: &[ToolInvocation]) -> String {
    let Some(last_ok) = invocations.iter().rev().find(|i| i.status == InvocationStatus::Success) else {
        return String::new();
    };
    let Some(output) = &last_ok.output else {
        return String::new();
    };
    let mut end = output.len().min(SUMMARY_MAX_BYTES);
    while end > 0 && !output.is_char_boundary(end) {
        end -= 1;
    }
    output[..end].trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use okcvm_llm::ChatResponse;

    struct EchoDriver;

    #[async_trait]
    impl ChatDriver for EchoDriver {
        async fn chat(&self, _system_prompt: &str, messages: &[ChatMessage], _tools: Option<&Value>, on_token: Option<mpsc::Sender<String>>) -> anyhow::Result<ChatResponse> {
            let last_user = messages.iter().rev().find_map(|m| m.content.clone()).unwrap_or_default();
            let reply = format!("echo: {last_user}");
            if let Some(tx) = on_token {
                let _ = tx.send(reply.clone()).await;
            }
            Ok(ChatResponse { model: "echo-model".to_string(), content: reply, tool_calls: vec![], finish_reason: "stop".to_string() })
        }
    }

    fn vm() -> VirtualMachine {
        VirtualMachine::new("sess1234", "system prompt", Arc::new(EchoDriver), Arc::new(ToolRegistry::new()), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn respond_appends_user_and_assistant_entries() {
        let vm = vm();
        let result = vm.respond("hello", false, None, None).await.unwrap();
        assert_eq!(result.reply, "echo: hello");
        assert_eq!(vm.history_length().await, 2);
    }

    #[tokio::test]
    async fn history_ids_are_namespaced_and_monotone() {
        let vm = vm();
        vm.respond("first", false, None, None).await.unwrap();
        vm.respond("second", false, None, None).await.unwrap();
        let history = vm.recent_history(10).await;
        assert_eq!(history[0].id, "sess1234-0001");
        assert_eq!(history[1].id, "sess1234-0002");
        assert_eq!(history[2].id, "sess1234-0003");
        assert_eq!(history[3].id, "sess1234-0004");
    }

    #[tokio::test]
    async fn replace_last_drops_prior_user_and_assistant_pair() {
        let vm = vm();
        vm.respond("first", false, None, None).await.unwrap();
        vm.respond("second", true, None, None).await.unwrap();
        assert_eq!(vm.history_length().await, 2);
        let history = vm.recent_history(10).await;
        assert_eq!(history[0].content, "second");
    }

    #[tokio::test]
    async fn clear_history_resets_sequence() {
        let vm = vm();
        vm.respond("first", false, None, None).await.unwrap();
        vm.clear_history().await;
        assert_eq!(vm.history_length().await, 0);
        vm.respond("again", false, None, None).await.unwrap();
        let history = vm.recent_history(10).await;
        assert_eq!(history[0].id, "sess1234-0001");
    }

    #[test]
    fn summary_is_empty_when_no_tool_ran() {
        assert_eq!(last_successful_summary(&[]), "");
    }

    struct AlwaysCallsTool;

    #[async_trait]
    impl ChatDriver for AlwaysCallsTool {
        async fn chat(&self, _system_prompt: &str, _messages: &[ChatMessage], _tools: Option<&Value>, _on_token: Option<mpsc::Sender<String>>) -> anyhow::Result<ChatResponse> {
            Ok(ChatResponse {
                model: "echo-model".to_string(),
                content: String::new(),
                tool_calls: vec![okcvm_llm::ToolCall { id: "call_1".to_string(), name: "noop".to_string(), arguments: Value::Null }],
                finish_reason: "tool_calls".to_string(),
            })
        }
    }

    struct NoopTool;

    #[async_trait]
    impl okcvm_tools::Tool for NoopTool {
        fn spec(&self) -> okcvm_tools::ToolSpec {
            okcvm_tools::ToolSpec { name: "noop".to_string(), description: "does nothing".to_string(), input_schema: Value::Object(Default::default()), requires_workspace: false }
        }
        async fn invoke(&self, _input: Value, _workspace: Option<&WorkspaceManager>) -> anyhow::Result<okcvm_tools::ToolOutput> {
            Ok(okcvm_tools::ToolOutput { success: true, output: "done".to_string() })
        }
    }

    #[tokio::test]
    async fn respond_stops_issuing_rounds_once_sink_closes() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(NoopTool));
        let vm = VirtualMachine::new("sess1234", "system prompt", Arc::new(AlwaysCallsTool), Arc::new(registry), Duration::from_secs(5));

        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let result = vm.respond("hello", false, None, Some(tx)).await.unwrap();
        // The model always requests a tool call, so an uncancelled loop would
        // run all MAX_TOOL_ROUNDS rounds. The sink was already closed before
        // the first send, so the loop should stop after the first round.
        assert_eq!(result.tool_calls.len(), 1);
    }

    #[test]
    fn summary_truncates_long_output_at_utf8_boundary() {
        let invocation = ToolInvocation {
            invocation_id: "call_1".to_string(),
            tool_name: "read_file".to_string(),
            input: Value::Null,
            output: Some("x".repeat(300)),
            error: None,
            status: InvocationStatus::Success,
            started_at: Utc::now(),
            duration_ms: 1,
            step_index: 0,
        };
        let summary = last_successful_summary(&[invocation]);
        assert_eq!(summary.len(), SUMMARY_MAX_BYTES);
    }
}
