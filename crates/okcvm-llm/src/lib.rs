//! Tool-calling chat driver contract and a concrete Ollama/OpenRouter binding
//! (§6.3, external collaborator).
//!
//! Generalises `aigent-llm`'s `ChatMessage`/`ToolCall`/`ChatResponse` types
//! and `LlmRouter` (native Ollama `/api/chat` + OpenRouter
//! `/chat/completions` tool calling) behind a [`ChatDriver`] trait any
//! tool-calling model can satisfy, so the virtual machine (component D)
//! never depends on a concrete provider.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: ChatRole::System, content: Some(content.into()), tool_calls: vec![], tool_call_id: None }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: Some(content.into()), tool_calls: vec![], tool_call_id: None }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: ChatRole::Assistant, content: Some(content.into()), tool_calls: vec![], tool_call_id: None }
    }
    pub fn assistant_tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        Self { role: ChatRole::Assistant, content: None, tool_calls, tool_call_id: None }
    }
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self { role: ChatRole::Tool, content: Some(content.into()), tool_calls: vec![], tool_call_id: Some(tool_call_id.into()) }
    }
}

/// A tool call requested by the model. `id` doubles as the spec's
/// `invocation_id` (§6.3) — the correlation key between this call and the
/// tool-result message that answers it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub model: String,
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: String,
}

/// Any tool-calling chat model satisfying this contract is swappable behind
/// the virtual machine. `on_token`, when given, receives non-empty token
/// deltas as they arrive; the final [`ChatResponse`] is always returned in
/// full regardless of whether streaming was requested.
#[async_trait]
pub trait ChatDriver: Send + Sync {
    async fn chat(
        &self,
        system_prompt: &str,
        messages: &[ChatMessage],
        tools: Option<&Value>,
        on_token: Option<mpsc::Sender<String>>,
    ) -> anyhow::Result<ChatResponse>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Provider {
    Ollama,
    OpenRouter,
}

/// Binds [`ChatDriver`] to Ollama or OpenRouter depending on `provider`,
/// generalising `aigent-llm::LlmRouter`'s provider dispatch.
pub struct LlmRouter {
    provider: Provider,
    model: String,
    api_key: Option<String>,
    base_url: Option<String>,
    client: reqwest::Client,
}

impl LlmRouter {
    pub fn new(provider: Provider, model: impl Into<String>, api_key: Option<String>, base_url: Option<String>) -> Self {
        Self { provider, model: model.into(), api_key, base_url, client: reqwest::Client::new() }
    }

    fn ollama_base_url(&self) -> String {
        self.base_url.clone().unwrap_or_else(|| "http://localhost:11434".to_string())
    }
}

#[async_trait]
impl ChatDriver for LlmRouter {
    async fn chat(
        &self,
        system_prompt: &str,
        messages: &[ChatMessage],
        tools: Option<&Value>,
        on_token: Option<mpsc::Sender<String>>,
    ) -> anyhow::Result<ChatResponse> {
        let mut full_messages = Vec::with_capacity(messages.len() + 1);
        full_messages.push(ChatMessage::system(system_prompt));
        full_messages.extend_from_slice(messages);

        match self.provider {
            Provider::Ollama => self.chat_ollama(&full_messages, tools, on_token).await,
            Provider::OpenRouter => self.chat_openrouter(&full_messages, tools, on_token).await,
        }
    }
}

impl LlmRouter {
    async fn chat_ollama(
        &self,
        messages: &[ChatMessage],
        tools: Option<&Value>,
        on_token: Option<mpsc::Sender<String>>,
    ) -> anyhow::Result<ChatResponse> {
        let endpoint = format!("{}/api/chat", self.ollama_base_url().trim_end_matches('/'));
        let stream = on_token.is_some();

        let mut payload = json!({
            "model": self.model,
            "messages": messages_to_ollama(messages),
            "stream": stream,
        });
        if let Some(tools) = tools {
            payload["tools"] = tools.clone();
        }

        let mut response = self.client.post(&endpoint).json(&payload).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body: Value = response.json().await.unwrap_or(Value::Null);
            anyhow::bail!("ollama error ({status}): {body}");
        }

        if !stream {
            let body: Value = response.json().await?;
            return Ok(parse_ollama_response(&self.model, &body));
        }

        let tx = on_token.unwrap();
        let mut content = String::new();
        let mut tool_calls = Vec::new();
        let mut finish_reason = "stop".to_string();

        while let Some(chunk) = response.chunk().await? {
            for line in String::from_utf8_lossy(&chunk).lines() {
                if line.trim().is_empty() {
                    continue;
                }
                let Ok(frame) = serde_json::from_str::<Value>(line) else { continue };
                if let Some(delta) = frame.get("message").and_then(|m| m.get("content")).and_then(Value::as_str) {
                    if !delta.is_empty() {
                        content.push_str(delta);
                        let _ = tx.send(delta.to_string()).await;
                    }
                }
                if frame.get("done").and_then(Value::as_bool).unwrap_or(false) {
                    if let Some(calls) = frame.get("message").and_then(|m| m.get("tool_calls")).and_then(Value::as_array) {
                        tool_calls = parse_tool_calls(calls);
                        if !tool_calls.is_empty() {
                            finish_reason = "tool_calls".to_string();
                        }
                    }
                }
            }
        }

        Ok(ChatResponse { model: self.model.clone(), content, tool_calls, finish_reason })
    }

    async fn chat_openrouter(
        &self,
        messages: &[ChatMessage],
        tools: Option<&Value>,
        on_token: Option<mpsc::Sender<String>>,
    ) -> anyhow::Result<ChatResponse> {
        let api_key = self
            .api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("OpenRouter API key missing"))?;

        let stream = on_token.is_some();
        let mut payload = json!({
            "model": self.model,
            "messages": messages_to_openai(messages),
            "stream": stream,
        });
        if let Some(tools) = tools {
            payload["tools"] = tools.clone();
        }

        let mut response = self
            .client
            .post("https://openrouter.ai/api/v1/chat/completions")
            .bearer_auth(api_key)
            .header("HTTP-Referer", "https://okcvm.local")
            .header("X-Title", "OK Computer VM")
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !stream {
            let body: Value = response.json().await?;
            if !status.is_success() {
                anyhow::bail!("openrouter error ({status}): {body}");
            }
            return Ok(parse_openai_response(&self.model, &body));
        }
        if !status.is_success() {
            let body: Value = response.json().await.unwrap_or(Value::Null);
            anyhow::bail!("openrouter error ({status}): {body}");
        }

        let tx = on_token.unwrap();
        let mut content = String::new();
        let mut tool_call_map: std::collections::HashMap<usize, (String, String, String)> = std::collections::HashMap::new();
        let mut finish_reason = "stop".to_string();

        while let Some(chunk) = response.chunk().await? {
            for line in String::from_utf8_lossy(&chunk).lines() {
                let line = line.trim();
                if line.is_empty() || line == "data: [DONE]" {
                    continue;
                }
                let Some(data) = line.strip_prefix("data: ") else { continue };
                let Ok(frame) = serde_json::from_str::<Value>(data) else { continue };
                let Some(choice) = frame.get("choices").and_then(|c| c.get(0)) else { continue };

                if let Some(fr) = choice.get("finish_reason").and_then(Value::as_str) {
                    finish_reason = fr.to_string();
                }
                let Some(delta) = choice.get("delta") else { continue };

                if let Some(text) = delta.get("content").and_then(Value::as_str) {
                    if !text.is_empty() {
                        content.push_str(text);
                        let _ = tx.send(text.to_string()).await;
                    }
                }

                if let Some(tcs) = delta.get("tool_calls").and_then(Value::as_array) {
                    for tc in tcs {
                        let idx = tc.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
                        let entry = tool_call_map.entry(idx).or_default();
                        if let Some(id) = tc.get("id").and_then(Value::as_str) {
                            entry.0 = id.to_string();
                        }
                        if let Some(func) = tc.get("function") {
                            if let Some(name) = func.get("name").and_then(Value::as_str) {
                                entry.1 = name.to_string();
                            }
                            if let Some(args) = func.get("arguments").and_then(Value::as_str) {
                                entry.2.push_str(args);
                            }
                        }
                    }
                }
            }
        }

        let mut tool_calls = Vec::new();
        if !tool_call_map.is_empty() {
            let mut indices: Vec<usize> = tool_call_map.keys().copied().collect();
            indices.sort();
            for idx in indices {
                let (id, name, args_str) = &tool_call_map[&idx];
                let arguments = serde_json::from_str(args_str).unwrap_or(json!({}));
                tool_calls.push(ToolCall {
                    id: if id.is_empty() { format!("call_{idx}") } else { id.clone() },
                    name: name.clone(),
                    arguments,
                });
            }
            if finish_reason == "stop" {
                finish_reason = "tool_calls".to_string();
            }
        }

        Ok(ChatResponse { model: self.model.clone(), content, tool_calls, finish_reason })
    }
}

fn messages_to_ollama(messages: &[ChatMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| {
            let mut msg = json!({ "role": role_str(&m.role) });
            if let Some(content) = &m.content {
                msg["content"] = json!(content);
            }
            if !m.tool_calls.is_empty() {
                msg["tool_calls"] = json!(
                    m.tool_calls
                        .iter()
                        .map(|tc| json!({ "function": { "name": tc.name, "arguments": tc.arguments } }))
                        .collect::<Vec<_>>()
                );
            }
            if let Some(id) = &m.tool_call_id {
                msg["tool_call_id"] = json!(id);
            }
            msg
        })
        .collect()
}

fn messages_to_openai(messages: &[ChatMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| {
            let mut msg = json!({ "role": role_str(&m.role) });
            msg["content"] = m.content.as_ref().map(|c| json!(c)).unwrap_or(Value::Null);
            if !m.tool_calls.is_empty() {
                msg["tool_calls"] = json!(
                    m.tool_calls
                        .iter()
                        .map(|tc| json!({
                            "id": tc.id,
                            "type": "function",
                            "function": { "name": tc.name, "arguments": tc.arguments.to_string() },
                        }))
                        .collect::<Vec<_>>()
                );
            }
            if let Some(id) = &m.tool_call_id {
                msg["tool_call_id"] = json!(id);
            }
            msg
        })
        .collect()
}

fn role_str(role: &ChatRole) -> &'static str {
    match role {
        ChatRole::System => "system",
        ChatRole::User => "user",
        ChatRole::Assistant => "assistant",
        ChatRole::Tool => "tool",
    }
}

fn parse_tool_calls(calls: &[Value]) -> Vec<ToolCall> {
    calls
        .iter()
        .enumerate()
        .filter_map(|(i, call)| {
            let func = call.get("function")?;
            let name = func.get("name")?.as_str()?.to_string();
            let arguments = func.get("arguments").cloned().unwrap_or(json!({}));
            Some(ToolCall { id: format!("call_{i}"), name, arguments })
        })
        .collect()
}

fn parse_ollama_response(model: &str, body: &Value) -> ChatResponse {
    let content = body.get("message").and_then(|m| m.get("content")).and_then(Value::as_str).unwrap_or("").to_string();
    let tool_calls = body
        .get("message")
        .and_then(|m| m.get("tool_calls"))
        .and_then(Value::as_array)
        .map(|c| parse_tool_calls(c))
        .unwrap_or_default();
    let finish_reason = if tool_calls.is_empty() { "stop".to_string() } else { "tool_calls".to_string() };
    ChatResponse { model: model.to_string(), content, tool_calls, finish_reason }
}

fn parse_openai_response(model: &str, body: &Value) -> ChatResponse {
    let choice = body.get("choices").and_then(|c| c.get(0));
    let message = choice.and_then(|c| c.get("message"));
    let content = message.and_then(|m| m.get("content")).and_then(Value::as_str).unwrap_or("").to_string();
    let finish_reason = choice.and_then(|c| c.get("finish_reason")).and_then(Value::as_str).unwrap_or("stop").to_string();
    let tool_calls = message
        .and_then(|m| m.get("tool_calls"))
        .and_then(Value::as_array)
        .map(|calls| {
            calls
                .iter()
                .enumerate()
                .filter_map(|(i, tc)| {
                    let id = tc.get("id").and_then(Value::as_str).unwrap_or("").to_string();
                    let func = tc.get("function")?;
                    let name = func.get("name")?.as_str()?.to_string();
                    let arguments = func
                        .get("arguments")
                        .map(|v| if let Some(s) = v.as_str() { serde_json::from_str(s).unwrap_or(json!({})) } else { v.clone() })
                        .unwrap_or(json!({}));
                    Some(ToolCall { id: if id.is_empty() { format!("call_{i}") } else { id }, name, arguments })
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    ChatResponse { model: model.to_string(), content, tool_calls, finish_reason }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_to_ollama_carries_tool_call_id() {
        let messages = vec![ChatMessage::tool_result("call_1", "output")];
        let rendered = messages_to_ollama(&messages);
        assert_eq!(rendered[0]["tool_call_id"], "call_1");
        assert_eq!(rendered[0]["role"], "tool");
    }

    #[test]
    fn messages_to_openai_serialises_arguments_as_string() {
        let messages = vec![ChatMessage::assistant_tool_calls(vec![ToolCall {
            id: "call_1".to_string(),
            name: "read_file".to_string(),
            arguments: json!({"path": "a.txt"}),
        }])];
        let rendered = messages_to_openai(&messages);
        let args = rendered[0]["tool_calls"][0]["function"]["arguments"].as_str().unwrap();
        assert!(args.contains("a.txt"));
    }

    #[test]
    fn parse_ollama_response_extracts_content_and_tool_calls() {
        let body = json!({
            "message": {
                "content": "",
                "tool_calls": [{"function": {"name": "read_file", "arguments": {"path": "a.txt"}}}],
            }
        });
        let response = parse_ollama_response("llama3.1:8b", &body);
        assert_eq!(response.finish_reason, "tool_calls");
        assert_eq!(response.tool_calls[0].name, "read_file");
    }

    #[test]
    fn parse_openai_response_defaults_finish_reason_to_stop() {
        let body = json!({ "choices": [{"message": {"content": "hello"}}] });
        let response = parse_openai_response("gpt-4o-mini", &body);
        assert_eq!(response.content, "hello");
        assert_eq!(response.finish_reason, "stop");
        assert!(response.tool_calls.is_empty());
    }
}
