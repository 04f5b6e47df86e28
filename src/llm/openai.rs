//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；支持原生 tool calling，
//! 适用于 OpenAI、本地 vLLM（--enable-auto-tool-choice）及其它兼容端点。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::chat::{
    ChatCompletionMessageToolCall, ChatCompletionMessageToolCalls,
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestToolMessageArgs,
    ChatCompletionRequestUserMessageArgs, ChatCompletionResponseMessage, ChatCompletionTool,
    ChatCompletionTools, CreateChatCompletionRequestArgs, FunctionCall, FunctionObjectArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;

use crate::llm::{LlmClient, LlmError, ToolSpec};
use crate::memory::{Message, Role, ToolCall};

/// 限流提示中没有等待时间时的默认退避
const DEFAULT_RETRY_AFTER_MS: u64 = 1000;
/// 服务端建议的等待时间上限
const MAX_RETRY_AFTER_MS: u64 = 60_000;

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
    pub total_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
        self.total_tokens.fetch_add(prompt + completion, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
            self.total_tokens.load(Ordering::Relaxed),
        )
    }
}

/// OpenAI 兼容客户端：持有 Client 与 model 名，complete 时把 Message / ToolSpec 转为 API 类型
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
    temperature: Option<f32>,
    timeout: Option<Duration>,
    /// 累计 token 使用统计
    pub usage: TokenUsage,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = if let Some(url) = base_url {
            OpenAIConfig::new()
                .with_api_base(url.trim_end_matches('/'))
                .with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            temperature: None,
            timeout: None,
            usage: TokenUsage::new(),
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// 单次请求超时
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Some(Duration::from_secs(secs.max(1)));
        self
    }

    fn to_openai_messages(messages: &[Message]) -> Result<Vec<ChatCompletionRequestMessage>, OpenAIError> {
        messages.iter().map(to_openai_message).collect()
    }

    fn to_openai_tools(tools: &[ToolSpec]) -> Result<Vec<ChatCompletionTools>, OpenAIError> {
        tools
            .iter()
            .map(|t| {
                let function = FunctionObjectArgs::default()
                    .name(t.name.clone())
                    .description(t.description.clone())
                    .parameters(t.parameters.clone())
                    .build()?;
                Ok(ChatCompletionTools::Function(ChatCompletionTool { function }))
            })
            .collect()
    }

    fn from_response_message(msg: ChatCompletionResponseMessage) -> Message {
        let calls: Vec<ToolCall> = msg
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .filter_map(|c| match c {
                ChatCompletionMessageToolCalls::Function(call) => Some(ToolCall::new(
                    call.id,
                    call.function.name,
                    parse_arguments(&call.function.arguments),
                )),
                _ => None,
            })
            .collect();
        Message::assistant_with_calls(msg.content.unwrap_or_default(), calls)
    }
}

fn to_openai_message(m: &Message) -> Result<ChatCompletionRequestMessage, OpenAIError> {
    // name 需满足 [a-zA-Z0-9_-]；tool 角色不接受 name
    let name = m.name.clone().filter(|n| is_wire_name(n));
    let message = match m.role {
        Role::System => {
            let mut args = ChatCompletionRequestSystemMessageArgs::default();
            args.content(m.content.clone());
            if let Some(name) = name {
                args.name(name);
            }
            ChatCompletionRequestMessage::System(args.build()?)
        }
        Role::User => {
            let mut args = ChatCompletionRequestUserMessageArgs::default();
            args.content(m.content.clone());
            if let Some(name) = name {
                args.name(name);
            }
            ChatCompletionRequestMessage::User(args.build()?)
        }
        Role::Assistant => {
            let mut args = ChatCompletionRequestAssistantMessageArgs::default();
            if !m.content.is_empty() || !m.has_tool_calls() {
                args.content(m.content.clone());
            }
            if m.has_tool_calls() {
                args.tool_calls(
                    m.tool_calls
                        .iter()
                        .map(|c| {
                            ChatCompletionMessageToolCalls::Function(ChatCompletionMessageToolCall {
                                id: c.id.clone(),
                                function: FunctionCall {
                                    name: c.name.clone(),
                                    arguments: c.arguments.to_string(),
                                },
                            })
                        })
                        .collect::<Vec<_>>(),
                );
            }
            if let Some(name) = name {
                args.name(name);
            }
            ChatCompletionRequestMessage::Assistant(args.build()?)
        }
        Role::Tool => ChatCompletionRequestMessage::Tool(
            ChatCompletionRequestToolMessageArgs::default()
                .content(m.content.clone())
                .tool_call_id(m.tool_call_id.clone().unwrap_or_default())
                .build()?,
        ),
    };
    Ok(message)
}

fn is_wire_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// 模型给出的 arguments 为 JSON 字符串；空串视为空对象，非法 JSON 原样保留交给参数校验报错
fn parse_arguments(raw: &str) -> Value {
    let raw = raw.trim();
    if raw.is_empty() {
        return Value::Object(serde_json::Map::new());
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// 从限流提示（"Please try again in 1.5s" / "in 250ms"）解析等待时间，上限 MAX_RETRY_AFTER_MS
fn retry_after_from_message(message: &str) -> u64 {
    static RETRY_IN: OnceLock<Option<Regex>> = OnceLock::new();
    let re = RETRY_IN.get_or_init(|| Regex::new(r"(?i)try again in (\d+(?:\.\d+)?)\s*(ms|s)\b").ok());
    re.as_ref()
        .and_then(|re| re.captures(message))
        .and_then(|c| {
            let value: f64 = c[1].parse().ok()?;
            let ms = if c[2].eq_ignore_ascii_case("ms") { value } else { value * 1000.0 };
            Some(ms.ceil().min(MAX_RETRY_AFTER_MS as f64) as u64)
        })
        .unwrap_or(DEFAULT_RETRY_AFTER_MS)
}

/// 按错误类型归类 API 错误：限流与服务端错误为瞬时错误
fn classify_api_error(kind: Option<&str>, message: &str) -> LlmError {
    let kind = kind.unwrap_or("");
    let lower = message.to_ascii_lowercase();
    if kind.contains("rate_limit") || kind == "requests" || kind == "tokens" || lower.contains("rate limit") {
        return LlmError::RateLimited {
            retry_after_ms: retry_after_from_message(message),
        };
    }
    if kind == "server_error" || lower.contains("overloaded") {
        return LlmError::Api {
            status: 500,
            body: message.to_string(),
        };
    }
    LlmError::Api {
        status: 400,
        body: message.to_string(),
    }
}

fn map_openai_error(e: OpenAIError) -> LlmError {
    match e {
        OpenAIError::Reqwest(e) => match e.status() {
            Some(status) if status.as_u16() == 429 => LlmError::RateLimited {
                retry_after_ms: DEFAULT_RETRY_AFTER_MS,
            },
            Some(status) => LlmError::Api {
                status: status.as_u16(),
                body: e.to_string(),
            },
            None => LlmError::Network(e.to_string()),
        },
        OpenAIError::ApiError(api) => classify_api_error(api.r#type.as_deref(), &api.message),
        other => LlmError::InvalidResponse(other.to_string()),
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }

    async fn complete(&self, messages: &[Message], tools: &[ToolSpec]) -> Result<Message, LlmError> {
        let invalid = |e: OpenAIError| LlmError::InvalidResponse(format!("request build failed: {}", e));

        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(&self.model)
            .messages(Self::to_openai_messages(messages).map_err(invalid)?);
        if !tools.is_empty() {
            args.tools(Self::to_openai_tools(tools).map_err(invalid)?);
        }
        if let Some(t) = self.temperature {
            args.temperature(t);
        }
        let request = args.build().map_err(invalid)?;

        let chat = self.client.chat();
        let call = chat.create(request);
        let response = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| LlmError::Network(format!("request timed out after {:?}", limit)))?,
            None => call.await,
        }
        .map_err(map_openai_error)?;

        // 提取 token 使用统计
        if let Some(usage) = &response.usage {
            self.usage
                .add(usage.prompt_tokens as u64, usage.completion_tokens as u64);
        }

        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse("response has no choices".to_string()))?;
        Ok(Self::from_response_message(choice.message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_arguments() {
        assert_eq!(parse_arguments(""), serde_json::json!({}));
        assert_eq!(parse_arguments(r#"{"q":"x"}"#), serde_json::json!({"q": "x"}));
        assert_eq!(parse_arguments("not json"), Value::String("not json".into()));
    }

    #[test]
    fn test_request_messages_carry_tool_calls() {
        let call = ToolCall::new("call_1", "web_search", serde_json::json!({"query": "rust"}));
        let msgs = vec![
            Message::assistant_with_calls("", vec![call]).with_name("internal_agent"),
            Message::tool_result("call_1", "web_search", "results"),
        ];
        let wire = serde_json::to_value(OpenAiClient::to_openai_messages(&msgs).unwrap()).unwrap();
        assert_eq!(wire[0]["role"], "assistant");
        assert_eq!(wire[0]["name"], "internal_agent");
        assert_eq!(wire[0]["tool_calls"][0]["id"], "call_1");
        assert_eq!(wire[0]["tool_calls"][0]["function"]["name"], "web_search");
        assert_eq!(wire[0]["tool_calls"][0]["function"]["arguments"], r#"{"query":"rust"}"#);
        assert_eq!(wire[1]["role"], "tool");
        assert_eq!(wire[1]["tool_call_id"], "call_1");
        assert!(wire[1].get("name").is_none());
    }

    #[test]
    fn test_tools_become_functions() {
        let specs = vec![ToolSpec::new(
            "search_knowledge_base",
            "Search the knowledge base",
            serde_json::json!({"type": "object", "properties": {"query": {"type": "string"}}}),
        )];
        let wire = serde_json::to_value(OpenAiClient::to_openai_tools(&specs).unwrap()).unwrap();
        assert_eq!(wire[0]["type"], "function");
        assert_eq!(wire[0]["function"]["name"], "search_knowledge_base");
        assert!(wire[0]["function"]["parameters"]["properties"].get("query").is_some());
    }

    #[test]
    fn test_from_response_message() {
        let raw = serde_json::json!({
            "role": "assistant",
            "content": null,
            "tool_calls": [{
                "id": "call_9",
                "type": "function",
                "function": {"name": "transfer_to_rag_agent", "arguments": "{}"}
            }]
        });
        let parsed: ChatCompletionResponseMessage = serde_json::from_value(raw).unwrap();
        let msg = OpenAiClient::from_response_message(parsed);
        assert_eq!(msg.role, Role::Assistant);
        assert_eq!(msg.tool_calls[0].id, "call_9");
        assert_eq!(msg.tool_calls[0].name, "transfer_to_rag_agent");
        assert_eq!(msg.tool_calls[0].arguments, serde_json::json!({}));
    }

    #[test]
    fn test_wire_name_filter() {
        assert!(is_wire_name("rag_agent"));
        assert!(!is_wire_name("rag agent"));
        assert!(!is_wire_name(""));
    }

    #[test]
    fn test_rate_limit_is_transient_with_bounded_wait() {
        let err = classify_api_error(
            Some("tokens"),
            "Rate limit reached for gpt-4o. Please try again in 1.5s.",
        );
        assert_eq!(err, LlmError::RateLimited { retry_after_ms: 1500 });
        assert!(err.is_transient());

        let err = classify_api_error(Some("requests"), "Please try again in 250ms.");
        assert_eq!(err, LlmError::RateLimited { retry_after_ms: 250 });

        // 异常大的等待时间被截断而不是溢出
        let huge = format!("Please try again in {}s.", "9".repeat(40));
        assert_eq!(retry_after_from_message(&huge), MAX_RETRY_AFTER_MS);
        assert_eq!(retry_after_from_message("slow down"), DEFAULT_RETRY_AFTER_MS);
    }

    #[test]
    fn test_api_error_classification() {
        assert!(classify_api_error(Some("server_error"), "The server had an error").is_transient());
        let err = classify_api_error(Some("invalid_request_error"), "bad tool schema");
        assert!(!err.is_transient());
        assert!(err.to_string().contains("bad tool schema"));
    }
}
