//! Supervisor：路由决策函数
//!
//! 给定完整会话历史、Agent 名册与策略文档，由模型决定下一步：交给某个 Agent、向用户追问、或结束。
//! Agent 以 `transfer_to_<name>` 工具的形式暴露给模型，追问为 `ask_user` 工具；不调用工具即结束。
//! 策略文档是可注入的配置；这里只负责把模型回复解析为 RouteDecision，不执行任何工具。

use std::sync::Arc;

use serde_json::json;

use crate::agent::Agent;
use crate::core::RouteDecision;
use crate::llm::{LlmClient, LlmError, ToolSpec};
use crate::memory::{Message, ToolCall};

pub const SUPERVISOR_NAME: &str = "supervisor";
pub const HANDOFF_PREFIX: &str = "transfer_to_";
pub const ASK_USER_TOOL: &str = "ask_user";

/// 内置策略（未提供策略文档时使用）
pub const DEFAULT_POLICY: &str = "\
# Routing Policy
You are the supervisor of a team of specialist agents. You never answer domain questions with tools yourself; you decide who acts next.

1. Dependency check: before handing off, confirm the target agent has every input it needs from the conversation. Reorder the user's steps when a later step depends on an earlier one.
2. Prefer progress: when only optional information is missing, hand off with what is available instead of asking the user.
3. Ambiguity: when several agents are plausible and the right choice depends on information only the user has, call ask_user with one precise question.
4. Failures: if an agent failed because of a transient error you may hand off to it again, but only a limited number of times. After that, or on any non-transient failure, change approach: pick a different agent or finish and explain what went wrong. Never repeat the same failed hand-off unchanged.
5. Multi-step requests: hand off to one agent at a time and review each result before the next hand-off.
6. Finish: when the request is answered, reply with the final answer for the user and do not call any tool.";

/// 一次决策：模型原始回复 + 解析结果
#[derive(Clone, Debug)]
pub struct SupervisorDecision {
    pub route: RouteDecision,
    /// 写入历史的 Supervisor 消息（含工具调用）
    pub message: Message,
    /// 被采纳的工具调用（Agent / AskUser 时存在）
    pub call: Option<ToolCall>,
    /// 同一回复中被忽略的其它工具调用
    pub ignored: Vec<ToolCall>,
}

/// Supervisor：模型 + 策略 + 名册
pub struct Supervisor {
    model: Arc<dyn LlmClient>,
    policy: String,
    roster: Vec<(String, String)>,
}

impl Supervisor {
    pub fn new(model: Arc<dyn LlmClient>, policy: impl Into<String>, agents: &[Agent]) -> Self {
        Self {
            model,
            policy: policy.into(),
            roster: agents
                .iter()
                .map(|a| (a.name.clone(), a.roster_card()))
                .collect(),
        }
    }

    /// 策略文档 + 生成的名册
    pub fn system_prompt(&self) -> String {
        let cards = self
            .roster
            .iter()
            .map(|(_, card)| card.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        format!(
            "{}\n\n## Agents\n\n{}\n\n## How to act\n- Call `{}<agent>` to hand the conversation to that agent.\n- Call `{}` to ask the user a clarifying question.\n- Reply without any tool call to finish the turn; your reply is the final answer.",
            self.policy.trim(),
            cards,
            HANDOFF_PREFIX,
            ASK_USER_TOOL
        )
    }

    /// 路由工具：每个 Agent 一个 transfer 工具 + ask_user
    pub fn routing_tools(&self) -> Vec<ToolSpec> {
        let mut tools: Vec<ToolSpec> = self
            .roster
            .iter()
            .map(|(name, card)| {
                let summary = card
                    .lines()
                    .find(|l| l.contains("Role:"))
                    .map(|l| l.trim_start_matches(['-', ' ']).trim().to_string())
                    .unwrap_or_default();
                ToolSpec::new(
                    format!("{}{}", HANDOFF_PREFIX, name),
                    format!("Hand off to {}. {}", name, summary).trim().to_string(),
                    json!({"type": "object", "properties": {}, "required": []}),
                )
            })
            .collect();
        tools.push(ToolSpec::new(
            ASK_USER_TOOL,
            "Ask the user a clarifying question when the right agent cannot be chosen without more information.",
            json!({
                "type": "object",
                "properties": {
                    "question": {"type": "string", "description": "The question to ask the user."}
                },
                "required": ["question"]
            }),
        ));
        tools
    }

    /// 做一次路由决策；模型失败原样返回，由调用方决定是否终止 Turn
    pub async fn decide(&self, history: &[Message]) -> Result<SupervisorDecision, LlmError> {
        let mut request = Vec::with_capacity(history.len() + 1);
        request.push(Message::system(self.system_prompt()));
        request.extend_from_slice(history);

        let message = self
            .model
            .complete(&request, &self.routing_tools())
            .await?
            .with_name(SUPERVISOR_NAME);
        Ok(parse_decision(message))
    }
}

/// 将 Supervisor 回复解析为决策：只采纳第一个工具调用
pub fn parse_decision(message: Message) -> SupervisorDecision {
    let mut calls = message.tool_calls.clone().into_iter();
    let Some(first) = calls.next() else {
        return SupervisorDecision {
            route: RouteDecision::Done(message.content.clone()),
            message,
            call: None,
            ignored: Vec::new(),
        };
    };

    let route = if first.name == ASK_USER_TOOL {
        let question = first
            .arguments
            .get("question")
            .and_then(|q| q.as_str())
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(String::from)
            .or_else(|| Some(message.content.trim().to_string()).filter(|c| !c.is_empty()))
            .unwrap_or_else(|| "Could you clarify what you would like me to do?".to_string());
        RouteDecision::AskUser(question)
    } else {
        let agent = first
            .name
            .strip_prefix(HANDOFF_PREFIX)
            .unwrap_or(&first.name)
            .to_string();
        RouteDecision::Agent(agent)
    };

    SupervisorDecision {
        route,
        call: Some(first),
        ignored: calls.collect(),
        message,
    }
}
