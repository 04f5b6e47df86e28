//! 状态定义：Agent 循环阶段、路由决策与 Turn 结果
//!
//! Agent 循环只有 Thinking / Acting 两个活动阶段，Done 为终态；Supervisor 每次决策产出一个 RouteDecision。

use serde::Serialize;

use crate::memory::Message;

/// Agent 工具循环阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentPhase {
    /// 等待模型回复
    Thinking,
    /// 执行本轮请求的工具调用
    Acting,
    Done,
}

/// Supervisor 的一次路由决策
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RouteDecision {
    /// 交给指定 Agent
    Agent(String),
    /// 需要向用户追问；问题文本即本轮输出
    AskUser(String),
    /// 结束本轮；内容为最终回复（可能为空，此时取最后一个 Agent 的输出）
    Done(String),
}

/// Turn 结束原因
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Supervisor 明确结束
    Completed,
    /// 等待用户补充信息
    AskUser,
    /// 达到每轮交接上限，强制结束
    HandoffLimit,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Completed => "completed",
            StopReason::AskUser => "ask_user",
            StopReason::HandoffLimit => "handoff_limit",
        }
    }
}

/// Turn 元数据
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TurnMetadata {
    pub session_id: String,
    /// 本轮实际执行的 Agent 交接次数
    pub handoffs: usize,
    pub stop_reason: StopReason,
    /// 按执行顺序参与本轮的 Agent
    pub agents: Vec<String>,
}

/// run_turn 的返回值
#[derive(Clone, Debug, Serialize)]
pub struct TurnResult {
    /// 用户可见的最终文本
    pub response: String,
    /// 产出最后一条消息的 Agent（Supervisor 直接回复时为 "supervisor"）
    pub agent: String,
    /// 写回检查点的完整消息序列
    pub messages: Vec<Message>,
    pub metadata: TurnMetadata,
}
