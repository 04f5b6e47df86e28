//! 错误分类
//!
//! 工具链路内的错误（ValidationError / ToolInvocationError）在 Agent 循环中转为 Tool 消息回给模型，
//! 不会中止循环；ProviderConnectionError 只在启动 / 重连时出现并被记录；
//! TurnError 是 run_turn 返回给调用方的唯一结构化错误。

use thiserror::Error;

use crate::llm::LlmError;

/// 工具参数校验失败：缺失必填字段或值无法转换为声明的类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid argument `{field}`: {reason}")]
pub struct ValidationError {
    /// 出错的字段名；参数整体不是对象时为 `$`
    pub field: String,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// 工具调用失败：远程返回错误、提供方断开、超时等
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("tool `{tool}` failed: {reason}")]
pub struct ToolInvocationError {
    pub tool: String,
    pub reason: String,
}

impl ToolInvocationError {
    pub fn new(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            reason: reason.into(),
        }
    }
}

/// 外部工具提供方连接失败（握手、列工具）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("provider `{endpoint}` unavailable: {reason}")]
pub struct ProviderConnectionError {
    pub endpoint: String,
    pub reason: String,
}

impl ProviderConnectionError {
    pub fn new(endpoint: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            reason: reason.into(),
        }
    }
}

/// 工具执行路径上的错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Invocation(#[from] ToolInvocationError),

    #[error("unknown tool `{0}`")]
    UnknownTool(String),
}

impl ToolError {
    /// 是否计入「同一工具连续失败」预算（参数错误由模型自行修正，不计入）
    pub fn is_invocation(&self) -> bool {
        matches!(self, ToolError::Invocation(_))
    }
}

/// 检查点存储错误
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("checkpoint serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("checkpoint backend error: {0}")]
    Backend(String),
}

/// 单次 Turn 的致命错误（返回给调用方；此时不写回检查点）
#[derive(Error, Debug)]
pub enum TurnError {
    #[error("supervisor decision failed: {0}")]
    Supervisor(#[source] LlmError),

    #[error("agent `{agent}` model call failed: {source}")]
    AgentModel {
        agent: String,
        #[source]
        source: LlmError,
    },

    #[error("checkpoint store failed: {0}")]
    Store(#[from] StoreError),

    #[error("turn cancelled")]
    Cancelled,

    #[error("empty user message")]
    EmptyInput,
}
