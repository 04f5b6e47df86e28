//! Turn 过程事件：用于流式展示路由、思考、工具调用与观察

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

use crate::core::StopReason;

/// 单步过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    /// Supervisor 把控制权交给某个 Agent（第几次交接）
    Routed { agent: String, handoff: usize },
    /// Agent 正在调用模型
    Thinking { agent: String, step: usize },
    ToolCall {
        agent: String,
        tool: String,
        args: serde_json::Value,
    },
    /// 工具返回（预览，避免过长）
    Observation {
        agent: String,
        tool: String,
        preview: String,
    },
    ToolFailure {
        agent: String,
        tool: String,
        reason: String,
    },
    AskUser { question: String },
    TurnDone { agent: String, stop_reason: StopReason },
}

/// 可选的事件出口
pub type EventSink = Option<UnboundedSender<TurnEvent>>;

/// 发送事件；接收端已关闭时静默忽略
pub fn emit(sink: &EventSink, event: TurnEvent) {
    if let Some(tx) = sink {
        let _ = tx.send(event);
    }
}

/// 观察结果预览
pub fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        format!("{}...", text.chars().take(max_chars).collect::<String>())
    } else {
        text.to_string()
    }
}
