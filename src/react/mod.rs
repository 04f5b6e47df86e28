//! 执行层：Agent 工具调用循环与过程事件

pub mod events;
pub mod loop_;

pub use events::{emit, preview, EventSink, TurnEvent};
pub use loop_::{AgentLoop, AgentOutcome, AgentRun, LoopLimits};
