//! 失败预算
//!
//! 两级预算保证循环终止：
//! - ToolFailureTracker：单次 Agent 运行内，同一工具连续调用失败超过 max_tool_retries 时放弃本次运行
//! - AgentRetryLedger：单个 Turn 内，同一 Agent 失败运行超过 max_agent_retries 后，Supervisor 必须换 Agent 或结束

use std::collections::HashMap;

/// 记录一次工具结果后的建议动作
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 继续循环，让模型观察结果（含错误）
    Continue,
    /// 某工具连续失败超出预算，结束本次 Agent 运行
    GiveUp { tool: String, failures: u32 },
}

/// 单次 Agent 运行内的工具连续失败计数
#[derive(Debug)]
pub struct ToolFailureTracker {
    max_retries: u32,
    consecutive: HashMap<String, u32>,
}

impl ToolFailureTracker {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            consecutive: HashMap::new(),
        }
    }

    /// 成功清零；调用失败（非参数错误）累加
    pub fn record(&mut self, tool: &str, invocation_failed: bool) -> RecoveryAction {
        if !invocation_failed {
            self.consecutive.remove(tool);
            return RecoveryAction::Continue;
        }
        let count = self.consecutive.entry(tool.to_string()).or_insert(0);
        *count += 1;
        if *count > self.max_retries {
            RecoveryAction::GiveUp {
                tool: tool.to_string(),
                failures: *count,
            }
        } else {
            RecoveryAction::Continue
        }
    }
}

/// 单个 Turn 内各 Agent 的失败运行次数
#[derive(Debug)]
pub struct AgentRetryLedger {
    max_retries: u32,
    failures: HashMap<String, u32>,
}

impl AgentRetryLedger {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            failures: HashMap::new(),
        }
    }

    /// 记录一次失败运行，返回累计失败次数
    pub fn record_failure(&mut self, agent: &str) -> u32 {
        let count = self.failures.entry(agent.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn record_success(&mut self, agent: &str) {
        self.failures.remove(agent);
    }

    /// 首次运行 + max_retries 次重试都失败后视为耗尽
    pub fn is_exhausted(&self, agent: &str) -> bool {
        self.failures.get(agent).copied().unwrap_or(0) > self.max_retries
    }

    pub fn failures(&self, agent: &str) -> u32 {
        self.failures.get(agent).copied().unwrap_or(0)
    }
}
