//! 工具执行器
//!
//! 对每次调用施加超时、输出结构化审计日志（JSON），并在取消时放弃等待：
//! 调用在独立任务中运行，取消后该任务自行跑完，结果被丢弃，不会写入会话历史。

use std::time::{Duration, Instant};

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::{ToolError, ToolInvocationError};
use crate::tools::ToolDescriptor;

/// 一次工具执行的结果
#[derive(Debug)]
pub enum ToolRun {
    Finished(Result<String, ToolError>),
    /// Turn 已取消，结果被丢弃
    Cancelled,
}

/// 工具执行器：超时 + 审计 + 取消
#[derive(Clone, Debug)]
pub struct ToolExecutor {
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            timeout: Duration::from_secs(timeout_secs.max(1)),
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub async fn execute(
        &self,
        tool: &ToolDescriptor,
        args: &Value,
        cancel: &CancellationToken,
    ) -> ToolRun {
        let start = Instant::now();
        let preview = args_preview(args);

        let task = {
            let tool = tool.clone();
            let args = args.clone();
            let limit = self.timeout;
            tokio::spawn(async move { tokio::time::timeout(limit, tool.invoke(&args)).await })
        };

        let (run, outcome) = tokio::select! {
            joined = task => match joined {
                Ok(Ok(Ok(content))) => (ToolRun::Finished(Ok(content)), "ok"),
                Ok(Ok(Err(e))) => {
                    let outcome = match e {
                        ToolError::Validation(_) => "invalid_args",
                        _ => "error",
                    };
                    (ToolRun::Finished(Err(e)), outcome)
                }
                Ok(Err(_)) => (
                    ToolRun::Finished(Err(ToolInvocationError::new(
                        &tool.name,
                        format!("timed out after {:?}", self.timeout),
                    )
                    .into())),
                    "timeout",
                ),
                Err(join) => (
                    ToolRun::Finished(Err(ToolInvocationError::new(
                        &tool.name,
                        format!("task aborted: {}", join),
                    )
                    .into())),
                    "error",
                ),
            },
            _ = cancel.cancelled() => (ToolRun::Cancelled, "cancelled"),
        };

        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool.name,
            "remote": tool.is_remote(),
            "ok": outcome == "ok",
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        run
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{Tool, ValidatedArgs};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct Sleepy(u64);

    #[async_trait]
    impl Tool for Sleepy {
        fn name(&self) -> &str {
            "sleepy"
        }
        fn description(&self) -> &str {
            "sleeps"
        }
        async fn execute(&self, _args: ValidatedArgs) -> Result<String, ToolError> {
            tokio::time::sleep(Duration::from_millis(self.0)).await;
            Ok("woke".into())
        }
    }

    #[tokio::test]
    async fn test_finishes() {
        let exec = ToolExecutor::new(5);
        let tool = ToolDescriptor::from_tool(Arc::new(Sleepy(1)));
        let run = exec.execute(&tool, &Value::Null, &CancellationToken::new()).await;
        assert!(matches!(run, ToolRun::Finished(Ok(ref s)) if s == "woke"));
    }

    #[tokio::test]
    async fn test_timeout_is_invocation_error() {
        let exec = ToolExecutor::with_timeout(Duration::from_millis(10));
        let tool = ToolDescriptor::from_tool(Arc::new(Sleepy(500)));
        let run = exec.execute(&tool, &Value::Null, &CancellationToken::new()).await;
        match run {
            ToolRun::Finished(Err(e)) => {
                assert!(e.is_invocation());
                assert!(e.to_string().contains("timed out after 10ms"), "{}", e);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_discards() {
        let exec = ToolExecutor::new(5);
        let tool = ToolDescriptor::from_tool(Arc::new(Sleepy(500)));
        let cancel = CancellationToken::new();
        let c2 = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            c2.cancel();
        });
        let run = exec.execute(&tool, &Value::Null, &cancel).await;
        assert!(matches!(run, ToolRun::Cancelled));
    }
}
