//! Agent 工具调用循环
//!
//! Thinking：以「系统指令 + 会话历史 + 本次运行已产生的消息」和本 Agent 的工具子集调用模型；
//! 回复不含工具调用即结束（Done），否则进入 Acting：逐个执行工具调用，每个调用追加一条以 call id 对应的
//! Tool 消息（失败时内容为错误描述），然后回到 Thinking。
//!
//! 终止保证：max_steps 限制模型调用次数；同一工具连续调用失败超出预算时放弃本次运行。
//! 工具错误不会中断循环；只有模型调用失败与取消会以 TurnError 结束。

use tokio_util::sync::CancellationToken;

use crate::agent::Agent;
use crate::core::{AgentPhase, RecoveryAction, ToolError, ToolFailureTracker, TurnError};
use crate::llm::ToolSpec;
use crate::memory::{Message, Role};
use crate::react::{emit, preview, EventSink, TurnEvent};
use crate::tools::{ToolExecutor, ToolRegistry, ToolRun};

/// Observation 预览最大字符数
const OBSERVATION_PREVIEW_CHARS: usize = 200;

/// 循环上限
#[derive(Clone, Copy, Debug)]
pub struct LoopLimits {
    /// 单次运行最多模型调用次数
    pub max_steps: usize,
    /// 同一工具连续调用失败的容忍次数
    pub max_tool_retries: u32,
}

impl Default for LoopLimits {
    fn default() -> Self {
        Self {
            max_steps: 10,
            max_tool_retries: 2,
        }
    }
}

/// 运行结束方式
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AgentOutcome {
    /// 模型给出不含工具调用的回复
    Answered,
    /// 某工具连续失败超出预算
    ToolFailures { tool: String, failures: u32 },
    /// 达到步数上限仍未给出最终回复
    StepLimit,
}

/// 一次 Agent 运行的结果
#[derive(Clone, Debug)]
pub struct AgentRun {
    pub agent: String,
    /// 本次运行产生的消息（按顺序追加到会话历史）
    pub messages: Vec<Message>,
    pub outcome: AgentOutcome,
    pub model_calls: usize,
    pub tool_calls: usize,
}

impl AgentRun {
    /// 运行的输出文本：最后一条 Assistant 消息的内容
    pub fn output(&self) -> &str {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .map(|m| m.content.as_str())
            .unwrap_or("")
    }

    pub fn is_failure(&self) -> bool {
        self.outcome != AgentOutcome::Answered
    }
}

/// 单次 Agent 运行所需的共享组件
pub struct AgentLoop<'a> {
    pub registry: &'a ToolRegistry,
    pub executor: &'a ToolExecutor,
    pub limits: LoopLimits,
    pub cancel: &'a CancellationToken,
    pub events: &'a EventSink,
}

impl<'a> AgentLoop<'a> {
    /// 在给定历史上运行 agent 的完整工具循环
    pub async fn run(&self, agent: &Agent, history: &[Message]) -> Result<AgentRun, TurnError> {
        let snapshot = self.registry.snapshot().await;
        let tools = agent.scope.resolve(&snapshot);
        let specs: Vec<ToolSpec> = tools.iter().map(|t| t.spec()).collect();

        let mut tracker = ToolFailureTracker::new(self.limits.max_tool_retries);
        let mut produced: Vec<Message> = Vec::new();
        let mut phase = AgentPhase::Thinking;
        let mut model_calls = 0;
        let mut tool_calls = 0;

        tracing::debug!(agent = %agent.name, tools = specs.len(), "agent run started");

        while model_calls < self.limits.max_steps {
            if self.cancel.is_cancelled() {
                return Err(TurnError::Cancelled);
            }
            debug_assert_eq!(phase, AgentPhase::Thinking);
            model_calls += 1;
            emit(
                self.events,
                TurnEvent::Thinking {
                    agent: agent.name.clone(),
                    step: model_calls,
                },
            );

            let mut request = Vec::with_capacity(1 + history.len() + produced.len());
            request.push(Message::system(&agent.instructions));
            request.extend_from_slice(history);
            request.extend_from_slice(&produced);

            let response = tokio::select! {
                r = agent.model.complete(&request, &specs) => r,
                _ = self.cancel.cancelled() => return Err(TurnError::Cancelled),
            }
            .map_err(|source| TurnError::AgentModel {
                agent: agent.name.clone(),
                source,
            })?
            .with_name(&agent.name);

            if !response.has_tool_calls() {
                produced.push(response);
                phase = AgentPhase::Done;
                tracing::debug!(agent = %agent.name, ?phase, model_calls, tool_calls, "agent answered");
                return Ok(AgentRun {
                    agent: agent.name.clone(),
                    messages: produced,
                    outcome: AgentOutcome::Answered,
                    model_calls,
                    tool_calls,
                });
            }

            phase = AgentPhase::Acting;
            let calls = response.tool_calls.clone();
            produced.push(response);

            let mut give_up: Option<(String, u32)> = None;
            for call in calls {
                tool_calls += 1;
                emit(
                    self.events,
                    TurnEvent::ToolCall {
                        agent: agent.name.clone(),
                        tool: call.name.clone(),
                        args: call.arguments.clone(),
                    },
                );

                let result = match tools.iter().find(|t| t.name == call.name) {
                    Some(tool) => match self.executor.execute(tool, &call.arguments, self.cancel).await {
                        ToolRun::Finished(r) => r,
                        ToolRun::Cancelled => return Err(TurnError::Cancelled),
                    },
                    None => Err(ToolError::UnknownTool(call.name.clone())),
                };

                let content = match &result {
                    Ok(text) => {
                        emit(
                            self.events,
                            TurnEvent::Observation {
                                agent: agent.name.clone(),
                                tool: call.name.clone(),
                                preview: preview(text, OBSERVATION_PREVIEW_CHARS),
                            },
                        );
                        text.clone()
                    }
                    Err(e) => {
                        tracing::warn!(agent = %agent.name, tool = %call.name, error = %e, "tool call failed");
                        emit(
                            self.events,
                            TurnEvent::ToolFailure {
                                agent: agent.name.clone(),
                                tool: call.name.clone(),
                                reason: e.to_string(),
                            },
                        );
                        format!("Error: {}", e)
                    }
                };
                produced.push(Message::tool_result(&call.id, &call.name, content));

                let invocation_failed = result.as_ref().err().is_some_and(ToolError::is_invocation);
                if let RecoveryAction::GiveUp { tool, failures } = tracker.record(&call.name, invocation_failed) {
                    give_up.get_or_insert((tool, failures));
                }
            }

            // 同一批调用全部得到回应后再放弃，保证每个 call id 都有对应结果
            if let Some((tool, failures)) = give_up {
                produced.push(
                    Message::assistant(format!(
                        "I could not complete the task: tool `{}` failed {} consecutive times.",
                        tool, failures
                    ))
                    .with_name(&agent.name),
                );
                tracing::warn!(agent = %agent.name, tool = %tool, failures, "agent gave up after repeated tool failures");
                return Ok(AgentRun {
                    agent: agent.name.clone(),
                    messages: produced,
                    outcome: AgentOutcome::ToolFailures { tool, failures },
                    model_calls,
                    tool_calls,
                });
            }
            phase = AgentPhase::Thinking;
        }

        produced.push(
            Message::assistant(format!(
                "I could not reach a final answer within {} steps.",
                self.limits.max_steps
            ))
            .with_name(&agent.name),
        );
        tracing::warn!(agent = %agent.name, max_steps = self.limits.max_steps, "agent hit step limit");
        Ok(AgentRun {
            agent: agent.name.clone(),
            messages: produced,
            outcome: AgentOutcome::StepLimit,
            model_calls,
            tool_calls,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::ToolScope;
    use crate::core::ToolInvocationError;
    use crate::llm::{LlmError, ScriptedLlmClient};
    use crate::memory::ToolCall;
    use crate::tools::{Tool, ValidatedArgs};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Flaky {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl Tool for Flaky {
        fn name(&self) -> &str {
            "lookup"
        }
        fn description(&self) -> &str {
            "lookup"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            json!({"type": "object", "properties": {"key": {"type": "string"}}, "required": ["key"]})
        }
        async fn execute(&self, args: ValidatedArgs) -> Result<String, ToolError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ToolInvocationError::new("lookup", "backend down").into());
            }
            Ok(format!("value of {}", args.get_str("key").unwrap_or("?")))
        }
    }

    fn call(id: &str, name: &str, args: serde_json::Value) -> Message {
        Message::assistant_with_calls("", vec![ToolCall::new(id, name, args)])
    }

    fn setup(fail: bool, script: Vec<Result<Message, LlmError>>) -> (Agent, ToolRegistry, Arc<ScriptedLlmClient>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = ToolRegistry::new();
        registry.register(Flaky { calls: calls.clone(), fail });
        let model = Arc::new(ScriptedLlmClient::new(script));
        let agent = Agent::new("worker", model.clone()).with_scope(ToolScope::named(["lookup"]));
        (agent, registry, model, calls)
    }

    async fn run(agent: &Agent, registry: &ToolRegistry, limits: LoopLimits) -> Result<AgentRun, TurnError> {
        let executor = ToolExecutor::new(5);
        let cancel = CancellationToken::new();
        let events: EventSink = None;
        AgentLoop { registry, executor: &executor, limits, cancel: &cancel, events: &events }
            .run(agent, &[Message::user("go")])
            .await
    }

    #[tokio::test]
    async fn test_validation_error_reaches_model() {
        let (agent, registry, model, calls) = setup(
            false,
            vec![
                Ok(call("c1", "lookup", json!({}))),
                Ok(call("c2", "lookup", json!({"key": "a"}))),
                Ok(Message::assistant("done")),
            ],
        );
        let run = run(&agent, &registry, LoopLimits::default()).await.unwrap();
        assert_eq!(run.outcome, AgentOutcome::Answered);
        assert!(run.messages[1].content.starts_with("Error: invalid argument `key`"));
        assert_eq!(run.messages[3].content, "value of a");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(model.call_count(), 3);
    }

    #[tokio::test]
    async fn test_unknown_and_out_of_scope_tool() {
        let (agent, registry, _model, _calls) = setup(
            false,
            vec![Ok(call("c1", "rm_rf", json!({}))), Ok(Message::assistant("ok"))],
        );
        let run = run(&agent, &registry, LoopLimits::default()).await.unwrap();
        assert_eq!(run.messages[1].content, "Error: unknown tool `rm_rf`");
        assert_eq!(run.messages[1].tool_call_id.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn test_gives_up_after_repeated_failures() {
        let script = (0..5)
            .map(|i| Ok(call(&format!("c{}", i), "lookup", json!({"key": "k"}))))
            .collect();
        let (agent, registry, model, calls) = setup(true, script);
        let run = run(&agent, &registry, LoopLimits { max_steps: 10, max_tool_retries: 2 })
            .await
            .unwrap();
        assert_eq!(run.outcome, AgentOutcome::ToolFailures { tool: "lookup".into(), failures: 3 });
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(model.call_count(), 3);
        assert!(run.output().contains("failed 3 consecutive times"));
    }

    #[tokio::test]
    async fn test_step_limit() {
        let script = (0..5)
            .map(|i| Ok(call(&format!("c{}", i), "lookup", json!({"key": "k"}))))
            .collect();
        let (agent, registry, model, _calls) = setup(false, script);
        let run = run(&agent, &registry, LoopLimits { max_steps: 2, max_tool_retries: 2 })
            .await
            .unwrap();
        assert_eq!(run.outcome, AgentOutcome::StepLimit);
        assert_eq!(model.call_count(), 2);
        assert!(run.is_failure());
    }

    #[tokio::test]
    async fn test_model_error_is_fatal() {
        let (agent, registry, _model, _calls) =
            setup(false, vec![Err(LlmError::Unavailable("down".into()))]);
        let err = run(&agent, &registry, LoopLimits::default()).await.unwrap_err();
        assert!(matches!(err, TurnError::AgentModel { ref agent, .. } if agent == "worker"));
    }

    #[tokio::test]
    async fn test_system_instructions_first() {
        let (agent, registry, model, _calls) = setup(false, vec![Ok(Message::assistant("hi"))]);
        let agent = agent.with_instructions("be brief");
        run(&agent, &registry, LoopLimits::default()).await.unwrap();
        let seen = &model.calls()[0];
        assert_eq!(seen.messages[0].role, Role::System);
        assert_eq!(seen.messages[0].content, "be brief");
        assert_eq!(seen.tool_names, vec!["lookup"]);
    }
}
