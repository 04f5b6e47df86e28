//! 编排图：单次 Turn 的主控循环
//!
//! 加载会话历史 → 追加用户消息 → 反复询问 Supervisor：
//! 交给 Agent 时运行其完整工具循环并追加产出；追问用户或结束时停止 → 写回检查点 → 返回 TurnResult。
//!
//! 约束：
//! - 同一 session 同时最多一个 Turn（SessionLocks），不同 session 完全并行
//! - 每轮交接次数有上限；同一 Agent 在本轮失败次数超出预算后拒绝再次交接
//! - 只有 Turn 完整结束才写回检查点；致命错误或取消时历史保持不变

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::agent::Agent;
use crate::core::supervisor::{Supervisor, SupervisorDecision, SUPERVISOR_NAME};
use crate::core::{AgentRetryLedger, RouteDecision, StopReason, TurnError, TurnMetadata, TurnResult};
use crate::llm::LlmClient;
use crate::memory::{CheckpointStore, Message, SessionLocks, ToolCall};
use crate::react::{emit, AgentLoop, EventSink, LoopLimits, TurnEvent};
use crate::tools::{ToolExecutor, ToolRegistry};

/// 编排上限
#[derive(Clone, Copy, Debug)]
pub struct OrchestratorConfig {
    /// 每轮最多交接次数（含被拒绝的交接）
    pub max_handoffs: usize,
    /// 单次 Agent 运行最多模型调用次数
    pub max_agent_steps: usize,
    /// 同一工具连续失败容忍次数
    pub max_tool_retries: u32,
    /// 同一 Agent 本轮失败容忍次数
    pub max_agent_retries: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_handoffs: 6,
            max_agent_steps: 10,
            max_tool_retries: 2,
            max_agent_retries: 2,
        }
    }
}

/// 编排器：Supervisor + Agent 名册 + 工具 + 检查点
pub struct Orchestrator {
    supervisor: Supervisor,
    agents: Vec<Agent>,
    registry: Arc<ToolRegistry>,
    executor: ToolExecutor,
    store: Arc<dyn CheckpointStore>,
    locks: SessionLocks,
    config: OrchestratorConfig,
}

impl Orchestrator {
    /// Supervisor 的名册由 agents 生成
    pub fn new(
        supervisor_model: Arc<dyn LlmClient>,
        policy: impl Into<String>,
        agents: Vec<Agent>,
        registry: Arc<ToolRegistry>,
        store: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            supervisor: Supervisor::new(supervisor_model, policy, &agents),
            agents,
            registry,
            executor: ToolExecutor::new(30),
            store,
            locks: SessionLocks::new(),
            config: OrchestratorConfig::default(),
        }
    }

    pub fn with_executor(mut self, executor: ToolExecutor) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn agents(&self) -> &[Agent] {
        &self.agents
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// 读取会话历史（未见过的 session 返回空）
    pub async fn history(&self, session_id: &str) -> Result<Vec<Message>, TurnError> {
        Ok(self.store.load(session_id).await?)
    }

    /// 处理一条用户消息（不可取消、无事件）
    pub async fn run_turn(&self, session_id: &str, text: &str) -> Result<TurnResult, TurnError> {
        self.run_turn_with(session_id, text, &CancellationToken::new(), &None)
            .await
    }

    /// 处理一条用户消息；cancel 触发时在下一个挂起点返回 Cancelled，历史不写回
    pub async fn run_turn_with(
        &self,
        session_id: &str,
        text: &str,
        cancel: &CancellationToken,
        events: &EventSink,
    ) -> Result<TurnResult, TurnError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(TurnError::EmptyInput);
        }

        let _guard = tokio::select! {
            g = self.locks.acquire(session_id) => g,
            _ = cancel.cancelled() => return Err(TurnError::Cancelled),
        };

        let mut messages = self.store.load(session_id).await?;
        let prior_len = messages.len();
        messages.push(Message::user(text));
        tracing::info!(session = %session_id, prior_messages = prior_len, "turn started");

        let agent_loop = AgentLoop {
            registry: &self.registry,
            executor: &self.executor,
            limits: LoopLimits {
                max_steps: self.config.max_agent_steps,
                max_tool_retries: self.config.max_tool_retries,
            },
            cancel,
            events,
        };
        let mut ledger = AgentRetryLedger::new(self.config.max_agent_retries);
        let mut handoffs = 0;
        let mut agents_run: Vec<String> = Vec::new();
        // 最近一次成功运行的 (Agent, 输出)
        let mut last_output: Option<(String, String)> = None;

        let (response, agent, stop_reason) = loop {
            if cancel.is_cancelled() {
                return Err(TurnError::Cancelled);
            }
            let decision = tokio::select! {
                d = self.supervisor.decide(&messages) => d,
                _ = cancel.cancelled() => return Err(TurnError::Cancelled),
            }
            .map_err(TurnError::Supervisor)?;

            let SupervisorDecision {
                route,
                message,
                call,
                ignored,
            } = decision;
            messages.push(message);

            match route {
                RouteDecision::Done(content) => {
                    answer_ignored(&mut messages, &ignored);
                    // Supervisor 不给出文本时，以最后一个 Agent 的输出作为回复
                    let (response, agent) = match last_output.take() {
                        Some((agent, output)) if content.trim().is_empty() => (output, agent),
                        _ => (content, SUPERVISOR_NAME.to_string()),
                    };
                    break (response, agent, StopReason::Completed);
                }
                RouteDecision::AskUser(question) => {
                    answer_call(&mut messages, call.as_ref(), "Question sent to the user.");
                    answer_ignored(&mut messages, &ignored);
                    messages.push(Message::assistant(&question).with_name(SUPERVISOR_NAME));
                    emit(
                        events,
                        TurnEvent::AskUser {
                            question: question.clone(),
                        },
                    );
                    break (question, SUPERVISOR_NAME.to_string(), StopReason::AskUser);
                }
                RouteDecision::Agent(name) => {
                    // 上限只约束「再一次」交接；最后一次运行之后 Supervisor 仍可 Done / AskUser
                    if handoffs >= self.config.max_handoffs {
                        tracing::warn!(session = %session_id, handoffs, agent = %name, "handoff limit reached");
                        answer_call(
                            &mut messages,
                            call.as_ref(),
                            &format!(
                                "Error: hand-off limit of {} reached; no further agents will run in this turn.",
                                self.config.max_handoffs
                            ),
                        );
                        answer_ignored(&mut messages, &ignored);
                        let (response, agent) = match last_output.take() {
                            Some((agent, output)) if !output.trim().is_empty() => (output, agent),
                            _ => {
                                let note = format!(
                                    "I could not complete this request within {} agent hand-offs.",
                                    self.config.max_handoffs
                                );
                                messages.push(Message::assistant(&note).with_name(SUPERVISOR_NAME));
                                (note, SUPERVISOR_NAME.to_string())
                            }
                        };
                        break (response, agent, StopReason::HandoffLimit);
                    }
                    handoffs += 1;
                    let Some(agent) = self.agents.iter().find(|a| a.name == name) else {
                        tracing::warn!(session = %session_id, agent = %name, "supervisor chose an unknown agent");
                        let available = self
                            .agents
                            .iter()
                            .map(|a| a.name.as_str())
                            .collect::<Vec<_>>()
                            .join(", ");
                        answer_call(
                            &mut messages,
                            call.as_ref(),
                            &format!("Error: unknown agent `{}`. Available agents: {}", name, available),
                        );
                        answer_ignored(&mut messages, &ignored);
                        continue;
                    };
                    if ledger.is_exhausted(&name) {
                        tracing::warn!(session = %session_id, agent = %name, "agent retry budget exhausted");
                        answer_call(
                            &mut messages,
                            call.as_ref(),
                            &format!(
                                "Error: agent `{}` already failed {} times in this turn; choose a different agent or finish and explain the failure.",
                                name,
                                ledger.failures(&name)
                            ),
                        );
                        answer_ignored(&mut messages, &ignored);
                        continue;
                    }

                    answer_call(&mut messages, call.as_ref(), &format!("Transferred to {}", name));
                    answer_ignored(&mut messages, &ignored);
                    tracing::info!(session = %session_id, agent = %name, handoff = handoffs, "handing off");
                    emit(
                        events,
                        TurnEvent::Routed {
                            agent: name.clone(),
                            handoff: handoffs,
                        },
                    );

                    let run = agent_loop.run(agent, &messages).await?;
                    agents_run.push(name.clone());
                    if run.is_failure() {
                        let failures = ledger.record_failure(&name);
                        tracing::warn!(session = %session_id, agent = %name, failures, outcome = ?run.outcome, "agent run failed");
                    } else {
                        ledger.record_success(&name);
                        last_output = Some((name.clone(), run.output().to_string()));
                    }
                    messages.extend(run.messages);
                }
            }
        };

        self.store.save(session_id, &messages).await?;

        emit(
            events,
            TurnEvent::TurnDone {
                agent: agent.clone(),
                stop_reason,
            },
        );
        tracing::info!(
            session = %session_id,
            agent = %agent,
            handoffs,
            stop_reason = stop_reason.as_str(),
            new_messages = messages.len() - prior_len,
            "turn finished"
        );

        Ok(TurnResult {
            response,
            agent,
            messages,
            metadata: TurnMetadata {
                session_id: session_id.to_string(),
                handoffs,
                stop_reason,
                agents: agents_run,
            },
        })
    }
}

/// 回应 Supervisor 采纳的工具调用
fn answer_call(messages: &mut Vec<Message>, call: Option<&ToolCall>, content: &str) {
    if let Some(c) = call {
        messages.push(Message::tool_result(&c.id, &c.name, content));
    }
}

/// 每个被忽略的调用也要有结果，否则历史里存在悬空的 call id
fn answer_ignored(messages: &mut Vec<Message>, ignored: &[ToolCall]) {
    for c in ignored {
        messages.push(Message::tool_result(
            &c.id,
            &c.name,
            "Ignored: only one routing action is taken per decision.",
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::ToolScope;
    use crate::core::supervisor::{ASK_USER_TOOL, HANDOFF_PREFIX};
    use crate::llm::{LlmError, ScriptedLlmClient};
    use crate::memory::InMemoryCheckpointStore;
    use serde_json::json;

    fn handoff(id: &str, agent: &str) -> Message {
        Message::assistant_with_calls(
            "",
            vec![ToolCall::new(id, format!("{}{}", HANDOFF_PREFIX, agent), json!({}))],
        )
    }

    struct Fixture {
        orchestrator: Orchestrator,
        supervisor: Arc<ScriptedLlmClient>,
        worker: Arc<ScriptedLlmClient>,
        store: Arc<InMemoryCheckpointStore>,
    }

    fn fixture(config: OrchestratorConfig) -> Fixture {
        let supervisor = Arc::new(ScriptedLlmClient::default());
        let worker = Arc::new(ScriptedLlmClient::default());
        let store = Arc::new(InMemoryCheckpointStore::new());
        let agents = vec![Agent::new("worker", worker.clone()).with_scope(ToolScope::NoTools)];
        let orchestrator = Orchestrator::new(
            supervisor.clone(),
            "policy",
            agents,
            Arc::new(ToolRegistry::new()),
            store.clone(),
        )
        .with_config(config);
        Fixture {
            orchestrator,
            supervisor,
            worker,
            store,
        }
    }

    #[tokio::test]
    async fn test_handoff_then_done() {
        let f = fixture(OrchestratorConfig::default());
        f.supervisor.push(Ok(handoff("h1", "worker")));
        f.supervisor.push(Ok(Message::assistant("")));
        f.worker.push(Ok(Message::assistant("42")));

        let result = f.orchestrator.run_turn("s1", "what is six times seven").await.unwrap();
        assert_eq!(result.response, "42");
        assert_eq!(result.agent, "worker");
        assert_eq!(result.metadata.handoffs, 1);
        assert_eq!(result.metadata.agents, vec!["worker"]);
        assert_eq!(result.metadata.stop_reason, StopReason::Completed);

        let saved = f.store.load("s1").await.unwrap();
        assert_eq!(saved, result.messages);
        assert_eq!(saved[0], Message::user("what is six times seven"));
        assert_eq!(saved[2].tool_call_id.as_deref(), Some("h1"));
        assert_eq!(saved[2].content, "Transferred to worker");
        assert_eq!(saved[3].name.as_deref(), Some("worker"));
    }

    #[tokio::test]
    async fn test_ask_user_ends_turn() {
        let f = fixture(OrchestratorConfig::default());
        f.supervisor.push(Ok(Message::assistant_with_calls(
            "",
            vec![ToolCall::new("q1", ASK_USER_TOOL, json!({"question": "Which region?"}))],
        )));
        let result = f.orchestrator.run_turn("s1", "sales report").await.unwrap();
        assert_eq!(result.response, "Which region?");
        assert_eq!(result.metadata.stop_reason, StopReason::AskUser);
        assert_eq!(result.messages.last().map(|m| m.content.as_str()), Some("Which region?"));
        assert_eq!(f.worker.call_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_agent_is_reported_back() {
        let f = fixture(OrchestratorConfig::default());
        f.supervisor.push(Ok(handoff("h1", "ghost")));
        f.supervisor.push(Ok(Message::assistant("Sorry, no agent fits.")));
        let result = f.orchestrator.run_turn("s1", "hi").await.unwrap();
        assert_eq!(result.response, "Sorry, no agent fits.");
        assert!(result.messages[2].content.contains("unknown agent `ghost`"));
        assert!(result.messages[2].content.contains("worker"));
        let second = &f.supervisor.calls()[1];
        assert_eq!(second.messages.last(), Some(&result.messages[2]));
    }

    #[tokio::test]
    async fn test_handoff_limit() {
        let f = fixture(OrchestratorConfig {
            max_handoffs: 2,
            ..OrchestratorConfig::default()
        });
        for i in 0..5 {
            f.supervisor.push(Ok(handoff(&format!("h{}", i), "worker")));
        }
        f.worker.push(Ok(Message::assistant("partial one")));
        f.worker.push(Ok(Message::assistant("partial two")));

        let result = f.orchestrator.run_turn("s1", "loop").await.unwrap();
        assert_eq!(result.metadata.stop_reason, StopReason::HandoffLimit);
        assert_eq!(result.metadata.handoffs, 2);
        assert_eq!(result.response, "partial two");
        assert_eq!(result.agent, "worker");
        assert_eq!(f.supervisor.call_count(), 3);
        assert_eq!(f.worker.call_count(), 2);
        // 超出上限的交接请求也得到回应
        assert!(result
            .messages
            .iter()
            .any(|m| m.tool_call_id.as_deref() == Some("h2") && m.content.contains("hand-off limit of 2")));
        assert_eq!(f.store.load("s1").await.unwrap(), result.messages);
    }

    #[tokio::test]
    async fn test_exactly_max_handoffs_then_done() {
        let f = fixture(OrchestratorConfig {
            max_handoffs: 1,
            ..OrchestratorConfig::default()
        });
        f.supervisor.push(Ok(handoff("h1", "worker")));
        f.supervisor.push(Ok(Message::assistant("Final summary: 42")));
        f.worker.push(Ok(Message::assistant("raw 42")));

        let result = f.orchestrator.run_turn("s1", "sum it up").await.unwrap();
        assert_eq!(result.metadata.stop_reason, StopReason::Completed);
        assert_eq!(result.response, "Final summary: 42");
        assert_eq!(result.agent, SUPERVISOR_NAME);
        assert_eq!(result.metadata.handoffs, 1);
        assert_eq!(f.supervisor.call_count(), 2);
    }

    #[tokio::test]
    async fn test_handoff_limit_without_output_adds_note() {
        let f = fixture(OrchestratorConfig {
            max_handoffs: 1,
            ..OrchestratorConfig::default()
        });
        f.supervisor.push(Ok(handoff("h1", "ghost")));
        f.supervisor.push(Ok(handoff("h2", "ghost")));

        let result = f.orchestrator.run_turn("s1", "anyone?").await.unwrap();
        assert_eq!(result.metadata.stop_reason, StopReason::HandoffLimit);
        assert_eq!(result.agent, SUPERVISOR_NAME);
        assert_eq!(
            result.response,
            "I could not complete this request within 1 agent hand-offs."
        );
        assert_eq!(f.worker.call_count(), 0);
    }

    #[tokio::test]
    async fn test_exhausted_agent_rejected() {
        let f = fixture(OrchestratorConfig {
            max_agent_retries: 0,
            max_agent_steps: 1,
            ..OrchestratorConfig::default()
        });
        f.supervisor.push(Ok(handoff("h1", "worker")));
        f.supervisor.push(Ok(handoff("h2", "worker")));
        f.supervisor.push(Ok(Message::assistant("Giving up.")));
        // 单步上限内仍请求工具：本次运行失败
        f.worker.push(Ok(Message::assistant_with_calls(
            "",
            vec![ToolCall::new("t1", "missing", json!({}))],
        )));

        let result = f.orchestrator.run_turn("s1", "try").await.unwrap();
        assert_eq!(result.response, "Giving up.");
        assert_eq!(f.worker.call_count(), 1);
        assert!(result
            .messages
            .iter()
            .any(|m| m.tool_call_id.as_deref() == Some("h2") && m.content.contains("already failed")));
    }

    #[tokio::test]
    async fn test_supervisor_error_not_persisted() {
        let f = fixture(OrchestratorConfig::default());
        f.supervisor.push(Err(LlmError::Unavailable("down".into())));
        let err = f.orchestrator.run_turn("s1", "hello").await.unwrap_err();
        assert!(matches!(err, TurnError::Supervisor(_)));
        assert!(f.store.is_empty().await);
    }

    #[tokio::test]
    async fn test_empty_input_rejected() {
        let f = fixture(OrchestratorConfig::default());
        let err = f.orchestrator.run_turn("s1", "   ").await.unwrap_err();
        assert!(matches!(err, TurnError::EmptyInput));
        assert_eq!(f.supervisor.call_count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_turn_leaves_history() {
        let f = fixture(OrchestratorConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = f
            .orchestrator
            .run_turn_with("s1", "hello", &cancel, &None)
            .await
            .unwrap_err();
        assert!(matches!(err, TurnError::Cancelled));
        assert!(f.store.is_empty().await);
    }

    #[tokio::test]
    async fn test_events_streamed() {
        let f = fixture(OrchestratorConfig::default());
        f.supervisor.push(Ok(handoff("h1", "worker")));
        f.supervisor.push(Ok(Message::assistant("done")));
        f.worker.push(Ok(Message::assistant("ok")));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        f.orchestrator
            .run_turn_with("s1", "go", &CancellationToken::new(), &Some(tx))
            .await
            .unwrap();
        let mut kinds = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            kinds.push(serde_json::to_value(ev).unwrap()["type"].as_str().unwrap_or("").to_string());
        }
        assert_eq!(kinds, vec!["routed", "thinking", "turn_done"]);
    }
}
