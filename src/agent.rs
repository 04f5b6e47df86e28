//! Agent 定义与默认名册
//!
//! Agent = {名称, 名册描述, 系统指令, 可用工具范围, 模型}，每次构建图时创建一次，之后不可变、跨 Turn 复用。
//! 名册描述（角色 / 输入 / 输出 / 工具 / 约束 / 失败条件）是 Supervisor 路由时看到的唯一信息。

use std::sync::Arc;

use crate::llm::LlmClient;
use crate::tools::{ToolDescriptor, ToolSnapshot, KNOWLEDGE_TOOL_NAME, WEB_SEARCH_TOOL_NAME};

pub const RAG_AGENT: &str = "rag_agent";
pub const EXTERNAL_AGENT: &str = "external_agent";
pub const INTERNAL_AGENT: &str = "internal_agent";

/// Agent 可调用的工具范围
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ToolScope {
    /// 指定名称的工具（不存在的名称被忽略）
    Named(Vec<String>),
    /// 所有已连接外部提供方的工具
    ExternalProviders,
    /// 不调用工具，只靠模型推理
    NoTools,
}

impl ToolScope {
    pub fn named<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ToolScope::Named(names.into_iter().map(Into::into).collect())
    }

    /// 在当前工具快照中解析出本 Agent 可用的工具
    pub fn resolve(&self, snapshot: &ToolSnapshot) -> Vec<ToolDescriptor> {
        match self {
            ToolScope::Named(names) => names
                .iter()
                .filter_map(|n| snapshot.get(n).cloned())
                .collect(),
            ToolScope::ExternalProviders => snapshot.remote().cloned().collect(),
            ToolScope::NoTools => Vec::new(),
        }
    }
}

/// 一个 Agent：构建后不可变
#[derive(Clone)]
pub struct Agent {
    pub name: String,
    /// 名册卡片（供 Supervisor 选择）
    pub description: String,
    /// 系统指令
    pub instructions: String,
    pub scope: ToolScope,
    pub model: Arc<dyn LlmClient>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.name)
            .field("scope", &self.scope)
            .finish()
    }
}

impl Agent {
    pub fn new(name: impl Into<String>, model: Arc<dyn LlmClient>) -> Self {
        let name = name.into();
        Self {
            description: format!("Agent `{}`", name),
            instructions: "You are a helpful assistant.".to_string(),
            scope: ToolScope::NoTools,
            name,
            model,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn with_scope(mut self, scope: ToolScope) -> Self {
        self.scope = scope;
        self
    }

    /// 名册中的一段（markdown）
    pub fn roster_card(&self) -> String {
        format!("### {}\n{}", self.name, self.description.trim())
    }
}

const RAG_CARD: &str = "\
- Role: Internal knowledge search specialist (policies, documents, uploaded files)
- Input: Natural language questions about internal data or company knowledge
- Output: Answer with source references, or a statement that no relevant documents were found
- Tools: search_knowledge_base
- Constraints: Only searches indexed documents; no web access; cannot modify documents
- Fail: No relevant documents found; question outside the knowledge base";

const RAG_INSTRUCTIONS: &str = "\
You are an internal knowledge search specialist.
Answer questions about company policies, project documents and uploaded files.
Use search_knowledge_base only for concrete questions about internal material; do not use it for greetings or general knowledge.
Base your answer on the search results and cite the sources.
If the search finds nothing, say plainly that no relevant documents were found.";

const EXTERNAL_CARD: &str = "\
- Role: External system integration and data visualization specialist
- Input: Chart or diagram requests, or operations on external systems
- Output: Generated visualization or the external system's response
- Tools: every tool exposed by the connected external tool providers
- Constraints: Requires at least one connected provider; cannot search internal documents
- Fail: Remote tool error; provider unavailable; unsupported request type";

const EXTERNAL_INSTRUCTIONS: &str = "\
You are an external integration and data visualization specialist.
Use the tools exposed by the connected providers to interact with external systems and to render charts and diagrams.
Work out the structure of the data before calling a chart tool, and include a title, axis labels and a legend.
Explain the result so the user can understand it. If a tool fails, explain the cause and suggest an alternative.
Do not use tools for small talk. Internal document search is not your job.";

const INTERNAL_CARD: &str = "\
- Role: Data analysis and general processing specialist
- Input: Calculation, analysis, transformation or general task requests
- Output: Processed result with an explanation
- Tools: web_search (current information from the web)
- Constraints: Limited to the data in the conversation plus web search; no internal document search
- Fail: Insufficient data provided; task needs a tool that is not available";

const INTERNAL_INSTRUCTIONS: &str = "\
You are a data analysis and processing specialist.
Handle calculations, transformations and aggregations. Simple analysis can be done directly without tools.
Use web_search only when the task needs current information that is not in the conversation.
Explain results clearly.";

/// 默认名册：rag_agent / external_agent / internal_agent，共用同一个模型
pub fn default_roster(model: Arc<dyn LlmClient>) -> Vec<Agent> {
    vec![
        Agent::new(RAG_AGENT, model.clone())
            .with_description(RAG_CARD)
            .with_instructions(RAG_INSTRUCTIONS)
            .with_scope(ToolScope::named([KNOWLEDGE_TOOL_NAME])),
        Agent::new(EXTERNAL_AGENT, model.clone())
            .with_description(EXTERNAL_CARD)
            .with_instructions(EXTERNAL_INSTRUCTIONS)
            .with_scope(ToolScope::ExternalProviders),
        Agent::new(INTERNAL_AGENT, model)
            .with_description(INTERNAL_CARD)
            .with_instructions(INTERNAL_INSTRUCTIONS)
            .with_scope(ToolScope::named([WEB_SEARCH_TOOL_NAME])),
    ]
}
