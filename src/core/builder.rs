//! 运行时构建：从 AppConfig 组装 LLM、工具注册表、外部工具连接、Agent 名册、检查点存储与编排器
//!
//! CLI 与测试共用同一套组装逻辑；外部提供方连接失败只记录，不影响启动。

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::agent::default_roster;
use crate::config::AppConfig;
use crate::core::{Orchestrator, DEFAULT_POLICY};
use crate::llm::{LlmClient, MockLlmClient, OpenAiClient, RetryConfig, RetryingLlmClient};
use crate::mcp::{ConnectionManager, RmcpConnector};
use crate::memory::{CheckpointStore, InMemoryCheckpointStore, InMemoryRetriever, Retriever};
use crate::tools::{KnowledgeSearchTool, ToolExecutor, ToolRegistry, WebSearchTool};

/// 本地 OpenAI 兼容服务（vLLM / Ollama）默认地址
const LOCAL_BASE_URL: &str = "http://localhost:8000/v1";

/// 构建完成的运行时
pub struct Runtime {
    pub orchestrator: Arc<Orchestrator>,
    pub connections: Arc<ConnectionManager>,
    pub retriever: Arc<dyn Retriever>,
    pub store: Arc<dyn CheckpointStore>,
}

/// 根据配置与环境变量选择 LLM 后端（OpenAI 兼容 / 本地 / Mock），外层包一层重试
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    let api_key = std::env::var(&cfg.llm.api_key_env)
        .ok()
        .filter(|k| !k.trim().is_empty());

    let inner: Arc<dyn LlmClient> = match (provider.as_str(), api_key) {
        ("mock", _) => {
            tracing::info!("Using Mock LLM");
            Arc::new(MockLlmClient)
        }
        ("local", key) => {
            let base = cfg.llm.base_url.as_deref().unwrap_or(LOCAL_BASE_URL);
            tracing::info!("Using local LLM {} at {}", cfg.llm.model, base);
            Arc::new(
                OpenAiClient::new(Some(base), &cfg.llm.model, Some(key.as_deref().unwrap_or("EMPTY")))
                    .with_temperature(cfg.llm.temperature)
                    .with_timeout(cfg.llm.timeouts.request),
            )
        }
        (_, Some(key)) => {
            tracing::info!("Using OpenAI-compatible LLM ({})", cfg.llm.model);
            Arc::new(
                OpenAiClient::new(cfg.llm.base_url.as_deref(), &cfg.llm.model, Some(&key))
                    .with_temperature(cfg.llm.temperature)
                    .with_timeout(cfg.llm.timeouts.request),
            )
        }
        (_, None) => {
            tracing::warn!(
                "{} not set, using Mock LLM",
                cfg.llm.api_key_env
            );
            Arc::new(MockLlmClient)
        }
    };

    Arc::new(RetryingLlmClient::new(
        inner,
        RetryConfig {
            max_retries: cfg.llm.retry.max_retries,
            base_delay_ms: cfg.llm.retry.base_delay_ms,
        },
    ))
}

/// Supervisor 策略文档：配置路径 > config/prompts/supervisor.md > 内置策略
pub fn load_supervisor_policy(cfg: &AppConfig) -> String {
    if let Some(path) = &cfg.orchestrator.supervisor_prompt {
        match std::fs::read_to_string(path) {
            Ok(text) => return text,
            Err(e) => tracing::warn!("Supervisor prompt {} unreadable ({}), using default", path.display(), e),
        }
    }
    ["config/prompts/supervisor.md", "../config/prompts/supervisor.md"]
        .into_iter()
        .find_map(|p| std::fs::read_to_string(p).ok())
        .unwrap_or_else(|| DEFAULT_POLICY.to_string())
}

async fn create_store(cfg: &AppConfig) -> Arc<dyn CheckpointStore> {
    #[cfg(feature = "async-sqlite")]
    {
        if let Some(path) = &cfg.app.session_db {
            match crate::memory::SqliteCheckpointStore::open(path).await {
                Ok(store) => {
                    tracing::info!("Session checkpoints stored in {}", path.display());
                    return Arc::new(store);
                }
                Err(e) => tracing::warn!("Session db {} unavailable ({}), using in-memory store", path.display(), e),
            }
        }
    }
    #[cfg(not(feature = "async-sqlite"))]
    {
        if cfg.app.session_db.is_some() {
            tracing::warn!("session_db configured but built without `async-sqlite`, using in-memory store");
        }
    }
    Arc::new(InMemoryCheckpointStore::new())
}

/// 组装完整运行时；retriever 由调用方提供（None 时使用内存检索器）
pub async fn build_runtime(cfg: &AppConfig, retriever: Option<Arc<dyn Retriever>>) -> Runtime {
    let llm = create_llm_from_config(cfg);
    let retriever = retriever.unwrap_or_else(|| Arc::new(InMemoryRetriever::default()) as Arc<dyn Retriever>);

    let connections = Arc::new(
        ConnectionManager::new(Arc::new(RmcpConnector::new()), cfg.mcp.endpoints())
            .with_connect_timeout(Duration::from_secs(cfg.mcp.handshake_timeout_secs)),
    );
    let summary = connections.initialize().await;
    tracing::info!(
        "External tools: {} from {} provider(s), {} failed",
        summary.tool_count(),
        summary.connected.len(),
        summary.failed.len()
    );

    let tavily_key = std::env::var(&cfg.tools.web_search.tavily_api_key_env)
        .ok()
        .filter(|k| !k.trim().is_empty());
    let mut registry = ToolRegistry::new();
    registry.register(KnowledgeSearchTool::new(retriever.clone(), cfg.tools.retrieval_top_k));
    registry.register(WebSearchTool::from_env_key(tavily_key, cfg.tools.web_search.timeout_secs));
    let registry = Arc::new(registry.with_external(connections.clone()));

    let policy = load_supervisor_policy(cfg);
    let agents = default_roster(llm.clone());
    let store = create_store(cfg).await;

    let orchestrator = Orchestrator::new(llm, policy, agents, registry, store.clone())
        .with_executor(ToolExecutor::new(cfg.tools.tool_timeout_secs))
        .with_config(cfg.orchestrator.limits());

    Runtime {
        orchestrator: Arc::new(orchestrator),
        connections,
        retriever,
        store,
    }
}

/// 从文件读取纯文本文档并加入检索器（每段以空行分隔）
pub async fn ingest_text_file(retriever: &dyn Retriever, path: &Path) -> anyhow::Result<usize> {
    let text = tokio::fs::read_to_string(path).await?;
    let source = path.display().to_string();
    let docs: Vec<_> = text
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| crate::memory::Document::new(p).with_source(&source))
        .collect();
    let count = docs.len();
    retriever.add_documents(docs).await?;
    Ok(count)
}
