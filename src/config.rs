//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__LLM__MODEL=gpt-4o`）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::core::OrchestratorConfig;
use crate::mcp::{ProviderEndpoint, ProviderTransport};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub tools: ToolsSection,
    pub mcp: McpSection,
    pub orchestrator: OrchestratorSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 持久化检查点的 SQLite 文件；未设置时使用内存存储
    pub session_db: Option<PathBuf>,
}

/// [llm] 段：后端选择、超时与重试
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// openai / local / mock
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    /// 读取 API Key 的环境变量名
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
    #[serde(default)]
    pub retry: LlmRetrySection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            api_key_env: default_api_key_env(),
            temperature: 0.0,
            timeouts: LlmTimeoutsSection::default(),
            retry: LlmRetrySection::default(),
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    #[serde(default = "default_request_timeout")]
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
        }
    }
}

fn default_request_timeout() -> u64 {
    60
}

/// [llm.retry] 段：瞬时错误重试
#[derive(Debug, Clone, Deserialize)]
pub struct LlmRetrySection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

impl Default for LlmRetrySection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

fn default_max_retries() -> u32 {
    2
}

fn default_base_delay_ms() -> u64 {
    500
}

/// [tools] 段
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    /// 知识库检索返回条数
    #[serde(default = "default_retrieval_top_k")]
    pub retrieval_top_k: usize,
    #[serde(default)]
    pub web_search: WebSearchSection,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: default_tool_timeout_secs(),
            retrieval_top_k: default_retrieval_top_k(),
            web_search: WebSearchSection::default(),
        }
    }
}

fn default_tool_timeout_secs() -> u64 {
    30
}

fn default_retrieval_top_k() -> usize {
    3
}

/// [tools.web_search] 段
#[derive(Debug, Clone, Deserialize)]
pub struct WebSearchSection {
    #[serde(default = "default_search_timeout_secs")]
    pub timeout_secs: u64,
    /// 读取 Tavily Key 的环境变量名；未设置该变量时只用 DuckDuckGo
    #[serde(default = "default_tavily_key_env")]
    pub tavily_api_key_env: String,
}

impl Default for WebSearchSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_search_timeout_secs(),
            tavily_api_key_env: default_tavily_key_env(),
        }
    }
}

fn default_search_timeout_secs() -> u64 {
    15
}

fn default_tavily_key_env() -> String {
    "TAVILY_API_KEY".to_string()
}

/// [mcp] 段：外部工具提供方
#[derive(Debug, Clone, Deserialize)]
pub struct McpSection {
    /// 单个提供方握手 + 列工具的超时（秒）
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    /// 关闭时每个清理任务（断开提供方、关闭存储）的超时（秒）
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    #[serde(default)]
    pub servers: Vec<McpServerEntry>,
}

impl Default for McpSection {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: default_handshake_timeout_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            servers: Vec::new(),
        }
    }
}

fn default_shutdown_timeout_secs() -> u64 {
    5
}

fn default_handshake_timeout_secs() -> u64 {
    30
}

/// [[mcp.servers]]：`url = "..."` 或 `command = "..."` + `args = [...]`
#[derive(Debug, Clone, Deserialize)]
pub struct McpServerEntry {
    pub name: Option<String>,
    #[serde(flatten)]
    pub transport: ProviderTransport,
}

impl McpServerEntry {
    pub fn endpoint(&self) -> ProviderEndpoint {
        let endpoint = match &self.transport {
            ProviderTransport::StreamableHttp { url } => ProviderEndpoint::http(url.clone()),
            ProviderTransport::Stdio { command, args } => {
                ProviderEndpoint::stdio(command.clone(), args.clone())
            }
        };
        match &self.name {
            Some(name) => endpoint.named(name.clone()),
            None => endpoint,
        }
    }
}

impl McpSection {
    pub fn endpoints(&self) -> Vec<ProviderEndpoint> {
        self.servers.iter().map(McpServerEntry::endpoint).collect()
    }
}

/// [orchestrator] 段
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorSection {
    #[serde(default = "default_max_handoffs")]
    pub max_handoffs: usize,
    #[serde(default = "default_max_agent_steps")]
    pub max_agent_steps: usize,
    #[serde(default = "default_max_tool_retries")]
    pub max_tool_retries: u32,
    #[serde(default = "default_max_agent_retries")]
    pub max_agent_retries: u32,
    /// Supervisor 策略文档路径；未设置时查找 config/prompts/supervisor.md
    pub supervisor_prompt: Option<PathBuf>,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_handoffs: default_max_handoffs(),
            max_agent_steps: default_max_agent_steps(),
            max_tool_retries: default_max_tool_retries(),
            max_agent_retries: default_max_agent_retries(),
            supervisor_prompt: None,
        }
    }
}

fn default_max_handoffs() -> usize {
    6
}

fn default_max_agent_steps() -> usize {
    10
}

fn default_max_tool_retries() -> u32 {
    2
}

fn default_max_agent_retries() -> u32 {
    2
}

impl OrchestratorSection {
    pub fn limits(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_handoffs: self.max_handoffs,
            max_agent_steps: self.max_agent_steps,
            max_tool_retries: self.max_tool_retries,
            max_agent_retries: self.max_agent_retries,
        }
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default"] {
        if std::path::Path::new(&format!("{}.toml", name)).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}
