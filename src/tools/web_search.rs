//! Web 搜索工具 web_search
//!
//! 按顺序尝试多个搜索后端：配置了 Tavily Key 时先走 Tavily，失败或未配置时回退到 DuckDuckGo（HTML 版，无需 Key）。
//! 结果条数限制在 1..=10；无结果时返回 "No results found for: <query>"；所有后端都失败才报 ToolInvocationError。

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::core::{ToolError, ToolInvocationError, ValidationError};
use crate::tools::{schema_of, Tool, ValidatedArgs};

pub const WEB_SEARCH_TOOL_NAME: &str = "web_search";

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

#[allow(dead_code)]
#[derive(Debug, Deserialize, JsonSchema)]
struct WebSearchInput {
    /// The search query to find information on the web.
    query: String,
    /// Maximum number of search results to return (1-10). Defaults to 5.
    max_results: Option<i64>,
}

/// 单条搜索结果
#[derive(Clone, Debug, PartialEq)]
pub struct SearchHit {
    pub title: String,
    pub snippet: String,
    pub url: String,
    /// 后端给出的相关度（Tavily）
    pub score: Option<f64>,
}

/// 搜索后端
#[async_trait]
pub trait SearchBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchHit>, String>;
}

fn http_client(timeout_secs: u64) -> Client {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs.max(1)))
        .user_agent(USER_AGENT)
        .build()
        .unwrap_or_default()
}

/// Tavily API 后端
pub struct TavilyBackend {
    client: Client,
    api_key: String,
}

impl TavilyBackend {
    pub fn new(api_key: impl Into<String>, timeout_secs: u64) -> Self {
        Self {
            client: http_client(timeout_secs),
            api_key: api_key.into(),
        }
    }
}

#[derive(Deserialize)]
struct TavilyResponse {
    #[serde(default)]
    results: Vec<TavilyResult>,
}

#[derive(Deserialize)]
struct TavilyResult {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    score: Option<f64>,
}

#[async_trait]
impl SearchBackend for TavilyBackend {
    fn name(&self) -> &str {
        "Tavily"
    }

    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchHit>, String> {
        let resp = self
            .client
            .post("https://api.tavily.com/search")
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "api_key": self.api_key,
                "query": query,
                "max_results": max_results,
            }))
            .send()
            .await
            .map_err(|e| format!("Request failed: {}", e))?;
        if !resp.status().is_success() {
            return Err(format!("HTTP {}", resp.status()));
        }
        let body: TavilyResponse = resp
            .json()
            .await
            .map_err(|e| format!("Invalid response: {}", e))?;
        Ok(body
            .results
            .into_iter()
            .take(max_results)
            .map(|r| SearchHit {
                title: r.title,
                snippet: r.content,
                url: r.url,
                score: r.score,
            })
            .collect())
    }
}

/// DuckDuckGo HTML 后端（无需 Key）
pub struct DuckDuckGoBackend {
    client: Client,
}

impl DuckDuckGoBackend {
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            client: http_client(timeout_secs),
        }
    }
}

/// 片段 HTML 转纯文本（html2text 失败时退回去标签）
fn fragment_text(html: &str) -> String {
    let text = html2text::from_read(html.as_bytes(), 10_000)
        .unwrap_or_else(|_| html.replace(['<', '>'], " "));
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// DuckDuckGo 跳转链接（//duckduckgo.com/l/?uddg=<encoded>）还原为目标 URL
fn resolve_ddg_href(href: &str) -> String {
    let href = href.replace("&amp;", "&");
    let absolute = if href.starts_with("//") {
        format!("https:{}", href)
    } else {
        href.clone()
    };
    reqwest::Url::parse(&absolute)
        .ok()
        .and_then(|u| {
            u.query_pairs()
                .find(|(k, _)| k == "uddg")
                .map(|(_, v)| v.into_owned())
        })
        .unwrap_or(href)
}

static DDG_LINK_RE: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
static DDG_SNIPPET_RE: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();

/// 取（首次编译后缓存的）正则
fn cached_regex(
    cell: &'static OnceLock<Result<Regex, regex::Error>>,
    pattern: &str,
) -> Result<&'static Regex, String> {
    cell.get_or_init(|| Regex::new(pattern))
        .as_ref()
        .map_err(|e| e.to_string())
}

/// 解析 DuckDuckGo HTML 结果页
pub fn parse_duckduckgo_html(html: &str, max_results: usize) -> Result<Vec<SearchHit>, String> {
    let link_re = cached_regex(
        &DDG_LINK_RE,
        r#"(?s)<a[^>]*class="result__a"[^>]*href="([^"]*)"[^>]*>(.*?)</a>"#,
    )?;
    let snippet_re = cached_regex(&DDG_SNIPPET_RE, r#"(?s)class="result__snippet"[^>]*>(.*?)</a>"#)?;

    let snippets: Vec<String> = snippet_re
        .captures_iter(html)
        .map(|c| fragment_text(&c[1]))
        .collect();

    Ok(link_re
        .captures_iter(html)
        .enumerate()
        .take(max_results)
        .map(|(i, c)| SearchHit {
            title: fragment_text(&c[2]),
            snippet: snippets.get(i).cloned().unwrap_or_default(),
            url: resolve_ddg_href(&c[1]),
            score: None,
        })
        .collect())
}

#[async_trait]
impl SearchBackend for DuckDuckGoBackend {
    fn name(&self) -> &str {
        "DuckDuckGo"
    }

    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchHit>, String> {
        let resp = self
            .client
            .get("https://html.duckduckgo.com/html/")
            .query(&[("q", query)])
            .send()
            .await
            .map_err(|e| format!("Request failed: {}", e))?;
        if !resp.status().is_success() {
            return Err(format!("HTTP {}", resp.status()));
        }
        let body = resp.text().await.map_err(|e| format!("Read body: {}", e))?;
        parse_duckduckgo_html(&body, max_results)
    }
}

/// 格式化结果列表
fn format_hits(backend: &str, query: &str, hits: &[SearchHit]) -> String {
    if hits.is_empty() {
        return format!("No results found for: {}", query);
    }
    let items = hits
        .iter()
        .enumerate()
        .map(|(i, h)| {
            let title = if h.title.is_empty() { "No title" } else { &h.title };
            let snippet = if h.snippet.is_empty() { "No description" } else { &h.snippet };
            match h.score {
                Some(score) => format!(
                    "{}. **{}** (relevance: {:.2})\n   {}\n   URL: {}",
                    i + 1,
                    title,
                    score,
                    snippet,
                    h.url
                ),
                None => format!("{}. **{}**\n   {}\n   URL: {}", i + 1, title, snippet, h.url),
            }
        })
        .collect::<Vec<_>>()
        .join("\n\n");
    format!("[{} Search Results for: {}]\n\n{}", backend, query, items)
}

/// Web 搜索工具：按顺序尝试后端，第一个成功的后端结果即为输出
pub struct WebSearchTool {
    backends: Vec<Arc<dyn SearchBackend>>,
}

impl WebSearchTool {
    pub fn new(backends: Vec<Arc<dyn SearchBackend>>) -> Self {
        Self { backends }
    }

    /// Tavily（若有 Key）→ DuckDuckGo
    pub fn from_env_key(tavily_api_key: Option<String>, timeout_secs: u64) -> Self {
        let mut backends: Vec<Arc<dyn SearchBackend>> = Vec::new();
        if let Some(key) = tavily_api_key.filter(|k| !k.trim().is_empty()) {
            backends.push(Arc::new(TavilyBackend::new(key, timeout_secs)));
        }
        backends.push(Arc::new(DuckDuckGoBackend::new(timeout_secs)));
        Self::new(backends)
    }

    pub fn backend_names(&self) -> Vec<String> {
        self.backends.iter().map(|b| b.name().to_string()).collect()
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        WEB_SEARCH_TOOL_NAME
    }

    fn description(&self) -> &str {
        "Use this tool to search the web for current information, news, facts, or any real-time data. Useful for recent events, prices, weather, or anything that might not be in the knowledge base."
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<WebSearchInput>()
    }

    async fn execute(&self, args: ValidatedArgs) -> Result<String, ToolError> {
        let query = args.get_str("query").unwrap_or("").trim().to_string();
        if query.is_empty() {
            return Err(ValidationError::new("query", "must not be empty").into());
        }
        let max_results = args.get_i64("max_results").unwrap_or(5).clamp(1, 10) as usize;

        let mut failures: Vec<String> = Vec::new();
        for backend in &self.backends {
            match backend.search(&query, max_results).await {
                Ok(hits) => {
                    let out = format_hits(backend.name(), &query, &hits);
                    if failures.is_empty() {
                        return Ok(out);
                    }
                    return Ok(format!(
                        "[{} failed, using {} fallback]\n\n{}",
                        failures.join(", "),
                        backend.name(),
                        out
                    ));
                }
                Err(e) => {
                    tracing::warn!(backend = backend.name(), error = %e, "web search backend failed");
                    failures.push(backend.name().to_string());
                }
            }
        }
        Err(ToolInvocationError::new(
            WEB_SEARCH_TOOL_NAME,
            format!("all search backends failed ({})", failures.join(", ")),
        )
        .into())
    }
}
