//! 外部工具提供方连接（MCP）
//!
//! ProviderConnector 负责建立连接并完成 initialize 握手，返回可并发使用的 ProviderSession；
//! RmcpConnector 为真实实现（Streamable HTTP 或 stdio 子进程），测试可注入假的 Connector。
//! 同一会话上的并发调用由 JSON-RPC 请求 ID 关联，无需额外串行化。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rmcp::model::{
    CallToolRequestParams, ClientCapabilities, InitializeRequestParams, ProtocolVersion, RawContent,
};
use rmcp::service::{serve_client, Peer, RoleClient, RunningService};
use rmcp::transport::child_process::TokioChildProcess;
use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
use rmcp::transport::StreamableHttpClientTransport;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::core::ProviderConnectionError;

/// 提供方传输方式
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProviderTransport {
    /// Streamable HTTP：连接 URL（如 `http://127.0.0.1:8000/mcp`）
    StreamableHttp { url: String },
    /// stdio：启动子进程，stdin/stdout 走 MCP
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

/// 一个已配置的提供方
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderEndpoint {
    /// 标识（日志与 reconnect 使用）；未命名时取 URL 或命令
    pub id: String,
    pub transport: ProviderTransport,
}

impl ProviderEndpoint {
    pub fn http(url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            id: url.clone(),
            transport: ProviderTransport::StreamableHttp { url },
        }
    }

    pub fn stdio(command: impl Into<String>, args: Vec<String>) -> Self {
        let command = command.into();
        Self {
            id: command.clone(),
            transport: ProviderTransport::Stdio { command, args },
        }
    }

    pub fn named(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

/// 提供方声明的工具
#[derive(Clone, Debug, PartialEq)]
pub struct RemoteToolInfo {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// 远程调用结果：文本部分拼接 + 是否标记为错误
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteCallResult {
    pub text: String,
    pub is_error: bool,
}

/// 已握手的提供方会话
#[async_trait]
pub trait ProviderSession: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<RemoteToolInfo>, String>;

    async fn call_tool(&self, name: &str, arguments: Map<String, Value>)
        -> Result<RemoteCallResult, String>;

    /// 关闭连接；重复关闭无副作用
    async fn close(&self) -> Result<(), String>;

    fn is_closed(&self) -> bool;
}

/// 建立连接 + 握手
#[async_trait]
pub trait ProviderConnector: Send + Sync {
    async fn connect(
        &self,
        endpoint: &ProviderEndpoint,
    ) -> Result<Arc<dyn ProviderSession>, ProviderConnectionError>;
}

fn init_params() -> InitializeRequestParams {
    InitializeRequestParams {
        meta: None,
        protocol_version: ProtocolVersion::V_2024_11_05,
        capabilities: ClientCapabilities::default(),
        client_info: rmcp::model::Implementation::from_build_env(),
    }
}

/// rmcp 实现的连接器
#[derive(Debug, Default, Clone)]
pub struct RmcpConnector;

impl RmcpConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProviderConnector for RmcpConnector {
    async fn connect(
        &self,
        endpoint: &ProviderEndpoint,
    ) -> Result<Arc<dyn ProviderSession>, ProviderConnectionError> {
        let fail = |reason: String| ProviderConnectionError::new(&endpoint.id, reason);
        let service = match &endpoint.transport {
            ProviderTransport::StreamableHttp { url } => {
                let http_client = reqwest::Client::builder()
                    .build()
                    .map_err(|e| fail(format!("reqwest client: {e}")))?;
                let transport = StreamableHttpClientTransport::with_client(
                    http_client,
                    StreamableHttpClientTransportConfig::with_uri(url.clone()),
                );
                serve_client(init_params(), transport)
                    .await
                    .map_err(|e| fail(format!("handshake: {e}")))?
            }
            ProviderTransport::Stdio { command, args } => {
                let mut cmd = Command::new(command);
                cmd.args(args)
                    .stdin(std::process::Stdio::piped())
                    .stdout(std::process::Stdio::piped());
                let (transport, _stderr) = TokioChildProcess::builder(cmd)
                    .spawn()
                    .map_err(|e| fail(format!("spawn: {e}")))?;
                serve_client(init_params(), transport)
                    .await
                    .map_err(|e| fail(format!("handshake: {e}")))?
            }
        };
        Ok(Arc::new(RmcpSession::new(service)))
    }
}

/// rmcp 会话：Peer 可克隆并发使用；RunningService 仅在关闭时取出
pub struct RmcpSession {
    peer: Peer<RoleClient>,
    service: Mutex<Option<RunningService<RoleClient, InitializeRequestParams>>>,
    closed: AtomicBool,
}

impl RmcpSession {
    fn new(service: RunningService<RoleClient, InitializeRequestParams>) -> Self {
        Self {
            peer: service.peer().clone(),
            service: Mutex::new(Some(service)),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ProviderSession for RmcpSession {
    async fn list_tools(&self) -> Result<Vec<RemoteToolInfo>, String> {
        let tools = self
            .peer
            .list_all_tools()
            .await
            .map_err(|e| format!("tools/list: {e}"))?;
        Ok(tools
            .into_iter()
            .map(|t| RemoteToolInfo {
                name: t.name.to_string(),
                description: t.description.map(|d| d.to_string()).unwrap_or_default(),
                input_schema: Value::Object(t.input_schema.as_ref().clone()),
            })
            .collect())
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Map<String, Value>,
    ) -> Result<RemoteCallResult, String> {
        if self.is_closed() {
            return Err("provider connection closed".to_string());
        }
        let params = CallToolRequestParams {
            meta: None,
            name: name.to_string().into(),
            arguments: Some(arguments),
            task: None,
        };
        let result = self
            .peer
            .call_tool(params)
            .await
            .map_err(|e| format!("tools/call: {e}"))?;
        let text = result
            .content
            .iter()
            .filter_map(|c| match &c.raw {
                RawContent::Text(t) => Some(t.text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n");
        Ok(RemoteCallResult {
            text,
            is_error: result.is_error.unwrap_or(false),
        })
    }

    async fn close(&self) -> Result<(), String> {
        self.closed.store(true, Ordering::SeqCst);
        let service = self.service.lock().await.take();
        if let Some(service) = service {
            service
                .cancel()
                .await
                .map_err(|e| format!("cancel: {e}"))?;
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_from_toml_shape() {
        let http: ProviderTransport =
            serde_json::from_value(serde_json::json!({"url": "http://127.0.0.1:8000/mcp"})).unwrap();
        assert_eq!(
            http,
            ProviderTransport::StreamableHttp { url: "http://127.0.0.1:8000/mcp".into() }
        );
        let stdio: ProviderTransport =
            serde_json::from_value(serde_json::json!({"command": "npx", "args": ["-y", "srv"]}))
                .unwrap();
        assert!(matches!(stdio, ProviderTransport::Stdio { ref args, .. } if args.len() == 2));
    }

    #[test]
    fn test_endpoint_ids() {
        assert_eq!(ProviderEndpoint::http("http://a/mcp").id, "http://a/mcp");
        assert_eq!(ProviderEndpoint::stdio("uvx", vec![]).named("charts").id, "charts");
    }
}
