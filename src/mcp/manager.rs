//! 外部工具连接管理
//!
//! 每个已配置的提供方持有一条长连接：启动时并发建立连接、握手并拉取工具目录，
//! 每个远程工具包装为 ToolDescriptor（契约在此时构建一次）。某个提供方连接失败只记录并跳过，
//! 不影响其它提供方。工具目录只在 reconnect 时刷新。shutdown 尽力关闭所有连接。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::core::{ProviderConnectionError, ToolError, ToolInvocationError};
use crate::mcp::{ProviderConnector, ProviderEndpoint, ProviderSession, RemoteToolInfo};
use crate::tools::{Tool, ToolDescriptor, ToolOrigin, ValidatedArgs};

/// 远程工具：调用经由所属提供方的会话完成
struct RemoteTool {
    provider: String,
    info: RemoteToolInfo,
    session: Arc<dyn ProviderSession>,
}

#[async_trait]
impl Tool for RemoteTool {
    fn name(&self) -> &str {
        &self.info.name
    }

    fn description(&self) -> &str {
        &self.info.description
    }

    fn parameters_schema(&self) -> Value {
        self.info.input_schema.clone()
    }

    async fn execute(&self, args: ValidatedArgs) -> Result<String, ToolError> {
        if self.session.is_closed() {
            return Err(ToolInvocationError::new(
                &self.info.name,
                format!("provider `{}` is disconnected", self.provider),
            )
            .into());
        }
        let result = self
            .session
            .call_tool(&self.info.name, args.into_map())
            .await
            .map_err(|e| ToolInvocationError::new(&self.info.name, e))?;
        if result.is_error {
            let reason = if result.text.trim().is_empty() {
                "remote tool reported an error".to_string()
            } else {
                result.text
            };
            return Err(ToolInvocationError::new(&self.info.name, reason).into());
        }
        Ok(result.text)
    }
}

/// 已连接的提供方
struct ProviderConnection {
    endpoint: ProviderEndpoint,
    session: Arc<dyn ProviderSession>,
    tools: Vec<ToolDescriptor>,
}

/// initialize 的结果汇总
#[derive(Debug, Default)]
pub struct ConnectSummary {
    /// (provider id, 工具数)
    pub connected: Vec<(String, usize)>,
    pub failed: Vec<ProviderConnectionError>,
}

impl ConnectSummary {
    pub fn tool_count(&self) -> usize {
        self.connected.iter().map(|(_, n)| n).sum()
    }
}

/// 连接管理器：进程级共享资源，启动时 initialize，停止时 shutdown
pub struct ConnectionManager {
    connector: Arc<dyn ProviderConnector>,
    endpoints: Vec<ProviderEndpoint>,
    connect_timeout: Duration,
    providers: RwLock<Vec<ProviderConnection>>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn ProviderConnector>, endpoints: Vec<ProviderEndpoint>) -> Self {
        Self {
            connector,
            endpoints,
            connect_timeout: Duration::from_secs(30),
            providers: RwLock::new(Vec::new()),
        }
    }

    /// 握手 + 拉取工具目录的超时
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn endpoints(&self) -> &[ProviderEndpoint] {
        &self.endpoints
    }

    async fn open(&self, endpoint: &ProviderEndpoint) -> Result<ProviderConnection, ProviderConnectionError> {
        let attempt = async {
            let session = self.connector.connect(endpoint).await?;
            let infos = match session.list_tools().await {
                Ok(infos) => infos,
                Err(e) => {
                    let _ = session.close().await;
                    return Err(ProviderConnectionError::new(&endpoint.id, e));
                }
            };
            let tools = infos
                .into_iter()
                .map(|info| {
                    let tool: Arc<dyn Tool> = Arc::new(RemoteTool {
                        provider: endpoint.id.clone(),
                        info,
                        session: session.clone(),
                    });
                    ToolDescriptor::with_origin(
                        tool,
                        ToolOrigin::Remote {
                            provider: endpoint.id.clone(),
                        },
                    )
                })
                .collect();
            Ok(ProviderConnection {
                endpoint: endpoint.clone(),
                session,
                tools,
            })
        };
        tokio::time::timeout(self.connect_timeout, attempt)
            .await
            .map_err(|_| {
                ProviderConnectionError::new(
                    &endpoint.id,
                    format!("connect timed out after {}s", self.connect_timeout.as_secs()),
                )
            })?
    }

    /// 并发连接全部提供方；失败的提供方记录后跳过
    pub async fn initialize(&self) -> ConnectSummary {
        let results = join_all(self.endpoints.iter().map(|ep| self.open(ep))).await;

        let mut summary = ConnectSummary::default();
        let mut connected = Vec::new();
        for result in results {
            match result {
                Ok(conn) => {
                    tracing::info!(
                        provider = %conn.endpoint.id,
                        tools = conn.tools.len(),
                        "external tool provider connected"
                    );
                    summary.connected.push((conn.endpoint.id.clone(), conn.tools.len()));
                    connected.push(conn);
                }
                Err(e) => {
                    tracing::warn!(provider = %e.endpoint, error = %e.reason, "skipping external tool provider");
                    summary.failed.push(e);
                }
            }
        }

        let stale = std::mem::replace(&mut *self.providers.write().await, connected);
        close_all(stale).await;
        summary
    }

    /// 当前已连接提供方的全部工具（按配置顺序）
    pub async fn tools(&self) -> Vec<ToolDescriptor> {
        self.providers
            .read()
            .await
            .iter()
            .filter(|p| !p.session.is_closed())
            .flat_map(|p| p.tools.iter().cloned())
            .collect()
    }

    pub async fn connected_providers(&self) -> Vec<String> {
        self.providers
            .read()
            .await
            .iter()
            .filter(|p| !p.session.is_closed())
            .map(|p| p.endpoint.id.clone())
            .collect()
    }

    /// 重连单个提供方并刷新其工具目录；返回新的工具数
    pub async fn reconnect(&self, provider_id: &str) -> Result<usize, ProviderConnectionError> {
        let endpoint = self
            .endpoints
            .iter()
            .find(|e| e.id == provider_id)
            .cloned()
            .ok_or_else(|| ProviderConnectionError::new(provider_id, "not configured"))?;

        let old = {
            let mut providers = self.providers.write().await;
            providers
                .iter()
                .position(|p| p.endpoint.id == provider_id)
                .map(|i| providers.remove(i))
        };
        if let Some(old) = old {
            close_all(vec![old]).await;
        }

        let conn = self.open(&endpoint).await.map_err(|e| {
            tracing::warn!(provider = %provider_id, error = %e.reason, "reconnect failed");
            e
        })?;
        let count = conn.tools.len();
        tracing::info!(provider = %provider_id, tools = count, "external tool provider reconnected");

        let mut providers = self.providers.write().await;
        providers.push(conn);
        // 保持配置顺序，使同名冲突时的优先级稳定
        let order = |id: &str| self.endpoints.iter().position(|e| e.id == id).unwrap_or(usize::MAX);
        providers.sort_by_key(|p| order(&p.endpoint.id));
        Ok(count)
    }

    /// 关闭所有连接；单个失败只记录
    pub async fn shutdown(&self) {
        let all = std::mem::take(&mut *self.providers.write().await);
        let n = all.len();
        close_all(all).await;
        tracing::info!(providers = n, "external tool providers closed");
    }
}

async fn close_all(conns: Vec<ProviderConnection>) {
    let closes = conns.iter().map(|c| async move {
        if let Err(e) = c.session.close().await {
            tracing::warn!(provider = %c.endpoint.id, error = %e, "provider close failed");
        }
    });
    join_all(closes).await;
}
