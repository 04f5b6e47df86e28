//! 优雅关闭
//!
//! Ctrl+C / SIGTERM 触发 ShutdownManager 的取消令牌，进行中的 Turn 在下一个挂起点返回；
//! 随后 ShutdownCoordinator 依次执行清理任务（关闭外部工具提供方连接等），每个任务有超时，失败只记录不阻塞退出。

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::mcp::ConnectionManager;
use crate::memory::CheckpointStore;

/// 关闭信号管理器
#[derive(Clone, Default)]
pub struct ShutdownManager {
    token: CancellationToken,
}

/// 关闭原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C 或 quit 命令
    UserInitiated,
    /// SIGTERM
    Signal,
    /// 标准输入结束
    InputClosed,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 取消令牌（传给 run_turn_with）
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 触发关闭；只有第一次调用会记录原因
    pub fn shutdown(&self, reason: ShutdownReason) {
        if !self.token.is_cancelled() {
            tracing::info!(?reason, "shutdown requested");
            self.token.cancel();
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// 安装 Ctrl+C / SIGTERM 处理
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, initiating graceful shutdown...");
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

/// 关闭时执行的清理任务
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    /// 日志中的名称
    fn name(&self) -> &'static str;
}

/// 清理协调器
pub struct ShutdownCoordinator {
    manager: Arc<ShutdownManager>,
    cleanup_tasks: Vec<Arc<dyn ShutdownCleanup>>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(manager: Arc<ShutdownManager>) -> Self {
        Self {
            manager,
            cleanup_tasks: Vec::new(),
            timeout: Duration::from_secs(5),
        }
    }

    /// 单个清理任务的超时
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, task: T) {
        self.cleanup_tasks.push(Arc::new(task));
    }

    /// 先取消令牌（停止仍在运行的 Turn），再依次执行所有清理任务；超时或失败只记录
    pub async fn run_cleanup(&self) {
        self.manager.shutdown(ShutdownReason::UserInitiated);
        tracing::info!("Running {} cleanup tasks...", self.cleanup_tasks.len());

        for task in &self.cleanup_tasks {
            let name = task.name();
            match tokio::time::timeout(self.timeout, task.cleanup()).await {
                Ok(Ok(())) => tracing::info!("Cleanup task '{}' completed", name),
                Ok(Err(e)) => tracing::warn!("Cleanup task '{}' failed: {}", name, e),
                Err(_) => tracing::warn!(
                    "Cleanup task '{}' timed out after {:?}",
                    name,
                    self.timeout
                ),
            }
        }
    }
}

/// 关闭所有外部工具提供方连接
pub struct ConnectionManagerCleanup {
    manager: Arc<ConnectionManager>,
}

impl ConnectionManagerCleanup {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self { manager }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for ConnectionManagerCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.manager.shutdown().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "ToolProviders"
    }
}

/// 关闭检查点存储（SQLite 连接池）
pub struct CheckpointStoreCleanup {
    store: Arc<dyn CheckpointStore>,
}

impl CheckpointStoreCleanup {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for CheckpointStoreCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.store.close().await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "CheckpointStore"
    }
}
