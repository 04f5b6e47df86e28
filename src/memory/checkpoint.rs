//! 会话检查点存储
//!
//! 按 session_id 保存完整消息序列。run_turn 在 Turn 开始时 load，在 Turn 成功结束后整体 save；
//! 中途失败的 Turn 不写回。同一会话的并发 Turn 由 SessionLocks 串行化，不同会话完全并行。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{OwnedMutexGuard, RwLock};

use crate::core::StoreError;
use crate::memory::Message;

/// 检查点存储 trait（内存实现与 SQLite 实现可互换）
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// 读取会话历史；未见过的会话返回空序列
    async fn load(&self, session_id: &str) -> Result<Vec<Message>, StoreError>;

    /// 以完整序列覆盖会话历史（原子写入）
    async fn save(&self, session_id: &str, messages: &[Message]) -> Result<(), StoreError>;

    /// 释放底层资源（连接池等）；内存实现无需关闭
    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// 进程内存储：满足读后写一致性，不保证跨重启持久
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    sessions: RwLock<HashMap<String, Vec<Message>>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 已知会话数
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn load(&self, session_id: &str) -> Result<Vec<Message>, StoreError> {
        Ok(self
            .sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn save(&self, session_id: &str, messages: &[Message]) -> Result<(), StoreError> {
        self.sessions
            .write()
            .await
            .insert(session_id.to_string(), messages.to_vec());
        Ok(())
    }
}

/// 每会话互斥锁表：保证同一 session_id 至多一个 Turn 在执行
#[derive(Debug, Default)]
pub struct SessionLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取会话锁；持有返回的 guard 期间同会话的其它 Turn 等待
    pub async fn acquire(&self, session_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = match self.locks.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            // 无人持有也无人等待的条目可回收
            locks.retain(|id, l| id == session_id || Arc::strong_count(l) > 1);
            locks
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// 当前表中的会话锁数量
    pub fn tracked(&self) -> usize {
        self.locks.lock().map(|l| l.len()).unwrap_or(0)
    }
}
