//! 持久化检查点存储（sqlx / SQLite）
//!
//! 需要启用 `async-sqlite` feature。每条消息一行（保序 seq + 完整 JSON），
//! save 在单个事务中整体替换会话消息，保证 Turn 级原子写回。

#[cfg(feature = "async-sqlite")]
mod sqlx_impl {
    use std::path::Path;

    use async_trait::async_trait;
    use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
    use sqlx::Row;

    use crate::core::StoreError;
    use crate::memory::{CheckpointStore, Message};

    fn backend(e: sqlx::Error) -> StoreError {
        StoreError::Backend(e.to_string())
    }

    /// SQLite 检查点存储
    pub struct SqliteCheckpointStore {
        pool: SqlitePool,
    }

    impl SqliteCheckpointStore {
        /// 打开（不存在则创建）数据库文件并建表
        pub async fn open(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
            if let Some(parent) = db_path.as_ref().parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| StoreError::Backend(e.to_string()))?;
                }
            }
            let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());
            let pool = SqlitePoolOptions::new()
                .max_connections(5)
                .connect(&db_url)
                .await
                .map_err(backend)?;
            let store = Self { pool };
            store.init_tables().await.map_err(backend)?;
            Ok(store)
        }

        async fn init_tables(&self) -> Result<(), sqlx::Error> {
            sqlx::query(
                "CREATE TABLE IF NOT EXISTS checkpoint_sessions (
                    id TEXT PRIMARY KEY,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                )",
            )
            .execute(&self.pool)
            .await?;

            sqlx::query(
                "CREATE TABLE IF NOT EXISTS checkpoint_messages (
                    session_id TEXT NOT NULL,
                    seq INTEGER NOT NULL,
                    role TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    PRIMARY KEY (session_id, seq),
                    FOREIGN KEY (session_id) REFERENCES checkpoint_sessions(id) ON DELETE CASCADE
                )",
            )
            .execute(&self.pool)
            .await?;

            Ok(())
        }

        /// 列出最近更新的会话：(id, updated_at)
        pub async fn list_sessions(&self, limit: i64) -> Result<Vec<(String, String)>, StoreError> {
            let rows = sqlx::query(
                "SELECT id, updated_at FROM checkpoint_sessions ORDER BY updated_at DESC LIMIT ?",
            )
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
            Ok(rows
                .into_iter()
                .map(|row| (row.get("id"), row.get("updated_at")))
                .collect())
        }
    }

    #[async_trait]
    impl CheckpointStore for SqliteCheckpointStore {
        async fn load(&self, session_id: &str) -> Result<Vec<Message>, StoreError> {
            let rows = sqlx::query(
                "SELECT payload FROM checkpoint_messages WHERE session_id = ? ORDER BY seq ASC",
            )
            .bind(session_id)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;

            let mut messages = Vec::with_capacity(rows.len());
            for row in rows {
                let payload: String = row.get("payload");
                messages.push(serde_json::from_str(&payload)?);
            }
            Ok(messages)
        }

        async fn save(&self, session_id: &str, messages: &[Message]) -> Result<(), StoreError> {
            let now = chrono::Utc::now().to_rfc3339();
            let payloads = messages
                .iter()
                .map(serde_json::to_string)
                .collect::<Result<Vec<_>, _>>()?;

            let mut tx = self.pool.begin().await.map_err(backend)?;
            sqlx::query(
                "INSERT INTO checkpoint_sessions (id, created_at, updated_at) VALUES (?, ?, ?)
                 ON CONFLICT(id) DO UPDATE SET updated_at = excluded.updated_at",
            )
            .bind(session_id)
            .bind(&now)
            .bind(&now)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;

            sqlx::query("DELETE FROM checkpoint_messages WHERE session_id = ?")
                .bind(session_id)
                .execute(&mut *tx)
                .await
                .map_err(backend)?;

            for (seq, (message, payload)) in messages.iter().zip(payloads).enumerate() {
                sqlx::query(
                    "INSERT INTO checkpoint_messages (session_id, seq, role, payload) VALUES (?, ?, ?, ?)",
                )
                .bind(session_id)
                .bind(seq as i64)
                .bind(message.role.as_str())
                .bind(payload)
                .execute(&mut *tx)
                .await
                .map_err(backend)?;
            }

            tx.commit().await.map_err(backend)?;
            Ok(())
        }

        async fn close(&self) -> Result<(), StoreError> {
            self.pool.close().await;
            Ok(())
        }
    }
}

#[cfg(feature = "async-sqlite")]
pub use sqlx_impl::SqliteCheckpointStore;

#[cfg(all(test, feature = "async-sqlite"))]
mod tests {
    use super::*;
    use crate::memory::{CheckpointStore, Message, Role, ToolCall};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_sqlite_store_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = SqliteCheckpointStore::open(dir.path().join("sessions.db"))
            .await
            .unwrap();

        assert!(store.load("s1").await.unwrap().is_empty());

        let call = ToolCall::new("c1", "search_knowledge_base", serde_json::json!({"query": "x"}));
        let history = vec![
            Message::user("Q1"),
            Message::assistant_with_calls("", vec![call]).with_name("rag_agent"),
            Message::tool_result("c1", "search_knowledge_base", "No relevant documents found."),
            Message::assistant("A1").with_name("rag_agent"),
        ];
        store.save("s1", &history).await.unwrap();

        let loaded = store.load("s1").await.unwrap();
        assert_eq!(loaded, history);
        assert_eq!(loaded[2].role, Role::Tool);
    }

    #[tokio::test]
    async fn test_sqlite_save_replaces() {
        let dir = TempDir::new().unwrap();
        let store = SqliteCheckpointStore::open(dir.path().join("sessions.db"))
            .await
            .unwrap();
        store.save("s1", &[Message::user("a"), Message::assistant("b")]).await.unwrap();
        store
            .save("s1", &[Message::user("a"), Message::assistant("b"), Message::user("c")])
            .await
            .unwrap();
        assert_eq!(store.load("s1").await.unwrap().len(), 3);
        assert_eq!(store.list_sessions(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sqlite_close_then_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sessions.db");
        let store = SqliteCheckpointStore::open(&path).await.unwrap();
        store.save("s1", &[Message::user("kept")]).await.unwrap();
        store.close().await.unwrap();
        assert!(store.load("s1").await.is_err());

        let reopened = SqliteCheckpointStore::open(&path).await.unwrap();
        assert_eq!(reopened.load("s1").await.unwrap(), vec![Message::user("kept")]);
    }
}
