//! 记忆层：对话消息模型、会话检查点存储、持久化、检索协作方

pub mod checkpoint;
pub mod conversation;
pub mod persistence;
pub mod retrieval;

pub use checkpoint::{CheckpointStore, InMemoryCheckpointStore, SessionLocks};
pub use conversation::{Message, Role, ToolCall};
#[cfg(feature = "async-sqlite")]
pub use persistence::SqliteCheckpointStore;
pub use retrieval::{Document, InMemoryRetriever, Retriever};
