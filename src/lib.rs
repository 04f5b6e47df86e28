//! Hive - 多智能体编排引擎
//!
//! 模块划分：
//! - **agent**: Agent 定义（名称、指令、工具范围、模型）与默认名册
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、Supervisor 路由、编排主循环、运行时构建、优雅关闭
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **mcp**: 外部工具提供方连接（握手、工具目录、远程调用）
//! - **memory**: 对话消息、会话检查点、持久化、检索协作方
//! - **observability**: 日志
//! - **react**: Agent 工具调用循环与过程事件
//! - **tools**: 调用契约、工具注册表、执行器与内置工具

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod mcp;
pub mod memory;
pub mod observability;
pub mod react;
pub mod tools;

pub use crate::core::{Orchestrator, TurnError, TurnResult};
