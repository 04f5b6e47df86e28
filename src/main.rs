//! Hive - 多智能体编排引擎
//!
//! 入口：初始化日志、加载配置、组装运行时，并运行一个按行交互的会话循环。
//! 命令：`/session <id>` 切换会话，`/ingest <file>` 装载知识库，`/tools` 列出工具，
//! `/reconnect <provider>` 重连外部提供方，`/history` 查看当前会话，`/quit` 退出。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use hive::config::{load_config, AppConfig};
use hive::core::{
    build_runtime, builder::ingest_text_file, CheckpointStoreCleanup, ConnectionManagerCleanup,
    ShutdownCoordinator, ShutdownManager, ShutdownReason,
};
use hive::react::TurnEvent;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });

    let runtime = build_runtime(&cfg, None).await;
    let orchestrator = runtime.orchestrator.clone();

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();
    let mut coordinator = ShutdownCoordinator::new(shutdown.clone())
        .with_timeout(Duration::from_secs(cfg.mcp.shutdown_timeout_secs));
    coordinator.register(ConnectionManagerCleanup::new(runtime.connections.clone()));
    coordinator.register(CheckpointStoreCleanup::new(runtime.store.clone()));

    let mut session_id = uuid::Uuid::new_v4().to_string();
    println!(
        "{} ready (session {}). Type /quit to exit.",
        cfg.app.name.as_deref().unwrap_or("hive"),
        session_id
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            l = lines.next_line() => l.context("Failed to read stdin")?,
            _ = shutdown.wait_for_shutdown() => break,
        };
        let Some(line) = line else {
            shutdown.shutdown(ShutdownReason::InputClosed);
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match line.split_once(' ').unwrap_or((line, "")) {
            ("/quit", _) => {
                shutdown.shutdown(ShutdownReason::UserInitiated);
                break;
            }
            ("/session", id) if !id.trim().is_empty() => {
                session_id = id.trim().to_string();
                println!("switched to session {}", session_id);
            }
            ("/ingest", path) if !path.trim().is_empty() => {
                match ingest_text_file(runtime.retriever.as_ref(), std::path::Path::new(path.trim())).await {
                    Ok(n) => println!("indexed {} chunk(s) from {}", n, path.trim()),
                    Err(e) => println!("ingest failed: {}", e),
                }
            }
            ("/tools", _) => {
                let snapshot = orchestrator.registry().snapshot().await;
                for tool in snapshot.iter() {
                    println!("- {} ({:?})", tool.name, tool.origin);
                }
            }
            ("/reconnect", provider) if !provider.trim().is_empty() => {
                match runtime.connections.reconnect(provider.trim()).await {
                    Ok(n) => println!("reconnected {}: {} tool(s)", provider.trim(), n),
                    Err(e) => println!("{}", e),
                }
            }
            ("/history", _) => match orchestrator.history(&session_id).await {
                Ok(messages) => {
                    for m in messages {
                        let who = m.name.as_deref().unwrap_or(m.role.as_str());
                        println!("[{}] {}", who, m.content);
                    }
                }
                Err(e) => println!("history unavailable: {}", e),
            },
            _ => {
                let (tx, mut rx) = mpsc::unbounded_channel();
                let printer = tokio::spawn(async move {
                    while let Some(event) = rx.recv().await {
                        match event {
                            TurnEvent::Routed { agent, .. } => println!("  -> {}", agent),
                            TurnEvent::ToolCall { tool, args, .. } => println!("  [tool] {} {}", tool, args),
                            TurnEvent::ToolFailure { tool, reason, .. } => {
                                println!("  [tool failed] {}: {}", tool, reason)
                            }
                            _ => {}
                        }
                    }
                });
                let result = orchestrator
                    .run_turn_with(&session_id, line, &shutdown.token(), &Some(tx))
                    .await;
                let _ = printer.await;
                match result {
                    Ok(turn) => println!("{}: {}", turn.agent, turn.response),
                    Err(e) => println!("error: {}", e),
                }
            }
        }
    }

    coordinator.run_cleanup().await;
    Ok(())
}
