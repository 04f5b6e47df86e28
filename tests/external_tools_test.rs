//! 外部工具集成测试：提供方部分失败、调用契约校验、远程错误与断开、注册表合并

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hive::core::{ProviderConnectionError, ToolError};
use hive::mcp::{
    ConnectionManager, ProviderConnector, ProviderEndpoint, ProviderSession, RemoteCallResult,
    RemoteToolInfo,
};
use hive::tools::{CallContract, FieldKind, ToolRegistry};
use serde_json::{json, Map, Value};

struct FakeSession {
    tools: Vec<RemoteToolInfo>,
    closed: AtomicBool,
    received: Mutex<Vec<(String, Map<String, Value>)>>,
}

impl FakeSession {
    fn new(tools: Vec<RemoteToolInfo>) -> Arc<Self> {
        Arc::new(Self {
            tools,
            closed: AtomicBool::new(false),
            received: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl ProviderSession for FakeSession {
    async fn list_tools(&self) -> Result<Vec<RemoteToolInfo>, String> {
        Ok(self.tools.clone())
    }

    async fn call_tool(&self, name: &str, arguments: Map<String, Value>) -> Result<RemoteCallResult, String> {
        if self.is_closed() {
            return Err("connection closed".to_string());
        }
        if let Ok(mut r) = self.received.lock() {
            r.push((name.to_string(), arguments.clone()));
        }
        if name == "broken" {
            return Ok(RemoteCallResult {
                text: "chart engine crashed".to_string(),
                is_error: true,
            });
        }
        Ok(RemoteCallResult {
            text: format!("{} ok", name),
            is_error: false,
        })
    }

    async fn close(&self) -> Result<(), String> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// 按 endpoint id 返回预置会话；未登记的 id 连接失败
struct FakeConnector {
    sessions: HashMap<String, Arc<FakeSession>>,
}

#[async_trait]
impl ProviderConnector for FakeConnector {
    async fn connect(
        &self,
        endpoint: &ProviderEndpoint,
    ) -> Result<Arc<dyn ProviderSession>, ProviderConnectionError> {
        match self.sessions.get(&endpoint.id) {
            Some(s) => Ok(s.clone() as Arc<dyn ProviderSession>),
            None => Err(ProviderConnectionError::new(&endpoint.id, "connection refused")),
        }
    }
}

fn chart_tool() -> RemoteToolInfo {
    RemoteToolInfo {
        name: "generate_bar_chart".to_string(),
        description: "Render a bar chart".to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "title": {"type": "string", "description": "Chart title"},
                "width": {"type": "integer"}
            },
            "required": ["title"]
        }),
    }
}

fn broken_tool() -> RemoteToolInfo {
    RemoteToolInfo {
        name: "broken".to_string(),
        description: "Always fails".to_string(),
        input_schema: json!({}),
    }
}

fn setup() -> (Arc<ConnectionManager>, Arc<FakeSession>) {
    let charts = FakeSession::new(vec![chart_tool(), broken_tool()]);
    let connector = FakeConnector {
        sessions: HashMap::from([("charts".to_string(), charts.clone())]),
    };
    let manager = ConnectionManager::new(
        Arc::new(connector),
        vec![
            ProviderEndpoint::http("http://127.0.0.1:9/mcp").named("offline"),
            ProviderEndpoint::http("http://127.0.0.1:1122/mcp").named("charts"),
        ],
    );
    (Arc::new(manager), charts)
}

#[tokio::test]
async fn test_surviving_provider_tools_exposed() {
    let (manager, _charts) = setup();
    let summary = manager.initialize().await;
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].endpoint, "offline");
    assert_eq!(summary.connected, vec![("charts".to_string(), 2)]);

    let names: Vec<String> = manager.tools().await.into_iter().map(|t| t.name).collect();
    assert_eq!(names, vec!["generate_bar_chart", "broken"]);
    assert_eq!(manager.connected_providers().await, vec!["charts"]);
}

#[tokio::test]
async fn test_remote_call_validates_then_forwards() {
    let (manager, charts) = setup();
    manager.initialize().await;
    let registry = ToolRegistry::new().with_external(manager.clone());
    let snapshot = registry.snapshot().await;
    let chart = snapshot.get("generate_bar_chart").unwrap();
    assert!(chart.is_remote());

    let err = chart.invoke(&json!({"width": 300})).await.unwrap_err();
    assert!(matches!(err, ToolError::Validation(ref v) if v.field == "title"));
    assert!(charts.received.lock().unwrap().is_empty());

    // 可选字段缺省；数字字符串按声明类型转换
    let out = chart.invoke(&json!({"title": "Sales", "width": "640"})).await.unwrap();
    assert_eq!(out, "generate_bar_chart ok");
    let received = charts.received.lock().unwrap().clone();
    assert_eq!(received[0].1.get("width"), Some(&json!(640)));

    let out = chart.invoke(&json!({"title": "Q2"})).await.unwrap();
    assert_eq!(out, "generate_bar_chart ok");
}

#[tokio::test]
async fn test_remote_error_and_disconnect_surface_as_invocation_errors() {
    let (manager, charts) = setup();
    manager.initialize().await;
    let tools = manager.tools().await;
    let broken = tools.iter().find(|t| t.name == "broken").unwrap();
    let err = broken.invoke(&json!({})).await.unwrap_err();
    assert!(err.is_invocation());
    assert!(err.to_string().contains("chart engine crashed"));

    let chart = tools.iter().find(|t| t.name == "generate_bar_chart").unwrap().clone();
    charts.close().await.unwrap();
    let err = chart.invoke(&json!({"title": "x"})).await.unwrap_err();
    assert!(err.is_invocation());

    // 断开的提供方不再出现在快照中
    assert!(manager.tools().await.is_empty());
}

#[tokio::test]
async fn test_shutdown_closes_every_connection() {
    let (manager, charts) = setup();
    manager.initialize().await;
    manager.shutdown().await;
    assert!(charts.is_closed());
    assert!(manager.connected_providers().await.is_empty());
}

#[tokio::test]
async fn test_reconnect_unknown_provider_fails() {
    let (manager, _charts) = setup();
    manager.initialize().await;
    let err = manager.reconnect("nope").await.unwrap_err();
    assert_eq!(err.endpoint, "nope");
    let err = manager.reconnect("offline").await.unwrap_err();
    assert!(err.reason.contains("connection refused"));
}

#[test]
fn test_contract_required_and_optional_fields() {
    let contract = CallContract::from_schema(
        "report",
        &json!({
            "type": "object",
            "properties": {
                "name": {"type": "string"},
                "count": {"type": "integer"}
            },
            "required": ["name"]
        }),
    );
    assert_eq!(contract.field("count").map(|f| f.kind), Some(FieldKind::Integer));

    let err = contract.validate(&json!({"count": 2})).unwrap_err();
    assert_eq!(err.field, "name");

    let args = contract.validate(&json!({"name": "weekly"})).unwrap();
    assert_eq!(args.get_str("name"), Some("weekly"));
    assert!(!args.contains("count"));

    let err = contract.validate(&json!({"name": "weekly", "count": "many"})).unwrap_err();
    assert_eq!(err.field, "count");
}

#[test]
fn test_empty_schema_accepts_no_arguments() {
    let contract = CallContract::from_schema("ping", &json!({}));
    assert!(contract.fields().is_empty());
    assert!(contract.validate(&Value::Null).unwrap().is_empty());
}
