//! 工具注册表
//!
//! 本地工具实现 Tool trait（name / description / parameters_schema / execute），注册时即按 Schema
//! 构建一次调用契约并包装为 ToolDescriptor；远程工具由 ConnectionManager 以同样的 ToolDescriptor 提供。
//! snapshot() 在每次请求时把本地工具与「当前已连接」提供方的工具合并为一个按名寻址的集合，
//! 因此连接状态变化无需重建注册表。

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::ToolError;
use crate::llm::ToolSpec;
use crate::mcp::ConnectionManager;
use crate::tools::{CallContract, ValidatedArgs};

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、异步执行（参数已按契约校验）
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认无参
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    async fn execute(&self, args: ValidatedArgs) -> Result<String, ToolError>;
}

/// 工具来源
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ToolOrigin {
    Local,
    /// 远程提供方（endpoint 标识）
    Remote { provider: String },
}

/// 可调用的工具描述：名称唯一（在一次 snapshot 内），契约构建一次后共享
#[derive(Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub schema: Value,
    pub origin: ToolOrigin,
    contract: Arc<CallContract>,
    tool: Arc<dyn Tool>,
}

impl fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolDescriptor")
            .field("name", &self.name)
            .field("origin", &self.origin)
            .finish()
    }
}

impl ToolDescriptor {
    pub fn from_tool(tool: Arc<dyn Tool>) -> Self {
        Self::with_origin(tool, ToolOrigin::Local)
    }

    pub fn with_origin(tool: Arc<dyn Tool>, origin: ToolOrigin) -> Self {
        let name = tool.name().to_string();
        let schema = tool.parameters_schema();
        Self {
            contract: Arc::new(CallContract::from_schema(name.clone(), &schema)),
            description: tool.description().to_string(),
            name,
            schema,
            origin,
            tool,
        }
    }

    pub fn contract(&self) -> &CallContract {
        &self.contract
    }

    pub fn is_remote(&self) -> bool {
        matches!(self.origin, ToolOrigin::Remote { .. })
    }

    /// 暴露给模型的描述
    pub fn spec(&self) -> ToolSpec {
        ToolSpec::new(&self.name, &self.description, self.schema.clone())
    }

    /// 校验参数后执行
    pub async fn invoke(&self, raw_args: &Value) -> Result<String, ToolError> {
        let args = self.contract.validate(raw_args)?;
        self.tool.execute(args).await
    }
}

/// 某一时刻可用工具的集合（本地 + 已连接的远程）
#[derive(Clone, Debug, Default)]
pub struct ToolSnapshot {
    tools: Vec<ToolDescriptor>,
}

impl ToolSnapshot {
    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.iter().find(|t| t.name == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ToolDescriptor> {
        self.tools.iter()
    }

    pub fn remote(&self) -> impl Iterator<Item = &ToolDescriptor> {
        self.tools.iter().filter(|t| t.is_remote())
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// 工具注册表：本地工具按注册顺序保存，远程工具每次 snapshot 时从 ConnectionManager 取
#[derive(Default)]
pub struct ToolRegistry {
    local: Vec<ToolDescriptor>,
    external: Option<Arc<ConnectionManager>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册本地工具；同名工具覆盖旧的
    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let descriptor = ToolDescriptor::from_tool(tool);
        if let Some(existing) = self.local.iter_mut().find(|d| d.name == descriptor.name) {
            tracing::warn!(tool = %descriptor.name, "replacing already registered tool");
            *existing = descriptor;
        } else {
            self.local.push(descriptor);
        }
    }

    /// 接入外部工具提供方
    pub fn with_external(mut self, manager: Arc<ConnectionManager>) -> Self {
        self.external = Some(manager);
        self
    }

    pub fn external(&self) -> Option<&Arc<ConnectionManager>> {
        self.external.as_ref()
    }

    pub fn local_names(&self) -> Vec<String> {
        self.local.iter().map(|d| d.name.clone()).collect()
    }

    /// 合并本地与当前已连接的远程工具；同名时本地优先，远程之间先连上的优先
    pub async fn snapshot(&self) -> ToolSnapshot {
        let mut tools = self.local.clone();
        if let Some(manager) = &self.external {
            let mut seen: HashSet<String> = tools.iter().map(|t| t.name.clone()).collect();
            for remote in manager.tools().await {
                if seen.insert(remote.name.clone()) {
                    tools.push(remote);
                } else {
                    tracing::warn!(
                        tool = %remote.name,
                        origin = ?remote.origin,
                        "skipping remote tool: name already registered"
                    );
                }
            }
        }
        ToolSnapshot { tools }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ToolInvocationError;
    use crate::tools::schema_of;
    use schemars::JsonSchema;

    #[allow(dead_code)]
    #[derive(JsonSchema)]
    struct ShoutArgs {
        text: String,
    }

    struct Shout;

    #[async_trait]
    impl Tool for Shout {
        fn name(&self) -> &str {
            "shout"
        }
        fn description(&self) -> &str {
            "Upper-case the text"
        }
        fn parameters_schema(&self) -> Value {
            schema_of::<ShoutArgs>()
        }
        async fn execute(&self, args: ValidatedArgs) -> Result<String, ToolError> {
            let text = args
                .get_str("text")
                .ok_or_else(|| ToolInvocationError::new("shout", "missing text"))?;
            Ok(text.to_uppercase())
        }
    }

    #[tokio::test]
    async fn test_invoke_validates_first() {
        let mut registry = ToolRegistry::new();
        registry.register(Shout);
        let snapshot = registry.snapshot().await;
        let shout = snapshot.get("shout").unwrap();

        assert_eq!(shout.invoke(&serde_json::json!({"text": "hi"})).await.unwrap(), "HI");
        let err = shout.invoke(&serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::Validation(ref v) if v.field == "text"));
    }

    #[tokio::test]
    async fn test_register_replaces_same_name() {
        let mut registry = ToolRegistry::new();
        registry.register(Shout);
        registry.register(Shout);
        assert_eq!(registry.local_names(), vec!["shout".to_string()]);
        assert_eq!(registry.snapshot().await.len(), 1);
    }

    #[test]
    fn test_spec_carries_schema() {
        let d = ToolDescriptor::from_tool(Arc::new(Shout));
        let spec = d.spec();
        assert_eq!(spec.name, "shout");
        assert!(spec.parameters["properties"].get("text").is_some());
        assert!(!d.is_remote());
    }
}
