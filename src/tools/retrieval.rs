//! 知识库检索工具 search_knowledge_base
//!
//! 调用检索协作方的 similarity_search，按「Content / Source」格式拼接前 k 条结果；
//! 无结果时返回固定哨兵文本，而不是空字符串。

use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::core::{ToolError, ToolInvocationError, ValidationError};
use crate::memory::{Document, Retriever};
use crate::tools::{schema_of, Tool, ValidatedArgs};

pub const KNOWLEDGE_TOOL_NAME: &str = "search_knowledge_base";

/// 检索无结果时的返回文本
pub const NO_DOCUMENTS: &str = "No relevant documents found.";

#[allow(dead_code)]
#[derive(Debug, Deserialize, JsonSchema)]
struct SearchInput {
    /// The query to search for in the knowledge base.
    query: String,
}

/// 知识库检索工具
pub struct KnowledgeSearchTool {
    retriever: Arc<dyn Retriever>,
    top_k: usize,
}

impl KnowledgeSearchTool {
    pub fn new(retriever: Arc<dyn Retriever>, top_k: usize) -> Self {
        Self {
            retriever,
            top_k: top_k.max(1),
        }
    }
}

/// 将检索结果格式化为工具输出
pub fn format_documents(docs: &[Document]) -> String {
    if docs.is_empty() {
        return NO_DOCUMENTS.to_string();
    }
    let body = docs
        .iter()
        .map(|d| format!("Content: {}\nSource: {}", d.content, d.source().unwrap_or("Unknown")))
        .collect::<Vec<_>>()
        .join("\n\n");
    format!("[RAG Search Results]\n{}", body)
}

#[async_trait]
impl Tool for KnowledgeSearchTool {
    fn name(&self) -> &str {
        KNOWLEDGE_TOOL_NAME
    }

    fn description(&self) -> &str {
        "Use this tool to search for internal documents and knowledge. Always use this when asked about specific company policies, project details or internal data."
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<SearchInput>()
    }

    async fn execute(&self, args: ValidatedArgs) -> Result<String, ToolError> {
        let query = args.get_str("query").unwrap_or("").trim();
        if query.is_empty() {
            return Err(ValidationError::new("query", "must not be empty").into());
        }
        tracing::debug!(query = %query, k = self.top_k, "knowledge base search");
        let docs = self
            .retriever
            .similarity_search(query, self.top_k)
            .await
            .map_err(|e| ToolInvocationError::new(KNOWLEDGE_TOOL_NAME, e.to_string()))?;
        Ok(format_documents(&docs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryRetriever;
    use crate::tools::ToolDescriptor;

    #[tokio::test]
    async fn test_empty_result_sentinel() {
        let tool = ToolDescriptor::from_tool(Arc::new(KnowledgeSearchTool::new(
            Arc::new(InMemoryRetriever::default()),
            4,
        )));
        let out = tool.invoke(&serde_json::json!({"query": "vacation policy"})).await.unwrap();
        assert_eq!(out, NO_DOCUMENTS);
    }

    #[tokio::test]
    async fn test_formats_hits() {
        let retriever = Arc::new(InMemoryRetriever::default());
        retriever
            .add_documents(vec![
                Document::new("Vacation policy: 20 days per year").with_source("hr.pdf"),
                Document::new("Vacation requests go through the portal"),
            ])
            .await
            .unwrap();
        let tool = ToolDescriptor::from_tool(Arc::new(KnowledgeSearchTool::new(retriever, 4)));
        let out = tool
            .invoke(&serde_json::json!({"query": "vacation policy"}))
            .await
            .unwrap();
        assert!(out.starts_with("[RAG Search Results]\n"));
        assert!(out.contains("Content: Vacation policy: 20 days per year\nSource: hr.pdf"));
        assert!(out.contains("Source: Unknown"));
    }

    #[tokio::test]
    async fn test_missing_query_is_validation_error() {
        let tool = ToolDescriptor::from_tool(Arc::new(KnowledgeSearchTool::new(
            Arc::new(InMemoryRetriever::default()),
            4,
        )));
        let err = tool.invoke(&serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::Validation(ref v) if v.field == "query"));
    }
}
