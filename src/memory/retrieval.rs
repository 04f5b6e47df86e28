//! 检索协作方
//!
//! 核心只消费读路径 similarity_search(query, k)；add_documents 供装载知识库使用。
//! InMemoryRetriever 按关键词重叠打分（无真实向量），用作默认实现与测试替身，
//! 真实向量库（Chroma / Qdrant 等）实现同一 trait 即可替换。

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// 检索得到的文档片段
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub content: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Document {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.metadata.insert("source".to_string(), source.into());
        self
    }

    pub fn source(&self) -> Option<&str> {
        self.metadata.get("source").map(String::as_str)
    }
}

/// 检索后端 trait
#[async_trait]
pub trait Retriever: Send + Sync {
    async fn add_documents(&self, docs: Vec<Document>) -> anyhow::Result<()>;

    /// 按相关度降序返回至多 k 条
    async fn similarity_search(&self, query: &str, k: usize) -> anyhow::Result<Vec<Document>>;
}

/// 将文本切分为小写词集合，用于简单相似度（词重叠数）
fn tokenize_lower(s: &str) -> HashSet<String> {
    s.split(|c: char| !c.is_alphanumeric())
        .map(|w| w.to_lowercase())
        .filter(|w| w.chars().count() > 1)
        .collect()
}

/// 内存检索：(文档, 词集合)，超过 max_entries 时淘汰最早加入的
pub struct InMemoryRetriever {
    store: RwLock<Vec<(Document, HashSet<String>)>>,
    max_entries: usize,
}

impl InMemoryRetriever {
    pub fn new(max_entries: usize) -> Self {
        Self {
            store: RwLock::new(Vec::new()),
            max_entries: max_entries.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.store.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryRetriever {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[async_trait]
impl Retriever for InMemoryRetriever {
    async fn add_documents(&self, docs: Vec<Document>) -> anyhow::Result<()> {
        let mut store = self
            .store
            .write()
            .map_err(|_| anyhow::anyhow!("retriever store poisoned"))?;
        for doc in docs {
            if doc.content.trim().is_empty() {
                continue;
            }
            let tokens = tokenize_lower(&doc.content);
            store.push((doc, tokens));
        }
        let n = store.len();
        if n > self.max_entries {
            store.drain(0..n - self.max_entries);
        }
        Ok(())
    }

    async fn similarity_search(&self, query: &str, k: usize) -> anyhow::Result<Vec<Document>> {
        let query_tokens = tokenize_lower(query);
        if query_tokens.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        let store = self
            .store
            .read()
            .map_err(|_| anyhow::anyhow!("retriever store poisoned"))?;
        let mut scored: Vec<(usize, &Document)> = store
            .iter()
            .map(|(doc, tokens)| (query_tokens.intersection(tokens).count(), doc))
            .filter(|(s, _)| *s > 0)
            .collect();
        // 稳定排序：同分时保留加入顺序
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(scored.into_iter().take(k).map(|(_, d)| d.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ranked_by_overlap() {
        let r = InMemoryRetriever::default();
        r.add_documents(vec![
            Document::new("rust async runtime").with_source("a.md"),
            Document::new("rust async runtime tokio scheduler").with_source("b.md"),
            Document::new("python web framework"),
        ])
        .await
        .unwrap();

        let hits = r.similarity_search("tokio async scheduler", 5).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].source(), Some("b.md"));
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest() {
        let r = InMemoryRetriever::new(2);
        r.add_documents(vec![
            Document::new("alpha one"),
            Document::new("beta two"),
            Document::new("gamma three"),
        ])
        .await
        .unwrap();
        assert_eq!(r.len(), 2);
        assert!(r.similarity_search("alpha", 3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_query() {
        let r = InMemoryRetriever::default();
        r.add_documents(vec![Document::new("something")]).await.unwrap();
        assert!(r.similarity_search("  ", 3).await.unwrap().is_empty());
    }
}
