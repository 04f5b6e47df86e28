//! 工具层：调用契约、注册表、执行器与内置工具（知识库检索、Web 搜索）

pub mod executor;
pub mod registry;
pub mod retrieval;
pub mod schema;
pub mod web_search;

pub use executor::{ToolExecutor, ToolRun};
pub use registry::{Tool, ToolDescriptor, ToolOrigin, ToolRegistry, ToolSnapshot};
pub use retrieval::{format_documents, KnowledgeSearchTool, KNOWLEDGE_TOOL_NAME, NO_DOCUMENTS};
pub use schema::{schema_of, CallContract, FieldKind, FieldSpec, ValidatedArgs};
pub use web_search::{
    DuckDuckGoBackend, SearchBackend, SearchHit, TavilyBackend, WebSearchTool, WEB_SEARCH_TOOL_NAME,
};
