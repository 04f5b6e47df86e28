//! 核心编排层：错误分类、状态、恢复预算、Supervisor 路由、编排主循环、运行时构建与优雅关闭

pub mod builder;
pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod shutdown;
pub mod state;
pub mod supervisor;

pub use builder::{build_runtime, create_llm_from_config, load_supervisor_policy, Runtime};
pub use error::{
    ProviderConnectionError, StoreError, ToolError, ToolInvocationError, TurnError,
    ValidationError,
};
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use recovery::{AgentRetryLedger, RecoveryAction, ToolFailureTracker};
pub use shutdown::{
    CheckpointStoreCleanup, ConnectionManagerCleanup, ShutdownCoordinator, ShutdownManager,
    ShutdownReason,
};
pub use state::{AgentPhase, RouteDecision, StopReason, TurnMetadata, TurnResult};
pub use supervisor::{Supervisor, SupervisorDecision, DEFAULT_POLICY};
