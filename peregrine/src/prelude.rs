//! Convenience re-exports of the types most integrations need.

pub use crate::approval::{ApprovalRequest, ApprovalStatus};
pub use crate::checkpoint::CheckpointManager;
pub use crate::config::{GuardrailConfig, RiskLevel};
pub use crate::error::{Error, Result, StoreError, ToolError};
pub use crate::event::{EventSink, Progress, TaskEvent, TaskEventKind};
pub use crate::evidence::{DecisionRecord, DecisionType, EvidenceChain, EvidenceNode, EvidenceType};
pub use crate::exec::verifier::{EvidenceVerifier, Verdict, Verifier};
pub use crate::exec::{Executor, MAX_PARALLEL_TOOLS};
pub use crate::guardrails::Guardrails;
pub use crate::hooks::{Learner, MemoryGraph};
pub use crate::metrics::{MetricsCollector, RunMetrics};
pub use crate::plan::{Plan, Step, StepStatus, ToolCallRecord};
pub use crate::planner::Planner;
pub use crate::provider::mock::{MockProvider, ScriptedTurn};
pub use crate::provider::{
    ChatMessage, LlmProvider, LlmRequest, LlmResponse, ProviderDirectory, ProviderRegistry, Role,
    ToolCallRequest, Usage,
};
pub use crate::router::{ModelRoute, ModelRouter, RouterConfig, RoutingStrategy, StepKind};
pub use crate::service::{ServiceError, StartTaskRequest, TaskHandle, TaskService};
pub use crate::store::{MemoryStore, TaskFilter, TaskStore};
pub use crate::task::{Task, TaskStatus, TaskSummary};
pub use crate::tool::registry::{RETRY_MAX_ATTEMPTS, ToolRegistry};
pub use crate::tool::{
    ToolContext, ToolDefinition, ToolHandler, ToolResult, ToolSpec, is_control_tool,
};
