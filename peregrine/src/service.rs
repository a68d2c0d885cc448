//! Transport-agnostic task service — the surface an RPC layer wraps.
//!
//! [`TaskService`] creates tasks, spawns one [`Executor`] per task, and
//! exposes event streaming, approval resolution, cancellation, and
//! listing. Error variants mirror the status codes an RPC layer would
//! return (not-found, invalid-argument, internal).

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{info, warn};

use crate::approval::ApprovalStatus;
use crate::config::GuardrailConfig;
use crate::error::StoreError;
use crate::event::EventSink;
use crate::exec::Executor;
use crate::exec::verifier::Verifier;
use crate::hooks::{Learner, MemoryGraph};
use crate::provider::{ChatMessage, ProviderRegistry};
use crate::router::RouterConfig;
use crate::store::{EventStream, TaskFilter, TaskStore};
use crate::task::{Task, TaskStatus, TaskSummary};
use crate::tool::registry::ToolRegistry;

/// Capacity of the live event channel handed to the starting caller.
const LIVE_EVENT_CAPACITY: usize = 256;

/// Service-level errors, mirroring RPC status codes.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ServiceError {
    /// The referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The request was malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The approval was already resolved by an earlier call.
    #[error("already resolved")]
    AlreadyResolved,

    /// Unexpected engine failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => Self::NotFound(what),
            StoreError::AlreadyResolved(_) => Self::AlreadyResolved,
            StoreError::Backend(message) => Self::Internal(message),
        }
    }
}

/// Parameters for starting a task.
#[derive(Debug, Clone)]
pub struct StartTaskRequest {
    /// Owning user.
    pub user_id: String,
    /// Owning workspace.
    pub workspace_id: String,
    /// The natural-language goal.
    pub goal: String,
    /// Conversation to embed the task in, if any.
    pub conversation_id: Option<String>,
    /// Guardrail overrides; defaults apply when absent.
    pub guardrails: Option<GuardrailConfig>,
    /// Pre-seeded conversation history for chat-embedded tasks.
    pub messages: Vec<ChatMessage>,
}

impl StartTaskRequest {
    /// Create a request with default guardrails.
    #[must_use]
    pub fn new(
        user_id: impl Into<String>,
        workspace_id: impl Into<String>,
        goal: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            workspace_id: workspace_id.into(),
            goal: goal.into(),
            conversation_id: None,
            guardrails: None,
            messages: Vec::new(),
        }
    }

    /// Sets the guardrail config.
    #[must_use]
    pub fn guardrails(mut self, config: GuardrailConfig) -> Self {
        self.guardrails = Some(config);
        self
    }

    /// Sets the conversation id.
    #[must_use]
    pub fn conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    /// Pre-seeds chat history.
    #[must_use]
    pub fn messages(mut self, messages: Vec<ChatMessage>) -> Self {
        self.messages = messages;
        self
    }
}

/// A started task: its id and the live event stream.
pub struct TaskHandle {
    /// Id of the created task.
    pub task_id: String,
    /// Live events from creation to the terminal event.
    pub events: mpsc::Receiver<crate::event::TaskEvent>,
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("task_id", &self.task_id)
            .finish_non_exhaustive()
    }
}

/// The engine's external surface.
pub struct TaskService {
    providers: ProviderRegistry,
    default_provider: String,
    model: String,
    tools: Arc<ToolRegistry>,
    store: Arc<dyn TaskStore>,
    router_config: RouterConfig,
    verifier: Option<Arc<dyn Verifier>>,
    learner: Option<Arc<dyn Learner>>,
    memory_graph: Option<Arc<dyn MemoryGraph>>,
    running: Arc<Mutex<HashMap<String, watch::Sender<bool>>>>,
}

impl TaskService {
    /// Create a service.
    #[must_use]
    pub fn new(
        providers: ProviderRegistry,
        default_provider: impl Into<String>,
        model: impl Into<String>,
        tools: Arc<ToolRegistry>,
        store: Arc<dyn TaskStore>,
    ) -> Self {
        Self {
            providers,
            default_provider: default_provider.into(),
            model: model.into(),
            tools,
            store,
            router_config: RouterConfig::default(),
            verifier: None,
            learner: None,
            memory_graph: None,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Sets the router configuration applied to every task.
    #[must_use]
    pub fn with_router_config(mut self, config: RouterConfig) -> Self {
        self.router_config = config;
        self
    }

    /// Gate completions behind a verifier.
    #[must_use]
    pub fn with_verifier(mut self, verifier: Arc<dyn Verifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Attach a learner hook.
    #[must_use]
    pub fn with_learner(mut self, learner: Arc<dyn Learner>) -> Self {
        self.learner = Some(learner);
        self
    }

    /// Attach a memory-graph hook.
    #[must_use]
    pub fn with_memory_graph(mut self, memory_graph: Arc<dyn MemoryGraph>) -> Self {
        self.memory_graph = Some(memory_graph);
        self
    }

    /// Create and persist a task, spawn its executor, and return the live
    /// event stream.
    ///
    /// # Errors
    ///
    /// [`ServiceError::InvalidArgument`] for an empty goal or an unknown
    /// default provider; [`ServiceError::Internal`] on persistence failure.
    pub async fn start_task(&self, request: StartTaskRequest) -> Result<TaskHandle, ServiceError> {
        if request.goal.trim().is_empty() {
            return Err(ServiceError::InvalidArgument("goal must not be empty".into()));
        }

        let mut task = Task::new(
            request.user_id,
            request.workspace_id,
            request.goal,
            request.guardrails.unwrap_or_default(),
        )
        .with_messages(request.messages);
        if let Some(conversation_id) = request.conversation_id {
            task = task.with_conversation(conversation_id);
        }
        let task_id = task.id.clone();

        self.store.save_task(&task).await?;
        info!(task_id = %task_id, goal = %task.goal, "task started");

        let mut executor = Executor::new(
            self.providers.clone(),
            self.default_provider.as_str(),
            self.model.as_str(),
            Arc::clone(&self.tools),
            Arc::clone(&self.store),
        )
        .map_err(|err| ServiceError::InvalidArgument(err.to_string()))?
        .with_router_config(self.router_config.clone());
        if let Some(verifier) = &self.verifier {
            executor = executor.with_verifier(Arc::clone(verifier));
        }
        if let Some(learner) = &self.learner {
            executor = executor.with_learner(Arc::clone(learner));
        }
        if let Some(graph) = &self.memory_graph {
            executor = executor.with_memory_graph(Arc::clone(graph));
        }

        let (event_tx, event_rx) = mpsc::channel(LIVE_EVENT_CAPACITY);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let sink = EventSink::new(event_tx, Arc::clone(&self.store));

        self.running
            .lock()
            .await
            .insert(task_id.clone(), cancel_tx);

        let running = Arc::clone(&self.running);
        let spawned_id = task_id.clone();
        tokio::spawn(async move {
            let finished = executor.run(task, sink, cancel_rx).await;
            info!(task_id = %finished.id, status = %finished.status, "task run finished");
            running.lock().await.remove(&spawned_id);
        });

        Ok(TaskHandle {
            task_id,
            events: event_rx,
        })
    }

    /// Reconnect to a task's event stream: persisted history first, then
    /// live events until the task terminates.
    ///
    /// # Errors
    ///
    /// [`ServiceError::NotFound`] for unknown task ids.
    pub async fn stream_task_events(&self, task_id: &str) -> Result<EventStream, ServiceError> {
        if self.store.get_task(task_id).await?.is_none() {
            return Err(ServiceError::NotFound(format!("task {task_id}")));
        }
        Ok(self.store.replay_events(task_id))
    }

    /// Resolve a pending approval. Idempotent in outcome: the first call
    /// decides, later calls fail with [`ServiceError::AlreadyResolved`].
    ///
    /// # Errors
    ///
    /// [`ServiceError::NotFound`] for unknown approval ids,
    /// [`ServiceError::AlreadyResolved`] for repeat resolutions.
    pub async fn approve_action(
        &self,
        approval_id: &str,
        approved: bool,
        user_id: &str,
    ) -> Result<(), ServiceError> {
        let status = if approved {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Denied
        };
        self.store
            .resolve_approval(approval_id, status, user_id)
            .await?;
        Ok(())
    }

    /// Cancel a running task. Cancelling an already-terminal task is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// [`ServiceError::NotFound`] for unknown task ids.
    pub async fn cancel_task(&self, task_id: &str) -> Result<(), ServiceError> {
        let Some(mut task) = self.store.get_task(task_id).await? else {
            return Err(ServiceError::NotFound(format!("task {task_id}")));
        };

        if task.status.is_terminal() {
            return Ok(());
        }

        if let Some(cancel) = self.running.lock().await.get(task_id) {
            // The executor observes the flag at its next suspension point.
            let _ = cancel.send(true);
            return Ok(());
        }

        // No live executor (e.g. after a restart): mark directly.
        if task.cancel().is_ok() {
            self.store.update_task(&task).await?;
        } else {
            warn!(task_id, "cancel raced with terminal transition");
        }
        Ok(())
    }

    /// List task summaries for a user, optionally filtered by workspace
    /// and status.
    ///
    /// # Errors
    ///
    /// [`ServiceError::Internal`] on persistence failure.
    pub async fn list_tasks(
        &self,
        user_id: &str,
        workspace_id: Option<&str>,
        status: Option<TaskStatus>,
    ) -> Result<Vec<TaskSummary>, ServiceError> {
        let filter = TaskFilter {
            user_id: user_id.to_owned(),
            workspace_id: workspace_id.map(str::to_owned),
            status,
        };
        Ok(self.store.list_tasks(&filter).await?)
    }
}

impl std::fmt::Debug for TaskService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskService")
            .field("default_provider", &self.default_provider)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}
