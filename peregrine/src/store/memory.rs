//! In-memory reference implementation of the persistence adapter.
//!
//! Backs the integration tests and single-process deployments. Event logs
//! are bounded ring buffers with a broadcast channel per task for live
//! subscribers; replay stitches the retained history to the live tail.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{RwLock, broadcast};
use tracing::debug;

use super::{EventStream, TASK_EVENT_HISTORY_MAX, TASK_EVENT_TTL, TaskFilter, TaskStore};
use crate::approval::{ApprovalRequest, ApprovalStatus};
use crate::error::StoreError;
use crate::event::TaskEvent;
use crate::evidence::DecisionRecord;
use crate::task::{Task, TaskSummary};

/// Capacity of each per-task live broadcast channel.
const BROADCAST_CAPACITY: usize = 256;

struct EventLog {
    entries: VecDeque<(tokio::time::Instant, TaskEvent)>,
    tx: broadcast::Sender<TaskEvent>,
}

impl EventLog {
    fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            tx: broadcast::channel(BROADCAST_CAPACITY).0,
        }
    }

    fn append(&mut self, event: TaskEvent) {
        let now = tokio::time::Instant::now();
        self.entries.push_back((now, event.clone()));

        while self.entries.len() > TASK_EVENT_HISTORY_MAX {
            self.entries.pop_front();
        }
        while self
            .entries
            .front()
            .is_some_and(|(at, _)| now.duration_since(*at) > TASK_EVENT_TTL)
        {
            self.entries.pop_front();
        }

        // No live subscribers is fine; replay reads the retained log.
        let _ = self.tx.send(event);
    }
}

/// Thread-safe in-memory [`TaskStore`].
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    tasks: RwLock<HashMap<String, Task>>,
    approvals: RwLock<HashMap<String, ApprovalRequest>>,
    events: RwLock<HashMap<String, EventLog>>,
    evidence: RwLock<HashMap<String, Vec<DecisionRecord>>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn save_task(&self, task: &Task) -> Result<(), StoreError> {
        self.inner
            .tasks
            .write()
            .await
            .insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn update_task(&self, task: &Task) -> Result<(), StoreError> {
        self.inner
            .tasks
            .write()
            .await
            .insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>, StoreError> {
        Ok(self.inner.tasks.read().await.get(id).cloned())
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<TaskSummary>, StoreError> {
        let tasks = self.inner.tasks.read().await;
        let mut summaries: Vec<TaskSummary> = tasks
            .values()
            .filter(|t| t.user_id == filter.user_id)
            .filter(|t| {
                filter
                    .workspace_id
                    .as_deref()
                    .is_none_or(|ws| t.workspace_id == ws)
            })
            .filter(|t| filter.status.is_none_or(|s| t.status == s))
            .map(TaskSummary::from)
            .collect();
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(summaries)
    }

    async fn save_approval(&self, approval: &ApprovalRequest) -> Result<(), StoreError> {
        self.inner
            .approvals
            .write()
            .await
            .insert(approval.id.clone(), approval.clone());
        Ok(())
    }

    async fn get_approval(&self, id: &str) -> Result<Option<ApprovalRequest>, StoreError> {
        Ok(self.inner.approvals.read().await.get(id).cloned())
    }

    async fn resolve_approval(
        &self,
        id: &str,
        status: ApprovalStatus,
        decided_by: &str,
    ) -> Result<ApprovalRequest, StoreError> {
        let mut approvals = self.inner.approvals.write().await;
        let approval = approvals
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("approval {id}")))?;

        if approval.status.is_resolved() {
            return Err(StoreError::AlreadyResolved(id.to_owned()));
        }

        approval.status = status;
        approval.decided_by = Some(decided_by.to_owned());
        debug!(approval_id = %id, status = ?status, decided_by, "approval resolved");
        Ok(approval.clone())
    }

    async fn append_event(&self, event: &TaskEvent) -> Result<(), StoreError> {
        let mut events = self.inner.events.write().await;
        events
            .entry(event.task_id.clone())
            .or_insert_with(EventLog::new)
            .append(event.clone());
        Ok(())
    }

    fn replay_events(&self, task_id: &str) -> EventStream {
        let inner = Arc::clone(&self.inner);
        let task_id = task_id.to_owned();

        Box::pin(async_stream::stream! {
            // Snapshot history and subscribe under one lock so no event can
            // fall between replay and the live tail.
            let (history, mut rx) = {
                let mut events = inner.events.write().await;
                let log = events.entry(task_id.clone()).or_insert_with(EventLog::new);
                let history: Vec<TaskEvent> =
                    log.entries.iter().map(|(_, e)| e.clone()).collect();
                (history, log.tx.subscribe())
            };

            let mut saw_terminal = false;
            for event in history {
                saw_terminal = event.kind.is_terminal();
                yield event;
                if saw_terminal {
                    return;
                }
            }

            // A terminal task whose log was fully trimmed has nothing left
            // to follow.
            if !saw_terminal {
                let terminal_task = {
                    let tasks = inner.tasks.read().await;
                    tasks
                        .get(&task_id)
                        .is_some_and(|t| t.status.is_terminal())
                };
                if terminal_task {
                    return;
                }
            }

            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let terminal = event.kind.is_terminal();
                        yield event;
                        if terminal {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(task_id = %task_id, skipped, "event subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        })
    }

    async fn save_evidence(
        &self,
        task_id: &str,
        records: &[DecisionRecord],
    ) -> Result<(), StoreError> {
        self.inner
            .evidence
            .write()
            .await
            .insert(task_id.to_owned(), records.to_vec());
        Ok(())
    }

    async fn get_evidence(&self, task_id: &str) -> Result<Vec<DecisionRecord>, StoreError> {
        Ok(self
            .inner
            .evidence
            .read()
            .await
            .get(task_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// Collect every event of a (terminating) replay stream.
#[cfg(test)]
pub async fn collect_events(mut stream: EventStream) -> Vec<TaskEvent> {
    use futures::StreamExt as _;

    let mut collected = Vec::new();
    while let Some(event) = stream.next().await {
        collected.push(event);
    }
    collected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GuardrailConfig, RiskLevel};
    use crate::event::{Progress, TaskEventKind};

    fn event(task_id: &str, kind: TaskEventKind) -> TaskEvent {
        TaskEvent::new(kind, task_id, Progress::default())
    }

    #[tokio::test]
    async fn task_roundtrip() {
        let store = MemoryStore::new();
        let mut task = Task::new("u1", "ws1", "goal", GuardrailConfig::default());
        store.save_task(&task).await.unwrap();

        task.record_iteration();
        store.update_task(&task).await.unwrap();

        let loaded = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(loaded.iterations, 1);
        assert!(store.get_task("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_filters() {
        let store = MemoryStore::new();
        let a = Task::new("u1", "ws1", "a", GuardrailConfig::default());
        let b = Task::new("u1", "ws2", "b", GuardrailConfig::default());
        let c = Task::new("u2", "ws1", "c", GuardrailConfig::default());
        for t in [&a, &b, &c] {
            store.save_task(t).await.unwrap();
        }

        let all_u1 = store
            .list_tasks(&TaskFilter {
                user_id: "u1".into(),
                ..TaskFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(all_u1.len(), 2);

        let ws1_u1 = store
            .list_tasks(&TaskFilter {
                user_id: "u1".into(),
                workspace_id: Some("ws1".into()),
                status: None,
            })
            .await
            .unwrap();
        assert_eq!(ws1_u1.len(), 1);
        assert_eq!(ws1_u1[0].goal, "a");
    }

    #[tokio::test]
    async fn approval_resolution_is_exactly_once() {
        let store = MemoryStore::new();
        let approval = ApprovalRequest::new(
            "t1",
            "s1",
            "shell_execute",
            serde_json::json!({}),
            RiskLevel::High,
            "high risk",
        );
        store.save_approval(&approval).await.unwrap();

        let resolved = store
            .resolve_approval(&approval.id, ApprovalStatus::Approved, "alice")
            .await
            .unwrap();
        assert_eq!(resolved.status, ApprovalStatus::Approved);
        assert_eq!(resolved.decided_by.as_deref(), Some("alice"));

        let second = store
            .resolve_approval(&approval.id, ApprovalStatus::Denied, "bob")
            .await;
        assert!(matches!(second, Err(StoreError::AlreadyResolved(_))));

        // The first decision stands.
        let current = store.get_approval(&approval.id).await.unwrap().unwrap();
        assert_eq!(current.status, ApprovalStatus::Approved);
    }

    #[tokio::test]
    async fn replay_returns_history_then_ends_on_terminal() {
        let store = MemoryStore::new();
        store
            .append_event(&event("t1", TaskEventKind::PlanCreated))
            .await
            .unwrap();
        store
            .append_event(&event("t1", TaskEventKind::StepStarted))
            .await
            .unwrap();
        store
            .append_event(&event("t1", TaskEventKind::TaskComplete))
            .await
            .unwrap();

        let events = collect_events(store.replay_events("t1")).await;
        let kinds: Vec<TaskEventKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TaskEventKind::PlanCreated,
                TaskEventKind::StepStarted,
                TaskEventKind::TaskComplete,
            ]
        );
    }

    #[tokio::test]
    async fn replay_follows_live_events() {
        let store = MemoryStore::new();
        store
            .append_event(&event("t1", TaskEventKind::PlanCreated))
            .await
            .unwrap();

        let stream = store.replay_events("t1");
        let collector = tokio::spawn(collect_events(stream));

        // Give the subscriber a moment to attach before publishing.
        tokio::task::yield_now().await;
        store
            .append_event(&event("t1", TaskEventKind::StepComplete))
            .await
            .unwrap();
        store
            .append_event(&event("t1", TaskEventKind::TaskComplete))
            .await
            .unwrap();

        let events = collector.await.unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events.last().unwrap().kind, TaskEventKind::TaskComplete);
    }

    #[tokio::test]
    async fn event_log_is_bounded() {
        let store = MemoryStore::new();
        for _ in 0..(TASK_EVENT_HISTORY_MAX + 50) {
            store
                .append_event(&event("t1", TaskEventKind::Thinking))
                .await
                .unwrap();
        }
        store
            .append_event(&event("t1", TaskEventKind::TaskComplete))
            .await
            .unwrap();

        let events = collect_events(store.replay_events("t1")).await;
        assert!(events.len() <= TASK_EVENT_HISTORY_MAX);
    }

    #[tokio::test]
    async fn replay_of_terminal_task_with_empty_log_ends() {
        let store = MemoryStore::new();
        let mut task = Task::new("u1", "ws1", "goal", GuardrailConfig::default());
        task.begin_execution().unwrap();
        task.complete("done").unwrap();
        store.save_task(&task).await.unwrap();

        let events = collect_events(store.replay_events(&task.id)).await;
        assert!(events.is_empty());
    }
}
