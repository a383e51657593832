use crate::agent::{cancel_pair, CancelHandle, CancelSignal};
use crate::types::{Task, TaskDefinition, TaskId, TaskStats, TaskStatus};
use chrono::Utc;
use harmonia_core::{HarmoniaError, HarmoniaResult};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Default)]
struct GraphState {
    tasks: HashMap<TaskId, Task>,
    /// Reverse edges: task -> tasks that list it as a dependency.
    dependents: HashMap<TaskId, BTreeSet<TaskId>>,
    cancels: HashMap<TaskId, CancelHandle>,
}

impl GraphState {
    fn get(&self, id: TaskId) -> HarmoniaResult<&Task> {
        self.tasks.get(&id).ok_or(HarmoniaError::UnknownTask(id))
    }

    fn get_mut(&mut self, id: TaskId) -> HarmoniaResult<&mut Task> {
        self.tasks.get_mut(&id).ok_or(HarmoniaError::UnknownTask(id))
    }

    fn pending_dependencies(&self, task: &Task) -> Vec<TaskId> {
        task.dependencies
            .iter()
            .filter(|dep| {
                self.tasks.get(dep).map(|d| d.status) != Some(TaskStatus::Completed)
            })
            .copied()
            .collect()
    }

    fn is_ready(&self, task: &Task) -> bool {
        task.status == TaskStatus::Queued && self.pending_dependencies(task).is_empty()
    }
}

fn invalid(task: &Task, to: TaskStatus) -> HarmoniaError {
    HarmoniaError::InvalidTransition {
        task: task.id,
        from: task.status.to_string(),
        to: to.to_string(),
    }
}

/// Dependency-gated task state machine.
///
/// `Created -> Queued -> Executing -> Completed | Failed`. A task enters
/// `Executing` only through [`TaskOrchestrator::start`], which refuses while any
/// dependency is not `Completed`. Dependencies must already be submitted, so the
/// graph is acyclic by construction.
pub struct TaskOrchestrator {
    state: RwLock<GraphState>,
}

impl TaskOrchestrator {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(GraphState::default()),
        }
    }

    /// Submit a task. It is queued immediately.
    pub async fn submit(
        &self,
        definition: TaskDefinition,
        dependencies: impl IntoIterator<Item = TaskId>,
        priority: i64,
    ) -> HarmoniaResult<Task> {
        let dependencies: BTreeSet<TaskId> = dependencies.into_iter().collect();
        let mut state = self.state.write().await;

        if let Some(missing) = dependencies.iter().find(|d| !state.tasks.contains_key(d)) {
            return Err(HarmoniaError::UnknownDependency(*missing));
        }

        let mut task = Task::new(definition, dependencies, priority);
        debug!(task = %task.id, status = %task.status, "Task created");
        task.status = TaskStatus::Queued;

        for dep in &task.dependencies {
            state.dependents.entry(*dep).or_default().insert(task.id);
        }
        info!(
            task = %task.id,
            capability = %task.capability(),
            dependencies = task.dependencies.len(),
            priority = task.priority,
            "Task queued"
        );
        state.tasks.insert(task.id, task.clone());
        Ok(task)
    }

    pub async fn get(&self, id: TaskId) -> Option<Task> {
        self.state.read().await.tasks.get(&id).cloned()
    }

    /// All tasks, oldest first.
    pub async fn list(&self) -> Vec<Task> {
        let state = self.state.read().await;
        let mut tasks: Vec<Task> = state.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        tasks
    }

    /// Whether the task is queued with every dependency completed.
    pub async fn is_ready(&self, id: TaskId) -> bool {
        let state = self.state.read().await;
        state.tasks.get(&id).is_some_and(|t| state.is_ready(t))
    }

    /// Dependencies of `id` that are not completed yet.
    pub async fn pending_dependencies(&self, id: TaskId) -> HarmoniaResult<Vec<TaskId>> {
        let state = self.state.read().await;
        let task = state.get(id)?;
        Ok(state.pending_dependencies(task))
    }

    /// Queued tasks whose dependencies are complete, most urgent first
    /// (priority descending, then task id).
    pub async fn ready_unassigned(&self) -> Vec<TaskId> {
        let state = self.state.read().await;
        let mut ready: Vec<&Task> = state.tasks.values().filter(|t| state.is_ready(t)).collect();
        ready.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        ready.into_iter().map(|t| t.id).collect()
    }

    /// Move a queued task to `Executing` on behalf of `agent_id`.
    ///
    /// Returns [`HarmoniaError::DependencyNotSatisfied`] while any dependency is
    /// incomplete; the task then stays queued.
    pub async fn start(&self, id: TaskId, agent_id: &str) -> HarmoniaResult<(Task, CancelSignal)> {
        let mut state = self.state.write().await;
        let task = state.get(id)?;
        if task.status != TaskStatus::Queued {
            return Err(invalid(task, TaskStatus::Executing));
        }
        let pending = state.pending_dependencies(task);
        if !pending.is_empty() {
            return Err(HarmoniaError::DependencyNotSatisfied { task: id, pending });
        }

        let (handle, signal) = cancel_pair();
        state.cancels.insert(id, handle);
        let task = state.get_mut(id)?;
        task.status = TaskStatus::Executing;
        task.assigned_agent = Some(agent_id.to_string());
        task.started_at = Some(Utc::now());
        info!(task = %id, agent = %agent_id, "Task executing");
        Ok((task.clone(), signal))
    }

    /// Mark an executing task completed and release its dependents.
    ///
    /// Returns the completed task and the dependents that became ready, in
    /// task-id order.
    pub async fn complete(&self, id: TaskId, output: Value) -> HarmoniaResult<(Task, Vec<TaskId>)> {
        let mut state = self.state.write().await;
        let task = state.get_mut(id)?;
        if task.status != TaskStatus::Executing {
            return Err(invalid(task, TaskStatus::Completed));
        }
        task.status = TaskStatus::Completed;
        task.output = Some(output);
        task.finished_at = Some(Utc::now());
        let task = task.clone();
        state.cancels.remove(&id);

        let released = Self::release_dependents(&state, id);
        info!(task = %id, released = released.len(), "Task completed");
        Ok((task, released))
    }

    /// Mark an executing task failed. Dependents stay queued.
    pub async fn fail(&self, id: TaskId, reason: impl Into<String>) -> HarmoniaResult<Task> {
        let mut state = self.state.write().await;
        let task = state.get_mut(id)?;
        if task.status != TaskStatus::Executing {
            return Err(invalid(task, TaskStatus::Failed));
        }
        let reason = reason.into();
        task.status = TaskStatus::Failed;
        task.failure_reason = Some(reason.clone());
        task.finished_at = Some(Utc::now());
        let task = task.clone();
        state.cancels.remove(&id);

        let blocked = Self::collect_blocked(&state, id);
        warn!(task = %id, reason = %reason, blocked = blocked.len(), "Task failed");
        Ok(task)
    }

    /// Cancel a task that has not finished. It becomes `Failed` and, if it
    /// was executing, its cancel signal fires so the agent can stop.
    pub async fn cancel(&self, id: TaskId) -> HarmoniaResult<Task> {
        let mut state = self.state.write().await;
        let task = state.get_mut(id)?;
        if task.status.is_terminal() {
            return Err(invalid(task, TaskStatus::Failed));
        }
        task.status = TaskStatus::Failed;
        task.failure_reason = Some("cancelled".to_string());
        task.finished_at = Some(Utc::now());
        let task = task.clone();
        if let Some(handle) = state.cancels.remove(&id) {
            handle.cancel();
        }

        let blocked = Self::collect_blocked(&state, id);
        info!(task = %id, blocked = blocked.len(), "Task cancelled");
        Ok(task)
    }

    /// Non-terminal tasks that transitively depend on `id`, in task-id order.
    pub async fn blocked_by(&self, id: TaskId) -> Vec<TaskId> {
        let state = self.state.read().await;
        Self::collect_blocked(&state, id)
    }

    pub async fn stats(&self) -> TaskStats {
        let state = self.state.read().await;
        let mut stats = TaskStats::default();
        for task in state.tasks.values() {
            match task.status {
                TaskStatus::Created => stats.created += 1,
                TaskStatus::Queued => stats.queued += 1,
                TaskStatus::Executing => stats.executing += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    /// Tasks currently executing on `agent_id`.
    pub async fn executing_on(&self, agent_id: &str) -> Vec<TaskId> {
        let state = self.state.read().await;
        let mut ids: Vec<TaskId> = state
            .tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::Executing && t.assigned_agent.as_deref() == Some(agent_id)
            })
            .map(|t| t.id)
            .collect();
        ids.sort();
        ids
    }

    /// Re-run the readiness check for every direct dependent of a completed
    /// task, walking an explicit work-list in task-id order.
    fn release_dependents(state: &GraphState, completed: TaskId) -> Vec<TaskId> {
        let mut work: VecDeque<TaskId> = state
            .dependents
            .get(&completed)
            .map(|d| d.iter().copied().collect())
            .unwrap_or_default();
        let mut released = Vec::new();
        while let Some(candidate) = work.pop_front() {
            if let Some(task) = state.tasks.get(&candidate) {
                if state.is_ready(task) {
                    released.push(candidate);
                }
            }
        }
        released
    }

    /// Iterative transitive walk over reverse edges.
    fn collect_blocked(state: &GraphState, root: TaskId) -> Vec<TaskId> {
        let mut seen: HashSet<TaskId> = HashSet::new();
        let mut work: Vec<TaskId> = vec![root];
        let mut blocked = BTreeSet::new();
        while let Some(current) = work.pop() {
            if let Some(children) = state.dependents.get(&current) {
                for child in children {
                    if seen.insert(*child) {
                        if let Some(task) = state.tasks.get(child) {
                            if !task.status.is_terminal() {
                                blocked.insert(*child);
                            }
                        }
                        work.push(*child);
                    }
                }
            }
        }
        blocked.into_iter().collect()
    }
}

impl Default for TaskOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}
