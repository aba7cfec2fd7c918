//! Several executions side by side (combined / benchmark views).
//!
//! Each execution lives in its own [`RunSlot`]. Slots are immutable once
//! published: every change clones the slot, applies the change, and swaps the
//! new `Arc` into the map, so a reader holding an old slot never sees it
//! move. The coordinator is the only writer for its slots.
//!
//! Failures stay in the slot they belong to. A failed history load still
//! yields a slot (empty timeline plus an error event), and a failed user
//! action is recorded in the acting execution's own timeline.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::backend::history::{fetch_history, History};
use crate::backend::{Backend, BackendError, MessageMode};
use crate::execution::{ExecutionId, ExecutionMeta, ExecutionRef, ExecutionStatus};
use crate::timeline::{
    ErrorOrigin, EventKind, IdentityKey, PlanStatus, StepRecord, TimelineEvent, TimelineSnapshot, TimelineStore,
};

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("execution {0} is not part of this view")]
    UnknownExecution(ExecutionId),

    #[error("execution {0} has no plan to act on")]
    NoPlan(ExecutionId),

    #[error("execution {id}: {source}")]
    Backend {
        id: ExecutionId,
        #[source]
        source: BackendError,
    },
}

/// UI-only busy flags. Set when a request starts, cleared when that request
/// completes or fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotFlags {
    pub generating_plan: bool,
    pub executing: bool,
}

impl SlotFlags {
    pub fn busy(&self) -> bool {
        self.generating_plan || self.executing
    }

    fn set(&mut self, mode: MessageMode, on: bool) {
        match mode {
            MessageMode::Plan => self.generating_plan = on,
            MessageMode::Execute => self.executing = on,
        }
    }
}

/// Per-execution state in a combined view.
#[derive(Debug, Clone)]
pub struct RunSlot {
    pub execution: ExecutionRef,
    pub meta: Option<ExecutionMeta>,
    pub timeline: TimelineStore,
    pub flags: SlotFlags,
    /// Set when the most recent history load failed.
    pub load_error: Option<String>,
}

impl RunSlot {
    fn empty(execution: ExecutionRef) -> Self {
        let timeline = TimelineStore::new(execution.id.clone());
        Self {
            execution,
            meta: None,
            timeline,
            flags: SlotFlags::default(),
            load_error: None,
        }
    }

    pub fn status(&self) -> ExecutionStatus {
        self.meta.as_ref().map_or(ExecutionStatus::Unknown, |m| m.status)
    }

    pub fn events(&self) -> TimelineSnapshot {
        self.timeline.snapshot()
    }

    pub fn steps(&self) -> Vec<StepRecord> {
        self.timeline.snapshot().steps().cloned().collect()
    }
}

/// All slots, in the order they were first loaded.
#[derive(Debug, Clone, Default)]
pub struct CombinedView {
    order: Vec<ExecutionId>,
    slots: HashMap<ExecutionId, Arc<RunSlot>>,
}

impl CombinedView {
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn get(&self, id: &ExecutionId) -> Option<&Arc<RunSlot>> {
        self.slots.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<RunSlot>> {
        self.order.iter().filter_map(|id| self.slots.get(id))
    }
}

pub struct MultiRunCoordinator {
    backend: Arc<dyn Backend>,
    view: watch::Sender<CombinedView>,
}

impl MultiRunCoordinator {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        let (view, _) = watch::channel(CombinedView::default());
        Self { backend, view }
    }

    pub fn view(&self) -> CombinedView {
        self.view.borrow().clone()
    }

    pub fn slot(&self, id: &ExecutionId) -> Option<Arc<RunSlot>> {
        self.view.borrow().slots.get(id).cloned()
    }

    /// Notified after every slot change.
    pub fn subscribe(&self) -> watch::Receiver<CombinedView> {
        self.view.subscribe()
    }

    /// Fetch every execution's history in parallel and merge the results once
    /// all have settled. One execution failing does not affect the others.
    /// Existing slots are merged into through `upsert`, so locally recorded
    /// events (user messages, errors) survive a reload.
    pub async fn load_all(&self, executions: &[ExecutionRef]) {
        let backend = self.backend.as_ref();
        let results = join_all(executions.iter().map(|exec| fetch_history(backend, exec))).await;

        self.view.send_modify(|view| {
            for (exec, result) in executions.iter().zip(results) {
                let mut slot = match view.slots.get(&exec.id) {
                    Some(current) => RunSlot::clone(current),
                    None => {
                        view.order.push(exec.id.clone());
                        RunSlot::empty(exec.clone())
                    }
                };
                merge_history(&mut slot, exec, result);
                view.slots.insert(exec.id.clone(), Arc::new(slot));
            }
        });
        info!(count = executions.len(), "combined view loaded");
    }

    /// Re-fetch one execution and merge it the way [`load_all`] does.
    ///
    /// [`load_all`]: MultiRunCoordinator::load_all
    pub async fn refresh(&self, id: &ExecutionId) -> Result<(), CoordinatorError> {
        let exec = self.execution_ref(id)?;
        self.resync(&exec).await;
        Ok(())
    }

    /// Merge fresh history into an existing slot. Unlike `load_all` this
    /// never creates one, so a slot removed while the fetch was in flight
    /// stays removed.
    async fn resync(&self, exec: &ExecutionRef) {
        let result = fetch_history(self.backend.as_ref(), exec).await;
        self.update(&exec.id, |slot| merge_history(slot, exec, result));
    }

    /// Drop one slot (its view went away).
    pub fn remove(&self, id: &ExecutionId) -> bool {
        self.view.send_if_modified(|view| {
            if view.slots.remove(id).is_none() {
                return false;
            }
            view.order.retain(|o| o != id);
            true
        })
    }

    /// Record the user's message immediately, mark the execution busy, send,
    /// then merge the authoritative state. On failure an error event is
    /// appended instead; the user's message is kept either way and the busy
    /// flag is always cleared.
    pub async fn send_message(&self, id: &ExecutionId, text: &str, mode: MessageMode) -> Result<(), CoordinatorError> {
        let exec = self.execution_ref(id)?;
        self.update(id, |slot| {
            slot.timeline.upsert(TimelineEvent::user(id.clone(), text));
            slot.flags.set(mode, true);
        });

        match self.backend.send_message(&exec, text, mode).await {
            Ok(()) => {
                debug!(execution = %exec, ?mode, "message sent");
                self.resync(&exec).await;
                self.update(id, |slot| slot.flags.set(mode, false));
                Ok(())
            }
            Err(e) => {
                warn!(execution = %exec, error = %e, "send message failed");
                let message = format!("Failed to send message: {e}");
                self.update(id, |slot| {
                    slot.timeline
                        .upsert(TimelineEvent::error(id.clone(), ErrorOrigin::Action, message));
                    slot.flags.set(mode, false);
                });
                Err(CoordinatorError::Backend {
                    id: id.clone(),
                    source: e,
                })
            }
        }
    }

    pub async fn approve_plan(&self, id: &ExecutionId) -> Result<(), CoordinatorError> {
        self.decide_plan(id, PlanStatus::Approved, None).await
    }

    pub async fn reject_plan(&self, id: &ExecutionId, reason: Option<&str>) -> Result<(), CoordinatorError> {
        self.decide_plan(id, PlanStatus::Rejected, reason).await
    }

    /// The backend call goes first; nothing local changes unless it succeeds.
    /// A failed decision is therefore only returned, never recorded as an
    /// `Error` event, unlike a failed `send_message`.
    async fn decide_plan(
        &self,
        id: &ExecutionId,
        decision: PlanStatus,
        reason: Option<&str>,
    ) -> Result<(), CoordinatorError> {
        let slot = self
            .slot(id)
            .ok_or_else(|| CoordinatorError::UnknownExecution(id.clone()))?;
        let plan_id = slot
            .timeline
            .latest_plan()
            .and_then(TimelineEvent::as_plan)
            .map(|p| p.plan_id.clone())
            .ok_or_else(|| CoordinatorError::NoPlan(id.clone()))?;
        let exec = slot.execution.clone();

        let sent = match decision {
            PlanStatus::Rejected => self.backend.reject_plan(&exec, &plan_id, reason).await,
            _ => self.backend.approve_plan(&exec, &plan_id).await,
        };
        sent.map_err(|source| CoordinatorError::Backend {
            id: id.clone(),
            source,
        })?;

        let note = match decision {
            PlanStatus::Rejected => match reason {
                Some(r) => format!("Plan rejected: {r}"),
                None => "Plan rejected".to_string(),
            },
            _ => "Plan approved".to_string(),
        };
        self.update(id, |slot| {
            // Re-read: a reload may have replaced the plan since it was located.
            if let Some(mut event) = slot.timeline.get(&IdentityKey::Plan(plan_id.clone())).cloned() {
                if let EventKind::Plan(plan) = &mut event.kind {
                    plan.status = decision;
                }
                slot.timeline.upsert(event);
            }
            slot.timeline.upsert(TimelineEvent::system(id.clone(), note));
        });
        info!(execution = %exec, plan_id = %plan_id, ?decision, "plan decided");

        self.refresh_meta(&exec).await;
        Ok(())
    }

    /// Ask the backend to cancel, then pick up the resulting status.
    pub async fn cancel(&self, id: &ExecutionId) -> Result<(), CoordinatorError> {
        let exec = self.execution_ref(id)?;
        self.backend
            .cancel(&exec)
            .await
            .map_err(|source| CoordinatorError::Backend {
                id: id.clone(),
                source,
            })?;
        self.refresh_meta(&exec).await;
        Ok(())
    }

    /// Undo server-side back to `step_index`, drop the undone entries
    /// locally, and re-sync.
    pub async fn undo_to_step(&self, id: &ExecutionId, step_index: u32) -> Result<(), CoordinatorError> {
        let exec = self.execution_ref(id)?;
        self.backend
            .undo_to_step(&exec, step_index)
            .await
            .map_err(|source| CoordinatorError::Backend {
                id: id.clone(),
                source,
            })?;
        self.update(id, |slot| {
            let removed = slot.timeline.truncate_after_step(step_index);
            debug!(execution = %slot.execution, step_index, removed, "undo truncated timeline");
        });
        self.resync(&exec).await;
        Ok(())
    }

    pub async fn replay_from_step(&self, id: &ExecutionId, step_index: u32) -> Result<(), CoordinatorError> {
        let exec = self.execution_ref(id)?;
        self.backend
            .replay_from_step(&exec, step_index)
            .await
            .map_err(|source| CoordinatorError::Backend {
                id: id.clone(),
                source,
            })?;
        self.resync(&exec).await;
        Ok(())
    }

    async fn refresh_meta(&self, exec: &ExecutionRef) {
        match self.backend.fetch_execution(exec).await {
            Ok(meta) => {
                self.update(&exec.id, |slot| slot.meta = Some(meta));
            }
            Err(e) => warn!(execution = %exec, error = %e, "metadata refresh failed"),
        }
    }

    fn execution_ref(&self, id: &ExecutionId) -> Result<ExecutionRef, CoordinatorError> {
        self.view
            .borrow()
            .slots
            .get(id)
            .map(|slot| slot.execution.clone())
            .ok_or_else(|| CoordinatorError::UnknownExecution(id.clone()))
    }

    /// Copy-on-write update of one slot. Returns false if the slot is gone.
    fn update(&self, id: &ExecutionId, f: impl FnOnce(&mut RunSlot)) -> bool {
        let updated = self.view.send_if_modified(|view| {
            let Some(current) = view.slots.get(id) else {
                return false;
            };
            let mut next = RunSlot::clone(current);
            f(&mut next);
            view.slots.insert(id.clone(), Arc::new(next));
            true
        });
        if !updated {
            debug!(execution_id = %id, "slot removed before update");
        }
        updated
    }
}

fn merge_history(slot: &mut RunSlot, exec: &ExecutionRef, result: Result<History, BackendError>) {
    match result {
        Ok(history) => {
            slot.meta = Some(history.meta.clone());
            slot.load_error = None;
            for event in history.into_events(exec) {
                slot.timeline.upsert(event);
            }
        }
        Err(e) => {
            warn!(execution = %exec, error = %e, "history load failed");
            let message = e.to_string();
            let mut event = TimelineEvent::error(
                exec.id.clone(),
                ErrorOrigin::Load,
                format!("Failed to load execution: {message}"),
            );
            // At most one load error per slot; a later failure replaces it.
            if let Some(previous) = slot.timeline.snapshot().iter().rev().find(|ev| is_load_error(ev)) {
                event.id = previous.id.clone();
            }
            slot.timeline.upsert(event);
            slot.load_error = Some(message);
        }
    }
}

fn is_load_error(event: &TimelineEvent) -> bool {
    matches!(&event.kind, EventKind::Error(e) if e.origin == ErrorOrigin::Load)
}
