//! Ordered, upsert-only timeline for a single execution.
//!
//! `upsert` is the only way entries get in. A re-delivered entry (same
//! identity key) replaces the existing one in place, so push and poll can both
//! write the same step without duplicating it. Steps stay ordered by
//! `step_index`; every other kind keeps arrival order.
//!
//! Entries are compared without their timestamp. Sources fill a missing
//! server timestamp with the current time, so the same server entry can
//! arrive twice with different timestamps; it still counts as unchanged and
//! keeps the timestamp it was first stored with.
//!
//! Storage is an `Arc<Vec<_>>` mutated through `Arc::make_mut`: handing out a
//! snapshot is a refcount bump, and the next write after that copies.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;

use tracing::debug;

use super::{IdentityKey, StepRecord, TimelineEvent};
use crate::execution::ExecutionId;

/// Immutable view of a timeline at one point in time.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TimelineSnapshot(Arc<Vec<TimelineEvent>>);

impl TimelineSnapshot {
    pub fn steps(&self) -> impl Iterator<Item = &StepRecord> {
        self.0.iter().filter_map(TimelineEvent::as_step)
    }

    pub fn to_vec(&self) -> Vec<TimelineEvent> {
        self.0.as_ref().clone()
    }
}

impl Deref for TimelineSnapshot {
    type Target = [TimelineEvent];

    fn deref(&self) -> &[TimelineEvent] {
        &self.0
    }
}

/// What an `upsert` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// New entry stored at this position.
    Inserted(usize),
    /// Existing entry at this position replaced with different content.
    Replaced(usize),
    /// Identical entry already present at this position.
    Unchanged(usize),
    /// Event belongs to another execution and was not stored.
    Rejected,
}

impl UpsertOutcome {
    pub fn changed(self) -> bool {
        matches!(self, UpsertOutcome::Inserted(_) | UpsertOutcome::Replaced(_))
    }
}

/// Which entry is currently selected for detail display.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Selection {
    /// Follow the last entry.
    #[default]
    Latest,
    Pinned(IdentityKey),
}

#[derive(Debug, Clone)]
pub struct TimelineStore {
    execution_id: ExecutionId,
    events: Arc<Vec<TimelineEvent>>,
    index: HashMap<IdentityKey, usize>,
    selection: Selection,
}

impl TimelineStore {
    pub fn new(execution_id: ExecutionId) -> Self {
        Self {
            execution_id,
            events: Arc::new(Vec::new()),
            index: HashMap::new(),
            selection: Selection::Latest,
        }
    }

    pub fn execution_id(&self) -> &ExecutionId {
        &self.execution_id
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn snapshot(&self) -> TimelineSnapshot {
        TimelineSnapshot(Arc::clone(&self.events))
    }

    pub fn get(&self, key: &IdentityKey) -> Option<&TimelineEvent> {
        self.index.get(key).map(|&pos| &self.events[pos])
    }

    /// Most recent plan in the timeline, if any.
    pub fn latest_plan(&self) -> Option<&TimelineEvent> {
        self.events.iter().rev().find(|e| e.as_plan().is_some())
    }

    /// Insert the event, or replace the entry with the same identity key.
    pub fn upsert(&mut self, event: TimelineEvent) -> UpsertOutcome {
        if event.execution_id != self.execution_id {
            debug!(
                execution_id = %self.execution_id,
                foreign = %event.execution_id,
                "dropping event for another execution"
            );
            return UpsertOutcome::Rejected;
        }

        let key = event.identity_key();
        if let Some(&pos) = self.index.get(&key) {
            if same_content(&self.events[pos], &event) {
                return UpsertOutcome::Unchanged(pos);
            }
            // Last write wins; see DESIGN.md on near-simultaneous disagreement.
            debug!(
                execution_id = %self.execution_id,
                key = ?key,
                position = pos,
                "replacing timeline entry"
            );
            Arc::make_mut(&mut self.events)[pos] = event;
            return UpsertOutcome::Replaced(pos);
        }

        let pos = match &key {
            IdentityKey::Step(step_index) => self.step_insert_position(*step_index),
            _ => self.events.len(),
        };
        let events = Arc::make_mut(&mut self.events);
        if pos == events.len() {
            events.push(event);
            self.index.insert(key, pos);
        } else {
            events.insert(pos, event);
            self.rebuild_index();
        }
        UpsertOutcome::Inserted(pos)
    }

    /// Append position, unless a later step is already present; then the new
    /// step goes right before the first step with a greater index.
    fn step_insert_position(&self, step_index: u32) -> usize {
        self.events
            .iter()
            .position(|e| e.as_step().is_some_and(|s| s.step_index > step_index))
            .unwrap_or(self.events.len())
    }

    /// Drop every entry after the step with `step_index`. This is the undo
    /// path and the only way entries leave the store. Returns how many were
    /// removed; nothing happens if the step is not present.
    pub fn truncate_after_step(&mut self, step_index: u32) -> usize {
        let Some(&pos) = self.index.get(&IdentityKey::Step(step_index)) else {
            return 0;
        };
        let removed = self.events.len() - (pos + 1);
        if removed > 0 {
            Arc::make_mut(&mut self.events).truncate(pos + 1);
            self.rebuild_index();
            self.revalidate_selection();
        }
        removed
    }

    fn rebuild_index(&mut self) {
        self.index = self
            .events
            .iter()
            .enumerate()
            .map(|(pos, e)| (e.identity_key(), pos))
            .collect();
    }

    fn revalidate_selection(&mut self) {
        if let Selection::Pinned(key) = &self.selection {
            if !self.index.contains_key(key) {
                self.selection = Selection::Latest;
            }
        }
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    /// Pin the selection to an entry. Returns false (and leaves the selection
    /// alone) if no such entry exists.
    pub fn select(&mut self, key: IdentityKey) -> bool {
        if !self.index.contains_key(&key) {
            return false;
        }
        self.selection = Selection::Pinned(key);
        true
    }

    pub fn follow_latest(&mut self) {
        self.selection = Selection::Latest;
    }

    pub fn selected(&self) -> Option<&TimelineEvent> {
        match &self.selection {
            Selection::Latest => self.events.last(),
            Selection::Pinned(key) => self.get(key),
        }
    }
}

fn same_content(a: &TimelineEvent, b: &TimelineEvent) -> bool {
    a.id == b.id && a.kind == b.kind
}
