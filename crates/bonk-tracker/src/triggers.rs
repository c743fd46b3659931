//! Durable one-shot trigger queue persisted with each repository's state.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerKind {
    Poll {
        run_id: u64,
        run_url: String,
        issue_number: u64,
        created_unix_ms: u64,
    },
    Cleanup {
        key: String,
    },
}

impl TriggerKind {
    /// Stable id; scheduling the same id again replaces the earlier trigger.
    pub fn trigger_id(&self) -> String {
        match self {
            Self::Poll { run_id, .. } => poll_trigger_id(*run_id),
            Self::Cleanup { key } => cleanup_trigger_id(key),
        }
    }
}

pub fn poll_trigger_id(run_id: u64) -> String {
    format!("poll:{run_id}")
}

pub fn cleanup_trigger_id(key: &str) -> String {
    format!("cleanup:{key}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledTrigger {
    pub trigger_id: String,
    pub due_unix_ms: u64,
    pub kind: TriggerKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TriggerQueue {
    triggers: BTreeMap<String, ScheduledTrigger>,
}

impl TriggerQueue {
    pub fn schedule(&mut self, kind: TriggerKind, due_unix_ms: u64) -> &ScheduledTrigger {
        let trigger_id = kind.trigger_id();
        self.triggers.insert(
            trigger_id.clone(),
            ScheduledTrigger {
                trigger_id: trigger_id.clone(),
                due_unix_ms,
                kind,
            },
        );
        &self.triggers[&trigger_id]
    }

    pub fn cancel(&mut self, trigger_id: &str) -> bool {
        self.triggers.remove(trigger_id).is_some()
    }

    pub fn get(&self, trigger_id: &str) -> Option<&ScheduledTrigger> {
        self.triggers.get(trigger_id)
    }

    /// Removes and returns every trigger due at `now_unix_ms`, earliest first.
    pub fn take_due(&mut self, now_unix_ms: u64) -> Vec<ScheduledTrigger> {
        let due_ids = self
            .triggers
            .values()
            .filter(|trigger| trigger.due_unix_ms <= now_unix_ms)
            .map(|trigger| trigger.trigger_id.clone())
            .collect::<Vec<_>>();
        let mut due = due_ids
            .iter()
            .filter_map(|trigger_id| self.triggers.remove(trigger_id))
            .collect::<Vec<_>>();
        due.sort_by(|left, right| {
            left.due_unix_ms
                .cmp(&right.due_unix_ms)
                .then_with(|| left.trigger_id.cmp(&right.trigger_id))
        });
        due
    }

    pub fn next_due_unix_ms(&self) -> Option<u64> {
        self.triggers.values().map(|trigger| trigger.due_unix_ms).min()
    }

    pub fn len(&self) -> usize {
        self.triggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }
}
