use serde::{Deserialize, Serialize};

use crate::registry::ReviewerId;

/// Hard upper bound on exploration hops from a changed file.
pub const MAX_EXPLORATION_DEPTH: u32 = 5;

/// A pending investigation target (file path or symbol reference).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExplorationEntry {
    pub target: String,
    /// 1 = highest.
    pub priority: u32,
    pub depth: u32,
    /// Reviewer that discovered the entry; `None` for seed entries. Seeds are
    /// the changed files, covered by every reviewer's diff pass, and are never
    /// popped.
    pub origin: Option<ReviewerId>,
    pub reason: String,
    #[serde(default)]
    pub consumed: bool,
}

/// Priority-ordered set of exploration targets. Each entry is consumed at most once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ExplorationQueue {
    #[serde(default)]
    entries: Vec<ExplorationEntry>,
}

impl ExplorationQueue {
    /// Queue a target. Refused when deeper than `max_depth` or already queued
    /// for the same origin.
    pub fn push(
        &mut self,
        target: &str,
        reason: &str,
        priority: u32,
        depth: u32,
        origin: Option<&ReviewerId>,
        max_depth: u32,
    ) -> bool {
        let max_depth = max_depth.min(MAX_EXPLORATION_DEPTH);
        if depth > max_depth {
            return false;
        }
        if target.trim().is_empty() {
            return false;
        }
        if self
            .entries
            .iter()
            .any(|e| e.target == target && e.origin.as_ref() == origin)
        {
            return false;
        }
        self.entries.push(ExplorationEntry {
            target: target.to_string(),
            priority,
            depth,
            origin: origin.cloned(),
            reason: reason.to_string(),
            consumed: false,
        });
        true
    }

    /// Queue a target discovered while examining `parent`, one hop deeper.
    /// Seeded targets are refused.
    pub fn push_follow_up(
        &mut self,
        parent: Option<&ExplorationEntry>,
        target: &str,
        reason: &str,
        priority: u32,
        origin: &ReviewerId,
        max_depth: u32,
    ) -> bool {
        if self.is_seeded(target) {
            return false;
        }
        let depth = parent.map_or(1, |p| p.depth + 1);
        self.push(target, reason, priority, depth, Some(origin), max_depth)
    }

    /// Take the highest-priority unconsumed entry for `origin`, oldest first on ties.
    pub fn pop_next(&mut self, origin: Option<&ReviewerId>) -> Option<ExplorationEntry> {
        let idx = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.consumed && e.origin.as_ref() == origin)
            .min_by_key(|(i, e)| (e.priority, *i))
            .map(|(i, _)| i)?;
        let entry = &mut self.entries[idx];
        entry.consumed = true;
        Some(entry.clone())
    }

    pub fn pending(&self, origin: Option<&ReviewerId>) -> usize {
        self.entries
            .iter()
            .filter(|e| !e.consumed && e.origin.as_ref() == origin)
            .count()
    }

    pub fn entries(&self) -> &[ExplorationEntry] {
        &self.entries
    }

    fn is_seeded(&self, target: &str) -> bool {
        self.entries.iter().any(|e| e.origin.is_none() && e.target == target)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry discovered by `origin`.
    pub fn remove_origin(&mut self, origin: &ReviewerId) {
        self.entries.retain(|e| e.origin.as_ref() != Some(origin));
    }
}
