use std::sync::Arc;

use bytes::Bytes;

use crate::config::{AggregationRule, UpstreamTarget};
use crate::core::ProxyError;

/// State of one dispatched call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    Pending,
    Succeeded(Bytes),
    Failed(ProxyError),
}

impl CallOutcome {
    pub fn is_pending(&self) -> bool {
        matches!(self, CallOutcome::Pending)
    }
}

/// What a resolution did to the call state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Unknown target, a slot that was already resolved, or a `Pending`
    /// outcome. Nothing changed.
    Ignored,
    /// The slot was written; this many calls are still outstanding.
    Recorded(usize),
    /// The slot was written and it was the last one. Returned exactly once
    /// per state.
    Ready,
}

/// Per-exchange tracking of the calls fanned out for a matched rule.
///
/// Slots are kept in target declaration order so both the completion check
/// and the merge iterate deterministically.
#[derive(Debug)]
pub struct RequestCallState {
    rule: Arc<AggregationRule>,
    outcomes: Vec<CallOutcome>,
    outstanding: usize,
}

impl RequestCallState {
    pub fn new(rule: Arc<AggregationRule>) -> Self {
        let outcomes = vec![CallOutcome::Pending; rule.targets.len()];
        let outstanding = outcomes.len();
        Self {
            rule,
            outcomes,
            outstanding,
        }
    }

    pub fn rule(&self) -> &Arc<AggregationRule> {
        &self.rule
    }

    pub fn position(&self, target_id: &str) -> Option<usize> {
        self.rule.targets.iter().position(|t| t.id == target_id)
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    pub fn is_ready(&self) -> bool {
        self.outstanding == 0
    }

    pub fn resolve(&mut self, target_id: &str, outcome: CallOutcome) -> Resolution {
        match self.position(target_id) {
            Some(index) => self.resolve_at(index, outcome),
            None => Resolution::Ignored,
        }
    }

    /// Writes a terminal outcome into the slot at `index`. The decrement and
    /// the zero check happen together, so only the call that empties the
    /// last slot observes [`Resolution::Ready`].
    pub fn resolve_at(&mut self, index: usize, outcome: CallOutcome) -> Resolution {
        if outcome.is_pending() {
            return Resolution::Ignored;
        }
        let Some(slot) = self.outcomes.get_mut(index) else {
            return Resolution::Ignored;
        };
        if !slot.is_pending() {
            return Resolution::Ignored;
        }

        *slot = outcome;
        self.outstanding -= 1;

        if self.outstanding == 0 {
            Resolution::Ready
        } else {
            Resolution::Recorded(self.outstanding)
        }
    }

    /// Targets paired with their outcome, in declaration order.
    pub fn outcomes(&self) -> impl Iterator<Item = (&UpstreamTarget, &CallOutcome)> {
        self.rule.targets.iter().zip(self.outcomes.iter())
    }
}
