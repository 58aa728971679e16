//! Serialized validation of incoming attempts.

use std::collections::VecDeque;

use super::attempt::{AttemptId, DecisionAttempt};

/// FIFO of attempts awaiting local validation, plus the one being validated.
///
/// Attempts are validated strictly one at a time in arrival order: the next
/// attempt is handed out only when the active one finishes.
#[derive(Debug, Default)]
pub struct DecisionQueue {
    pending: VecDeque<DecisionAttempt>,
    active: Option<DecisionAttempt>,
}

impl DecisionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an attempt. Returns it back if it becomes active immediately.
    pub fn enqueue(&mut self, attempt: DecisionAttempt) -> Option<DecisionAttempt> {
        if self.active.is_some() {
            self.pending.push_back(attempt);
            return None;
        }
        self.active = Some(attempt.clone());
        Some(attempt)
    }

    /// Finish the active attempt and activate the next one, if any.
    ///
    /// Finishing anything but the active attempt is a no-op.
    pub fn finish(&mut self, id: &AttemptId) -> Option<DecisionAttempt> {
        if self.active.as_ref().map(|a| &a.id) != Some(id) {
            return None;
        }
        self.active = self.pending.pop_front();
        self.active.clone()
    }

    pub fn active(&self) -> Option<&DecisionAttempt> {
        self.active.as_ref()
    }

    /// Attempts waiting behind the active one.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_none() && self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NodeId;
    use serde_json::json;

    fn attempt(n: u32) -> DecisionAttempt {
        DecisionAttempt::new("k", NodeId::new("p"), json!(n))
    }

    #[test]
    fn first_attempt_runs_immediately() {
        let mut queue = DecisionQueue::new();
        let a = attempt(1);
        assert_eq!(queue.enqueue(a.clone()), Some(a.clone()));
        assert_eq!(queue.active(), Some(&a));
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn attempts_run_in_arrival_order() {
        let mut queue = DecisionQueue::new();
        let (a, b, c) = (attempt(1), attempt(2), attempt(3));
        queue.enqueue(a.clone());
        assert_eq!(queue.enqueue(b.clone()), None);
        assert_eq!(queue.enqueue(c.clone()), None);
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.finish(&a.id), Some(b.clone()));
        assert_eq!(queue.finish(&b.id), Some(c.clone()));
        assert_eq!(queue.finish(&c.id), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn finishing_inactive_attempt_is_ignored() {
        let mut queue = DecisionQueue::new();
        let (a, b) = (attempt(1), attempt(2));
        queue.enqueue(a.clone());
        queue.enqueue(b.clone());

        assert_eq!(queue.finish(&b.id), None);
        assert_eq!(queue.active(), Some(&a));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn idle_queue_restarts_on_enqueue() {
        let mut queue = DecisionQueue::new();
        let a = attempt(1);
        queue.enqueue(a.clone());
        queue.finish(&a.id);

        let b = attempt(2);
        assert_eq!(queue.enqueue(b.clone()), Some(b));
    }
}
