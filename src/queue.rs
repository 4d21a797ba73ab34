//! Priority request queue.
//!
//! Holds only job ids during the pending window. Ordering is priority
//! descending, then enqueue order ascending. A `BTreeMap` keyed by
//! `(Reverse(priority), seq)` keeps removal and re-prioritisation at
//! O(log n) without rebuilding a heap.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};

use crate::state_machine::JobId;

type OrderKey = (Reverse<i32>, u64);

/// An entry handed out by [`PriorityQueue::dequeue_next`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub job_id: JobId,
    pub priority: i32,
    /// Enqueue sequence number, used to break ties between equal priorities.
    pub seq: u64,
}

#[derive(Debug, Default)]
pub struct PriorityQueue {
    order: BTreeMap<OrderKey, JobId>,
    index: HashMap<JobId, OrderKey>,
    next_seq: u64,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a job behind every entry of equal or higher priority.
    /// Returns the assigned sequence number. Re-enqueuing an id replaces it.
    pub fn enqueue(&mut self, job_id: JobId, priority: i32) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.insert(job_id, priority, seq);
        seq
    }

    /// Put a job back with a sequence number it was given earlier, so a job
    /// bounced by the rate limiter keeps its place among equal priorities.
    pub fn requeue(&mut self, entry: QueueEntry) {
        self.insert(entry.job_id, entry.priority, entry.seq);
    }

    fn insert(&mut self, job_id: JobId, priority: i32, seq: u64) {
        self.remove(&job_id);
        let key = (Reverse(priority), seq);
        self.order.insert(key, job_id.clone());
        self.index.insert(job_id, key);
    }

    /// Remove and return the highest-priority entry.
    pub fn dequeue_next(&mut self) -> Option<QueueEntry> {
        let ((Reverse(priority), seq), job_id) = self.order.pop_first()?;
        self.index.remove(&job_id);
        Some(QueueEntry {
            job_id,
            priority,
            seq,
        })
    }

    /// Drop a job before dispatch. Returns false if it was not queued.
    pub fn remove(&mut self, job_id: &str) -> bool {
        match self.index.remove(job_id) {
            Some(key) => {
                self.order.remove(&key);
                true
            }
            None => false,
        }
    }

    /// Move a queued job to its new priority position. Its original enqueue
    /// order still breaks ties.
    pub fn set_priority(&mut self, job_id: &str, priority: i32) -> bool {
        let Some(&(_, seq)) = self.index.get(job_id) else {
            return false;
        };
        self.insert(job_id.to_string(), priority, seq);
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Ids in dispatch order.
    pub fn ids(&self) -> Vec<JobId> {
        self.order.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(queue: &mut PriorityQueue) -> Vec<String> {
        std::iter::from_fn(|| queue.dequeue_next().map(|e| e.job_id)).collect()
    }

    #[test]
    fn orders_by_priority_then_fifo() {
        let mut queue = PriorityQueue::new();
        for (id, priority) in [("a", 1), ("b", 5), ("c", 1), ("d", 3), ("e", 1)] {
            queue.enqueue(id.into(), priority);
        }
        assert_eq!(drain(&mut queue), vec!["b", "d", "a", "c", "e"]);
        assert!(queue.dequeue_next().is_none());
    }

    #[test]
    fn negative_priorities_sort_last() {
        let mut queue = PriorityQueue::new();
        queue.enqueue("low".into(), -4);
        queue.enqueue("zero".into(), 0);
        assert_eq!(drain(&mut queue), vec!["zero", "low"]);
    }

    #[test]
    fn remove_before_dispatch() {
        let mut queue = PriorityQueue::new();
        queue.enqueue("a".into(), 1);
        queue.enqueue("b".into(), 1);
        assert!(queue.remove("a"));
        assert!(!queue.remove("a"));
        assert_eq!(queue.len(), 1);
        assert_eq!(drain(&mut queue), vec!["b"]);
    }

    #[test]
    fn set_priority_resorts_but_keeps_enqueue_order() {
        let mut queue = PriorityQueue::new();
        queue.enqueue("a".into(), 1);
        queue.enqueue("b".into(), 1);
        queue.enqueue("c".into(), 2);

        assert!(queue.set_priority("b", 2));
        // b and c now share priority 2; b was enqueued first.
        assert_eq!(queue.ids(), vec!["b", "c", "a"]);
        assert!(!queue.set_priority("missing", 9));
        assert_eq!(drain(&mut queue), vec!["b", "c", "a"]);
    }

    #[test]
    fn requeue_restores_original_place() {
        let mut queue = PriorityQueue::new();
        queue.enqueue("a".into(), 1);
        queue.enqueue("b".into(), 1);
        let first = queue.dequeue_next().unwrap();
        assert_eq!(first.job_id, "a");

        queue.enqueue("c".into(), 1);
        queue.requeue(first);
        assert_eq!(drain(&mut queue), vec!["a", "b", "c"]);
    }

    #[test]
    fn enqueue_same_id_replaces_entry() {
        let mut queue = PriorityQueue::new();
        queue.enqueue("a".into(), 1);
        queue.enqueue("a".into(), 7);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.dequeue_next().unwrap().priority, 7);
    }
}
