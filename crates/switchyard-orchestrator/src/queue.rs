//! Priority queue of pending tasks.
//!
//! Tasks are dispatched highest priority first and FIFO within a priority.
//! The queue only holds task IDs and the fields needed for matching; task
//! records live with the coordinator.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Priority for task execution (higher value = higher priority).
pub type Priority = u32;

/// One queued task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    /// Task ID.
    pub task_id: String,
    /// Agent type the task must run on.
    pub agent_type: String,
    /// Task priority.
    pub priority: Priority,
    /// Enqueue sequence number.
    pub sequence: u64,
}

/// Heap wrapper: higher priority first, then lower sequence first.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PriorityEntry(QueueEntry);

impl PartialOrd for PriorityEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PriorityEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap, so older entries must compare greater.
        (self.0.priority, Reverse(self.0.sequence))
            .cmp(&(other.0.priority, Reverse(other.0.sequence)))
    }
}

/// Pending task queue.
#[derive(Debug, Default)]
pub struct TaskQueue {
    heap: BinaryHeap<PriorityEntry>,
    next_sequence: u64,
}

impl TaskQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a task.
    pub fn push(&mut self, task_id: impl Into<String>, agent_type: impl Into<String>, priority: Priority) {
        let entry = QueueEntry {
            task_id: task_id.into(),
            agent_type: agent_type.into(),
            priority,
            sequence: self.next_sequence,
        };
        self.next_sequence += 1;
        debug!(task_id = %entry.task_id, priority, "Enqueued task");
        self.heap.push(PriorityEntry(entry));
    }

    /// Removes a task wherever it sits in the queue.
    ///
    /// # Returns
    /// Returns `true` if the task was queued.
    pub fn remove(&mut self, task_id: &str) -> bool {
        let before = self.heap.len();
        self.heap.retain(|e| e.0.task_id != task_id);
        self.heap.len() < before
    }

    /// Whether `task_id` is queued.
    #[must_use]
    pub fn contains(&self, task_id: &str) -> bool {
        self.heap.iter().any(|e| e.0.task_id == task_id)
    }

    /// Walks the queue in dispatch order, removing every entry for which
    /// `take` returns `true`.
    ///
    /// # Returns
    /// The removed entries, in dispatch order.
    pub fn take_where<F>(&mut self, mut take: F) -> Vec<QueueEntry>
    where
        F: FnMut(&QueueEntry) -> bool,
    {
        let ordered = std::mem::take(&mut self.heap).into_sorted_vec();
        let mut taken = Vec::new();
        // into_sorted_vec is ascending; dispatch order is the reverse.
        for entry in ordered.into_iter().rev() {
            if take(&entry.0) {
                taken.push(entry.0);
            } else {
                self.heap.push(entry);
            }
        }
        taken
    }

    /// Queued entries in dispatch order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<QueueEntry> {
        let mut entries: Vec<_> = self.heap.iter().cloned().collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries.into_iter().map(|e| e.0).collect()
    }

    /// Number of queued tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
