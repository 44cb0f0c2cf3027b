//! Bounded FIFO of graph mutations waiting for replay.
//!
//! The queue itself is plain data; [`crate::DegradationService`] owns the only
//! instance and guards it with a mutex.

use chrono::{DateTime, Utc};
use lifeline_core::config::{EVICTION_BATCH, MAX_QUEUE_SIZE};
use lifeline_core::{DeferredGraphWrite, UnsyncedOperation, UnsyncedStats};
use std::collections::{HashSet, VecDeque};

#[derive(Debug)]
pub struct UnsyncedQueue {
    entries: VecDeque<UnsyncedOperation>,
    /// Entities whose popped entries are being replayed. One batch at a time.
    in_flight: HashSet<String>,
    capacity: usize,
    eviction_batch: usize,
    sequence: u64,
    evicted_total: u64,
    permanently_failed_total: u64,
}

impl Default for UnsyncedQueue {
    fn default() -> Self {
        Self::with_limits(MAX_QUEUE_SIZE, EVICTION_BATCH)
    }
}

impl UnsyncedQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_limits(capacity: usize, eviction_batch: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            in_flight: HashSet::new(),
            capacity: capacity.max(1),
            eviction_batch: eviction_batch.max(1),
            sequence: 0,
            evicted_total: 0,
            permanently_failed_total: 0,
        }
    }

    /// Append a deferred write, evicting the oldest entries first when full.
    ///
    /// Returns the new entry and the entries evicted to make room.
    pub fn push(
        &mut self,
        write: DeferredGraphWrite,
        now: DateTime<Utc>,
    ) -> (&UnsyncedOperation, Vec<UnsyncedOperation>) {
        let mut evicted = Vec::new();
        if self.entries.len() + 1 > self.capacity {
            let count = self.eviction_batch.min(self.entries.len());
            evicted.extend(self.entries.drain(..count));
            self.evicted_total += evicted.len() as u64;
        }

        self.sequence += 1;
        self.entries
            .push_back(UnsyncedOperation::new(write, now, self.sequence));
        let entry = &self.entries[self.entries.len() - 1];
        (entry, evicted)
    }

    /// Remove up to `max` entries from the front.
    ///
    /// Their entities count as pending until [`UnsyncedQueue::finish_batch`].
    pub fn pop_batch(&mut self, max: usize) -> Vec<UnsyncedOperation> {
        let count = max.min(self.entries.len());
        let batch: Vec<_> = self.entries.drain(..count).collect();
        self.in_flight
            .extend(batch.iter().map(|op| op.entity_id.clone()));
        batch
    }

    /// Mark the popped batch as settled, whether replayed, requeued or dropped.
    pub fn finish_batch(&mut self) {
        self.in_flight.clear();
    }

    /// True while a graph write for `entity_id` is queued or being replayed.
    pub fn has_pending(&self, entity_id: &str) -> bool {
        self.in_flight.contains(entity_id)
            || self.entries.iter().any(|op| op.entity_id == entity_id)
    }

    /// Put entries back at the front, keeping their relative order.
    pub fn requeue_front(&mut self, ops: Vec<UnsyncedOperation>) {
        for op in ops.into_iter().rev() {
            self.entries.push_front(op);
        }
    }

    pub fn record_permanent_failure(&mut self) {
        self.permanently_failed_total += 1;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry, returning how many were removed.
    pub fn clear(&mut self) -> usize {
        let removed = self.entries.len();
        self.entries.clear();
        removed
    }

    pub fn iter(&self) -> impl Iterator<Item = &UnsyncedOperation> {
        self.entries.iter()
    }

    pub fn stats(&self) -> UnsyncedStats {
        let mut stats = UnsyncedStats {
            total_queued: self.entries.len(),
            evicted_total: self.evicted_total,
            permanently_failed_total: self.permanently_failed_total,
            ..UnsyncedStats::default()
        };

        for op in &self.entries {
            *stats.counts_by_kind.entry(op.kind).or_insert(0) += 1;
            *stats
                .counts_by_collection
                .entry(op.collection.clone())
                .or_insert(0) += 1;
            stats.oldest_enqueued_at = Some(match stats.oldest_enqueued_at {
                Some(oldest) if oldest <= op.enqueued_at => oldest,
                _ => op.enqueued_at,
            });
            stats.newest_enqueued_at = Some(match stats.newest_enqueued_at {
                Some(newest) if newest >= op.enqueued_at => newest,
                _ => op.enqueued_at,
            });
        }

        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use lifeline_core::{OperationKind, Properties};

    fn write(entity_id: &str, kind: OperationKind) -> DeferredGraphWrite {
        DeferredGraphWrite {
            kind,
            collection: "financial_transactions".to_string(),
            entity_id: entity_id.to_string(),
            graph_labels: vec!["Transaction".to_string()],
            graph_properties: Properties::new(),
            relationships: Vec::new(),
        }
    }

    #[test]
    fn test_capacity_holds_after_overflow() {
        let mut queue = UnsyncedQueue::new();
        let now = Utc::now();
        let mut evicted_ids = Vec::new();
        for i in 0..1100 {
            let (_, evicted) = queue.push(write(&format!("e-{}", i), OperationKind::Create), now);
            evicted_ids.extend(evicted.into_iter().map(|op| op.entity_id));
        }

        assert_eq!(queue.len(), MAX_QUEUE_SIZE);
        assert_eq!(evicted_ids.len(), EVICTION_BATCH);
        assert_eq!(evicted_ids.first().map(String::as_str), Some("e-0"));
        assert_eq!(evicted_ids.last().map(String::as_str), Some("e-99"));
        assert_eq!(queue.stats().evicted_total, 100);
        assert_eq!(queue.iter().next().unwrap().entity_id, "e-100");
    }

    #[test]
    fn test_eviction_triggers_on_first_overflowing_push() {
        let mut queue = UnsyncedQueue::with_limits(10, 3);
        let now = Utc::now();
        for i in 0..10 {
            queue.push(write(&i.to_string(), OperationKind::Update), now);
        }
        assert_eq!(queue.len(), 10);

        let (entry, evicted) = queue.push(write("10", OperationKind::Update), now);
        assert_eq!(entry.entity_id, "10");
        assert_eq!(evicted.len(), 3);
        assert_eq!(queue.len(), 8);
    }

    #[test]
    fn test_requeue_front_keeps_order_ahead_of_new_arrivals() {
        let mut queue = UnsyncedQueue::new();
        let now = Utc::now();
        for id in ["a", "b", "c", "d"] {
            queue.push(write(id, OperationKind::Create), now);
        }

        let batch = queue.pop_batch(2);
        assert_eq!(batch.len(), 2);
        queue.push(write("e", OperationKind::Create), now);
        queue.requeue_front(batch);

        let order: Vec<_> = queue.iter().map(|op| op.entity_id.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn test_pending_covers_queued_and_in_flight_entries() {
        let mut queue = UnsyncedQueue::new();
        let now = Utc::now();
        queue.push(write("a", OperationKind::Create), now);
        queue.push(write("b", OperationKind::Create), now);
        assert!(queue.has_pending("a"));
        assert!(!queue.has_pending("c"));

        let batch = queue.pop_batch(1);
        assert_eq!(queue.len(), 1);
        assert!(queue.has_pending("a"));

        queue.requeue_front(batch);
        queue.finish_batch();
        assert!(queue.has_pending("a"));

        queue.pop_batch(2);
        queue.finish_batch();
        assert!(!queue.has_pending("a"));
        assert!(!queue.has_pending("b"));
    }

    #[test]
    fn test_stats_report_counts_and_bounds() {
        let mut queue = UnsyncedQueue::new();
        let start = Utc::now();
        queue.push(write("a", OperationKind::Create), start);
        queue.push(write("b", OperationKind::Update), start + Duration::seconds(5));
        queue.push(write("a", OperationKind::Delete), start + Duration::seconds(9));
        queue.record_permanent_failure();

        let stats = queue.stats();
        assert_eq!(stats.total_queued, 3);
        assert_eq!(stats.counts_by_kind[&OperationKind::Create], 1);
        assert_eq!(stats.counts_by_kind[&OperationKind::Update], 1);
        assert_eq!(stats.counts_by_kind[&OperationKind::Delete], 1);
        assert_eq!(stats.counts_by_collection["financial_transactions"], 3);
        assert_eq!(stats.oldest_enqueued_at, Some(start));
        assert_eq!(stats.newest_enqueued_at, Some(start + Duration::seconds(9)));
        assert_eq!(stats.permanently_failed_total, 1);

        assert_eq!(queue.clear(), 3);
        let empty = queue.stats();
        assert_eq!(empty.total_queued, 0);
        assert!(empty.oldest_enqueued_at.is_none());
    }
}
