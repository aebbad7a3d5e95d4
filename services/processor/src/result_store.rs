//! Rolling buffer of the most recent enrichment results.

use crate::model::EnrichmentResult;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Number of results kept for live display.
pub const DEFAULT_RESULT_CAPACITY: usize = 10;

/// Bounded FIFO of enrichment results, oldest evicted first.
///
/// Safe to push from many enrichment completions while readers take
/// snapshots.
#[derive(Debug)]
pub struct ResultStore {
    results: Mutex<VecDeque<EnrichmentResult>>,
    capacity: usize,
}

impl ResultStore {
    /// Create a store holding at most `capacity` results (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            results: Mutex::new(VecDeque::with_capacity(capacity + 1)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a result, evicting the oldest entries beyond capacity.
    ///
    /// Returns the number of evicted results.
    pub fn push(&self, result: EnrichmentResult) -> usize {
        let mut results = self.results.lock();
        results.push_back(result);

        let mut evicted = 0;
        while results.len() > self.capacity {
            results.pop_front();
            evicted += 1;
        }
        evicted
    }

    /// Current contents, oldest first.
    pub fn snapshot(&self) -> Vec<EnrichmentResult> {
        self.results.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.results.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.lock().is_empty()
    }
}

impl Default for ResultStore {
    fn default() -> Self {
        Self::new(DEFAULT_RESULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn result(n: usize) -> EnrichmentResult {
        EnrichmentResult::new(&format!("https://pbs.example.com/{n}.jpg"), n, 0, n).unwrap()
    }

    #[test]
    fn test_store_creation() {
        let store = ResultStore::default();
        assert!(store.is_empty());
        assert_eq!(store.capacity(), DEFAULT_RESULT_CAPACITY);
    }

    #[test]
    fn test_eleventh_push_evicts_first() {
        let store = ResultStore::default();
        for n in 0..11 {
            store.push(result(n));
        }

        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 10);
        assert!(!snapshot.contains(&result(0)));
        assert_eq!(snapshot.first(), Some(&result(1)));
        assert_eq!(snapshot.last(), Some(&result(10)));
    }

    #[test]
    fn test_snapshot_keeps_most_recent_in_order() {
        let store = ResultStore::new(3);
        for n in 0..25 {
            store.push(result(n));
            let snapshot = store.snapshot();
            assert!(snapshot.len() <= 3);

            let expected: Vec<_> = (n.saturating_sub(2)..=n).map(result).collect();
            assert_eq!(snapshot, expected);
        }
    }

    #[test]
    fn test_snapshot_does_not_drain() {
        let store = ResultStore::default();
        store.push(result(1));
        assert_eq!(store.snapshot().len(), 1);
        assert_eq!(store.snapshot().len(), 1);
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let store = ResultStore::new(0);
        store.push(result(1));
        assert_eq!(store.push(result(2)), 1);
        assert_eq!(store.snapshot(), vec![result(2)]);
    }

    #[test]
    fn test_concurrent_pushes_stay_bounded() {
        let store = Arc::new(ResultStore::default());

        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for n in 0..100 {
                        store.push(result(worker * 100 + n));
                        assert!(store.snapshot().len() <= DEFAULT_RESULT_CAPACITY);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.len(), DEFAULT_RESULT_CAPACITY);
    }
}
