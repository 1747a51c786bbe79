//! Priority queues over inputs.
//!
//! Both the ready queue and the unscheduled queue share one structure with a
//! total order of `(priority desc, timestamp-delta asc, insertion counter
//! asc)`. The counter comes from a monotonic per-queue source and provides
//! FIFO tie-break among equal-priority entries; an entry re-inserted after a
//! binding mismatch keeps its old counter so its place in line is preserved.
//!
//! Blocked inputs stay in the ready queue: with no interrupts there is no
//! control point to wake them, so unblocking is checked when an entry would
//! be chosen to run (see the dispatcher's pop loop in `core`).
//!
//! The queues themselves are policy-free ordered sets; binding and blocked
//! filtering happen in the dispatcher, which holds the scheduling lock.

use std::collections::BTreeSet;

use ahash::AHashMap;

/// One queued input with its ordering key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct QueueEntry {
    pub input: usize,
    pub priority: i32,
    /// `last_timestamp - base_timestamp` snapshot for timestamp-ordered
    /// inputs, 0 otherwise.
    pub timestamp_delta: u64,
    pub counter: u64,
}

impl QueueEntry {
    fn key(&self) -> QueueKey {
        QueueKey {
            neg_priority: -(i64::from(self.priority)),
            timestamp_delta: self.timestamp_delta,
            counter: self.counter,
            input: self.input,
        }
    }
}

/// Derived `Ord` gives: priority desc, delta asc, counter asc.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    neg_priority: i64,
    timestamp_delta: u64,
    counter: u64,
    input: usize,
}

/// Ordered input queue with O(log n) push/pop/erase and keyed lookup.
#[derive(Debug, Default)]
pub(crate) struct InputQueue {
    ordered: BTreeSet<QueueKey>,
    by_input: AHashMap<usize, QueueEntry>,
    counter: u64,
}

impl InputQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts with a fresh counter (back of its priority class).
    /// An input may appear at most once; re-pushing an existing input is a
    /// caller bug and panics in debug builds.
    pub fn push(&mut self, input: usize, priority: i32, timestamp_delta: u64) {
        self.counter += 1;
        let entry = QueueEntry {
            input,
            priority,
            timestamp_delta,
            counter: self.counter,
        };
        self.reinsert(entry);
    }

    /// Re-inserts an entry popped earlier, preserving its counter and thus
    /// its FIFO position among equals.
    pub fn reinsert(&mut self, entry: QueueEntry) {
        debug_assert!(!self.by_input.contains_key(&entry.input));
        self.ordered.insert(entry.key());
        self.by_input.insert(entry.input, entry);
    }

    /// Removes and returns the best entry.
    pub fn pop_first(&mut self) -> Option<QueueEntry> {
        let key = *self.ordered.iter().next()?;
        self.ordered.remove(&key);
        let entry = self.by_input.remove(&key.input);
        debug_assert!(entry.is_some(), "queue maps out of sync");
        entry
    }

    /// Removes and returns a pseudo-random entry.
    pub fn pop_random(&mut self, rng: &mut XorShift64) -> Option<QueueEntry> {
        if self.ordered.is_empty() {
            return None;
        }
        let nth = rng.bounded(self.ordered.len() as u64) as usize;
        let key = *self.ordered.iter().nth(nth)?;
        self.ordered.remove(&key);
        self.by_input.remove(&key.input)
    }

    pub fn erase(&mut self, input: usize) -> bool {
        match self.by_input.remove(&input) {
            Some(entry) => {
                let removed = self.ordered.remove(&entry.key());
                debug_assert!(removed);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, input: usize) -> bool {
        self.by_input.contains_key(&input)
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}

/// Small deterministic PRNG for the randomized pop.
///
/// Reproducible runs matter more than statistical quality here; a fixed
/// seed gives identical schedules across reruns.
#[derive(Clone, Debug)]
pub(crate) struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    pub fn new(seed: u64) -> Self {
        Self {
            state: seed | 1, // Zero state would be a fixed point.
        }
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    /// Uniform-ish value in `[0, n)` via the multiply-shift reduction.
    pub fn bounded(&mut self, n: u64) -> u64 {
        debug_assert!(n > 0);
        ((u128::from(self.next_u64()) * u128::from(n)) >> 64) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_among_equal_priorities() {
        let mut q = InputQueue::new();
        q.push(0, 0, 0);
        q.push(1, 0, 0);
        q.push(2, 0, 0);
        assert_eq!(q.pop_first().unwrap().input, 0);
        assert_eq!(q.pop_first().unwrap().input, 1);
        assert_eq!(q.pop_first().unwrap().input, 2);
        assert!(q.pop_first().is_none());
    }

    #[test]
    fn higher_priority_wins() {
        let mut q = InputQueue::new();
        q.push(0, 0, 0);
        q.push(1, 5, 0);
        q.push(2, -1, 0);
        assert_eq!(q.pop_first().unwrap().input, 1);
        assert_eq!(q.pop_first().unwrap().input, 0);
        assert_eq!(q.pop_first().unwrap().input, 2);
    }

    #[test]
    fn timestamp_delta_breaks_before_fifo() {
        let mut q = InputQueue::new();
        q.push(0, 0, 50);
        q.push(1, 0, 10);
        assert_eq!(q.pop_first().unwrap().input, 1);
        assert_eq!(q.pop_first().unwrap().input, 0);
    }

    #[test]
    fn reinsert_preserves_position() {
        let mut q = InputQueue::new();
        q.push(0, 0, 0);
        q.push(1, 0, 0);
        let first = q.pop_first().unwrap();
        assert_eq!(first.input, 0);
        // Put it back unchanged: it should still be ahead of input 1.
        q.reinsert(first);
        assert_eq!(q.pop_first().unwrap().input, 0);
    }

    #[test]
    fn erase_and_contains() {
        let mut q = InputQueue::new();
        q.push(3, 0, 0);
        q.push(4, 0, 0);
        assert!(q.contains(3));
        assert!(q.erase(3));
        assert!(!q.contains(3));
        assert!(!q.erase(3));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn pop_random_drains_everything() {
        let mut q = InputQueue::new();
        for i in 0..17 {
            q.push(i, (i % 3) as i32, 0);
        }
        let mut rng = XorShift64::new(42);
        let mut seen = std::collections::BTreeSet::new();
        while let Some(e) = q.pop_random(&mut rng) {
            assert!(seen.insert(e.input));
        }
        assert_eq!(seen.len(), 17);
    }
}

#[cfg(test)]
mod properties {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Pop order is the total order (priority desc, delta asc, counter
        /// asc), with the counter encoding insertion order.
        #[test]
        fn pop_order_matches_sort(entries in proptest::collection::vec(
            (-10i32..10, 0u64..100), 1..40)
        ) {
            let mut q = InputQueue::new();
            for (input, &(priority, delta)) in entries.iter().enumerate() {
                q.push(input, priority, delta);
            }
            let mut expected: Vec<(i64, u64, usize)> = entries
                .iter()
                .enumerate()
                .map(|(input, &(priority, delta))| {
                    (-(i64::from(priority)), delta, input)
                })
                .collect();
            expected.sort();
            let mut popped = Vec::new();
            while let Some(e) = q.pop_first() {
                popped.push(e.input);
            }
            let expected_inputs: Vec<usize> =
                expected.into_iter().map(|(_, _, input)| input).collect();
            prop_assert_eq!(popped, expected_inputs);
        }

        /// Erase removes exactly the asked-for entry and nothing else.
        #[test]
        fn erase_is_precise(count in 1usize..30, victim in 0usize..30) {
            let mut q = InputQueue::new();
            for input in 0..count {
                q.push(input, 0, 0);
            }
            let existed = q.erase(victim % count);
            prop_assert!(existed);
            prop_assert_eq!(q.len(), count - 1);
            prop_assert!(!q.contains(victim % count));
        }
    }
}
