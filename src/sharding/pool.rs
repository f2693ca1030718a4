//! Shared work pools and the completion latch.
//!
//! Both the generic-unit pool and the token-unit pool are instances of one
//! abstraction, [`UnitPool`]: a mutex-guarded deque whose take operations
//! are atomic per caller, so "read current snapshot + remove one element" is
//! a single step, so no two pollers can ever claim the same unit.
//!
//! The [`CompletionLatch`] coordinates worker shutdown: each poller arrives
//! exactly once on loop exit, and exactly one of them observes the count
//! reaching zero and performs the final unexecuted-report drain.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::unit::TestUnit;

/// A shared pool of unexecuted test units.
///
/// The pool owns units until a worker claims one; the claim removes it
/// atomically, transferring ownership to the claiming worker. Units appear
/// in exactly one pool, and once claimed, in none.
#[derive(Default)]
pub struct UnitPool {
    units: Mutex<VecDeque<Box<dyn TestUnit>>>,
}

impl UnitPool {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a pool seeded with the given units.
    pub fn from_units(units: Vec<Box<dyn TestUnit>>) -> Self {
        Self {
            units: Mutex::new(units.into()),
        }
    }

    /// Adds a unit to the back of the pool.
    pub fn push(&self, unit: Box<dyn TestUnit>) {
        self.lock().push_back(unit);
    }

    /// Atomically removes and returns the unit at the front, if any.
    pub fn take_next(&self) -> Option<Box<dyn TestUnit>> {
        self.lock().pop_front()
    }

    /// Atomically removes and returns the first unit matching `accept`.
    ///
    /// Units are scanned in iteration order; `accept` may carry caller
    /// state (e.g. a rejected-unit memo) since the whole scan runs under
    /// the pool lock.
    pub fn take_where<F>(&self, mut accept: F) -> Option<Box<dyn TestUnit>>
    where
        F: FnMut(&dyn TestUnit) -> bool,
    {
        let mut units = self.lock();
        let position = units.iter().position(|unit| accept(unit.as_ref()));
        position.and_then(|index| units.remove(index))
    }

    /// Number of unclaimed units.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` if no units remain.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Box<dyn TestUnit>>> {
        self.units.lock().expect("unit pool lock poisoned")
    }
}

/// Shared countdown over the active pollers of one sharded run.
///
/// Initialized to the shard count. Each poller arrives exactly once on loop
/// exit; [`arrive`](Self::arrive) reports `true` to exactly the caller that
/// brings the count to zero, so the final drain runs once no matter how the
/// workers race.
#[derive(Debug)]
pub struct CompletionLatch {
    remaining: AtomicUsize,
}

impl CompletionLatch {
    /// Creates a latch expecting `count` arrivals.
    pub fn new(count: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(count),
        }
    }

    /// Number of workers that have not yet arrived.
    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::SeqCst)
    }

    /// Records one worker's exit.
    ///
    /// Returns `true` iff this arrival brought the count to zero. Arrivals
    /// past zero are ignored and return `false`.
    pub fn arrive(&self) -> bool {
        let mut current = self.remaining.load(Ordering::SeqCst);
        loop {
            if current == 0 {
                return false;
            }
            match self.remaining.compare_exchange(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return current == 1,
                Err(observed) => current = observed,
            }
        }
    }
}

/// Separates token-requiring units from generic ones.
///
/// This is the classification step run once, up front, when token-based
/// dispatch is enabled: token-bound units go into their own pool so that
/// capability gating only ever scans units that actually need it.
pub fn partition_token_units(
    units: Vec<Box<dyn TestUnit>>,
) -> (Vec<Box<dyn TestUnit>>, Vec<Box<dyn TestUnit>>) {
    units.into_iter().partition(|unit| !unit.requires_token())
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::*;
    use crate::invocation::RunListener;
    use crate::unit::{Token, UnitResult};

    struct NamedUnit {
        id: String,
        tokens: Vec<Token>,
    }

    impl NamedUnit {
        fn boxed(id: &str) -> Box<dyn TestUnit> {
            Box::new(Self {
                id: id.to_string(),
                tokens: Vec::new(),
            })
        }

        fn boxed_with_token(id: &str, token: Token) -> Box<dyn TestUnit> {
            Box::new(Self {
                id: id.to_string(),
                tokens: vec![token],
            })
        }
    }

    #[async_trait]
    impl TestUnit for NamedUnit {
        fn id(&self) -> &str {
            &self.id
        }

        fn required_tokens(&self) -> &[Token] {
            &self.tokens
        }

        async fn run(&mut self, _listener: &dyn RunListener) -> UnitResult<()> {
            Ok(())
        }
    }

    #[test]
    fn take_next_drains_in_order() {
        let pool = UnitPool::from_units(vec![NamedUnit::boxed("a"), NamedUnit::boxed("b")]);

        assert_eq!(pool.take_next().unwrap().id(), "a");
        assert_eq!(pool.take_next().unwrap().id(), "b");
        assert!(pool.take_next().is_none());
    }

    #[test]
    fn take_where_skips_rejected_units() {
        let pool = UnitPool::from_units(vec![NamedUnit::boxed("a"), NamedUnit::boxed("b")]);

        let taken = pool.take_where(|unit| unit.id() != "a").unwrap();
        assert_eq!(taken.id(), "b");
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn partition_separates_token_units() {
        let units = vec![
            NamedUnit::boxed("generic-1"),
            NamedUnit::boxed_with_token("sim-1", Token::SimCard),
            NamedUnit::boxed("generic-2"),
        ];

        let (generic, token) = partition_token_units(units);

        assert_eq!(generic.len(), 2);
        assert_eq!(token.len(), 1);
        assert_eq!(token[0].id(), "sim-1");
    }

    #[tokio::test]
    async fn concurrent_takers_never_double_claim() {
        let units: Vec<_> = (0..100)
            .map(|i| NamedUnit::boxed(&format!("unit-{i}")))
            .collect();
        let pool = Arc::new(UnitPool::from_units(units));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some(unit) = pool.take_next() {
                    claimed.push(unit.id().to_string());
                    tokio::task::yield_now().await;
                }
                claimed
            }));
        }

        let mut seen = HashSet::new();
        let mut total = 0;
        for handle in handles {
            for id in handle.await.unwrap() {
                assert!(seen.insert(id), "unit claimed twice");
                total += 1;
            }
        }
        assert_eq!(total, 100);
        assert!(pool.is_empty());
    }

    #[test]
    fn latch_reports_zero_to_exactly_one_arrival() {
        let latch = CompletionLatch::new(3);

        assert_eq!(latch.remaining(), 3);
        assert!(!latch.arrive());
        assert!(!latch.arrive());
        assert!(latch.arrive());
        assert_eq!(latch.remaining(), 0);
        // Arrivals past zero are ignored.
        assert!(!latch.arrive());
    }

    #[tokio::test]
    async fn latch_zero_observation_is_race_free() {
        let latch = Arc::new(CompletionLatch::new(16));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let latch = latch.clone();
            handles.push(tokio::spawn(async move { latch.arrive() }));
        }

        let mut zero_observers = 0;
        for handle in handles {
            if handle.await.unwrap() {
                zero_observers += 1;
            }
        }
        assert_eq!(zero_observers, 1);
    }
}
