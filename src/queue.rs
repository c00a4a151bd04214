use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::time::Duration;

/// Identity of one unit of work: a namespaced object name. The same queue
/// carries session keys and child-event keys; the reconciler disambiguates
/// by reading the key as an event first.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct RequestKey {
    pub namespace: String,
    pub name: String,
}

impl RequestKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// FIFO of pending keys. A key already waiting is not enqueued twice, so a
/// burst of watch events for one object collapses into a single reconcile.
#[derive(Default)]
pub struct WorkQueue {
    order: VecDeque<RequestKey>,
    pending: HashSet<RequestKey>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: RequestKey) {
        if self.pending.insert(key.clone()) {
            self.order.push_back(key);
        }
    }

    pub fn pop(&mut self) -> Option<RequestKey> {
        let key = self.order.pop_front()?;
        self.pending.remove(&key);
        Some(key)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Per-key retry delay: doubles on every consecutive failure, capped, and
/// forgotten on success.
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempts: HashMap<RequestKey, u32>,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempts: HashMap::new(),
        }
    }

    pub fn next_delay(&mut self, key: &RequestKey) -> Duration {
        let attempt = self.attempts.entry(key.clone()).or_insert(0);
        let delay = self.base.saturating_mul(1u32 << (*attempt).min(16));
        *attempt = attempt.saturating_add(1);
        delay.min(self.max)
    }

    pub fn reset(&mut self, key: &RequestKey) {
        self.attempts.remove(key);
    }
}
