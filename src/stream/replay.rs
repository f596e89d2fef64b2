/// Pool of recently accepted live points, shared for the life of the process

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::time::{Duration, Instant};

use crate::core::DataPoint;

#[derive(Debug)]
pub struct ReplayPool {
    points: VecDeque<DataPoint>,
    capacity: usize,
    cursor: usize,
    last_real_at: Option<Instant>,
}

impl ReplayPool {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            points: VecDeque::with_capacity(capacity),
            capacity,
            cursor: 0,
            last_real_at: None,
        }
    }

    /// Remember a live point and mark `at` as the time of last real data.
    pub fn record(&mut self, point: DataPoint, at: Instant) {
        if self.points.len() >= self.capacity {
            self.points.pop_front();
            self.cursor = self.cursor.saturating_sub(1);
        }
        self.points.push_back(point);
        self.last_real_at = Some(at);
    }

    /// Next point in round-robin order.
    pub fn next_round_robin(&mut self) -> Option<DataPoint> {
        if self.points.is_empty() {
            return None;
        }
        if self.cursor >= self.points.len() {
            self.cursor = 0;
        }
        let point = self.points[self.cursor].clone();
        self.cursor += 1;
        Some(point)
    }

    /// True once more than `threshold` has passed since the last real point.
    /// A pool that never saw real data counts as stale.
    pub fn is_stale(&self, now: Instant, threshold: Duration) -> bool {
        match self.last_real_at {
            Some(at) => now.saturating_duration_since(at) > threshold,
            None => true,
        }
    }

    pub fn last_real_at(&self) -> Option<Instant> {
        self.last_real_at
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Cloneable handle to one [`ReplayPool`].
///
/// Controllers created with clones of the same handle see the same pool, so
/// replay material survives reconnects and controller restarts.
#[derive(Debug, Clone)]
pub struct SharedReplayPool {
    inner: Arc<Mutex<ReplayPool>>,
}

impl SharedReplayPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ReplayPool::new(capacity))),
        }
    }

    /// Lock the pool. A panic while holding the lock cannot leave the pool
    /// half-written, so poisoning is ignored.
    pub fn lock(&self) -> MutexGuard<'_, ReplayPool> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity()
    }
}
