//! Work queue handle and the retry rate limiter
//!
//! Deduplication of queued keys, per-key serialization and delayed redelivery are done by the
//! kube runtime [`applier`](kube::runtime::controller::applier) draining the queue. This module
//! only owns the enqueue side and decides how long a failing key waits before its next attempt.
use std::{collections::HashMap, hash::Hash, num::NonZeroU32, time::Duration};

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use futures::channel::mpsc;
use governor::{
    clock::{Clock, DefaultClock},
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota,
};
use kube::{runtime::reflector::ObjectRef, Resource};
use parking_lot::Mutex;
use tracing::debug;

/// Delay before the first retry of a failing key
pub const BASE_DELAY: Duration = Duration::from_millis(5);
/// Upper bound on the delay of a single key
pub const MAX_DELAY: Duration = Duration::from_secs(1000);
/// Sustained retries per second across all keys
pub const BUCKET_RATE: NonZeroU32 = non_zero(50);
/// Retries allowed in a burst before [`BUCKET_RATE`] applies
pub const BUCKET_BURST: NonZeroU32 = non_zero(300);

const fn non_zero(n: u32) -> NonZeroU32 {
    match NonZeroU32::new(n) {
        Some(n) => n,
        None => panic!("rate limit must not be zero"),
    }
}

/// Enqueue side of the work queue
///
/// Adding a key that is already queued is harmless, the consumer coalesces duplicates.
pub struct WorkQueue<K: Resource>
where
    K::DynamicType: Eq + Hash,
{
    tx: mpsc::UnboundedSender<ObjectRef<K>>,
}

// derive(Clone) would require K: Clone
impl<K: Resource> Clone for WorkQueue<K>
where
    K::DynamicType: Eq + Hash,
{
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

/// Create a work queue and the stream of keys it feeds
pub fn work_queue<K: Resource>() -> (WorkQueue<K>, mpsc::UnboundedReceiver<ObjectRef<K>>)
where
    K::DynamicType: Eq + Hash,
{
    let (tx, rx) = mpsc::unbounded();
    (WorkQueue { tx }, rx)
}

impl<K: Resource> WorkQueue<K>
where
    K::DynamicType: Eq + Hash,
{
    /// Queue `key` for reconciliation, never blocks
    pub fn add(&self, key: ObjectRef<K>) {
        if let Err(err) = self.tx.unbounded_send(key) {
            debug!(key = %err.into_inner(), "work queue is shut down, dropping key");
        }
    }

    /// Stop accepting keys, the consumer stream ends once drained
    pub fn shut_down(&self) {
        self.tx.close_channel();
    }

    /// Whether [`WorkQueue::shut_down`] was called or the consumer went away
    pub fn is_shut_down(&self) -> bool {
        self.tx.is_closed()
    }
}

type Bucket<C> = governor::RateLimiter<NotKeyed, InMemoryState, C, NoOpMiddleware<<C as Clock>::Instant>>;

struct Failures {
    count: u32,
    backoff: ExponentialBackoff,
}

/// Decides when a failed key may be retried
///
/// The delay is the larger of an exponential per-key backoff and the wait imposed by a
/// token bucket shared by all keys, so a storm of failures cannot flood the API server.
pub struct RateLimiter<K: Resource, C: Clock = DefaultClock>
where
    K::DynamicType: Eq + Hash,
{
    builder: ExponentialBuilder,
    failures: Mutex<HashMap<ObjectRef<K>, Failures>>,
    bucket: Bucket<C>,
    clock: C,
}

impl<K: Resource> Default for RateLimiter<K>
where
    K::DynamicType: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new(BASE_DELAY, MAX_DELAY, Quota::per_second(BUCKET_RATE).allow_burst(BUCKET_BURST))
    }
}

impl<K: Resource> RateLimiter<K>
where
    K::DynamicType: Eq + Hash + Clone,
{
    /// Create a rate limiter with custom parameters
    pub fn new(base_delay: Duration, max_delay: Duration, quota: Quota) -> Self {
        Self::with_clock(base_delay, max_delay, quota, DefaultClock::default())
    }
}

impl<K: Resource, C: Clock + Clone> RateLimiter<K, C>
where
    K::DynamicType: Eq + Hash + Clone,
{
    /// Create a rate limiter whose bucket refills according to `clock`
    pub fn with_clock(base_delay: Duration, max_delay: Duration, quota: Quota, clock: C) -> Self {
        let builder = ExponentialBuilder::default()
            .with_min_delay(base_delay)
            .with_max_delay(max_delay)
            .with_factor(2.0)
            .without_max_times();
        Self {
            builder,
            failures: Mutex::new(HashMap::new()),
            bucket: governor::RateLimiter::direct_with_clock(quota, clock.clone()),
            clock,
        }
    }

    /// Record a failure of `key` and return how long to wait before retrying it
    pub fn when(&self, key: &ObjectRef<K>) -> Duration {
        let item = {
            let mut failures = self.failures.lock();
            let entry = failures.entry(key.clone()).or_insert_with(|| Failures {
                count: 0,
                backoff: self.builder.clone().build(),
            });
            entry.count = entry.count.saturating_add(1);
            entry.backoff.next().unwrap_or(MAX_DELAY)
        };
        let overall = match self.bucket.check() {
            Ok(()) => Duration::ZERO,
            Err(not_until) => not_until.wait_time_from(self.clock.now()),
        };
        item.max(overall)
    }

    /// Clear the failure history of `key`, called after a successful reconciliation
    pub fn forget(&self, key: &ObjectRef<K>) {
        self.failures.lock().remove(key);
    }

    /// Number of failures recorded for `key` since it was last forgotten
    pub fn retries(&self, key: &ObjectRef<K>) -> u32 {
        self.failures.lock().get(key).map_or(0, |f| f.count)
    }
}
