//! Per-resource asynchronous lock with a FIFO wait queue.
//!
//! Each [`ResourceMutex`] is a small state machine (free, shared by `n`
//! holders, or held exclusively). Requests that cannot be granted on arrival
//! are parked in a FIFO queue and the calling task is suspended on a oneshot
//! channel until a release promotes it. Worker threads are never blocked.
//!
//! The queue gives the following guarantees:
//! - a waiter that arrived earlier is granted before one that arrived later
//! - a shared request is not granted while an exclusive request is queued,
//!   so readers cannot starve writers
//! - an abandoned acquisition (dropped future, timeout) leaves the queue, and
//!   if it had already been promoted the grant is handed back immediately

use crate::error::LockError;
use log::{debug, trace, warn};
use shared::{LockMode, Resource};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};

/// Identifies one successful acquisition of one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GrantId(u64);

/// What a lock handed out: which acquisition, and in which mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grant {
    id: GrantId,
    mode: LockMode,
}

impl Grant {
    pub fn id(&self) -> GrantId {
        self.id
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

/// Observable state of a resource lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexState {
    Free,
    Shared(usize),
    Exclusive,
}

/// Counters polled by the stats logger and health reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutexStats {
    pub resource: Resource,
    pub state: MutexState,
    /// Acquisitions granted on arrival.
    pub hits: u64,
    /// Acquisitions that had to wait.
    pub misses: u64,
    /// Acquisitions that arrived behind other queued waiters.
    pub contentions: u64,
    /// Bounded waits that gave up. Also counted in `cancellations`.
    pub timeouts: u64,
    /// Waits abandoned before the lock was observed.
    pub cancellations: u64,
    pub releases: u64,
    pub queue_depth: usize,
    pub max_queue_depth: usize,
}

impl MutexStats {
    pub fn acquisitions(&self) -> u64 {
        self.hits + self.misses
    }

    /// Fraction of acquisitions that had to wait (0.0 - 1.0).
    pub fn miss_rate(&self) -> f64 {
        let total = self.acquisitions();
        if total == 0 {
            return 0.0;
        }
        self.misses as f64 / total as f64
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    contentions: AtomicU64,
    timeouts: AtomicU64,
    cancellations: AtomicU64,
    releases: AtomicU64,
    max_queue_depth: AtomicUsize,
}

enum Holders {
    Free,
    Shared(Vec<GrantId>),
    Exclusive(GrantId),
}

struct Waiter {
    id: GrantId,
    mode: LockMode,
    wake: oneshot::Sender<()>,
}

struct Inner {
    holders: Holders,
    queue: VecDeque<Waiter>,
    next_id: u64,
    closed: bool,
}

impl Inner {
    fn next_grant_id(&mut self) -> GrantId {
        self.next_id += 1;
        GrantId(self.next_id)
    }

    fn can_grant(&self, mode: LockMode) -> bool {
        match (&self.holders, mode) {
            (Holders::Free, LockMode::Exclusive) => self.queue.is_empty(),
            (Holders::Free | Holders::Shared(_), LockMode::Shared) => !self
                .queue
                .iter()
                .any(|waiter| waiter.mode == LockMode::Exclusive),
            _ => false,
        }
    }

    fn grant(&mut self, id: GrantId, mode: LockMode) {
        match mode {
            LockMode::Exclusive => self.holders = Holders::Exclusive(id),
            LockMode::Shared => match &mut self.holders {
                Holders::Shared(ids) => ids.push(id),
                _ => self.holders = Holders::Shared(vec![id]),
            },
        }
    }

    /// Removes `id` from the holders. Returns false if it was not holding.
    fn revoke(&mut self, id: GrantId) -> bool {
        match &mut self.holders {
            Holders::Exclusive(holder) if *holder == id => {
                self.holders = Holders::Free;
                true
            }
            Holders::Shared(ids) => {
                let before = ids.len();
                ids.retain(|held| *held != id);
                let removed = ids.len() != before;
                if ids.is_empty() {
                    self.holders = Holders::Free;
                }
                removed
            }
            _ => false,
        }
    }

    fn holds(&self, id: GrantId) -> bool {
        match &self.holders {
            Holders::Free => false,
            Holders::Shared(ids) => ids.contains(&id),
            Holders::Exclusive(holder) => *holder == id,
        }
    }

    fn state(&self) -> MutexState {
        match &self.holders {
            Holders::Free => MutexState::Free,
            Holders::Shared(ids) => MutexState::Shared(ids.len()),
            Holders::Exclusive(_) => MutexState::Exclusive,
        }
    }

    fn is_idle(&self) -> bool {
        matches!(self.holders, Holders::Free) && self.queue.is_empty()
    }
}

/// The lock guarding one [`Resource`].
///
/// Lives for the lifetime of its owning lock table and is only reachable
/// through it. Shutdown is [`close`](Self::close) followed by
/// [`wait_idle`](Self::wait_idle), which lets already queued waiters finish
/// before the lock goes away.
pub(crate) struct ResourceMutex {
    resource: Resource,
    inner: Mutex<Inner>,
    idle: Notify,
    counters: Counters,
}

impl ResourceMutex {
    pub fn new(resource: Resource) -> Self {
        Self {
            resource,
            inner: Mutex::new(Inner {
                holders: Holders::Free,
                queue: VecDeque::new(),
                next_id: 0,
                closed: false,
            }),
            idle: Notify::new(),
            counters: Counters::default(),
        }
    }

    pub fn resource(&self) -> Resource {
        self.resource
    }

    /// The mode a request for `mode` is actually granted in.
    ///
    /// Exclusive-only resources serve shared requests exclusively.
    pub fn effective_mode(&self, mode: LockMode) -> LockMode {
        if self.resource.supports_shared() {
            mode
        } else {
            LockMode::Exclusive
        }
    }

    /// Acquires the lock, suspending the calling task until it is granted.
    pub(crate) async fn acquire(&self, mode: LockMode) -> Result<ResourceGuard<'_>, LockError> {
        let mode = self.effective_mode(mode);

        let (id, wake) = {
            let mut inner = self.lock_inner();
            if inner.closed {
                return Err(LockError::Closed {
                    resource: self.resource,
                });
            }

            let id = inner.next_grant_id();
            if inner.can_grant(mode) {
                inner.grant(id, mode);
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(ResourceGuard {
                    mutex: self,
                    grant: Grant { id, mode },
                });
            }

            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            if !inner.queue.is_empty() {
                self.counters.contentions.fetch_add(1, Ordering::Relaxed);
            }

            let (tx, rx) = oneshot::channel();
            inner.queue.push_back(Waiter { id, mode, wake: tx });
            let depth = inner.queue.len();
            self.counters
                .max_queue_depth
                .fetch_max(depth, Ordering::Relaxed);
            trace!(
                "{} {} request queued at depth {}",
                self.resource,
                mode,
                depth
            );
            (id, rx)
        };

        let mut pending = PendingAcquire {
            mutex: self,
            id,
            armed: true,
        };
        let woken = wake.await;
        pending.armed = false;

        match woken {
            Ok(()) => Ok(ResourceGuard {
                mutex: self,
                grant: Grant { id, mode },
            }),
            Err(_) => Err(LockError::Closed {
                resource: self.resource,
            }),
        }
    }

    /// Bounded-wait variant of [`acquire`](Self::acquire).
    pub(crate) async fn acquire_timeout(
        &self,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<ResourceGuard<'_>, LockError> {
        match tokio::time::timeout(timeout, self.acquire(mode)).await {
            Ok(result) => result,
            Err(_) => {
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                debug!("{} acquisition timed out after {:?}", self.resource, timeout);
                Err(LockError::Timeout {
                    resource: self.resource,
                    waited: timeout,
                })
            }
        }
    }

    /// Whether `grant` currently holds this lock.
    pub fn is_held_by(&self, grant: Grant) -> bool {
        self.lock_inner().holds(grant.id)
    }

    pub fn state(&self) -> MutexState {
        self.lock_inner().state()
    }

    pub fn queue_depth(&self) -> usize {
        self.lock_inner().queue.len()
    }

    /// Refuses new acquisitions. Waiters already queued are still served.
    pub fn close(&self) {
        let mut inner = self.lock_inner();
        if !inner.closed {
            inner.closed = true;
            debug!(
                "{} lock closed with {} queued waiter(s)",
                self.resource,
                inner.queue.len()
            );
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock_inner().closed
    }

    /// Resolves once nobody holds or waits for the lock.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            let idle = self.lock_inner().is_idle();
            if idle {
                return;
            }
            notified.await;
        }
    }

    pub fn stats(&self) -> MutexStats {
        let (state, queue_depth) = {
            let inner = self.lock_inner();
            (inner.state(), inner.queue.len())
        };
        MutexStats {
            resource: self.resource,
            state,
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            contentions: self.counters.contentions.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            cancellations: self.counters.cancellations.load(Ordering::Relaxed),
            releases: self.counters.releases.load(Ordering::Relaxed),
            queue_depth,
            max_queue_depth: self.counters.max_queue_depth.load(Ordering::Relaxed),
        }
    }

    fn release(&self, id: GrantId) {
        let mut inner = self.lock_inner();
        if !inner.revoke(id) {
            warn!("{} release of a grant that is not held", self.resource);
            return;
        }
        self.counters.releases.fetch_add(1, Ordering::Relaxed);
        self.promote(&mut inner);
    }

    /// Called when an acquisition future is dropped before observing its grant.
    fn abandon(&self, id: GrantId) {
        let mut inner = self.lock_inner();
        self.counters.cancellations.fetch_add(1, Ordering::Relaxed);

        if let Some(position) = inner.queue.iter().position(|waiter| waiter.id == id) {
            inner.queue.remove(position);
            trace!("{} waiter left the queue", self.resource);
        } else if inner.revoke(id) {
            // Promoted concurrently with the cancellation.
            trace!("{} returned a grant nobody observed", self.resource);
        }
        self.promote(&mut inner);
    }

    /// Grants the head of the queue for as long as it is compatible.
    fn promote(&self, inner: &mut Inner) {
        loop {
            let grantable = match (inner.queue.front(), &inner.holders) {
                (Some(_), Holders::Free) => true,
                (Some(waiter), Holders::Shared(_)) => waiter.mode == LockMode::Shared,
                _ => false,
            };
            if !grantable {
                break;
            }
            let Some(waiter) = inner.queue.pop_front() else {
                break;
            };
            inner.grant(waiter.id, waiter.mode);
            if waiter.wake.send(()).is_err() {
                inner.revoke(waiter.id);
            }
        }

        if inner.is_idle() {
            self.idle.notify_waiters();
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ResourceMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock_inner();
        f.debug_struct("ResourceMutex")
            .field("resource", &self.resource)
            .field("state", &inner.state())
            .field("queue_depth", &inner.queue.len())
            .field("closed", &inner.closed)
            .finish()
    }
}

/// Removes a waiter from the queue if its acquisition future is dropped.
struct PendingAcquire<'a> {
    mutex: &'a ResourceMutex,
    id: GrantId,
    armed: bool,
}

impl Drop for PendingAcquire<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.mutex.abandon(self.id);
        }
    }
}

/// Holds a resource lock. Releasing happens exactly once, on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub(crate) struct ResourceGuard<'a> {
    mutex: &'a ResourceMutex,
    grant: Grant,
}

impl ResourceGuard<'_> {
    pub fn grant(&self) -> Grant {
        self.grant
    }
}

impl fmt::Debug for ResourceGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceGuard")
            .field("resource", &self.mutex.resource)
            .field("grant", &self.grant)
            .finish()
    }
}

impl Drop for ResourceGuard<'_> {
    fn drop(&mut self) {
        self.mutex.release(self.grant.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, block_on, task};

    #[test]
    fn test_exclusive_acquire_on_free_lock_is_immediate() {
        let mutex = ResourceMutex::new(Resource::Users);

        let guard = block_on(mutex.acquire(LockMode::Exclusive)).unwrap();
        assert_eq!(mutex.state(), MutexState::Exclusive);
        assert!(mutex.is_held_by(guard.grant()));

        let grant = guard.grant();
        drop(guard);
        assert_eq!(mutex.state(), MutexState::Free);
        assert!(!mutex.is_held_by(grant));

        let stats = mutex.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.releases, 1);
    }

    #[test]
    fn test_exclusive_waiters_are_served_in_arrival_order() {
        let mutex = ResourceMutex::new(Resource::Users);
        let holder = block_on(mutex.acquire(LockMode::Exclusive)).unwrap();

        let mut first = task::spawn(mutex.acquire(LockMode::Exclusive));
        let mut second = task::spawn(mutex.acquire(LockMode::Exclusive));
        assert_pending!(first.poll());
        assert_pending!(second.poll());
        assert_eq!(mutex.queue_depth(), 2);

        drop(holder);
        assert!(first.is_woken());
        let first_guard = assert_ready!(first.poll()).unwrap();
        assert_pending!(second.poll());

        drop(first_guard);
        assert!(second.is_woken());
        let second_guard = assert_ready!(second.poll()).unwrap();
        assert_eq!(mutex.state(), MutexState::Exclusive);
        drop(second_guard);
        assert_eq!(mutex.state(), MutexState::Free);
    }

    #[test]
    fn test_shared_holders_coexist() {
        let mutex = ResourceMutex::new(Resource::World);

        let a = block_on(mutex.acquire(LockMode::Shared)).unwrap();
        let b = block_on(mutex.acquire(LockMode::Shared)).unwrap();
        assert_eq!(mutex.state(), MutexState::Shared(2));

        drop(a);
        assert_eq!(mutex.state(), MutexState::Shared(1));
        drop(b);
        assert_eq!(mutex.state(), MutexState::Free);
    }

    #[test]
    fn test_queued_writer_blocks_later_readers() {
        let mutex = ResourceMutex::new(Resource::World);
        let reader = block_on(mutex.acquire(LockMode::Shared)).unwrap();

        let mut writer = task::spawn(mutex.acquire(LockMode::Exclusive));
        assert_pending!(writer.poll());

        let mut late_reader = task::spawn(mutex.acquire(LockMode::Shared));
        assert_pending!(late_reader.poll());

        drop(reader);
        let writer_guard = assert_ready!(writer.poll()).unwrap();
        assert_pending!(late_reader.poll());

        drop(writer_guard);
        let reader_guard = assert_ready!(late_reader.poll()).unwrap();
        assert_eq!(reader_guard.grant().mode(), LockMode::Shared);
    }

    #[test]
    fn test_consecutive_readers_are_promoted_together() {
        let mutex = ResourceMutex::new(Resource::Store);
        let writer = block_on(mutex.acquire(LockMode::Exclusive)).unwrap();

        let mut r1 = task::spawn(mutex.acquire(LockMode::Shared));
        let mut r2 = task::spawn(mutex.acquire(LockMode::Shared));
        let mut w2 = task::spawn(mutex.acquire(LockMode::Exclusive));
        assert_pending!(r1.poll());
        assert_pending!(r2.poll());
        assert_pending!(w2.poll());

        drop(writer);
        assert_eq!(mutex.state(), MutexState::Shared(2));
        let g1 = assert_ready!(r1.poll()).unwrap();
        let g2 = assert_ready!(r2.poll()).unwrap();
        assert_pending!(w2.poll());

        drop(g1);
        assert_pending!(w2.poll());
        drop(g2);
        let g3 = assert_ready!(w2.poll()).unwrap();
        assert_eq!(g3.grant().mode(), LockMode::Exclusive);
    }

    #[test]
    fn test_dropped_waiter_leaves_queue() {
        let mutex = ResourceMutex::new(Resource::Messages);
        let holder = block_on(mutex.acquire(LockMode::Exclusive)).unwrap();

        let mut waiter = task::spawn(mutex.acquire(LockMode::Exclusive));
        assert_pending!(waiter.poll());
        assert_eq!(mutex.queue_depth(), 1);

        drop(waiter);
        assert_eq!(mutex.queue_depth(), 0);
        assert_eq!(mutex.stats().cancellations, 1);

        drop(holder);
        assert_eq!(mutex.state(), MutexState::Free);
    }

    #[test]
    fn test_promoted_but_unobserved_grant_is_returned() {
        let mutex = ResourceMutex::new(Resource::Messages);
        let holder = block_on(mutex.acquire(LockMode::Exclusive)).unwrap();

        let mut waiter = task::spawn(mutex.acquire(LockMode::Exclusive));
        assert_pending!(waiter.poll());

        drop(holder);
        assert_eq!(mutex.state(), MutexState::Exclusive);

        drop(waiter);
        assert_eq!(mutex.state(), MutexState::Free);
        assert_eq!(mutex.queue_depth(), 0);
    }

    #[test]
    fn test_cancelled_writer_unblocks_readers_behind_it() {
        let mutex = ResourceMutex::new(Resource::World);
        let reader = block_on(mutex.acquire(LockMode::Shared)).unwrap();

        let mut writer = task::spawn(mutex.acquire(LockMode::Exclusive));
        let mut late_reader = task::spawn(mutex.acquire(LockMode::Shared));
        assert_pending!(writer.poll());
        assert_pending!(late_reader.poll());

        drop(writer);
        assert!(late_reader.is_woken());
        let guard = assert_ready!(late_reader.poll()).unwrap();
        assert_eq!(mutex.state(), MutexState::Shared(2));
        drop(guard);
        drop(reader);
        assert_eq!(mutex.state(), MutexState::Free);
    }

    #[test]
    fn test_shared_request_on_exclusive_only_resource() {
        let mutex = ResourceMutex::new(Resource::Users);
        let guard = block_on(mutex.acquire(LockMode::Shared)).unwrap();
        assert_eq!(guard.grant().mode(), LockMode::Exclusive);
        assert_eq!(mutex.state(), MutexState::Exclusive);
    }

    #[tokio::test]
    async fn test_acquire_timeout_gives_up_and_leaves_queue() {
        let mutex = ResourceMutex::new(Resource::Store);
        let _holder = mutex.acquire(LockMode::Exclusive).await.unwrap();

        let result = mutex
            .acquire_timeout(LockMode::Shared, Duration::from_millis(20))
            .await;
        match result {
            Err(LockError::Timeout { resource, waited }) => {
                assert_eq!(resource, Resource::Store);
                assert_eq!(waited, Duration::from_millis(20));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
        assert_eq!(mutex.queue_depth(), 0);

        let stats = mutex.stats();
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.cancellations, 1);
    }

    #[test]
    fn test_closed_lock_rejects_new_but_serves_queued() {
        let mutex = ResourceMutex::new(Resource::Users);
        let holder = block_on(mutex.acquire(LockMode::Exclusive)).unwrap();
        let mut queued = task::spawn(mutex.acquire(LockMode::Exclusive));
        assert_pending!(queued.poll());

        mutex.close();
        assert!(mutex.is_closed());
        let rejected = block_on(mutex.acquire(LockMode::Exclusive));
        assert!(matches!(rejected, Err(LockError::Closed { .. })));

        let mut idle = task::spawn(mutex.wait_idle());
        assert_pending!(idle.poll());

        drop(holder);
        let guard = assert_ready!(queued.poll()).unwrap();
        assert_pending!(idle.poll());

        drop(guard);
        assert!(idle.is_woken());
        assert_ready!(idle.poll());
    }

    #[test]
    fn test_contention_counters() {
        let mutex = ResourceMutex::new(Resource::Users);
        let holder = block_on(mutex.acquire(LockMode::Exclusive)).unwrap();
        let mut w1 = task::spawn(mutex.acquire(LockMode::Exclusive));
        let mut w2 = task::spawn(mutex.acquire(LockMode::Exclusive));
        assert_pending!(w1.poll());
        assert_pending!(w2.poll());

        let stats = mutex.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.contentions, 1);
        assert_eq!(stats.queue_depth, 2);
        assert_eq!(stats.max_queue_depth, 2);
        assert!((stats.miss_rate() - 2.0 / 3.0).abs() < 1e-9);

        drop(holder);
        drop(w1);
        drop(w2);
        assert_eq!(mutex.state(), MutexState::Free);
    }
}
