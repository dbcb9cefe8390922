//! Scoped acquisition: the only sanctioned way to take a resource lock.
//!
//! [`LockTable::with_lock`] checks the order against the caller's token,
//! acquires the resource's mutex, hands a widened token to a continuation and
//! releases the mutex once the continuation settles. Release is tied to a
//! guard's `Drop`, so it also happens when the continuation returns an error,
//! panics, or when the whole future is dropped (task cancellation).

use crate::config::LockConfig;
use crate::error::LockError;
use crate::mutex::{MutexState, MutexStats, ResourceGuard, ResourceMutex};
use crate::token::{level, Above, Level, Token};
use log::{debug, error, info};
use shared::{LockMode, Resource};
use std::future::Future;
use std::time::Duration;

/// One lock per resource, indexed by resource order.
///
/// The mutexes themselves are private to the crate: the scoped helpers are
/// the only public way to acquire one, so every acquisition passes the
/// token's order check.
///
/// ```compile_fail
/// use server::locks::LockTable;
/// use shared::{LockMode, Resource};
///
/// let locks = LockTable::default();
/// let _ = locks.mutex(Resource::World).acquire(LockMode::Exclusive);
/// ```
///
/// Observing a lock needs no token:
///
/// ```
/// use server::locks::LockTable;
/// use server::mutex::MutexState;
/// use shared::Resource;
///
/// let locks = LockTable::default();
/// assert_eq!(locks.state(Resource::World), MutexState::Free);
/// assert_eq!(locks.queue_depth(Resource::World), 0);
/// assert_eq!(locks.stats_for(Resource::World).acquisitions(), 0);
/// ```
#[derive(Debug)]
pub struct LockTable {
    mutexes: [ResourceMutex; Resource::COUNT],
    acquire_timeout: Option<Duration>,
}

impl LockTable {
    pub fn new(config: &LockConfig) -> Self {
        Self {
            mutexes: Resource::ALL.map(ResourceMutex::new),
            acquire_timeout: config.acquire_timeout,
        }
    }

    /// Acquires `R` for the duration of `continuation`.
    ///
    /// The static bound `R: Above<L>` rejects out-of-order acquisitions at
    /// compile time for typed tokens. The order is checked again at run time
    /// before the mutex is touched.
    pub async fn with_lock<R, L, T, E, F, Fut>(
        &self,
        token: &Token<L>,
        mode: LockMode,
        continuation: F,
    ) -> Result<T, E>
    where
        R: Above<L>,
        L: Level,
        F: FnOnce(Token<R>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        self.scoped(token, R::RESOURCE, mode, continuation).await
    }

    /// Acquires a resource chosen at run time. The continuation receives an
    /// erased token, so only the run-time check guards further acquisitions.
    pub async fn with_resource<L, T, E, F, Fut>(
        &self,
        token: &Token<L>,
        resource: Resource,
        mode: LockMode,
        continuation: F,
    ) -> Result<T, E>
    where
        L: Level,
        F: FnOnce(Token<level::Any>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        self.scoped(token, resource, mode, continuation).await
    }

    async fn scoped<L, R, T, E, F, Fut>(
        &self,
        token: &Token<L>,
        resource: Resource,
        mode: LockMode,
        continuation: F,
    ) -> Result<T, E>
    where
        L: Level,
        R: Level,
        F: FnOnce(Token<R>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        if let Err(err) = token.check(resource) {
            error!("{} (held: {:?})", err, token);
            return Err(err.into());
        }

        let guard = self.acquire_guard(resource, mode).await?;
        let widened = token.acquire::<R>(resource, guard.grant())?;
        let result = continuation(widened).await;
        drop(guard);
        result
    }

    async fn acquire_guard(
        &self,
        resource: Resource,
        mode: LockMode,
    ) -> Result<ResourceGuard<'_>, LockError> {
        let mutex = self.mutex(resource);
        match self.acquire_timeout {
            Some(timeout) => mutex.acquire_timeout(mode, timeout).await,
            None => mutex.acquire(mode).await,
        }
    }

    /// Re-validates that `token` holds `resource` in at least `needed` mode
    /// and that its grant is still live. Every held accessor calls this.
    pub fn verify<L: Level>(
        &self,
        token: &Token<L>,
        resource: Resource,
        needed: LockMode,
    ) -> Result<(), LockError> {
        let grant = token
            .grant_for(resource)
            .filter(|grant| grant.mode().satisfies(needed))
            .ok_or(LockError::NotHeld { resource, needed })?;

        if self.mutex(resource).is_held_by(grant) {
            Ok(())
        } else {
            Err(LockError::StaleToken { resource })
        }
    }

    pub(crate) fn mutex(&self, resource: Resource) -> &ResourceMutex {
        &self.mutexes[resource.index()]
    }

    /// Who holds `resource` right now. Read-only; locks are only taken
    /// through [`with_lock`](Self::with_lock) and
    /// [`with_resource`](Self::with_resource).
    pub fn state(&self, resource: Resource) -> MutexState {
        self.state(resource)
    }

    pub fn queue_depth(&self, resource: Resource) -> usize {
        self.queue_depth(resource)
    }

    pub fn stats_for(&self, resource: Resource) -> MutexStats {
        self.stats_for(resource)
    }

    pub fn stats(&self) -> Vec<MutexStats> {
        self.mutexes.iter().map(ResourceMutex::stats).collect()
    }

    /// Whether every lock refuses new acquisitions.
    pub fn is_closed(&self) -> bool {
        self.mutexes.iter().all(ResourceMutex::is_closed)
    }

    /// Refuses new acquisitions on every resource.
    pub fn close(&self) {
        for mutex in &self.mutexes {
            mutex.close();
        }
    }

    /// Closes every lock, then waits for queued waiters to drain.
    pub async fn shutdown(&self) {
        self.close();
        for mutex in &self.mutexes {
            debug!("waiting for {} lock to drain", mutex.resource());
            mutex.wait_idle().await;
        }
        info!("all resource locks drained");
    }
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new(&LockConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn explode() -> Result<(), LockError> {
        panic!("continuation failed")
    }

    #[tokio::test]
    async fn test_nested_acquisition_in_order() {
        let table = LockTable::default();
        let locks = &table;
        let root = Token::empty();

        let max = locks
            .with_lock(&root, LockMode::Shared, |world: Token<level::World>| async move {
                locks
                    .with_lock(&world, LockMode::Exclusive, |users: Token<level::Users>| async move {
                        locks
                            .with_lock(&users, LockMode::Exclusive, |store: Token<level::Store>| async move {
                                assert!(store.holds(Resource::World));
                                assert!(store.holds(Resource::Users));
                                Ok::<_, LockError>(store.max_order())
                            })
                            .await
                    })
                    .await
            })
            .await
            .unwrap();

        assert_eq!(max, Some(3));
        for resource in Resource::ALL {
            assert_eq!(locks.state(resource), MutexState::Free);
        }
    }

    #[tokio::test]
    async fn test_violation_fails_before_touching_mutex() {
        let table = LockTable::default();
        let locks = &table;

        let result = locks
            .with_lock(&Token::empty(), LockMode::Exclusive, |users: Token<level::Users>| async move {
                let erased = users.erase();
                let before = locks.stats_for(Resource::World);
                let inner = locks
                    .with_resource(&erased, Resource::World, LockMode::Shared, |_| async {
                        Ok::<_, LockError>(())
                    })
                    .await;
                let after = locks.stats_for(Resource::World);
                assert_eq!(before.acquisitions(), after.acquisitions());
                inner
            })
            .await;

        assert_eq!(
            result,
            Err(LockError::OrderViolation {
                requested: Resource::World,
                held_max: Resource::Users,
            })
        );
        assert_eq!(locks.state(Resource::Users), MutexState::Free);
    }

    #[tokio::test]
    async fn test_double_hold_is_a_violation() {
        let table = LockTable::default();
        let locks = &table;

        let result = locks
            .with_resource(&Token::empty(), Resource::World, LockMode::Shared, |world| async move {
                locks
                    .with_resource(&world, Resource::World, LockMode::Shared, |_| async {
                        Ok::<_, LockError>(())
                    })
                    .await
            })
            .await;

        assert_eq!(
            result,
            Err(LockError::OrderViolation {
                requested: Resource::World,
                held_max: Resource::World,
            })
        );
        assert_eq!(locks.state(Resource::World), MutexState::Free);
    }

    #[tokio::test]
    async fn test_release_when_continuation_fails() {
        let locks = LockTable::default();
        let result: Result<(), LockError> = locks
            .with_resource(&Token::empty(), Resource::Users, LockMode::Exclusive, |_| async {
                Err(LockError::Closed {
                    resource: Resource::Users,
                })
            })
            .await;

        assert!(result.is_err());
        assert_eq!(locks.state(Resource::Users), MutexState::Free);
    }

    #[tokio::test]
    async fn test_release_when_continuation_panics() {
        let locks = Arc::new(LockTable::default());
        let task_locks = Arc::clone(&locks);

        let handle = tokio::spawn(async move {
            task_locks
                .with_resource(&Token::empty(), Resource::Messages, LockMode::Exclusive, |_| {
                    explode()
                })
                .await
        });

        assert!(handle.await.unwrap_err().is_panic());
        assert_eq!(locks.state(Resource::Messages), MutexState::Free);
    }

    #[tokio::test]
    async fn test_release_when_task_is_cancelled() {
        let locks = Arc::new(LockTable::default());
        let task_locks = Arc::clone(&locks);
        let (entered_tx, entered_rx) = tokio::sync::oneshot::channel();

        let handle = tokio::spawn(async move {
            task_locks
                .with_resource(&Token::empty(), Resource::Store, LockMode::Exclusive, |_| async move {
                    let _ = entered_tx.send(());
                    std::future::pending::<()>().await;
                    Ok::<(), LockError>(())
                })
                .await
        });

        entered_rx.await.unwrap();
        assert_eq!(locks.state(Resource::Store), MutexState::Exclusive);

        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());
        assert_eq!(locks.state(Resource::Store), MutexState::Free);
    }

    #[tokio::test]
    async fn test_escaped_token_is_stale() {
        let table = LockTable::default();
        let locks = &table;

        let escaped = locks
            .with_resource(&Token::empty(), Resource::Users, LockMode::Exclusive, |users| async move {
                locks.verify(&users, Resource::Users, LockMode::Exclusive)?;
                Ok::<_, LockError>(users)
            })
            .await
            .unwrap();

        assert_eq!(
            locks.verify(&escaped, Resource::Users, LockMode::Exclusive),
            Err(LockError::StaleToken {
                resource: Resource::Users
            })
        );
    }

    #[tokio::test]
    async fn test_verify_requires_sufficient_mode() {
        let table = LockTable::default();
        let locks = &table;

        locks
            .with_lock(&Token::empty(), LockMode::Shared, |world: Token<level::World>| async move {
                assert!(locks.verify(&world, Resource::World, LockMode::Shared).is_ok());
                assert_eq!(
                    locks.verify(&world, Resource::World, LockMode::Exclusive),
                    Err(LockError::NotHeld {
                        resource: Resource::World,
                        needed: LockMode::Exclusive,
                    })
                );
                assert_eq!(
                    locks.verify(&world, Resource::Users, LockMode::Shared),
                    Err(LockError::NotHeld {
                        resource: Resource::Users,
                        needed: LockMode::Shared,
                    })
                );
                Ok::<_, LockError>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_configured_timeout_applies() {
        let locks = LockTable::new(&LockConfig {
            acquire_timeout: Some(Duration::from_millis(20)),
        });
        let holder = locks
            .mutex(Resource::Users)
            .acquire(LockMode::Exclusive)
            .await
            .unwrap();

        let result = locks
            .with_resource(&Token::empty(), Resource::Users, LockMode::Exclusive, |_| async {
                Ok::<_, LockError>(())
            })
            .await;
        assert!(matches!(result, Err(LockError::Timeout { .. })));

        drop(holder);
        assert_eq!(locks.state(Resource::Users), MutexState::Free);
    }

    #[tokio::test]
    async fn test_shutdown_drains_and_rejects() {
        let locks = LockTable::default();
        locks.shutdown().await;

        let result = locks
            .with_resource(&Token::empty(), Resource::World, LockMode::Shared, |_| async {
                Ok::<_, LockError>(())
            })
            .await;
        assert_eq!(
            result,
            Err(LockError::Closed {
                resource: Resource::World
            })
        );
    }
}
