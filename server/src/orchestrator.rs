//! The cache orchestrator: one owner for the lock table, the three caches and
//! the persistent store.
//!
//! Request handlers go through [`Caches`] for everything. Operations that
//! span several resources use the composite helpers below, each of which
//! acquires its resources in hierarchy order, so no handler has to spell
//! the order out by hand.

use crate::config::CacheConfig;
use crate::error::{LockError, ServerError};
use crate::locks::LockTable;
use crate::message_cache::MessageCache;
use crate::mutex::MutexStats;
use crate::store::PersistentStore;
use crate::token::{level, Token};
use crate::user_cache::UserCache;
use crate::world_cache::WorldCache;
use log::{debug, error, info};
use shared::LockMode;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What one flush moved into the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub objects: usize,
    pub users: usize,
    pub messages: usize,
    /// Whether a snapshot was written.
    pub committed: bool,
    pub elapsed: Duration,
}

impl FlushReport {
    pub fn written(&self) -> usize {
        self.objects + self.users + self.messages
    }
}

#[derive(Debug)]
pub struct Caches {
    locks: Arc<LockTable>,
    world: WorldCache,
    users: UserCache,
    messages: MessageCache,
    store: PersistentStore,
}

impl Caches {
    /// Loads the persisted snapshot (if a data directory is configured) and
    /// seeds every cache from it.
    pub async fn open(config: &CacheConfig) -> Result<Self, ServerError> {
        let locks = Arc::new(LockTable::new(&config.lock));
        let store = match &config.data_dir {
            Some(dir) => PersistentStore::open(Arc::clone(&locks), dir).await?,
            None => PersistentStore::in_memory(Arc::clone(&locks)),
        };

        let snapshot = store.snapshot(&Token::empty()).await?;
        let world = WorldCache::new(
            Arc::clone(&locks),
            snapshot.objects.into_values(),
            snapshot.next_object_id,
        );
        let users = UserCache::new(
            Arc::clone(&locks),
            snapshot.users.into_values(),
            snapshot.next_user_id,
            config.max_sessions,
        );
        let messages = MessageCache::new(
            Arc::clone(&locks),
            snapshot.messages,
            snapshot.next_message_seq,
            config.message_capacity,
        );

        info!(
            "Caches ready ({})",
            store
                .path()
                .map_or_else(|| "memory only".to_string(), |path| path.display().to_string())
        );

        Ok(Self {
            locks,
            world,
            users,
            messages,
            store,
        })
    }

    /// The empty token every request starts from.
    pub fn token(&self) -> Token {
        Token::empty()
    }

    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    pub fn world(&self) -> &WorldCache {
        &self.world
    }

    pub fn users(&self) -> &UserCache {
        &self.users
    }

    pub fn messages(&self) -> &MessageCache {
        &self.messages
    }

    pub fn store(&self) -> &PersistentStore {
        &self.store
    }

    /// World (in `world_mode`), then Users.
    pub async fn with_world_users<T, E, F, Fut>(&self, world_mode: LockMode, f: F) -> Result<T, E>
    where
        F: FnOnce(Token<level::Users>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        let locks = &*self.locks;
        locks
            .with_lock(&self.token(), world_mode, |world: Token<level::World>| async move {
                locks.with_lock(&world, LockMode::Exclusive, f).await
            })
            .await
    }

    /// World, Users, then Store.
    pub async fn with_world_users_store<T, E, F, Fut>(
        &self,
        world_mode: LockMode,
        store_mode: LockMode,
        f: F,
    ) -> Result<T, E>
    where
        F: FnOnce(Token<level::Store>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        let locks = &*self.locks;
        self.with_world_users(world_mode, |users: Token<level::Users>| async move {
            locks.with_lock(&users, store_mode, f).await
        })
        .await
    }

    /// Users, then Messages.
    pub async fn with_users_messages<T, E, F, Fut>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(Token<level::Messages>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        let locks = &*self.locks;
        locks
            .with_lock(&self.token(), LockMode::Exclusive, |users: Token<level::Users>| async move {
                locks.with_lock(&users, LockMode::Exclusive, f).await
            })
            .await
    }

    /// World (in `world_mode`), then Messages.
    pub async fn with_world_messages<T, E, F, Fut>(&self, world_mode: LockMode, f: F) -> Result<T, E>
    where
        F: FnOnce(Token<level::Messages>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        let locks = &*self.locks;
        locks
            .with_lock(&self.token(), world_mode, |world: Token<level::World>| async move {
                locks.with_lock(&world, LockMode::Exclusive, f).await
            })
            .await
    }

    /// Store (in `store_mode`), then Messages.
    pub async fn with_store_messages<T, E, F, Fut>(&self, store_mode: LockMode, f: F) -> Result<T, E>
    where
        F: FnOnce(Token<level::Messages>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        let locks = &*self.locks;
        locks
            .with_lock(&self.token(), store_mode, |store: Token<level::Store>| async move {
                locks.with_lock(&store, LockMode::Exclusive, f).await
            })
            .await
    }

    /// Moves every dirty entry into the store, then commits it.
    ///
    /// World and user changes travel World→Users→Store. Messages outrank the
    /// store, so they travel Store→Messages. The snapshot is written after
    /// both transfers, with only the store lock held.
    pub async fn flush(&self) -> Result<FlushReport, ServerError> {
        let started = Instant::now();
        let world = &self.world;
        let users = &self.users;
        let messages = &self.messages;
        let store = &self.store;

        let (objects, user_count) = self
            .with_world_users_store(
                LockMode::Exclusive,
                LockMode::Exclusive,
                |token: Token<level::Store>| async move {
                    let (object_changes, next_object_id) = world.take_dirty_locked(&token)?;
                    let (user_changes, next_user_id) = users.take_dirty_locked(&token)?;
                    let objects = store.apply_objects_locked(&token, object_changes, next_object_id)?;
                    let users = store.apply_users_locked(&token, user_changes, next_user_id)?;
                    Ok::<_, LockError>((objects, users))
                },
            )
            .await?;

        let message_count = self
            .with_store_messages(LockMode::Exclusive, |token: Token<level::Messages>| async move {
                let pending = messages.take_unpersisted_locked(&token)?;
                let Some(last_seq) = pending.last().map(|message| message.seq) else {
                    return Ok::<_, LockError>(0);
                };
                let written = store.append_messages_locked(&token, pending)?;
                messages.mark_persisted_locked(&token, last_seq)?;
                Ok(written)
            })
            .await?;

        let committed = store.commit(&self.token()).await?;

        let report = FlushReport {
            objects,
            users: user_count,
            messages: message_count,
            committed,
            elapsed: started.elapsed(),
        };
        if report.written() > 0 {
            debug!(
                "Flushed {} objects, {} users, {} messages in {:?}",
                report.objects, report.users, report.messages, report.elapsed
            );
        }
        Ok(report)
    }

    pub fn stats(&self) -> Vec<MutexStats> {
        self.locks.stats()
    }

    /// Final flush, then closes every lock and waits for queued waiters to
    /// drain. The locks are closed even when the flush fails.
    pub async fn shutdown(&self) -> Result<FlushReport, ServerError> {
        info!("Flushing caches before shutdown");
        let flushed = self.flush().await;
        if let Err(err) = &flushed {
            error!("Final flush failed: {}", err);
        }
        self.locks.shutdown().await;
        flushed
    }
}
