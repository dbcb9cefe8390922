//! Persistent store: the last resource written before anything reaches disk.
//!
//! The store keeps a typed snapshot of everything the caches flushed into it
//! and writes it as a single bincode file. Reads may share the store lock;
//! anything that changes the snapshot or writes the file holds it
//! exclusively.

use crate::cache::DirtySet;
use crate::error::{LockError, ServerError};
use crate::locks::LockTable;
use crate::token::{level, Above, Level, Token};
use bincode::{deserialize, serialize};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use shared::{ChatMessage, LockMode, ObjectId, Resource, UserId, UserRecord, WorldObject};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

const SNAPSHOT_FILE: &str = "snapshot.bin";
const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub users: BTreeMap<UserId, UserRecord>,
    pub objects: BTreeMap<ObjectId, WorldObject>,
    pub messages: Vec<ChatMessage>,
    pub next_user_id: UserId,
    pub next_object_id: ObjectId,
    pub next_message_seq: u64,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            users: BTreeMap::new(),
            objects: BTreeMap::new(),
            messages: Vec::new(),
            next_user_id: 1,
            next_object_id: 1,
            next_message_seq: 1,
        }
    }
}

#[derive(Debug, Default)]
struct StoreState {
    snapshot: Snapshot,
    dirty: bool,
    commits: u64,
}

#[derive(Debug)]
pub struct PersistentStore {
    locks: Arc<LockTable>,
    path: Option<PathBuf>,
    state: RwLock<StoreState>,
}

impl PersistentStore {
    /// A store that never touches disk.
    pub fn in_memory(locks: Arc<LockTable>) -> Self {
        Self {
            locks,
            path: None,
            state: RwLock::new(StoreState::default()),
        }
    }

    /// Opens the snapshot under `data_dir`, starting empty if none exists.
    pub async fn open(locks: Arc<LockTable>, data_dir: &Path) -> Result<Self, ServerError> {
        tokio::fs::create_dir_all(data_dir).await?;
        let path = data_dir.join(SNAPSHOT_FILE);

        let snapshot = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let snapshot: Snapshot = deserialize(&bytes)?;
                if snapshot.version != SNAPSHOT_VERSION {
                    return Err(ServerError::Invalid(format!(
                        "snapshot version {} is not supported",
                        snapshot.version
                    )));
                }
                info!(
                    "Loaded snapshot from {} ({} users, {} objects, {} messages)",
                    path.display(),
                    snapshot.users.len(),
                    snapshot.objects.len(),
                    snapshot.messages.len()
                );
                snapshot
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!("No snapshot at {}, starting empty", path.display());
                Snapshot::default()
            }
            Err(err) => return Err(err.into()),
        };

        Ok(Self {
            locks,
            path: Some(path),
            state: RwLock::new(StoreState {
                snapshot,
                dirty: false,
                commits: 0,
            }),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Copy of the stored snapshot, taken under a shared store lock.
    pub async fn snapshot<L>(&self, token: &Token<L>) -> Result<Snapshot, LockError>
    where
        L: Level,
        level::Store: Above<L>,
    {
        self.locks
            .with_lock(token, LockMode::Shared, |store: Token<level::Store>| async move {
                self.snapshot_locked(&store)
            })
            .await
    }

    /// Writes the snapshot to disk if anything changed since the last commit.
    /// Returns whether a write happened.
    pub async fn commit<L>(&self, token: &Token<L>) -> Result<bool, ServerError>
    where
        L: Level,
        level::Store: Above<L>,
    {
        self.locks
            .with_lock(token, LockMode::Exclusive, |store: Token<level::Store>| async move {
                self.commit_locked(&store).await
            })
            .await
    }

    pub fn snapshot_locked<L: Level>(&self, token: &Token<L>) -> Result<Snapshot, LockError> {
        self.locks.verify(token, Resource::Store, LockMode::Shared)?;
        Ok(self.read().snapshot.clone())
    }

    pub fn is_dirty_locked<L: Level>(&self, token: &Token<L>) -> Result<bool, LockError> {
        self.locks.verify(token, Resource::Store, LockMode::Shared)?;
        Ok(self.read().dirty)
    }

    pub fn commits_locked<L: Level>(&self, token: &Token<L>) -> Result<u64, LockError> {
        self.locks.verify(token, Resource::Store, LockMode::Shared)?;
        Ok(self.read().commits)
    }

    pub fn apply_users_locked<L: Level>(
        &self,
        token: &Token<L>,
        changes: DirtySet<UserId, UserRecord>,
        next_user_id: UserId,
    ) -> Result<usize, LockError> {
        self.locks.verify(token, Resource::Store, LockMode::Exclusive)?;
        let mut state = self.write();
        let written = changes.len();
        for (id, user) in changes.upserts {
            state.snapshot.users.insert(id, user);
        }
        for id in changes.removals {
            state.snapshot.users.remove(&id);
        }
        state.snapshot.next_user_id = state.snapshot.next_user_id.max(next_user_id);
        state.dirty |= written > 0;
        Ok(written)
    }

    pub fn apply_objects_locked<L: Level>(
        &self,
        token: &Token<L>,
        changes: DirtySet<ObjectId, WorldObject>,
        next_object_id: ObjectId,
    ) -> Result<usize, LockError> {
        self.locks.verify(token, Resource::Store, LockMode::Exclusive)?;
        let mut state = self.write();
        let written = changes.len();
        for (id, object) in changes.upserts {
            state.snapshot.objects.insert(id, object);
        }
        for id in changes.removals {
            state.snapshot.objects.remove(&id);
        }
        state.snapshot.next_object_id = state.snapshot.next_object_id.max(next_object_id);
        state.dirty |= written > 0;
        Ok(written)
    }

    /// Appends to the persisted message log. Messages at or below the last
    /// stored sequence number are ignored.
    pub fn append_messages_locked<L: Level>(
        &self,
        token: &Token<L>,
        messages: Vec<ChatMessage>,
    ) -> Result<usize, LockError> {
        self.locks.verify(token, Resource::Store, LockMode::Exclusive)?;
        let mut state = self.write();
        let last_seq = state.snapshot.messages.last().map_or(0, |message| message.seq);
        let before = state.snapshot.messages.len();
        state
            .snapshot
            .messages
            .extend(messages.into_iter().filter(|message| message.seq > last_seq));
        let written = state.snapshot.messages.len() - before;
        if let Some(last) = state.snapshot.messages.last() {
            let next = last.seq + 1;
            state.snapshot.next_message_seq = state.snapshot.next_message_seq.max(next);
        }
        state.dirty |= written > 0;
        Ok(written)
    }

    pub async fn commit_locked<L: Level>(&self, token: &Token<L>) -> Result<bool, ServerError> {
        self.locks.verify(token, Resource::Store, LockMode::Exclusive)?;

        let encoded = {
            let state = self.read();
            if !state.dirty {
                return Ok(false);
            }
            serialize(&state.snapshot)?
        };

        if let Some(path) = &self.path {
            let tmp = path.with_extension("bin.tmp");
            tokio::fs::write(&tmp, &encoded).await?;
            tokio::fs::rename(&tmp, path).await?;
            debug!("Wrote {} byte snapshot to {}", encoded.len(), path.display());
        }

        let mut state = self.write();
        state.dirty = false;
        state.commits += 1;
        Ok(true)
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}
