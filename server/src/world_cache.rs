//! World objects and the simulation tick, guarded by the World lock.
//!
//! The world is the lowest resource in the hierarchy and the only cache whose
//! reads may run concurrently: listing objects or reading the tick takes the
//! lock shared, anything that moves, spawns or despawns takes it exclusive.

use crate::cache::{DirtySet, EntryMap};
use crate::error::{LockError, ServerError};
use crate::locks::LockTable;
use crate::token::{level, Above, Level, Token};
use log::debug;
use shared::{LockMode, ObjectId, Resource, UserId, WorldObject};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug)]
struct WorldState {
    objects: EntryMap<ObjectId, WorldObject>,
    next_id: ObjectId,
    tick: u64,
}

#[derive(Debug)]
pub struct WorldCache {
    locks: Arc<LockTable>,
    state: RwLock<WorldState>,
}

impl WorldCache {
    /// Seeds the world from persisted objects. Ids are never reused.
    pub fn new(
        locks: Arc<LockTable>,
        objects: impl IntoIterator<Item = WorldObject>,
        next_id: ObjectId,
    ) -> Self {
        let objects = EntryMap::load(objects.into_iter().map(|object| (object.id, object)));
        let next_id = objects
            .values()
            .map(|object| object.id + 1)
            .max()
            .unwrap_or(1)
            .max(next_id);

        Self {
            locks,
            state: RwLock::new(WorldState {
                objects,
                next_id,
                tick: 0,
            }),
        }
    }

    pub async fn objects<L>(&self, token: &Token<L>) -> Result<Vec<WorldObject>, LockError>
    where
        L: Level,
        level::World: Above<L>,
    {
        self.locks
            .with_lock(token, LockMode::Shared, |world: Token<level::World>| async move {
                self.objects_locked(&world)
            })
            .await
    }

    pub async fn object<L>(
        &self,
        token: &Token<L>,
        id: ObjectId,
    ) -> Result<Option<WorldObject>, LockError>
    where
        L: Level,
        level::World: Above<L>,
    {
        self.locks
            .with_lock(token, LockMode::Shared, |world: Token<level::World>| async move {
                self.object_locked(&world, id)
            })
            .await
    }

    pub async fn spawn<L>(
        &self,
        token: &Token<L>,
        owner: Option<UserId>,
        x: f32,
        y: f32,
    ) -> Result<WorldObject, LockError>
    where
        L: Level,
        level::World: Above<L>,
    {
        self.locks
            .with_lock(token, LockMode::Exclusive, |world: Token<level::World>| async move {
                self.spawn_locked(&world, owner, x, y)
            })
            .await
    }

    pub async fn move_object<L>(
        &self,
        token: &Token<L>,
        id: ObjectId,
        dx: f32,
        dy: f32,
    ) -> Result<WorldObject, ServerError>
    where
        L: Level,
        level::World: Above<L>,
    {
        self.locks
            .with_lock(token, LockMode::Exclusive, |world: Token<level::World>| async move {
                self.move_locked(&world, id, dx, dy)
            })
            .await
    }

    pub async fn despawn<L>(
        &self,
        token: &Token<L>,
        id: ObjectId,
    ) -> Result<Option<WorldObject>, LockError>
    where
        L: Level,
        level::World: Above<L>,
    {
        self.locks
            .with_lock(token, LockMode::Exclusive, |world: Token<level::World>| async move {
                self.despawn_locked(&world, id)
            })
            .await
    }

    /// Advances the simulation tick and returns it with the objects as they
    /// stand at that tick.
    pub async fn advance_tick<L>(
        &self,
        token: &Token<L>,
    ) -> Result<(u64, Vec<WorldObject>), LockError>
    where
        L: Level,
        level::World: Above<L>,
    {
        self.locks
            .with_lock(token, LockMode::Exclusive, |world: Token<level::World>| async move {
                let tick = self.advance_tick_locked(&world)?;
                Ok((tick, self.objects_locked(&world)?))
            })
            .await
    }

    pub fn objects_locked<L: Level>(&self, token: &Token<L>) -> Result<Vec<WorldObject>, LockError> {
        Ok(self.read(token)?.objects.values().cloned().collect())
    }

    pub fn object_locked<L: Level>(
        &self,
        token: &Token<L>,
        id: ObjectId,
    ) -> Result<Option<WorldObject>, LockError> {
        Ok(self.read(token)?.objects.get(&id).cloned())
    }

    pub fn tick_locked<L: Level>(&self, token: &Token<L>) -> Result<u64, LockError> {
        Ok(self.read(token)?.tick)
    }

    pub fn len_locked<L: Level>(&self, token: &Token<L>) -> Result<usize, LockError> {
        Ok(self.read(token)?.objects.len())
    }

    /// Places a new object, clamped into the world bounds.
    pub fn spawn_locked<L: Level>(
        &self,
        token: &Token<L>,
        owner: Option<UserId>,
        x: f32,
        y: f32,
    ) -> Result<WorldObject, LockError> {
        let mut state = self.write(token)?;
        let id = state.next_id;
        state.next_id += 1;
        let object = WorldObject::new(id, owner, x, y);
        state.objects.insert(id, object.clone());
        debug!("Spawned object {} at ({:.1}, {:.1})", id, object.x, object.y);
        Ok(object)
    }

    /// Moves an object by a delta. The result never leaves the world bounds.
    pub fn move_locked<L: Level>(
        &self,
        token: &Token<L>,
        id: ObjectId,
        dx: f32,
        dy: f32,
    ) -> Result<WorldObject, ServerError> {
        if !dx.is_finite() || !dy.is_finite() {
            return Err(ServerError::Invalid("movement must be finite".to_string()));
        }

        let mut state = self.write(token)?;
        state
            .objects
            .update(&id, |object| {
                object.translate(dx, dy);
                object.clone()
            })
            .ok_or(ServerError::UnknownObject(id))
    }

    pub fn despawn_locked<L: Level>(
        &self,
        token: &Token<L>,
        id: ObjectId,
    ) -> Result<Option<WorldObject>, LockError> {
        let removed = self.write(token)?.objects.remove(&id);
        if removed.is_some() {
            debug!("Despawned object {}", id);
        }
        Ok(removed)
    }

    pub fn advance_tick_locked<L: Level>(&self, token: &Token<L>) -> Result<u64, LockError> {
        let mut state = self.write(token)?;
        state.tick += 1;
        Ok(state.tick)
    }

    pub fn dirty_count_locked<L: Level>(&self, token: &Token<L>) -> Result<usize, LockError> {
        Ok(self.read(token)?.objects.dirty_count())
    }

    /// Collects changed objects for the flush path, along with the next
    /// unused object id. Needs the world exclusively since it clears the
    /// dirty flags.
    pub fn take_dirty_locked<L: Level>(
        &self,
        token: &Token<L>,
    ) -> Result<(DirtySet<ObjectId, WorldObject>, ObjectId), LockError> {
        let mut state = self.write(token)?;
        let next_id = state.next_id;
        Ok((state.objects.take_dirty(), next_id))
    }

    fn read<L: Level>(&self, token: &Token<L>) -> Result<RwLockReadGuard<'_, WorldState>, LockError> {
        self.locks.verify(token, Resource::World, LockMode::Shared)?;
        Ok(self.state.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn write<L: Level>(
        &self,
        token: &Token<L>,
    ) -> Result<RwLockWriteGuard<'_, WorldState>, LockError> {
        self.locks
            .verify(token, Resource::World, LockMode::Exclusive)?;
        Ok(self.state.write().unwrap_or_else(PoisonError::into_inner))
    }
}
