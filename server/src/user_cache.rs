//! User records and network sessions, guarded by the Users lock
//!
//! This module keeps the server-side view of who is playing:
//! - Persistent user records (name, avatar, message count, activity times)
//! - Network sessions mapping a client address to a user
//! - Session health monitoring and idle cleanup
//! - Session capacity management
//!
//! Sessions are not persisted. They live beside the user records under the
//! same lock so no request ever needs a lock outside the hierarchy to find
//! out who sent a packet.

use crate::cache::{now_millis, DirtySet, EntryMap};
use crate::error::{LockError, ServerError};
use crate::locks::LockTable;
use crate::token::{level, Above, Level, Token};
use log::info;
use shared::{LockMode, Resource, UserId, UserRecord, MAX_NAME_LEN};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// A connected client and the user it speaks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Session {
    /// User this address is logged in as
    pub user_id: UserId,
    /// Network address for sending responses
    pub addr: SocketAddr,
    /// Last time we received any packet from this address
    pub last_seen: Instant,
}

impl Session {
    pub fn new(user_id: UserId, addr: SocketAddr) -> Self {
        Self {
            user_id,
            addr,
            last_seen: Instant::now(),
        }
    }

    /// Checks if the session has exceeded the idle timeout
    ///
    /// Returns true if no packets have been received from this address
    /// within the specified timeout duration, indicating a likely disconnect.
    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

#[derive(Debug)]
struct UserState {
    users: EntryMap<UserId, UserRecord>,
    sessions: HashMap<SocketAddr, Session>,
    next_id: UserId,
}

impl UserState {
    /// Rebinding an address, or moving a user's live session, needs no new slot.
    fn has_room(&self, addr: SocketAddr, user_id: Option<UserId>, max_sessions: usize) -> bool {
        self.sessions.contains_key(&addr)
            || self.sessions.len() < max_sessions
            || user_id.is_some_and(|id| self.sessions.values().any(|session| session.user_id == id))
    }
}

fn server_full() -> ServerError {
    ServerError::Invalid("server is full".to_string())
}

/// Cache of user records and live sessions
///
/// Every method either acquires the Users lock itself (safe accessors, which
/// take a token whose level is below Users) or requires the caller to
/// already hold it (the `*_locked` accessors, which re-validate the token
/// against the live lock before touching anything).
#[derive(Debug)]
pub struct UserCache {
    locks: Arc<LockTable>,
    max_sessions: usize,
    state: Mutex<UserState>,
}

impl UserCache {
    /// Creates the cache seeded with persisted users
    ///
    /// `next_id` is the first id handed to a new user; it is raised past
    /// every loaded id so persisted ids are never reused.
    pub fn new(
        locks: Arc<LockTable>,
        users: impl IntoIterator<Item = UserRecord>,
        next_id: UserId,
        max_sessions: usize,
    ) -> Self {
        let users = EntryMap::load(users.into_iter().map(|user| (user.id, user)));
        let next_id = users
            .values()
            .map(|user| user.id + 1)
            .max()
            .unwrap_or(1)
            .max(next_id);

        Self {
            locks,
            max_sessions,
            state: Mutex::new(UserState {
                users,
                sessions: HashMap::new(),
                next_id,
            }),
        }
    }

    pub async fn get<L>(&self, token: &Token<L>, id: UserId) -> Result<Option<UserRecord>, LockError>
    where
        L: Level,
        level::Users: Above<L>,
    {
        self.locks
            .with_lock(token, LockMode::Exclusive, |users: Token<level::Users>| async move {
                self.get_locked(&users, id)
            })
            .await
    }

    pub async fn find_by_name<L>(
        &self,
        token: &Token<L>,
        name: &str,
    ) -> Result<Option<UserRecord>, LockError>
    where
        L: Level,
        level::Users: Above<L>,
    {
        self.locks
            .with_lock(token, LockMode::Exclusive, |users: Token<level::Users>| async move {
                self.find_by_name_locked(&users, name)
            })
            .await
    }

    pub async fn create<L>(&self, token: &Token<L>, name: &str) -> Result<UserRecord, ServerError>
    where
        L: Level,
        level::Users: Above<L>,
    {
        self.locks
            .with_lock(token, LockMode::Exclusive, |users: Token<level::Users>| async move {
                self.create_locked(&users, name)
            })
            .await
    }

    /// Looks up the session for `addr` and refreshes its activity time
    pub async fn touch_session<L>(
        &self,
        token: &Token<L>,
        addr: SocketAddr,
    ) -> Result<Option<UserId>, LockError>
    where
        L: Level,
        level::Users: Above<L>,
    {
        self.locks
            .with_lock(token, LockMode::Exclusive, |users: Token<level::Users>| async move {
                self.touch_session_locked(&users, addr)
            })
            .await
    }

    pub async fn session_addrs<L>(&self, token: &Token<L>) -> Result<Vec<SocketAddr>, LockError>
    where
        L: Level,
        level::Users: Above<L>,
    {
        self.locks
            .with_lock(token, LockMode::Exclusive, |users: Token<level::Users>| async move {
                self.session_addrs_locked(&users)
            })
            .await
    }

    pub fn get_locked<L: Level>(
        &self,
        token: &Token<L>,
        id: UserId,
    ) -> Result<Option<UserRecord>, LockError> {
        let state = self.state_locked(token)?;
        Ok(state.users.get(&id).cloned())
    }

    pub fn find_by_name_locked<L: Level>(
        &self,
        token: &Token<L>,
        name: &str,
    ) -> Result<Option<UserRecord>, LockError> {
        let state = self.state_locked(token)?;
        let found = state.users.values().find(|user| user.name == name).cloned();
        Ok(found)
    }

    /// Registers a new user
    ///
    /// Names must be non-empty, at most `MAX_NAME_LEN` bytes and unique.
    pub fn create_locked<L: Level>(
        &self,
        token: &Token<L>,
        name: &str,
    ) -> Result<UserRecord, ServerError> {
        let name = name.trim();
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(ServerError::Invalid(format!(
                "user names must be 1 to {} bytes",
                MAX_NAME_LEN
            )));
        }

        let mut state = self.state_locked(token)?;
        if state.users.values().any(|user| user.name == name) {
            return Err(ServerError::Invalid(format!("name {} is taken", name)));
        }

        let id = state.next_id;
        state.next_id += 1;
        let user = UserRecord::new(id, name, now_millis());
        state.users.insert(id, user.clone());
        info!("User {} registered as {}", id, name);
        Ok(user)
    }

    /// Applies `update` to a user record and marks it dirty
    pub fn update_locked<L: Level, R>(
        &self,
        token: &Token<L>,
        id: UserId,
        update: impl FnOnce(&mut UserRecord) -> R,
    ) -> Result<R, ServerError> {
        let mut state = self.state_locked(token)?;
        state
            .users
            .update(&id, update)
            .ok_or(ServerError::UnknownUser(id))
    }

    /// Associates `addr` with a user
    ///
    /// A user has at most one session: binding from a new address replaces
    /// the old one, whose address is returned. New addresses are refused
    /// once `max_sessions` are bound.
    pub fn bind_session_locked<L: Level>(
        &self,
        token: &Token<L>,
        addr: SocketAddr,
        user_id: UserId,
    ) -> Result<Option<SocketAddr>, ServerError> {
        let mut state = self.state_locked(token)?;
        if state.users.get(&user_id).is_none() {
            return Err(ServerError::UnknownUser(user_id));
        }
        if !state.has_room(addr, Some(user_id), self.max_sessions) {
            return Err(server_full());
        }

        let previous = state
            .sessions
            .values()
            .find(|session| session.user_id == user_id && session.addr != addr)
            .map(|session| session.addr);
        if let Some(previous) = previous {
            state.sessions.remove(&previous);
        }

        state.sessions.insert(addr, Session::new(user_id, addr));
        info!("User {} connected from {}", user_id, addr);
        Ok(previous)
    }

    /// Fails with "server is full" unless a session from `addr` would fit.
    /// `user_id` is the registered user about to bind, if there is one.
    ///
    /// Lets a caller reject a join before creating anything for it.
    pub fn ensure_room_locked<L: Level>(
        &self,
        token: &Token<L>,
        addr: SocketAddr,
        user_id: Option<UserId>,
    ) -> Result<(), ServerError> {
        let state = self.state_locked(token)?;
        if state.has_room(addr, user_id, self.max_sessions) {
            Ok(())
        } else {
            Err(server_full())
        }
    }

    pub fn unbind_session_locked<L: Level>(
        &self,
        token: &Token<L>,
        addr: SocketAddr,
    ) -> Result<Option<Session>, LockError> {
        let mut state = self.state_locked(token)?;
        let session = state.sessions.remove(&addr);
        if let Some(session) = &session {
            info!("User {} disconnected from {}", session.user_id, addr);
        }
        Ok(session)
    }

    pub fn session_locked<L: Level>(
        &self,
        token: &Token<L>,
        addr: SocketAddr,
    ) -> Result<Option<Session>, LockError> {
        let state = self.state_locked(token)?;
        Ok(state.sessions.get(&addr).copied())
    }

    pub fn touch_session_locked<L: Level>(
        &self,
        token: &Token<L>,
        addr: SocketAddr,
    ) -> Result<Option<UserId>, LockError> {
        let mut state = self.state_locked(token)?;
        Ok(state.sessions.get_mut(&addr).map(|session| {
            session.last_seen = Instant::now();
            session.user_id
        }))
    }

    /// Removes and returns every session idle for longer than `timeout`
    pub fn expire_sessions_locked<L: Level>(
        &self,
        token: &Token<L>,
        timeout: Duration,
    ) -> Result<Vec<Session>, LockError> {
        let mut state = self.state_locked(token)?;
        let expired: Vec<Session> = state
            .sessions
            .values()
            .filter(|session| session.is_timed_out(timeout))
            .copied()
            .collect();

        for session in &expired {
            state.sessions.remove(&session.addr);
            info!("User {} timed out from {}", session.user_id, session.addr);
        }

        Ok(expired)
    }

    /// Addresses of every bound session, used for broadcasts
    pub fn session_addrs_locked<L: Level>(
        &self,
        token: &Token<L>,
    ) -> Result<Vec<SocketAddr>, LockError> {
        let state = self.state_locked(token)?;
        Ok(state.sessions.keys().copied().collect())
    }

    pub fn session_count_locked<L: Level>(&self, token: &Token<L>) -> Result<usize, LockError> {
        Ok(self.state_locked(token)?.sessions.len())
    }

    pub fn len_locked<L: Level>(&self, token: &Token<L>) -> Result<usize, LockError> {
        Ok(self.state_locked(token)?.users.len())
    }

    pub fn dirty_count_locked<L: Level>(&self, token: &Token<L>) -> Result<usize, LockError> {
        Ok(self.state_locked(token)?.users.dirty_count())
    }

    /// Collects changed records for the flush path, along with the next
    /// unused user id
    pub fn take_dirty_locked<L: Level>(
        &self,
        token: &Token<L>,
    ) -> Result<(DirtySet<UserId, UserRecord>, UserId), LockError> {
        let mut state = self.state_locked(token)?;
        let next_id = state.next_id;
        Ok((state.users.take_dirty(), next_id))
    }

    fn state_locked<L: Level>(&self, token: &Token<L>) -> Result<MutexGuard<'_, UserState>, LockError> {
        self.locks
            .verify(token, Resource::Users, LockMode::Exclusive)?;
        Ok(self.state.lock().unwrap_or_else(PoisonError::into_inner))
    }
}
