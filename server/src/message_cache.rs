//! Append-only chat log, guarded by the Messages lock.
//!
//! Messages are numbered in append order. Only a bounded window stays in
//! memory, but a message is never evicted before the store has it.

use crate::cache::{now_millis, CacheEntry};
use crate::error::{LockError, ServerError};
use crate::locks::LockTable;
use crate::token::{level, Above, Level, Token};
use log::{debug, warn};
use shared::{ChatMessage, LockMode, Resource, UserId, MAX_MESSAGE_LEN};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug)]
struct MessageLog {
    entries: VecDeque<CacheEntry<ChatMessage>>,
    next_seq: u64,
}

#[derive(Debug)]
pub struct MessageCache {
    locks: Arc<LockTable>,
    capacity: usize,
    log: Mutex<MessageLog>,
}

impl MessageCache {
    /// Seeds the log with the newest persisted messages.
    pub fn new(
        locks: Arc<LockTable>,
        persisted: impl IntoIterator<Item = ChatMessage>,
        next_seq: u64,
        capacity: usize,
    ) -> Self {
        let mut entries: VecDeque<_> = persisted.into_iter().map(CacheEntry::clean).collect();
        while entries.len() > capacity {
            entries.pop_front();
        }
        let next_seq = entries
            .back()
            .map_or(1, |entry| entry.value.seq + 1)
            .max(next_seq);

        Self {
            locks,
            capacity,
            log: Mutex::new(MessageLog { entries, next_seq }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn append<L>(
        &self,
        token: &Token<L>,
        author: UserId,
        text: &str,
    ) -> Result<ChatMessage, ServerError>
    where
        L: Level,
        level::Messages: Above<L>,
    {
        self.locks
            .with_lock(token, LockMode::Exclusive, |messages: Token<level::Messages>| async move {
                self.append_locked(&messages, author, text)
            })
            .await
    }

    pub async fn recent<L>(&self, token: &Token<L>, count: usize) -> Result<Vec<ChatMessage>, LockError>
    where
        L: Level,
        level::Messages: Above<L>,
    {
        self.locks
            .with_lock(token, LockMode::Exclusive, |messages: Token<level::Messages>| async move {
                self.recent_locked(&messages, count)
            })
            .await
    }

    pub fn append_locked<L: Level>(
        &self,
        token: &Token<L>,
        author: UserId,
        text: &str,
    ) -> Result<ChatMessage, ServerError> {
        let text = text.trim();
        if text.is_empty() || text.len() > MAX_MESSAGE_LEN {
            return Err(ServerError::Invalid(format!(
                "messages must be 1 to {} bytes",
                MAX_MESSAGE_LEN
            )));
        }

        let mut log = self.lock(token)?;
        let message = ChatMessage {
            seq: log.next_seq,
            author,
            text: text.to_string(),
            timestamp: now_millis(),
        };
        log.next_seq += 1;
        log.entries.push_back(CacheEntry::dirty(message.clone()));
        self.evict(&mut log);
        Ok(message)
    }

    /// The newest `count` messages in memory, oldest first.
    pub fn recent_locked<L: Level>(
        &self,
        token: &Token<L>,
        count: usize,
    ) -> Result<Vec<ChatMessage>, LockError> {
        let log = self.lock(token)?;
        let skip = log.entries.len().saturating_sub(count);
        Ok(log
            .entries
            .iter()
            .skip(skip)
            .map(|entry| entry.value.clone())
            .collect())
    }

    pub fn len_locked<L: Level>(&self, token: &Token<L>) -> Result<usize, LockError> {
        Ok(self.lock(token)?.entries.len())
    }

    pub fn unpersisted_count_locked<L: Level>(&self, token: &Token<L>) -> Result<usize, LockError> {
        Ok(self
            .lock(token)?
            .entries
            .iter()
            .filter(|entry| entry.dirty)
            .count())
    }

    pub fn next_seq_locked<L: Level>(&self, token: &Token<L>) -> Result<u64, LockError> {
        Ok(self.lock(token)?.next_seq)
    }

    /// Messages the store does not have yet, in sequence order. They stay
    /// unpersisted until [`MessageCache::mark_persisted_locked`] is called.
    pub fn take_unpersisted_locked<L: Level>(
        &self,
        token: &Token<L>,
    ) -> Result<Vec<ChatMessage>, LockError> {
        let log = self.lock(token)?;
        Ok(log
            .entries
            .iter()
            .filter(|entry| entry.dirty)
            .map(|entry| entry.value.clone())
            .collect())
    }

    /// Marks every message up to and including `seq` as persisted, then
    /// trims the log back to capacity.
    pub fn mark_persisted_locked<L: Level>(
        &self,
        token: &Token<L>,
        seq: u64,
    ) -> Result<usize, LockError> {
        let mut log = self.lock(token)?;
        let mut marked = 0;
        for entry in log.entries.iter_mut().filter(|entry| entry.dirty) {
            if entry.value.seq <= seq {
                entry.dirty = false;
                marked += 1;
            }
        }
        self.evict(&mut log);
        debug!("Marked {} messages persisted up to seq {}", marked, seq);
        Ok(marked)
    }

    /// Drops persisted messages from the front until the log fits. Stops at
    /// the first unpersisted one.
    fn evict(&self, log: &mut MessageLog) {
        while log.entries.len() > self.capacity {
            match log.entries.front() {
                Some(front) if !front.dirty => {
                    log.entries.pop_front();
                }
                _ => break,
            }
        }
        if log.entries.len() > self.capacity.saturating_mul(2) {
            warn!(
                "{} messages held in memory waiting for a flush (capacity {})",
                log.entries.len(),
                self.capacity
            );
        }
    }

    fn lock<L: Level>(&self, token: &Token<L>) -> Result<MutexGuard<'_, MessageLog>, LockError> {
        self.locks
            .verify(token, Resource::Messages, LockMode::Exclusive)?;
        Ok(self.log.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn messages(capacity: usize) -> MessageCache {
        MessageCache::new(Arc::new(LockTable::default()), Vec::new(), 1, capacity)
    }

    fn persisted(seq: u64) -> ChatMessage {
        ChatMessage {
            seq,
            author: 1,
            text: format!("old {}", seq),
            timestamp: 0,
        }
    }

    #[tokio::test]
    async fn test_append_numbers_in_order() {
        let cache = messages(10);
        let root = Token::empty();

        let first = cache.append(&root, 1, "hello").await.unwrap();
        let second = cache.append(&root, 2, "  world  ").await.unwrap();

        assert_eq!(first.seq, 1);
        assert_eq!(second.seq, 2);
        assert_eq!(second.text, "world");

        let recent = cache.recent(&root, 1).await.unwrap();
        assert_eq!(recent, vec![second]);
        assert_eq!(cache.recent(&root, 50).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_append_rejects_empty_and_oversized() {
        let cache = messages(10);
        let root = Token::empty();

        assert!(matches!(
            cache.append(&root, 1, "   ").await,
            Err(ServerError::Invalid(_))
        ));
        let long = "y".repeat(MAX_MESSAGE_LEN + 1);
        assert!(matches!(
            cache.append(&root, 1, &long).await,
            Err(ServerError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_unpersisted_messages_are_never_evicted() {
        let cache = messages(2);
        let cache = &cache;
        let root = Token::empty();

        for i in 0..5 {
            cache.append(&root, 1, &format!("msg {}", i)).await.unwrap();
        }

        cache
            .locks
            .with_lock(&root, LockMode::Exclusive, |token: Token<level::Messages>| async move {
                // Over capacity, but nothing has reached the store yet.
                assert_eq!(cache.len_locked(&token)?, 5);
                let pending = cache.take_unpersisted_locked(&token)?;
                assert_eq!(pending.len(), 5);

                assert_eq!(cache.mark_persisted_locked(&token, 3)?, 3);
                // Seq 1 to 3 are persisted and can go now.
                assert_eq!(cache.len_locked(&token)?, 2);
                assert_eq!(cache.unpersisted_count_locked(&token)?, 2);

                cache.mark_persisted_locked(&token, 5)?;
                assert_eq!(cache.len_locked(&token)?, 2);
                assert!(cache.take_unpersisted_locked(&token)?.is_empty());
                Ok::<_, LockError>(())
            })
            .await
            .unwrap();

        let kept: Vec<u64> = cache
            .recent(&root, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|message| message.seq)
            .collect();
        assert_eq!(kept, vec![4, 5]);
    }

    #[tokio::test]
    async fn test_seeded_log_continues_sequence() {
        let cache = MessageCache::new(
            Arc::new(LockTable::default()),
            (1..=5).map(persisted),
            1,
            3,
        );
        let root = Token::empty();

        let recent = cache.recent(&root, 10).await.unwrap();
        assert_eq!(recent.first().map(|message| message.seq), Some(3));

        let next = cache.append(&root, 2, "new").await.unwrap();
        assert_eq!(next.seq, 6);
    }

    #[tokio::test]
    async fn test_held_accessor_requires_messages_lock() {
        let cache = messages(4);
        let cache = &cache;

        let result = cache
            .locks
            .with_lock(&Token::empty(), LockMode::Exclusive, |store: Token<level::Store>| async move {
                cache.recent_locked(&store, 1)
            })
            .await;
        assert_eq!(
            result,
            Err(LockError::NotHeld {
                resource: Resource::Messages,
                needed: LockMode::Exclusive,
            })
        );
    }
}
