//! Types shared by every process that talks to, or runs, the game server.
//!
//! The [`Resource`] table lives here so that every binary linking this crate
//! agrees on the same acquisition order.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

pub const WORLD_WIDTH: f32 = 800.0;
pub const WORLD_HEIGHT: f32 = 600.0;
pub const MAX_NAME_LEN: usize = 32;
pub const MAX_MESSAGE_LEN: usize = 256;
pub const PROTOCOL_VERSION: u32 = 1;

pub type UserId = u32;
pub type ObjectId = u32;

/// A shared resource guarded by exactly one lock.
///
/// Resources are totally ordered by [`Resource::order`]. A call chain may only
/// acquire a resource whose order is strictly greater than everything it
/// already holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resource {
    World,
    Users,
    Store,
    Messages,
}

impl Resource {
    pub const COUNT: usize = 4;

    /// Every resource, lowest order first.
    pub const ALL: [Resource; Resource::COUNT] = [
        Resource::World,
        Resource::Users,
        Resource::Store,
        Resource::Messages,
    ];

    pub const fn order(self) -> u8 {
        match self {
            Resource::World => 1,
            Resource::Users => 2,
            Resource::Store => 3,
            Resource::Messages => 4,
        }
    }

    /// Whether the resource tolerates concurrent readers.
    pub const fn supports_shared(self) -> bool {
        matches!(self, Resource::World | Resource::Store)
    }

    pub const fn name(self) -> &'static str {
        match self {
            Resource::World => "world",
            Resource::Users => "users",
            Resource::Store => "store",
            Resource::Messages => "messages",
        }
    }

    /// Dense index for per-resource tables.
    pub const fn index(self) -> usize {
        self.order() as usize - 1
    }
}

impl Ord for Resource {
    fn cmp(&self, other: &Self) -> Ordering {
        self.order().cmp(&other.order())
    }
}

impl PartialOrd for Resource {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Access mode requested from, or granted by, a resource lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl LockMode {
    /// Exclusive access satisfies any need; shared only satisfies shared.
    pub const fn satisfies(self, needed: LockMode) -> bool {
        matches!(
            (self, needed),
            (LockMode::Exclusive, _) | (LockMode::Shared, LockMode::Shared)
        )
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Shared => f.write_str("shared"),
            LockMode::Exclusive => f.write_str("exclusive"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: UserId,
    pub name: String,
    /// Avatar in the world while the user is connected.
    pub object_id: Option<ObjectId>,
    pub messages_sent: u32,
    pub created_at: u64,
    pub last_seen: u64,
}

impl UserRecord {
    pub fn new(id: UserId, name: impl Into<String>, now: u64) -> Self {
        Self {
            id,
            name: name.into(),
            object_id: None,
            messages_sent: 0,
            created_at: now,
            last_seen: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldObject {
    pub id: ObjectId,
    pub owner: Option<UserId>,
    pub x: f32,
    pub y: f32,
}

impl WorldObject {
    pub fn new(id: ObjectId, owner: Option<UserId>, x: f32, y: f32) -> Self {
        let mut object = Self { id, owner, x, y };
        object.clamp_to_world();
        object
    }

    pub fn translate(&mut self, dx: f32, dy: f32) {
        self.x += dx;
        self.y += dy;
        self.clamp_to_world();
    }

    fn clamp_to_world(&mut self) {
        self.x = self.x.clamp(0.0, WORLD_WIDTH);
        self.y = self.y.clamp(0.0, WORLD_HEIGHT);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub seq: u64,
    pub author: UserId,
    pub text: String,
    pub timestamp: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum Packet {
    Join {
        client_version: u32,
        name: String,
    },
    Move {
        dx: f32,
        dy: f32,
    },
    Say {
        text: String,
    },
    RequestState,
    Leave,

    Joined {
        user_id: UserId,
        object_id: ObjectId,
    },
    State {
        tick: u64,
        objects: Vec<WorldObject>,
        recent_messages: Vec<ChatMessage>,
    },
    Chat {
        message: ChatMessage,
    },
    Rejected {
        reason: String,
    },
    Left,
}

impl Packet {
    /// Packets a server accepts from clients.
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            Packet::Join { .. }
                | Packet::Move { .. }
                | Packet::Say { .. }
                | Packet::RequestState
                | Packet::Leave
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_resource_order_is_total_and_strict() {
        for pair in Resource::ALL.windows(2) {
            assert!(pair[0].order() < pair[1].order());
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn test_resource_index_is_dense() {
        for (i, resource) in Resource::ALL.iter().enumerate() {
            assert_eq!(resource.index(), i);
        }
    }

    #[test]
    fn test_shared_mode_support() {
        assert!(Resource::World.supports_shared());
        assert!(Resource::Store.supports_shared());
        assert!(!Resource::Users.supports_shared());
        assert!(!Resource::Messages.supports_shared());
    }

    #[test]
    fn test_resource_display() {
        assert_eq!(Resource::World.to_string(), "world");
        assert_eq!(Resource::Messages.to_string(), "messages");
    }

    #[test]
    fn test_lock_mode_satisfies() {
        assert!(LockMode::Exclusive.satisfies(LockMode::Shared));
        assert!(LockMode::Exclusive.satisfies(LockMode::Exclusive));
        assert!(LockMode::Shared.satisfies(LockMode::Shared));
        assert!(!LockMode::Shared.satisfies(LockMode::Exclusive));
    }

    #[test]
    fn test_world_object_is_clamped() {
        let mut object = WorldObject::new(1, None, -10.0, WORLD_HEIGHT + 5.0);
        assert_approx_eq!(object.x, 0.0);
        assert_approx_eq!(object.y, WORLD_HEIGHT);

        object.translate(25.5, -100.25);
        assert_approx_eq!(object.x, 25.5);
        assert_approx_eq!(object.y, WORLD_HEIGHT - 100.25);

        object.translate(WORLD_WIDTH * 2.0, 0.0);
        assert_approx_eq!(object.x, WORLD_WIDTH);
    }

    #[test]
    fn test_user_record_creation() {
        let user = UserRecord::new(7, "ada", 1000);
        assert_eq!(user.id, 7);
        assert_eq!(user.name, "ada");
        assert_eq!(user.object_id, None);
        assert_eq!(user.created_at, 1000);
        assert_eq!(user.last_seen, 1000);
    }

    #[test]
    fn test_packet_serialization_state() {
        let packet = Packet::State {
            tick: 42,
            objects: vec![WorldObject::new(1, Some(3), 10.0, 20.0)],
            recent_messages: vec![ChatMessage {
                seq: 9,
                author: 3,
                text: "hello".to_string(),
                timestamp: 123456,
            }],
        };

        let serialized = bincode::serialize(&packet).unwrap();
        let deserialized: Packet = bincode::deserialize(&serialized).unwrap();

        match deserialized {
            Packet::State {
                tick,
                objects,
                recent_messages,
            } => {
                assert_eq!(tick, 42);
                assert_eq!(objects.len(), 1);
                assert_eq!(objects[0].owner, Some(3));
                assert_eq!(recent_messages[0].text, "hello");
            }
            _ => panic!("Wrong packet type after deserialization"),
        }
    }

    #[test]
    fn test_request_classification() {
        assert!(Packet::Leave.is_request());
        assert!(Packet::Say {
            text: "hi".to_string()
        }
        .is_request());
        assert!(!Packet::Left.is_request());
        assert!(!Packet::Rejected {
            reason: "full".to_string()
        }
        .is_request());
    }
}
