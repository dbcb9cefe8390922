//! # Game Server Library
//!
//! This library provides the authoritative server for the multiplayer game:
//! player records, world objects, the chat log and the store they are
//! persisted to. Many request handlers run concurrently against that state,
//! and the library's main job is letting them do so without deadlocks or
//! races.
//!
//! ## Ordered Locking
//!
//! Every shared resource has a fixed place in a total order:
//!
//! | resource   | order | shared reads |
//! |------------|-------|--------------|
//! | `World`    | 1     | yes          |
//! | `Users`    | 2     | no           |
//! | `Store`    | 3     | yes          |
//! | `Messages` | 4     | no           |
//!
//! A handler may only acquire a resource whose order is strictly greater
//! than anything it already holds. The rule is carried by a capability
//! [`Token`](token::Token) threaded through every call:
//!
//! - its type parameter records the highest level held, so out-of-order
//!   typed acquisitions do not compile
//! - [`Token::check`](token::Token::check) enforces the same rule at run time
//!   before any lock is touched, including for erased tokens
//!
//! With every handler acquiring in one global order, no cycle of waiters can
//! form.
//!
//! ### Mutex Engine (`mutex`)
//! One asynchronous reader/writer lock per resource:
//! - Waiting tasks are suspended, never blocked
//! - Strict FIFO queue; a queued writer holds back later readers
//! - Waiters dropped before being granted leave the queue
//! - Hit, miss, contention and timeout counters
//!
//! ### Scoped Acquisition (`locks`)
//! [`LockTable::with_lock`](locks::LockTable::with_lock) is the only way to
//! take a lock. It hands a widened token to a continuation and releases the
//! lock however the continuation ends: success, error, panic or
//! cancellation.
//!
//! ## Module Organization
//!
//! ### Caches (`user_cache`, `world_cache`, `message_cache`, `store`)
//! Each cache owns the data behind one resource. Safe accessors take the
//! lock themselves; `*_locked` accessors require the caller to hold it and
//! re-validate the token against the live lock first.
//!
//! ### Orchestrator (`orchestrator`)
//! [`Caches`](orchestrator::Caches) owns the lock table and every cache,
//! offers composite operations that acquire several resources in order, and
//! flushes dirty entries into the store.
//!
//! ### Network (`network`)
//! UDP request server. Each datagram is handled in its own task; replies
//! and broadcasts go through a single sender task.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut server = Server::new(ServerConfig::default()).await?;
//!
//!     tokio::select! {
//!         result = server.run() => result?,
//!         _ = tokio::signal::ctrl_c() => {}
//!     }
//!
//!     // Final flush, then every lock is closed and drained.
//!     server.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod locks;
pub mod message_cache;
pub mod mutex;
pub mod network;
pub mod orchestrator;
pub mod store;
pub mod token;
pub mod user_cache;
pub mod world_cache;
