//! Server network layer handling UDP communications and request dispatch
//!
//! Every inbound datagram is decoded and handled in its own task, so many
//! requests touch the caches concurrently. Handlers never talk to the
//! socket directly: they return [`Outbound`] messages that a single sender
//! task delivers. Background tasks flush the caches, expire idle sessions,
//! log lock statistics and broadcast the world every tick.

use crate::config::ServerConfig;
use crate::error::{LockError, ServerError};
use crate::orchestrator::Caches;
use crate::token::{level, Token};
use bincode::{deserialize, serialize};
use log::{debug, error, info, trace, warn};
use rand::Rng;
use shared::{LockMode, Packet, UserId, PROTOCOL_VERSION, WORLD_HEIGHT, WORLD_WIDTH};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval;

/// Messages in the most recent window sent with a state reply.
pub const RECENT_MESSAGES: usize = 20;

const RETRY_REASON: &str = "operation failed, retry the request";

/// Messages sent from request handlers to the sender task
#[derive(Debug, Clone)]
pub enum Outbound {
    SendPacket {
        packet: Packet,
        addr: SocketAddr,
    },
    BroadcastPacket {
        packet: Packet,
        exclude: Option<SocketAddr>,
    },
}

/// Main server owning the socket, the caches and the background tasks
pub struct Server {
    socket: Arc<UdpSocket>,
    caches: Arc<Caches>,
    config: ServerConfig,
    tasks: Vec<JoinHandle<()>>,

    outbound_tx: mpsc::UnboundedSender<Outbound>,
    outbound_rx: Option<mpsc::UnboundedReceiver<Outbound>>,
}

impl Server {
    pub async fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let caches = Arc::new(Caches::open(&config.cache).await?);
        let socket = Arc::new(UdpSocket::bind(config.bind_addr.as_str()).await?);
        info!("Server listening on {}", socket.local_addr()?);

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        Ok(Server {
            socket,
            caches,
            config,
            tasks: Vec::new(),
            outbound_tx,
            outbound_rx: Some(outbound_rx),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn caches(&self) -> Arc<Caches> {
        Arc::clone(&self.caches)
    }

    /// Spawns task that processes the outgoing packet queue
    fn spawn_sender(&mut self) {
        let Some(mut outbound_rx) = self.outbound_rx.take() else {
            return;
        };
        let socket = Arc::clone(&self.socket);
        let caches = Arc::clone(&self.caches);

        self.tasks.push(tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                match message {
                    Outbound::SendPacket { packet, addr } => {
                        if let Err(e) = send_packet(&socket, &packet, addr).await {
                            error!("Failed to send packet to {}: {}", addr, e);
                        }
                    }
                    Outbound::BroadcastPacket { packet, exclude } => {
                        let addrs = match caches.users().session_addrs(&caches.token()).await {
                            Ok(addrs) => addrs,
                            Err(LockError::Closed { .. }) => break,
                            Err(e) => {
                                warn!("Skipping broadcast: {}", e);
                                continue;
                            }
                        };

                        for addr in addrs {
                            if Some(addr) == exclude {
                                continue;
                            }
                            if let Err(e) = send_packet(&socket, &packet, addr).await {
                                error!("Failed to send to {}: {}", addr, e);
                            }
                        }
                    }
                }
            }
        }));
    }

    /// Spawns task that writes dirty cache entries to the store
    fn spawn_flusher(&mut self) {
        let caches = Arc::clone(&self.caches);
        let period = self.config.flush_interval;

        self.tasks.push(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                match caches.flush().await {
                    Ok(report) => trace!("Periodic flush: {:?}", report),
                    Err(ServerError::Lock(LockError::Closed { .. })) => break,
                    Err(e) => error!("Periodic flush failed: {}", e),
                }
            }
        }));
    }

    /// Spawns task that removes sessions that went quiet
    fn spawn_timeout_checker(&mut self) {
        let caches = Arc::clone(&self.caches);
        let timeout = self.config.session_timeout;

        self.tasks.push(tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(1));

            loop {
                ticker.tick().await;
                match expire_sessions(&caches, timeout).await {
                    Ok(0) => {}
                    Ok(expired) => info!("Expired {} idle session(s)", expired),
                    Err(ServerError::Lock(LockError::Closed { .. })) => break,
                    Err(e) => warn!("Session expiry failed: {}", e),
                }
            }
        }));
    }

    /// Spawns task that periodically logs lock contention
    fn spawn_stats_logger(&mut self) {
        let caches = Arc::clone(&self.caches);
        let period = self.config.stats_interval;

        self.tasks.push(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                for stats in caches.stats() {
                    info!(
                        "{} lock: {:?}, {} acquisitions, {:.1}% waited, {} contended, {} timed out, queue {} (max {})",
                        stats.resource,
                        stats.state,
                        stats.acquisitions(),
                        stats.miss_rate() * 100.0,
                        stats.contentions,
                        stats.timeouts,
                        stats.queue_depth,
                        stats.max_queue_depth
                    );
                }
            }
        }));
    }

    /// Spawns task that advances the world and broadcasts it every tick
    fn spawn_ticker(&mut self) {
        let caches = Arc::clone(&self.caches);
        let outbound_tx = self.outbound_tx.clone();
        let period = self.config.tick_duration;

        self.tasks.push(tokio::spawn(async move {
            let mut ticker = interval(period);

            loop {
                ticker.tick().await;
                let (tick, objects) = match caches.world().advance_tick(&caches.token()).await {
                    Ok(state) => state,
                    Err(LockError::Closed { .. }) => break,
                    Err(e) => {
                        warn!("Tick skipped: {}", e);
                        continue;
                    }
                };

                if tick % 600 == 0 {
                    debug!("Tick {}: {} objects", tick, objects.len());
                }

                let packet = Packet::State {
                    tick,
                    objects,
                    recent_messages: Vec::new(),
                };
                if outbound_tx
                    .send(Outbound::BroadcastPacket {
                        packet,
                        exclude: None,
                    })
                    .is_err()
                {
                    break;
                }
            }
        }));
    }

    /// Receives packets until the socket fails, handling each request in its
    /// own task
    pub async fn run(&mut self) -> Result<(), ServerError> {
        self.spawn_sender();
        self.spawn_flusher();
        self.spawn_timeout_checker();
        self.spawn_stats_logger();
        self.spawn_ticker();

        info!("Server started successfully");

        let mut buffer = [0u8; 2048];
        loop {
            let (len, addr) = match self.socket.recv_from(&mut buffer).await {
                Ok(received) => received,
                Err(e) => {
                    error!("Error receiving packet: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    continue;
                }
            };

            let packet = match deserialize::<Packet>(&buffer[..len]) {
                Ok(packet) if packet.is_request() => packet,
                Ok(_) => {
                    warn!("Unexpected packet type from client at {}", addr);
                    continue;
                }
                Err(_) => {
                    warn!("Failed to deserialize packet from {}", addr);
                    continue;
                }
            };

            let caches = Arc::clone(&self.caches);
            let outbound_tx = self.outbound_tx.clone();
            tokio::spawn(async move {
                for message in handle_request(&caches, packet, addr).await {
                    if let Err(e) = outbound_tx.send(message) {
                        error!("Failed to queue packet for sending: {}", e);
                    }
                }
            });
        }
    }

    /// Stops the background tasks, then flushes the caches and drains every
    /// lock.
    pub async fn shutdown(&mut self) -> Result<(), ServerError> {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        let report = self.caches.shutdown().await?;
        info!(
            "Server stopped ({} entries written in final flush)",
            report.written()
        );
        Ok(())
    }
}

async fn send_packet(socket: &UdpSocket, packet: &Packet, addr: SocketAddr) -> Result<(), ServerError> {
    let data = serialize(packet)?;
    socket.send_to(&data, addr).await?;
    Ok(())
}

/// Handles one client request and returns the packets it produces.
///
/// Failures are turned into a `Rejected` reply to the sender. Lock failures
/// never leak internals to clients: they are logged and the client is told
/// to retry.
pub async fn handle_request(caches: &Caches, packet: Packet, addr: SocketAddr) -> Vec<Outbound> {
    let result = match packet {
        Packet::Join {
            client_version,
            name,
        } => join(caches, addr, client_version, &name).await,
        Packet::Move { dx, dy } => move_avatar(caches, addr, dx, dy).await,
        Packet::Say { text } => say(caches, addr, &text).await,
        Packet::RequestState => request_state(caches, addr).await,
        Packet::Leave => leave(caches, addr).await,
        other => Err(ServerError::Invalid(format!(
            "{:?} is not a request",
            other
        ))),
    };

    match result {
        Ok(messages) => messages,
        Err(err) => {
            let reason = match err.lock_error() {
                Some(lock_err) if lock_err.is_order_violation() => {
                    error!("Request from {} broke lock order: {}", addr, lock_err);
                    RETRY_REASON.to_string()
                }
                Some(lock_err) => {
                    warn!("Request from {} failed: {}", addr, lock_err);
                    RETRY_REASON.to_string()
                }
                None => {
                    debug!("Rejected request from {}: {}", addr, err);
                    err.to_string()
                }
            };
            vec![Outbound::SendPacket {
                packet: Packet::Rejected { reason },
                addr,
            }]
        }
    }
}

fn reply(packet: Packet, addr: SocketAddr) -> Outbound {
    Outbound::SendPacket { packet, addr }
}

/// Logs `name` in (registering it on first use), places its avatar and
/// binds the session. Takes World then Users.
async fn join(
    caches: &Caches,
    addr: SocketAddr,
    client_version: u32,
    name: &str,
) -> Result<Vec<Outbound>, ServerError> {
    if client_version != PROTOCOL_VERSION {
        return Err(ServerError::Invalid(format!(
            "client version {} is not supported (server speaks {})",
            client_version, PROTOCOL_VERSION
        )));
    }
    info!("Client joining from {} as {}", addr, name);

    let (x, y) = {
        let mut rng = rand::thread_rng();
        (rng.gen_range(0.0..WORLD_WIDTH), rng.gen_range(0.0..WORLD_HEIGHT))
    };
    let world = caches.world();
    let users = caches.users();

    caches
        .with_world_users(LockMode::Exclusive, |token: Token<level::Users>| async move {
            let found = users.find_by_name_locked(&token, name.trim())?;
            // Nothing is created for a join that cannot be bound.
            users.ensure_room_locked(&token, addr, found.as_ref().map(|user| user.id))?;
            let user = match found {
                Some(user) => user,
                None => users.create_locked(&token, name)?,
            };

            let existing = match user.object_id {
                Some(id) => world.object_locked(&token, id)?,
                None => None,
            };
            let object_id = match existing {
                Some(object) => object.id,
                None => world.spawn_locked(&token, Some(user.id), x, y)?.id,
            };

            let displaced = users.bind_session_locked(&token, addr, user.id)?;
            users.update_locked(&token, user.id, |record| {
                record.object_id = Some(object_id);
                record.last_seen = crate::cache::now_millis();
            })?;

            let mut messages = vec![reply(
                Packet::Joined {
                    user_id: user.id,
                    object_id,
                },
                addr,
            )];
            if let Some(old_addr) = displaced {
                messages.push(reply(Packet::Left, old_addr));
            }
            Ok::<_, ServerError>(messages)
        })
        .await
}

/// Moves the sender's avatar. Takes World then Users.
async fn move_avatar(
    caches: &Caches,
    addr: SocketAddr,
    dx: f32,
    dy: f32,
) -> Result<Vec<Outbound>, ServerError> {
    let world = caches.world();
    let users = caches.users();

    caches
        .with_world_users(LockMode::Exclusive, |token: Token<level::Users>| async move {
            let user_id = users
                .touch_session_locked(&token, addr)?
                .ok_or(ServerError::NotJoined)?;
            let object_id = users
                .get_locked(&token, user_id)?
                .and_then(|user| user.object_id)
                .ok_or(ServerError::NotJoined)?;
            world.move_locked(&token, object_id, dx, dy)?;
            Ok::<_, ServerError>(Vec::new())
        })
        .await
}

/// Appends a chat message and broadcasts it. Takes Users then Messages.
async fn say(caches: &Caches, addr: SocketAddr, text: &str) -> Result<Vec<Outbound>, ServerError> {
    let users = caches.users();
    let messages = caches.messages();

    let message = caches
        .with_users_messages(|token: Token<level::Messages>| async move {
            let user_id = users
                .touch_session_locked(&token, addr)?
                .ok_or(ServerError::NotJoined)?;
            let message = messages.append_locked(&token, user_id, text)?;
            users.update_locked(&token, user_id, |record| record.messages_sent += 1)?;
            Ok::<_, ServerError>(message)
        })
        .await?;

    Ok(vec![Outbound::BroadcastPacket {
        packet: Packet::Chat { message },
        exclude: None,
    }])
}

/// Replies with the world and the recent chat. Checks the session first,
/// then reads World (shared) and Messages.
async fn request_state(caches: &Caches, addr: SocketAddr) -> Result<Vec<Outbound>, ServerError> {
    let root = caches.token();
    caches
        .users()
        .touch_session(&root, addr)
        .await?
        .ok_or(ServerError::NotJoined)?;

    let world = caches.world();
    let messages = caches.messages();
    let packet = caches
        .with_world_messages(LockMode::Shared, |token: Token<level::Messages>| async move {
            Ok::<_, LockError>(Packet::State {
                tick: world.tick_locked(&token)?,
                objects: world.objects_locked(&token)?,
                recent_messages: messages.recent_locked(&token, RECENT_MESSAGES)?,
            })
        })
        .await?;

    Ok(vec![reply(packet, addr)])
}

/// Ends the sender's session and removes its avatar. Takes World then Users.
async fn leave(caches: &Caches, addr: SocketAddr) -> Result<Vec<Outbound>, ServerError> {
    let users = caches.users();

    caches
        .with_world_users(LockMode::Exclusive, |token: Token<level::Users>| async move {
            let session = users
                .unbind_session_locked(&token, addr)?
                .ok_or(ServerError::NotJoined)?;
            remove_avatar(caches, &token, session.user_id)?;
            Ok::<_, ServerError>(vec![reply(Packet::Left, addr)])
        })
        .await
}

/// Drops every idle session and its avatar. Returns how many expired.
pub async fn expire_sessions(caches: &Caches, timeout: Duration) -> Result<usize, ServerError> {
    let users = caches.users();

    caches
        .with_world_users(LockMode::Exclusive, |token: Token<level::Users>| async move {
            let expired = users.expire_sessions_locked(&token, timeout)?;
            for session in &expired {
                remove_avatar(caches, &token, session.user_id)?;
            }
            Ok::<_, ServerError>(expired.len())
        })
        .await
}

/// Despawns a user's avatar and clears it from the record. The token must
/// hold World and Users exclusively.
fn remove_avatar(
    caches: &Caches,
    token: &Token<level::Users>,
    user_id: UserId,
) -> Result<(), ServerError> {
    let object_id = caches
        .users()
        .update_locked(token, user_id, |record| record.object_id.take())?;
    if let Some(object_id) = object_id {
        caches.world().despawn_locked(token, object_id)?;
    }
    Ok(())
}
