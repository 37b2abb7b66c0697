//! Best-effort fan-out of realtime events to joined connections.
//!
//! Routing state lives only in memory: a connection is reachable as a user
//! after it joins and stops being reachable as soon as it leaves or its
//! [`RelayConnection`] handle is dropped. Events addressed to a user with no
//! joined connection are dropped; nothing is buffered for later.

use crate::typing::TypingTracker;
use chat_api::{Message, ServerEvent, UserId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::debug;

pub type ConnId = u64;

type Routes = HashMap<UserId, HashMap<ConnId, UnboundedSender<ServerEvent>>>;

struct Inner {
    routes: Mutex<Routes>,
    next_id: AtomicU64,
    typing: TypingTracker,
}

/// Shared handle to the relay; cheap to clone.
#[derive(Clone)]
pub struct Relay {
    inner: Arc<Inner>,
}

/// Routing state of a single connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Joined(UserId),
}

impl Relay {
    pub fn new(typing_debounce: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                routes: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                typing: TypingTracker::new(typing_debounce),
            }),
        }
    }

    /// Register a new transport connection. It receives nothing until it
    /// joins as a user.
    pub fn connect(&self) -> RelayConnection {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = unbounded_channel();
        RelayConnection {
            id,
            state: ConnectionState::Connected,
            relay: self.clone(),
            tx,
            rx,
        }
    }

    /// Deliver an event to every joined connection of `user_id`. Returns the
    /// number of connections reached.
    pub fn deliver(&self, user_id: UserId, event: ServerEvent) -> usize {
        let mut routes = self.inner.routes.lock();
        let Some(conns) = routes.get_mut(&user_id) else {
            return 0;
        };
        conns.retain(|_, tx| tx.send(event.clone()).is_ok());
        let delivered = conns.len();
        if conns.is_empty() {
            routes.remove(&user_id);
        }
        delivered
    }

    /// Push a newly created message to its receiver.
    pub fn message_created(&self, msg: &Message) -> usize {
        let n = self.deliver(msg.receiver.id, ServerEvent::ReceiveMessage(msg.clone()));
        if n == 0 {
            debug!(message_id = %msg.id, receiver = msg.receiver.id, "receiver offline; relay skipped");
        }
        n
    }

    /// Tell the sender that the receiver read a message.
    pub fn message_read(&self, sender_id: UserId, message_id: uuid::Uuid, read_at: i64) -> usize {
        self.deliver(
            sender_id,
            ServerEvent::MessageRead {
                message_id,
                read_at,
            },
        )
    }

    /// Tell the receiver that a message it may be displaying is gone.
    pub fn message_deleted(&self, msg: &Message) -> usize {
        self.deliver(
            msg.receiver.id,
            ServerEvent::MessageDeleted { message_id: msg.id },
        )
    }

    /// Forward a typing signal unless the pair is within its debounce window.
    pub fn typing(&self, from: UserId, to: UserId) -> usize {
        if !self.inner.typing.typing(from, to) {
            return 0;
        }
        self.deliver(to, ServerEvent::Typing { sender_id: from })
    }

    pub fn stop_typing(&self, from: UserId, to: UserId) -> usize {
        self.inner.typing.stop(from, to);
        self.deliver(to, ServerEvent::StopTyping { sender_id: from })
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.connection_count(user_id) > 0
    }

    pub fn connection_count(&self, user_id: UserId) -> usize {
        self.inner
            .routes
            .lock()
            .get(&user_id)
            .map(|c| c.len())
            .unwrap_or(0)
    }

    fn add_route(&self, user_id: UserId, conn: ConnId, tx: UnboundedSender<ServerEvent>) {
        self.inner
            .routes
            .lock()
            .entry(user_id)
            .or_default()
            .insert(conn, tx);
    }

    fn remove_route(&self, user_id: UserId, conn: ConnId) {
        let mut routes = self.inner.routes.lock();
        let last = match routes.get_mut(&user_id) {
            Some(conns) => {
                conns.remove(&conn);
                conns.is_empty()
            }
            None => false,
        };
        if last {
            routes.remove(&user_id);
            drop(routes);
            self.inner.typing.forget(user_id);
        }
    }
}

/// One transport connection's view of the relay. Dropping it releases every
/// routing entry it holds.
pub struct RelayConnection {
    id: ConnId,
    state: ConnectionState,
    relay: Relay,
    tx: UnboundedSender<ServerEvent>,
    rx: UnboundedReceiver<ServerEvent>,
}

impl RelayConnection {
    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn user_id(&self) -> Option<UserId> {
        match self.state {
            ConnectionState::Joined(user) => Some(user),
            ConnectionState::Connected => None,
        }
    }

    /// Route events addressed to `user_id` to this connection. Joining as a
    /// different user first releases the previous route.
    pub fn join(&mut self, user_id: UserId) {
        if self.state == ConnectionState::Joined(user_id) {
            return;
        }
        self.leave();
        self.relay.add_route(user_id, self.id, self.tx.clone());
        self.state = ConnectionState::Joined(user_id);
        debug!(conn = self.id, user_id, "relay joined");
    }

    /// Return to the connected state, no longer addressable as a user.
    pub fn leave(&mut self) {
        if let ConnectionState::Joined(user) = self.state {
            self.relay.remove_route(user, self.id);
            self.state = ConnectionState::Connected;
            debug!(conn = self.id, user_id = user, "relay left");
        }
    }

    /// Wait for the next event routed to this connection.
    pub async fn recv(&mut self) -> Option<ServerEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ServerEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for RelayConnection {
    fn drop(&mut self) {
        self.leave();
    }
}
