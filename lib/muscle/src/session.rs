use crate::gateway::{Gateway, GatewayPolicy, MessageGateway};
use crate::message::{Message, MessageRef};
use crate::path::PathPattern;
use crate::pool::ObjectPool;
use crate::support::{Result, SessionId};
use fiber::logging::Logger;
use indexmap::IndexMap;
use mio::net::TcpStream;
use std::net::SocketAddr;

/// Update messages carry these well-known field names.
pub const UPDATE_REMOVED_FIELD: &str = "removed";
pub const UPDATE_INDEX_FIELD: &str = "index";

/// Tunable per-session parameters (see `CMD_SET_PARAMETERS`).
#[derive(Debug, Clone, Copy)]
pub struct SessionParams {
    /// Attach the previous payload to change updates.
    pub include_old_payload: bool,
    /// Cap on update items per second; 0 means unlimited.
    pub max_update_items_per_second: u32,
    /// Ceiling on nodes this session may create.
    pub max_nodes: usize,
    /// This session may kick others.
    pub can_kick: bool,
}

impl Default for SessionParams {
    fn default() -> SessionParams {
        SessionParams {
            include_old_payload: false,
            max_update_items_per_second: 0,
            max_nodes: 1 << 20,
            can_kick: false,
        }
    }
}

/// One installed subscription: the compiled pattern plus its match counter.
pub struct Subscription {
    pub pattern: PathPattern,
    pub match_count: u64,
}

/// Accumulated, not yet flushed changes for one session, keyed by node path
/// in first-touch order.
#[derive(Default)]
pub struct UpdateBuffer {
    entries: IndexMap<String, PendingUpdate>,
}

#[derive(Default)]
struct PendingUpdate {
    payload: Option<MessageRef>,
    old_payload: Option<MessageRef>,
    removed: bool,
    index_ops: Vec<String>,
}

impl UpdateBuffer {
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn entry(&mut self, path: &str) -> &mut PendingUpdate {
        if !self.entries.contains_key(path) {
            self.entries.insert(path.to_owned(), PendingUpdate::default());
        }

        self.entries.get_mut(path).expect("Entry vanished after insert")
    }

    pub fn node_updated(&mut self, path: &str, payload: MessageRef, old: Option<MessageRef>) {
        let entry = self.entry(path);

        entry.removed = false;
        entry.payload = Some(payload);

        // Keep the oldest unflushed payload so the client sees the value it
        // last knew about
        if entry.old_payload.is_none() {
            entry.old_payload = old;
        }
    }

    pub fn node_removed(&mut self, path: &str) {
        let entry = self.entry(path);

        entry.removed = true;
        entry.payload = None;
        entry.old_payload = None;
        entry.index_ops.clear();
    }

    pub fn index_changed(&mut self, path: &str, op: String) {
        self.entry(path).index_ops.push(op);
    }

    /// Drains up to `budget` entries into one update message. Remaining
    /// entries carry over to the next flush.
    pub fn drain_into(&mut self, budget: usize, what: u32) -> Option<Message> {
        if self.entries.is_empty() || budget == 0 {
            return None;
        }

        let take = budget.min(self.entries.len());
        let mut update = Message::new(what);
        let mut index_ops = Message::new(0);

        let paths: Vec<String> = self.entries.keys().take(take).cloned().collect();

        for path in paths {
            let entry = self.entries.shift_remove(&path).expect("Entry vanished mid-drain");

            if entry.removed {
                update
                    .add_string(UPDATE_REMOVED_FIELD, &path)
                    .expect("Update field type drifted");
                continue;
            }

            if let Some(payload) = entry.payload {
                update
                    .add_message(&path, payload)
                    .expect("Update field type drifted");

                if let Some(old) = entry.old_payload {
                    update.add_message(&path, old).expect("Update field type drifted");
                }
            }

            for op in entry.index_ops {
                index_ops.add_string(&path, &op).expect("Update field type drifted");
            }
        }

        if index_ops.field_count() > 0 {
            update
                .add_message_value(UPDATE_INDEX_FIELD, index_ops)
                .expect("Update field type drifted");
        }

        Some(update)
    }
}

/// Progress of an outbound connection.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectPhase {
    /// Non-blocking connect in flight; aborted at `deadline` (absolute
    /// microseconds), or never when `None`.
    Connecting { deadline: Option<u64> },
    Ready,
}

/// All per-connection state owned by the server: the socket, its gateway,
/// the pluggable behavior, subscriptions, and the pending update buffer.
pub struct Session {
    pub id: SessionId,
    pub(crate) token: usize,
    pub(crate) stream: Option<TcpStream>,
    pub(crate) gateway: Box<dyn Gateway>,
    pub(crate) behavior: Option<Box<dyn SessionBehavior>>,
    pub params: SessionParams,
    pub subscriptions: Vec<Subscription>,
    pub(crate) pending: UpdateBuffer,
    pub(crate) connect: ConnectPhase,
    pub(crate) kill: bool,
    /// Textual peer IP; first segment of the session's home path.
    pub host: String,
    pub(crate) update_tokens: u32,
    pub(crate) last_refill: u64,
    pub(crate) log: Logger,
}

impl Session {
    /// The session id as it appears in the tree: zero-padded so ids sort
    /// lexicographically.
    pub fn id_string(&self) -> String {
        format!("{:010}", self.id)
    }

    /// Root path segments of this session's subtree.
    pub fn home_segments(&self) -> [String; 2] {
        [self.host.clone(), self.id_string()]
    }
}

/// The hooks a session's protocol logic implements. Exactly one callback runs
/// at a time and must not block; every tree access goes through the context.
pub trait SessionBehavior {
    /// Invoked once the session is installed in the table, before any I/O.
    fn attached(&mut self, ctx: &mut crate::server::ServerCtx) -> Result<()>;

    /// Invoked as the session leaves the table. Tears down per-session state.
    fn detached(&mut self, ctx: &mut crate::server::ServerCtx);

    /// One decoded message from the peer.
    fn message_received(&mut self, ctx: &mut crate::server::ServerCtx, msg: MessageRef) -> Result<()>;

    /// Outcome of a non-blocking connect, delivered before any I/O.
    fn async_connect_completed(&mut self, _ctx: &mut crate::server::ServerCtx, _succeeded: bool) {}

    /// Next absolute wakeup in microseconds, `None` for never.
    fn pulse_time(&self, _now: u64) -> Option<u64> {
        None
    }

    /// Invoked when the requested pulse time has been reached.
    fn pulse(&mut self, _ctx: &mut crate::server::ServerCtx, _now: u64, _scheduled: u64) {}
}

/// Bound to a listen address; manufactures behavior objects for accepted
/// connections.
pub trait SessionFactory {
    /// Reject a peer before a session is created. Banned hosts go here.
    fn accepts(&self, _peer: &SocketAddr) -> bool {
        true
    }

    fn create(&mut self, peer: &SocketAddr, log: &Logger) -> Result<Box<dyn SessionBehavior>>;

    /// Initial parameters for sessions from this factory.
    fn initial_params(&self, _peer: &SocketAddr) -> SessionParams {
        SessionParams::default()
    }

    /// The per-connection codec. Message framing by default; factories for
    /// plain byte peers hand out a `RawGateway` instead.
    fn create_gateway(&self, policy: GatewayPolicy, pool: &ObjectPool<Message>) -> Box<dyn Gateway> {
        Box::new(MessageGateway::new(policy, pool.clone()))
    }
}
