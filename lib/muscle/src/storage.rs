use crate::gateway::Gateway;
use crate::message::{fourcc, Field, Message, MessageRef};
use crate::path::{has_wildcards, split_path, PathPattern, SegmentPattern};
use crate::server::ServerCtx;
use crate::session::{SessionBehavior, SessionFactory, SessionParams, Subscription};
use crate::support::{Error, Result, SessionId};
use crate::tree::NodeId;
use fiber::logging::{self, Logger};
use std::net::SocketAddr;

const COMMAND_BASE: u32 = fourcc(*b"!Pc0");

pub const CMD_PING: u32 = COMMAND_BASE;
pub const CMD_SET_DATA: u32 = COMMAND_BASE + 1;
pub const CMD_GET_DATA: u32 = COMMAND_BASE + 2;
pub const CMD_REMOVE_DATA: u32 = COMMAND_BASE + 3;
pub const CMD_SUBSCRIBE: u32 = COMMAND_BASE + 4;
pub const CMD_UNSUBSCRIBE: u32 = COMMAND_BASE + 5;
pub const CMD_INSERT_ORDERED: u32 = COMMAND_BASE + 6;
pub const CMD_REORDER_INDEX: u32 = COMMAND_BASE + 7;
pub const CMD_GET_PARAMETERS: u32 = COMMAND_BASE + 8;
pub const CMD_SET_PARAMETERS: u32 = COMMAND_BASE + 9;
pub const CMD_KICK: u32 = COMMAND_BASE + 10;

const RESULT_BASE: u32 = fourcc(*b"!Pr0");

pub const RESULT_DATA_ITEMS: u32 = RESULT_BASE;
pub const RESULT_SESSION_INFO: u32 = RESULT_BASE + 1;
pub const RESULT_PONG: u32 = RESULT_BASE + 2;
pub const RESULT_PARAMETERS: u32 = RESULT_BASE + 3;
pub const RESULT_ERROR: u32 = RESULT_BASE + 4;

pub const FIELD_PATH: &str = "path";
pub const FIELD_PATHS: &str = "paths";
pub const FIELD_NAME: &str = "name";
pub const FIELD_BEFORE: &str = "before";
pub const FIELD_DATA: &str = "data";
pub const FIELD_QUIET: &str = "quiet";
pub const FIELD_HOST: &str = "host";
pub const FIELD_SESSION_ID: &str = "session_id";
pub const FIELD_ERROR: &str = "error";
pub const FIELD_COMMAND: &str = "command";

/// Default recursion bound for path resolution and subscription walks.
const MAX_PATH_DEPTH: usize = 64;

/// Binds the wire protocol to the shared tree: request messages become tree
/// operations, tree changes come back as update messages through the
/// subscription fanout. One instance per connected client.
pub struct StorageSession {
    home: Option<NodeId>,
    node_budget_used: usize,
    log: Logger,
}

impl StorageSession {
    pub fn new(log: Logger) -> StorageSession {
        StorageSession {
            home: None,
            node_budget_used: 0,
            log,
        }
    }

    fn home(&self) -> Result<NodeId> {
        self.home.ok_or(Error::BadObject)
    }

    /// Resolves a relative, wildcard-free path against the session subtree,
    /// creating missing interior nodes. Returns the parent node and the leaf
    /// segment name.
    fn resolve_parent<'p>(&mut self, ctx: &mut ServerCtx, path: &'p str) -> Result<(NodeId, &'p str)> {
        let (absolute, segments) = split_path(path)?;

        if absolute || segments.is_empty() || segments.len() > MAX_PATH_DEPTH {
            return Err(Error::BadArgument);
        }

        if segments.iter().any(|s| has_wildcards(s)) {
            return Err(Error::BadArgument);
        }

        let mut cursor = self.home()?;

        for segment in &segments[..segments.len() - 1] {
            cursor = match ctx.tree.node(cursor).child(segment) {
                Some(child) => child,
                None => {
                    self.charge_node(ctx)?;
                    ctx.put_node(cursor, segment, None)?
                }
            };
        }

        Ok((cursor, segments[segments.len() - 1]))
    }

    fn charge_node(&mut self, ctx: &ServerCtx) -> Result<()> {
        if self.node_budget_used >= ctx.session().params.max_nodes {
            return Err(Error::OutOfMemory);
        }

        self.node_budget_used += 1;
        Ok(())
    }

    /// Collects nodes matched by a pattern string: absolute patterns walk
    /// from the root, relative ones from the session subtree.
    fn match_pattern(&self, ctx: &ServerCtx, pattern: &str) -> Result<Vec<NodeId>> {
        let (absolute, segments) = split_path(pattern)?;
        let start = match absolute {
            true => ctx.tree.root(),
            false => self.home()?,
        };

        let compiled = segments
            .iter()
            .map(|s| SegmentPattern::compile(s))
            .collect::<Result<Vec<_>>>()?;

        let mut found = Vec::new();
        ctx.tree.find_nodes(start, &compiled, MAX_PATH_DEPTH, &mut found);

        Ok(found)
    }

    fn reply(&self, ctx: &mut ServerCtx, build: impl FnOnce(&mut Message)) {
        let reply = ctx.msg_pool.obtain_with(build);
        ctx.send_to(ctx.own_id, reply);
    }

    fn reply_error(&self, ctx: &mut ServerCtx, command: u32, err: Error) {
        logging::debug!(self.log, "rejecting request";
                        "command" => command, "error" => %err);

        self.reply(ctx, |m| {
            m.set_what(RESULT_ERROR);
            m.add_string(FIELD_ERROR, err.name()).expect("Reply field type drifted");
            m.add_u32(FIELD_COMMAND, command).expect("Reply field type drifted");
        });
    }

    fn handle_set_data(&mut self, ctx: &mut ServerCtx, msg: &Message) -> Result<()> {
        let items: Vec<(String, MessageRef)> = msg
            .iter()
            .filter_map(|(path, field)| match field {
                Field::Message(values) => values.first().map(|v| (path.to_owned(), v.clone())),
                _ => None,
            })
            .collect();

        if items.is_empty() {
            return Err(Error::BadArgument);
        }

        for (path, payload) in items {
            let (parent, leaf) = self.resolve_parent(ctx, &path)?;

            match ctx.tree.node(parent).child(leaf) {
                Some(existing) => ctx.set_node_data(existing, Some(payload)),
                None => {
                    self.charge_node(ctx)?;
                    ctx.put_node(parent, leaf, Some(payload))?;
                }
            }
        }

        Ok(())
    }

    fn handle_get_data(&mut self, ctx: &mut ServerCtx, msg: &Message) -> Result<()> {
        let patterns: Vec<String> = msg.get_strings(FIELD_PATHS)?.to_vec();

        let mut reply = Message::new(RESULT_DATA_ITEMS);

        for pattern in &patterns {
            for node in self.match_pattern(ctx, pattern)? {
                let path = ctx.tree.node_path(node);
                let payload = ctx
                    .tree
                    .node(node)
                    .payload()
                    .cloned()
                    .unwrap_or_else(|| MessageRef::detached(Message::new(0)));

                reply.add_message(&path, payload).expect("Reply field type drifted");
            }
        }

        let pooled = ctx.msg_pool.obtain_with(|slot| *slot = reply);
        ctx.send_to(ctx.own_id, pooled);

        Ok(())
    }

    fn handle_remove_data(&mut self, ctx: &mut ServerCtx, msg: &Message) -> Result<()> {
        let patterns: Vec<String> = msg.get_strings(FIELD_PATHS)?.to_vec();
        let home = self.home()?;

        for pattern in &patterns {
            // Removal is confined to the session's own subtree
            let (absolute, _) = split_path(pattern)?;
            if absolute {
                return Err(Error::AccessDenied);
            }

            let before = ctx.tree.len();

            for node in self.match_pattern(ctx, pattern)? {
                if node == home || !ctx.tree.contains(node) {
                    continue;
                }

                let (parent, name) = {
                    let n = ctx.tree.node(node);
                    (n.parent(), n.name().to_owned())
                };

                if let Some(parent) = parent {
                    // Wildcards may match already-removed subtree members
                    if ctx.remove_node_child(parent, &name).is_err() {
                        logging::debug!(self.log, "node already gone"; "name" => name);
                    }
                }
            }

            self.node_budget_used = self
                .node_budget_used
                .saturating_sub(before - ctx.tree.len());
        }

        Ok(())
    }

    fn handle_subscribe(&mut self, ctx: &mut ServerCtx, msg: &Message) -> Result<()> {
        let pattern = PathPattern::compile(msg.first_string(FIELD_PATH)?)?;
        let quiet = msg.first_bool(FIELD_QUIET).unwrap_or(false);
        let own = ctx.own_id;

        let mut matches = Vec::new();
        let mut compiled_segments = Vec::new();
        for depth in 0..pattern.segment_count() {
            compiled_segments.push(pattern.segment(depth).expect("Segment within count").clone());
        }
        ctx.tree.find_nodes(ctx.tree.root(), &compiled_segments, MAX_PATH_DEPTH, &mut matches);

        for &node in &matches {
            ctx.tree.increment_subscriber(node, own);
        }

        let subscription = Subscription {
            pattern,
            match_count: matches.len() as u64,
        };

        if !quiet {
            // Initial snapshot flows through the normal update machinery
            for &node in &matches {
                let path = ctx.tree.node_path(node);
                let payload = ctx
                    .tree
                    .node(node)
                    .payload()
                    .cloned()
                    .unwrap_or_else(|| MessageRef::detached(Message::new(0)));
                ctx.session_mut().pending.node_updated(&path, payload, None);
            }
        }

        ctx.session_mut().subscriptions.push(subscription);

        Ok(())
    }

    fn handle_unsubscribe(&mut self, ctx: &mut ServerCtx, msg: &Message) -> Result<()> {
        let path = msg.first_string(FIELD_PATH)?.to_owned();
        let own = ctx.own_id;

        let removed: Vec<Subscription> = {
            let session = ctx.session_mut();
            let (dropped, kept) = session
                .subscriptions
                .drain(..)
                .partition(|sub| sub.pattern.as_str() == path);
            session.subscriptions = kept;
            dropped
        };

        if removed.is_empty() {
            return Err(Error::DataNotFound);
        }

        // Reverse walk: release the per-node counters this pattern held
        for sub in removed {
            let mut compiled = Vec::new();
            for depth in 0..sub.pattern.segment_count() {
                compiled.push(sub.pattern.segment(depth).expect("Segment within count").clone());
            }

            let mut matches = Vec::new();
            ctx.tree.find_nodes(ctx.tree.root(), &compiled, MAX_PATH_DEPTH, &mut matches);

            for node in matches {
                ctx.tree.decrement_subscriber(node, own);
            }
        }

        Ok(())
    }

    fn handle_insert_ordered(&mut self, ctx: &mut ServerCtx, msg: &Message) -> Result<()> {
        let path = msg.first_string(FIELD_PATH)?.to_owned();
        let before = msg.first_string(FIELD_BEFORE).ok().map(str::to_owned);
        let name = msg.first_string(FIELD_NAME).ok().map(str::to_owned);
        let payloads: Vec<MessageRef> = msg.get_messages(FIELD_DATA)?.to_vec();

        let (parent, leaf) = self.resolve_parent(ctx, &path)?;
        let parent = match ctx.tree.node(parent).child(leaf) {
            Some(existing) => existing,
            None => {
                self.charge_node(ctx)?;
                ctx.put_node(parent, leaf, None)?
            }
        };

        for payload in payloads {
            self.charge_node(ctx)?;
            ctx.insert_ordered_node(parent, before.as_deref(), name.as_deref(), Some(payload))?;
        }

        Ok(())
    }

    fn handle_reorder_index(&mut self, ctx: &mut ServerCtx, msg: &Message) -> Result<()> {
        let path = msg.first_string(FIELD_PATH)?.to_owned();
        let name = msg.first_string(FIELD_NAME)?.to_owned();
        let before = msg.first_string(FIELD_BEFORE).ok().map(str::to_owned);

        let home = self.home()?;
        let parent = ctx
            .tree
            .find_first_matching_node(home, &path, MAX_PATH_DEPTH)?
            .ok_or(Error::DataNotFound)?;

        ctx.reorder_node(parent, &name, before.as_deref())
    }

    fn handle_get_parameters(&mut self, ctx: &mut ServerCtx) -> Result<()> {
        let drop_oldest = ctx.session_mut().gateway.policy_mut().drop_oldest;
        let (params, patterns) = {
            let session = ctx.session();
            let patterns: Vec<String> = session
                .subscriptions
                .iter()
                .map(|sub| sub.pattern.as_str().to_owned())
                .collect();
            (session.params, patterns)
        };

        let central = match params.can_kick {
            true => Some((*ctx.central).clone()),
            false => None,
        };

        self.reply(ctx, move |m| {
            m.set_what(RESULT_PARAMETERS);
            m.add_bool("include_old", params.include_old_payload)
                .expect("Reply field type drifted");
            m.add_u32("max_update_items_per_second", params.max_update_items_per_second)
                .expect("Reply field type drifted");
            m.add_u64("max_nodes", params.max_nodes as u64)
                .expect("Reply field type drifted");
            m.add_bool("drop_oldest", drop_oldest).expect("Reply field type drifted");
            for pattern in &patterns {
                m.add_string("subscriptions", pattern).expect("Reply field type drifted");
            }
            if let Some(central) = central {
                m.add_message_value("central", central).expect("Reply field type drifted");
            }
        });

        Ok(())
    }

    fn handle_set_parameters(&mut self, ctx: &mut ServerCtx, msg: &Message) -> Result<()> {
        if let Ok(include_old) = msg.first_bool("include_old") {
            ctx.session_mut().params.include_old_payload = include_old;
        }

        if let Ok(rate) = msg.first_u32("max_update_items_per_second") {
            let session = ctx.session_mut();
            session.params.max_update_items_per_second = rate;
            session.update_tokens = rate;
        }

        if let Ok(drop_oldest) = msg.first_bool("drop_oldest") {
            ctx.session_mut().gateway.policy_mut().drop_oldest = drop_oldest;
        }

        Ok(())
    }

    fn handle_kick(&mut self, ctx: &mut ServerCtx, msg: &Message) -> Result<()> {
        if !ctx.session().params.can_kick {
            return Err(Error::AccessDenied);
        }

        let patterns: Vec<PathPattern> = msg
            .get_strings(FIELD_PATHS)?
            .iter()
            .map(|p| PathPattern::compile(p))
            .collect::<Result<Vec<_>>>()?;

        let victims: Vec<SessionId> = ctx
            .sessions
            .iter()
            .filter(|(_, session)| {
                let home = session.home_segments();
                let segments = [home[0].as_str(), home[1].as_str()];
                patterns.iter().any(|p| p.matches(&segments))
            })
            .map(|(&sid, _)| sid)
            .collect();

        for victim in victims {
            logging::info!(self.log, "kicking session"; "victim" => victim);
            ctx.kick(victim);
        }

        Ok(())
    }

    fn handle_ping(&mut self, ctx: &mut ServerCtx, msg: &Message) -> Result<()> {
        let mut pong = msg.clone();
        pong.set_what(RESULT_PONG);

        let pooled = ctx.msg_pool.obtain_with(|slot| *slot = pong);
        ctx.send_to(ctx.own_id, pooled);

        Ok(())
    }

    /// Messages with an unrecognised what-code are reflected to every other
    /// session watching this session's subtree; with no watchers they drop.
    fn reflect_unknown(&mut self, ctx: &mut ServerCtx, msg: MessageRef) {
        let (host, id_string) = {
            let session = ctx.session();
            (session.host.clone(), session.id_string())
        };

        let own = ctx.own_id;
        let targets: Vec<SessionId> = ctx
            .sessions
            .iter()
            .filter(|(&sid, session)| {
                sid != own
                    && session.subscriptions.iter().any(|sub| {
                        let first = sub.pattern.segment(0);
                        let second = sub.pattern.segment(1);
                        first.map_or(false, |s| s.matches(&host))
                            && second.map_or(false, |s| s.matches(&id_string))
                    })
            })
            .map(|(&sid, _)| sid)
            .collect();

        for target in targets {
            ctx.send_to(target, msg.clone());
        }
    }
}

impl SessionBehavior for StorageSession {
    fn attached(&mut self, ctx: &mut ServerCtx) -> Result<()> {
        let (host, id_string) = {
            let session = ctx.session();
            (session.host.clone(), session.id_string())
        };

        let root = ctx.tree.root();
        let host_node = match ctx.tree.node(root).child(&host) {
            Some(existing) => existing,
            None => ctx.put_node(root, &host, None)?,
        };

        let home = ctx.put_node(host_node, &id_string, None)?;
        self.home = Some(home);

        logging::debug!(self.log, "session subtree created";
                        "path" => ctx.tree.node_path(home));

        let home_path = ctx.tree.node_path(home);
        let own = ctx.own_id;
        self.reply(ctx, |m| {
            m.set_what(RESULT_SESSION_INFO);
            m.add_string(FIELD_HOST, &host).expect("Reply field type drifted");
            m.add_string(FIELD_SESSION_ID, &id_string).expect("Reply field type drifted");
            m.add_string(FIELD_PATH, &home_path).expect("Reply field type drifted");
            m.add_u32("id", own).expect("Reply field type drifted");
        });

        Ok(())
    }

    fn detached(&mut self, ctx: &mut ServerCtx) {
        if let Some(home) = self.home.take() {
            if !ctx.tree.contains(home) {
                return;
            }

            let host_node = ctx.tree.node(home).parent();

            ctx.remove_node_subtree(home);

            // Drop the host vertex once its last session leaves
            if let Some(host_node) = host_node {
                if ctx.tree.contains(host_node) && ctx.tree.node(host_node).child_count() == 0 {
                    ctx.remove_node_subtree(host_node);
                }
            }
        }
    }

    fn message_received(&mut self, ctx: &mut ServerCtx, msg: MessageRef) -> Result<()> {
        let what = msg.what();

        let result = match what {
            CMD_PING => self.handle_ping(ctx, &msg),
            CMD_SET_DATA => self.handle_set_data(ctx, &msg),
            CMD_GET_DATA => self.handle_get_data(ctx, &msg),
            CMD_REMOVE_DATA => self.handle_remove_data(ctx, &msg),
            CMD_SUBSCRIBE => self.handle_subscribe(ctx, &msg),
            CMD_UNSUBSCRIBE => self.handle_unsubscribe(ctx, &msg),
            CMD_INSERT_ORDERED => self.handle_insert_ordered(ctx, &msg),
            CMD_REORDER_INDEX => self.handle_reorder_index(ctx, &msg),
            CMD_GET_PARAMETERS => self.handle_get_parameters(ctx),
            CMD_SET_PARAMETERS => self.handle_set_parameters(ctx, &msg),
            CMD_KICK => self.handle_kick(ctx, &msg),
            _ => {
                self.reflect_unknown(ctx, msg);
                return Ok(());
            }
        };

        // Recoverable protocol errors turn into an error reply; the session
        // lives on
        if let Err(err) = result {
            self.reply_error(ctx, what, err);
        }

        Ok(())
    }
}

/// Manufactures a `StorageSession` per accepted connection, refusing banned
/// hosts and granting kick privilege by hostmask.
pub struct StorageFactory {
    pub params: SessionParams,
    pub kick_masks: Vec<SegmentPattern>,
    pub ban_masks: Vec<SegmentPattern>,
}

impl StorageFactory {
    pub fn new(params: SessionParams) -> StorageFactory {
        StorageFactory {
            params,
            kick_masks: Vec::new(),
            ban_masks: Vec::new(),
        }
    }
}

impl SessionFactory for StorageFactory {
    fn accepts(&self, peer: &SocketAddr) -> bool {
        let host = peer.ip().to_string();

        !self.ban_masks.iter().any(|mask| mask.matches(&host))
    }

    fn create(&mut self, peer: &SocketAddr, log: &Logger) -> Result<Box<dyn SessionBehavior>> {
        let session_log = log.new(logging::o!("peer" => peer.to_string()));

        Ok(Box::new(StorageSession::new(session_log)))
    }

    fn initial_params(&self, peer: &SocketAddr) -> SessionParams {
        let host = peer.ip().to_string();
        let mut params = self.params;

        params.can_kick = self.kick_masks.iter().any(|mask| mask.matches(&host));
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{Gateway, GatewayPolicy, MessageGateway};
    use crate::pool::ObjectPool;
    use crate::session::{ConnectPhase, Session, UpdateBuffer, UPDATE_INDEX_FIELD, UPDATE_REMOVED_FIELD};
    use crate::tree::NodeTree;
    use indexmap::IndexMap;

    /// Drives storage sessions against a real tree and session table, the
    /// way the event loop would, minus the sockets.
    struct Harness {
        tree: NodeTree,
        sessions: IndexMap<SessionId, Session>,
        behaviors: IndexMap<SessionId, StorageSession>,
        central: Message,
        pool: ObjectPool<Message>,
        kills: Vec<SessionId>,
        log: Logger,
    }

    impl Harness {
        fn new() -> Harness {
            Harness {
                tree: NodeTree::new(),
                sessions: IndexMap::new(),
                behaviors: IndexMap::new(),
                central: Message::new(0),
                pool: ObjectPool::new(),
                kills: Vec::new(),
                log: logging::discard(),
            }
        }

        fn ctx(&mut self, own: SessionId) -> ServerCtx {
            ServerCtx {
                own_id: own,
                now: 0,
                tree: &mut self.tree,
                sessions: &mut self.sessions,
                central: &mut self.central,
                msg_pool: &self.pool,
                kills: &mut self.kills,
                log: &self.log,
            }
        }

        fn add_session(&mut self, id: SessionId, host: &str) {
            let session = Session {
                id,
                token: 2000 + id as usize,
                stream: None,
                gateway: Box::new(MessageGateway::new(GatewayPolicy::default(), self.pool.clone())),
                behavior: None,
                params: SessionParams::default(),
                subscriptions: Vec::new(),
                pending: UpdateBuffer::default(),
                connect: ConnectPhase::Ready,
                kill: false,
                host: host.to_owned(),
                update_tokens: 0,
                last_refill: 0,
                log: logging::discard(),
            };
            self.sessions.insert(id, session);

            let mut behavior = StorageSession::new(logging::discard());
            {
                let mut ctx = self.ctx(id);
                behavior.attached(&mut ctx).unwrap();
            }
            self.behaviors.insert(id, behavior);

            // Discard the greeting so tests start from a clean queue
            self.take_outgoing(id);
        }

        fn remove_session(&mut self, id: SessionId) {
            self.sessions.swap_remove(&id).unwrap();
            let mut behavior = self.behaviors.swap_remove(&id).unwrap();
            let mut ctx = self.ctx(id);
            behavior.detached(&mut ctx);
        }

        fn deliver(&mut self, id: SessionId, msg: Message) {
            let mut behavior = self.behaviors.swap_remove(&id).unwrap();
            let pooled = self.pool.obtain_with(|slot| *slot = msg);
            {
                let mut ctx = self.ctx(id);
                behavior.message_received(&mut ctx, pooled).unwrap();
            }
            self.behaviors.insert(id, behavior);
        }

        /// Pending subscription updates for a session, drained as the flush
        /// pass would.
        fn drain_update(&mut self, id: SessionId) -> Option<Message> {
            self.sessions
                .get_mut(&id)
                .unwrap()
                .pending
                .drain_into(usize::max_value(), RESULT_DATA_ITEMS)
        }

        /// Everything queued on a session's gateway, decoded back.
        fn take_outgoing(&mut self, id: SessionId) -> Vec<MessageRef> {
            let mut bytes = Vec::new();
            {
                let session = self.sessions.get_mut(&id).unwrap();
                while session.gateway.has_output() {
                    session.gateway.flush(&mut bytes).unwrap();
                }
            }

            let mut rx = MessageGateway::new(GatewayPolicy::default(), self.pool.clone());
            rx.push_incoming(&bytes);

            let mut out = Vec::new();
            while let Ok(msg) = rx.next_message() {
                out.push(msg);
            }
            out
        }

        fn home_path(&self, id: SessionId) -> String {
            let session = &self.sessions[&id];
            format!("/{}/{}", session.host, session.id_string())
        }
    }

    fn payload(n: i32) -> Message {
        let mut msg = Message::new(100);
        msg.add_i32("n", n).unwrap();
        msg
    }

    fn set_data_msg(path: &str, n: i32) -> Message {
        let mut msg = Message::new(CMD_SET_DATA);
        msg.add_message_value(path, payload(n)).unwrap();
        msg
    }

    fn subscribe_msg(pattern: &str, quiet: bool) -> Message {
        let mut msg = Message::new(CMD_SUBSCRIBE);
        msg.add_string(FIELD_PATH, pattern).unwrap();
        msg.add_bool(FIELD_QUIET, quiet).unwrap();
        msg
    }

    #[test]
    fn test_attach_creates_home_and_greets() {
        let mut h = Harness::new();

        // add_session drains the greeting; attach a second session and
        // inspect its greeting directly
        h.add_session(1, "10.0.0.1");

        let session = Session {
            id: 2,
            token: 2002,
            stream: None,
            gateway: Box::new(MessageGateway::new(GatewayPolicy::default(), h.pool.clone())),
            behavior: None,
            params: SessionParams::default(),
            subscriptions: Vec::new(),
            pending: UpdateBuffer::default(),
            connect: ConnectPhase::Ready,
            kill: false,
            host: "10.0.0.2".to_owned(),
            update_tokens: 0,
            last_refill: 0,
            log: logging::discard(),
        };
        h.sessions.insert(2, session);

        let mut behavior = StorageSession::new(logging::discard());
        {
            let mut ctx = h.ctx(2);
            behavior.attached(&mut ctx).unwrap();
        }
        h.behaviors.insert(2, behavior);

        let greetings = h.take_outgoing(2);
        assert_eq!(greetings.len(), 1);
        assert_eq!(greetings[0].what(), RESULT_SESSION_INFO);
        assert_eq!(greetings[0].first_string(FIELD_HOST).unwrap(), "10.0.0.2");
        assert_eq!(greetings[0].first_string(FIELD_SESSION_ID).unwrap(), "0000000002");
        assert_eq!(greetings[0].first_string(FIELD_PATH).unwrap(), "/10.0.0.2/0000000002");

        let home = h
            .tree
            .find_first_matching_node(h.tree.root(), "/10.0.0.2/0000000002", 8)
            .unwrap();
        assert!(home.is_some());
    }

    #[test]
    fn test_subscription_fanout_lifecycle() {
        let mut h = Harness::new();
        h.add_session(1, "hostA");
        h.add_session(2, "hostB");

        h.deliver(1, subscribe_msg("/*/*/data/*", false));
        assert!(h.drain_update(1).is_none());

        // Creating a matching node produces exactly one update for the match
        h.deliver(2, set_data_msg("data/x", 1));

        let update = h.drain_update(1).expect("Subscriber missed the new node");
        let path = format!("{}/data/x", h.home_path(2));

        assert_eq!(update.field_count(), 1);
        assert_eq!(update.get_messages(&path).unwrap()[0].first_i32("n").unwrap(), 1);

        // The interior "data" node does not match the 4-segment pattern
        assert!(update.get_messages(&format!("{}/data", h.home_path(2))).is_err());

        // Payload change, with old payload once requested
        h.sessions.get_mut(&1).unwrap().params.include_old_payload = true;
        h.deliver(2, set_data_msg("data/x", 2));

        let update = h.drain_update(1).unwrap();
        let items = update.get_messages(&path).unwrap();
        assert_eq!(items[0].first_i32("n").unwrap(), 2);
        assert_eq!(items[1].first_i32("n").unwrap(), 1);

        // Removal of the parent reports the matching leaf as removed
        let mut remove = Message::new(CMD_REMOVE_DATA);
        remove.add_string(FIELD_PATHS, "data").unwrap();
        h.deliver(2, remove);

        let update = h.drain_update(1).unwrap();
        assert!(update
            .get_strings(UPDATE_REMOVED_FIELD)
            .unwrap()
            .contains(&path));

        // After unsubscribing, further changes are silent
        let mut unsub = Message::new(CMD_UNSUBSCRIBE);
        unsub.add_string(FIELD_PATH, "/*/*/data/*").unwrap();
        h.deliver(1, unsub);

        h.deliver(2, set_data_msg("data/y", 3));
        assert!(h.drain_update(1).is_none());
    }

    #[test]
    fn test_subscribe_snapshot_and_quiet() {
        let mut h = Harness::new();
        h.add_session(1, "hostA");
        h.add_session(2, "hostB");

        h.deliver(2, set_data_msg("data/x", 1));
        h.deliver(2, set_data_msg("data/y", 2));

        // Normal subscribe delivers the current matches up front
        h.deliver(1, subscribe_msg("/*/*/data/*", false));
        let snapshot = h.drain_update(1).unwrap();
        assert_eq!(snapshot.field_count(), 2);

        // Quiet subscribe suppresses the snapshot but not later updates
        h.add_session(3, "hostC");
        h.deliver(3, subscribe_msg("/*/*/data/*", true));
        assert!(h.drain_update(3).is_none());

        h.deliver(2, set_data_msg("data/x", 5));
        assert!(h.drain_update(3).is_some());
    }

    #[test]
    fn test_get_data_with_wildcards() {
        let mut h = Harness::new();
        h.add_session(1, "hostA");
        h.add_session(2, "hostB");

        h.deliver(2, set_data_msg("data/x", 7));

        let mut get = Message::new(CMD_GET_DATA);
        get.add_string(FIELD_PATHS, "/*/*/data/x").unwrap();
        h.deliver(1, get);

        let replies = h.take_outgoing(1);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].what(), RESULT_DATA_ITEMS);

        let path = format!("{}/data/x", h.home_path(2));
        assert_eq!(
            replies[0].get_messages(&path).unwrap()[0].first_i32("n").unwrap(),
            7
        );
    }

    #[test]
    fn test_set_data_empty_payload_creates_node() {
        let mut h = Harness::new();
        h.add_session(1, "hostA");

        let mut msg = Message::new(CMD_SET_DATA);
        msg.add_message_value("empty", Message::new(0)).unwrap();
        h.deliver(1, msg);

        let node = h
            .tree
            .find_first_matching_node(h.tree.root(), &format!("{}/empty", h.home_path(1)), 8)
            .unwrap()
            .expect("Empty payload still creates the node");
        assert_eq!(h.tree.node(node).payload().unwrap().field_count(), 0);
    }

    #[test]
    fn test_insert_ordered_via_wire_uses_auto_names() {
        let mut h = Harness::new();
        h.add_session(1, "hostA");
        h.add_session(2, "hostB");

        h.deliver(2, subscribe_msg("/hostA/*/list", false));
        h.drain_update(2);

        let mut insert = Message::new(CMD_INSERT_ORDERED);
        insert.add_string(FIELD_PATH, "list").unwrap();
        insert.add_message_value(FIELD_DATA, payload(1)).unwrap();
        insert.add_message_value(FIELD_DATA, payload(2)).unwrap();
        h.deliver(1, insert);

        let list = h
            .tree
            .find_first_matching_node(h.tree.root(), &format!("{}/list", h.home_path(1)), 8)
            .unwrap()
            .unwrap();

        let order: Vec<String> = h
            .tree
            .node(list)
            .index()
            .unwrap()
            .iter()
            .map(|&id| h.tree.node(id).name().to_owned())
            .collect();
        assert_eq!(order, vec!["I0", "I1"]);

        // The watcher of /hostA/*/list saw the list node appear
        let update = h.drain_update(2).unwrap();
        assert!(update.get_messages(&format!("{}/list", h.home_path(1))).is_ok());
    }

    #[test]
    fn test_reorder_index_notifies_subscribers() {
        let mut h = Harness::new();
        h.add_session(1, "hostA");
        h.add_session(2, "hostB");

        for _ in 0..3 {
            let mut insert = Message::new(CMD_INSERT_ORDERED);
            insert.add_string(FIELD_PATH, "list").unwrap();
            insert.add_message_value(FIELD_DATA, payload(0)).unwrap();
            h.deliver(1, insert);
        }

        h.deliver(2, subscribe_msg("/hostA/*/list", true));

        let mut reorder = Message::new(CMD_REORDER_INDEX);
        reorder.add_string(FIELD_PATH, "list").unwrap();
        reorder.add_string(FIELD_NAME, "I2").unwrap();
        reorder.add_string(FIELD_BEFORE, "I0").unwrap();
        h.deliver(1, reorder);

        let update = h.drain_update(2).unwrap();
        let index = update.first_message(UPDATE_INDEX_FIELD).unwrap();
        let ops = index.get_strings(&format!("{}/list", h.home_path(1))).unwrap();

        assert_eq!(ops, &["r2:I2".to_owned(), "i0:I2".to_owned()]);
    }

    #[test]
    fn test_detach_destroys_subtree_and_notifies() {
        let mut h = Harness::new();
        h.add_session(1, "hostA");
        h.add_session(2, "hostB");

        h.deliver(2, set_data_msg("data/x", 1));
        h.deliver(1, subscribe_msg("/*/*/data/*", true));

        h.remove_session(2);

        let update = h.drain_update(1).unwrap();
        assert!(update.get_strings(UPDATE_REMOVED_FIELD).unwrap().len() >= 1);

        // The whole host vertex is gone once its only session left
        assert!(h
            .tree
            .find_first_matching_node(h.tree.root(), "/hostB", 8)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_node_budget_enforced() {
        let mut h = Harness::new();
        h.add_session(1, "hostA");
        h.sessions.get_mut(&1).unwrap().params.max_nodes = 2;

        h.deliver(1, set_data_msg("a/b", 1));

        // Two nodes used up the budget; the next create is refused
        h.deliver(1, set_data_msg("c", 1));

        let replies = h.take_outgoing(1);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].what(), RESULT_ERROR);
        assert_eq!(replies[0].first_string(FIELD_ERROR).unwrap(), "OutOfMemory");

        // Removal frees budget
        let mut remove = Message::new(CMD_REMOVE_DATA);
        remove.add_string(FIELD_PATHS, "a").unwrap();
        h.deliver(1, remove);
        h.deliver(1, set_data_msg("c", 1));

        assert!(h.take_outgoing(1).is_empty());
    }

    #[test]
    fn test_ping_echoes_fields() {
        let mut h = Harness::new();
        h.add_session(1, "hostA");

        let mut ping = Message::new(CMD_PING);
        ping.add_string("tag", "marco").unwrap();
        h.deliver(1, ping);

        let replies = h.take_outgoing(1);
        assert_eq!(replies[0].what(), RESULT_PONG);
        assert_eq!(replies[0].first_string("tag").unwrap(), "marco");
    }

    #[test]
    fn test_kick_requires_privilege() {
        let mut h = Harness::new();
        h.add_session(1, "hostA");
        h.add_session(2, "hostB");

        let mut kick = Message::new(CMD_KICK);
        kick.add_string(FIELD_PATHS, "/hostB/*").unwrap();
        h.deliver(1, kick.clone());

        let replies = h.take_outgoing(1);
        assert_eq!(replies[0].what(), RESULT_ERROR);
        assert_eq!(replies[0].first_string(FIELD_ERROR).unwrap(), "AccessDenied");
        assert!(h.kills.is_empty());

        h.sessions.get_mut(&1).unwrap().params.can_kick = true;
        h.deliver(1, kick);

        assert_eq!(h.kills, vec![2]);
    }

    #[test]
    fn test_unknown_what_reflects_to_watchers() {
        let mut h = Harness::new();
        h.add_session(1, "hostA");
        h.add_session(2, "hostB");
        h.add_session(3, "hostC");

        // Session 1 watches session 2's subtree, session 3 watches nothing
        h.deliver(1, subscribe_msg("/hostB/*/chat/*", true));

        let mut custom = Message::new(fourcc(*b"chat"));
        custom.add_string("text", "hello").unwrap();
        h.deliver(2, custom);

        let got = h.take_outgoing(1);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].what(), fourcc(*b"chat"));
        assert_eq!(got[0].first_string("text").unwrap(), "hello");

        assert!(h.take_outgoing(3).is_empty());
    }

    #[test]
    fn test_parameters_roundtrip() {
        let mut h = Harness::new();
        h.add_session(1, "hostA");

        let mut set = Message::new(CMD_SET_PARAMETERS);
        set.add_bool("include_old", true).unwrap();
        set.add_u32("max_update_items_per_second", 50).unwrap();
        set.add_bool("drop_oldest", true).unwrap();
        h.deliver(1, set);

        h.deliver(1, Message::new(CMD_GET_PARAMETERS));

        let replies = h.take_outgoing(1);
        assert_eq!(replies[0].what(), RESULT_PARAMETERS);
        assert_eq!(replies[0].first_bool("include_old").unwrap(), true);
        assert_eq!(replies[0].first_u32("max_update_items_per_second").unwrap(), 50);
        assert_eq!(replies[0].first_bool("drop_oldest").unwrap(), true);
    }

    #[test]
    fn test_malformed_requests_get_error_replies() {
        let mut h = Harness::new();
        h.add_session(1, "hostA");

        // Absolute set path is rejected
        let mut msg = Message::new(CMD_SET_DATA);
        msg.add_message_value("/absolute/path", Message::new(0)).unwrap();
        h.deliver(1, msg);

        // Wildcards cannot be set either
        h.deliver(1, set_data_msg("a*/b", 1));

        // Unsubscribe without a matching pattern
        let mut unsub = Message::new(CMD_UNSUBSCRIBE);
        unsub.add_string(FIELD_PATH, "/never/subscribed").unwrap();
        h.deliver(1, unsub);

        let replies = h.take_outgoing(1);
        let errors: Vec<&str> = replies
            .iter()
            .map(|r| {
                assert_eq!(r.what(), RESULT_ERROR);
                r.first_string(FIELD_ERROR).unwrap()
            })
            .collect();

        assert_eq!(errors, vec!["BadArgument", "BadArgument", "DataNotFound"]);
    }
}
