use crate::gateway::{Gateway, GatewayPolicy, MessageGateway};
use crate::message::{Message, MessageRef};
use crate::pool::ObjectPool;
use crate::session::{ConnectPhase, Session, SessionBehavior, SessionFactory, SessionParams, UpdateBuffer};
use crate::storage::RESULT_DATA_ITEMS;
use crate::support::{Error, ErrorUtils, Result, SessionId};
use crate::tree::{IndexOp, NodeId, NodeTree, TreeSink};
use fiber::logging::{self, Logger};
use fiber::time::{timestamp_secs, MonoClock};
use hashbrown::HashMap;
use indexmap::IndexMap;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Poll, PollOpt, Ready, Token};
use std::net::SocketAddr;
use std::time::Duration;

/// What-code of the per-server shared state message.
pub const CENTRAL_STATE: u32 = crate::message::fourcc(*b"stat");

/// Tokens below this bound address accept factories; sessions live above it.
const FACTORY_TOKEN_LIMIT: usize = 1024;

/// Token-bucket refill interval for the per-session update rate limit.
const REFILL_INTERVAL_MICROS: u64 = 1_000_000;

/// Subscription fanout. Installed as the tree's event sink for every mutation
/// made through a `ServerCtx`; distributes change records into the pending
/// update buffers of watching sessions.
pub struct Fanout<'a> {
    sessions: &'a mut IndexMap<SessionId, Session>,
    // Subscriber-counter increments deferred until the tree is mutable again
    marks: Vec<(NodeId, SessionId)>,
}

impl<'a> Fanout<'a> {
    pub fn new(sessions: &'a mut IndexMap<SessionId, Session>) -> Fanout<'a> {
        Fanout {
            sessions,
            marks: Vec::new(),
        }
    }

    /// Applies the subscriber registrations recorded for freshly created
    /// nodes.
    pub fn finish(self, tree: &mut NodeTree) {
        for (node, session) in self.marks {
            if tree.contains(node) {
                tree.increment_subscriber(node, session);
            }
        }
    }

    fn empty_payload() -> MessageRef {
        MessageRef::detached(Message::new(0))
    }
}

impl TreeSink for Fanout<'_> {
    fn node_created(&mut self, tree: &NodeTree, node: NodeId) {
        let segments = tree.path_segments(node);
        let path = tree.node_path(node);
        let payload = tree
            .node(node)
            .payload()
            .cloned()
            .unwrap_or_else(Self::empty_payload);

        for (&sid, session) in self.sessions.iter_mut() {
            let mut matched = false;

            for sub in session.subscriptions.iter_mut() {
                if sub.pattern.matches(&segments) {
                    sub.match_count += 1;
                    self.marks.push((node, sid));
                    matched = true;
                }
            }

            if matched {
                session.pending.node_updated(&path, payload.clone(), None);
            }
        }
    }

    fn node_changed(&mut self, tree: &NodeTree, node: NodeId, old_payload: Option<&MessageRef>) {
        let path = tree.node_path(node);
        let payload = tree
            .node(node)
            .payload()
            .cloned()
            .unwrap_or_else(Self::empty_payload);

        for (sid, _) in tree.node(node).subscribers() {
            if let Some(session) = self.sessions.get_mut(&sid) {
                let old = match session.params.include_old_payload {
                    true => old_payload.cloned(),
                    false => None,
                };
                session.pending.node_updated(&path, payload.clone(), old);
            }
        }
    }

    fn node_removed(&mut self, tree: &NodeTree, node: NodeId) {
        let path = tree.node_path(node);
        let segments = tree.path_segments(node);

        for (sid, _) in tree.node(node).subscribers() {
            if let Some(session) = self.sessions.get_mut(&sid) {
                session.pending.node_removed(&path);
            }
        }

        for (_, session) in self.sessions.iter_mut() {
            for sub in session.subscriptions.iter_mut() {
                if sub.match_count > 0 && sub.pattern.matches(&segments) {
                    sub.match_count -= 1;
                }
            }
        }
    }

    fn index_changed(&mut self, tree: &NodeTree, node: NodeId, op: IndexOp, pos: usize, child: &str) {
        let path = tree.node_path(node);
        let tag = match op {
            IndexOp::Inserted => 'i',
            IndexOp::Removed => 'r',
        };

        for (sid, _) in tree.node(node).subscribers() {
            if let Some(session) = self.sessions.get_mut(&sid) {
                session.pending.index_changed(&path, format!("{}{}:{}", tag, pos, child));
            }
        }
    }
}

/// Everything a session behavior may touch during a callback. Tree mutations
/// go through the `*_node` wrappers so subscription fanout runs on each one.
pub struct ServerCtx<'a> {
    pub own_id: SessionId,
    pub now: u64,
    pub tree: &'a mut NodeTree,
    pub sessions: &'a mut IndexMap<SessionId, Session>,
    pub central: &'a mut Message,
    pub msg_pool: &'a ObjectPool<Message>,
    pub kills: &'a mut Vec<SessionId>,
    pub log: &'a Logger,
}

impl ServerCtx<'_> {
    pub fn session(&self) -> &Session {
        self.sessions.get(&self.own_id).expect("Own session missing from table")
    }

    pub fn session_mut(&mut self) -> &mut Session {
        self.sessions
            .get_mut(&self.own_id)
            .expect("Own session missing from table")
    }

    pub fn put_node(&mut self, parent: NodeId, name: &str, payload: Option<MessageRef>) -> Result<NodeId> {
        let mut fanout = Fanout::new(self.sessions);
        let result = self.tree.put_child(parent, name, payload, &mut fanout);
        fanout.finish(self.tree);
        result
    }

    pub fn set_node_data(&mut self, node: NodeId, payload: Option<MessageRef>) {
        let mut fanout = Fanout::new(self.sessions);
        self.tree.set_data(node, payload, &mut fanout);
        fanout.finish(self.tree);
    }

    pub fn remove_node_child(&mut self, parent: NodeId, name: &str) -> Result<()> {
        let mut fanout = Fanout::new(self.sessions);
        let result = self.tree.remove_child(parent, name, &mut fanout);
        fanout.finish(self.tree);
        result
    }

    pub fn remove_node_subtree(&mut self, node: NodeId) {
        let mut fanout = Fanout::new(self.sessions);
        self.tree.remove_subtree(node, &mut fanout);
        fanout.finish(self.tree);
    }

    pub fn insert_ordered_node(
        &mut self,
        parent: NodeId,
        before: Option<&str>,
        name: Option<&str>,
        payload: Option<MessageRef>,
    ) -> Result<NodeId> {
        let mut fanout = Fanout::new(self.sessions);
        let result = self.tree.insert_ordered_child(parent, before, name, payload, &mut fanout);
        fanout.finish(self.tree);
        result
    }

    pub fn reorder_node(&mut self, parent: NodeId, name: &str, before: Option<&str>) -> Result<()> {
        let mut fanout = Fanout::new(self.sessions);
        let result = self.tree.reorder_child(parent, name, before, &mut fanout);
        fanout.finish(self.tree);
        result
    }

    /// Queues a message on a session's gateway; overflow marks the session
    /// for disconnect.
    pub fn send_to(&mut self, target: SessionId, msg: MessageRef) {
        let log = self.log;

        if let Some(session) = self.sessions.get_mut(&target) {
            if session.gateway.enqueue(msg).has_failed() {
                logging::warn!(log, "outgoing queue overrun, disconnecting";
                               "session_id" => target);
                session.kill = true;
                self.kills.push(target);
            }
        }
    }

    /// Schedules a session for removal after the current callback.
    pub fn kick(&mut self, target: SessionId) {
        self.kills.push(target);
    }
}

struct FactoryEntry {
    listener: TcpListener,
    factory: Box<dyn SessionFactory>,
    token: usize,
}

/// The message-reflection server: a single-threaded readiness loop over the
/// listen sockets, the session table and the pulse schedule. Several
/// instances may coexist in one process; nothing here is global.
pub struct ReflectServer {
    log: Logger,
    poll: Poll,
    events: Events,
    clock: MonoClock,
    tree: NodeTree,
    sessions: IndexMap<SessionId, Session>,
    session_tokens: HashMap<usize, SessionId>,
    factories: IndexMap<SocketAddr, FactoryEntry>,
    next_session_id: SessionId,
    next_session_token: usize,
    next_factory_token: usize,
    central: Message,
    msg_pool: ObjectPool<Message>,
    pub default_policy: GatewayPolicy,
    kills: Vec<SessionId>,
    shutdown: bool,
}

impl ReflectServer {
    pub fn new(log: Logger) -> Result<ReflectServer> {
        let mut central = Message::new(CENTRAL_STATE);
        central
            .add_u64("start_time", timestamp_secs())
            .expect("Fresh message rejected a field");

        Ok(ReflectServer {
            log,
            poll: Poll::new()?,
            events: Events::with_capacity(1024),
            clock: MonoClock::new(),
            tree: NodeTree::new(),
            sessions: IndexMap::new(),
            session_tokens: HashMap::new(),
            factories: IndexMap::new(),
            next_session_id: 1,
            next_session_token: FACTORY_TOKEN_LIMIT,
            next_factory_token: 0,
            central,
            msg_pool: ObjectPool::new(),
            default_policy: GatewayPolicy::default(),
            kills: Vec::new(),
            shutdown: false,
        })
    }

    #[inline]
    pub fn tree(&self) -> &NodeTree {
        &self.tree
    }

    #[inline]
    pub fn message_pool(&self) -> &ObjectPool<Message> {
        &self.msg_pool
    }

    #[inline]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    #[inline]
    pub fn session_ids(&self) -> impl Iterator<Item = SessionId> + '_ {
        self.sessions.keys().copied()
    }

    pub fn request_shutdown(&mut self) {
        self.shutdown = true;
    }

    /// Binds a listener and installs the factory that manufactures a session
    /// per accepted connection. Returns the actual bound address.
    pub fn put_accept_factory(
        &mut self,
        addr: SocketAddr,
        factory: Box<dyn SessionFactory>,
    ) -> Result<SocketAddr> {
        if self.next_factory_token >= FACTORY_TOKEN_LIMIT {
            return Err(Error::OutOfMemory);
        }

        let listener = TcpListener::bind(&addr)?;
        let local = listener.local_addr()?;
        let token = self.next_factory_token;
        self.next_factory_token += 1;

        self.poll
            .register(&listener, Token(token), Ready::readable(), PollOpt::edge())?;

        logging::info!(self.log, "listening"; "address" => %local);

        self.factories.insert(
            local,
            FactoryEntry {
                listener,
                factory,
                token,
            },
        );

        Ok(local)
    }

    pub fn remove_accept_factory(&mut self, addr: &SocketAddr) -> Result<()> {
        let entry = self.factories.swap_remove(addr).ok_or(Error::DataNotFound)?;

        self.poll.deregister(&entry.listener)?;

        Ok(())
    }

    /// Installs a session over an already connected stream.
    pub fn add_new_session(
        &mut self,
        stream: TcpStream,
        behavior: Box<dyn SessionBehavior>,
        params: SessionParams,
    ) -> Result<SessionId> {
        let host = stream
            .peer_addr()
            .map(|peer| peer.ip().to_string())
            .unwrap_or_else(|_| "unknown".to_owned());
        let gateway = Box::new(MessageGateway::new(self.default_policy, self.msg_pool.clone()));

        self.install_session(stream, behavior, gateway, params, ConnectPhase::Ready, host)
    }

    /// Starts a non-blocking outbound connection. The behavior's
    /// `async_connect_completed` runs before any I/O; a stuck connect is
    /// aborted after `max_connect_micros`.
    pub fn add_new_connect_session(
        &mut self,
        addr: &SocketAddr,
        behavior: Box<dyn SessionBehavior>,
        params: SessionParams,
        max_connect_micros: Option<u64>,
    ) -> Result<SessionId> {
        let stream = TcpStream::connect(addr)?;
        let deadline = max_connect_micros.map(|period| self.clock.now_micros() + period);
        let gateway = Box::new(MessageGateway::new(self.default_policy, self.msg_pool.clone()));

        self.install_session(
            stream,
            behavior,
            gateway,
            params,
            ConnectPhase::Connecting { deadline },
            addr.ip().to_string(),
        )
    }

    fn install_session(
        &mut self,
        stream: TcpStream,
        behavior: Box<dyn SessionBehavior>,
        gateway: Box<dyn Gateway>,
        params: SessionParams,
        connect: ConnectPhase,
        host: String,
    ) -> Result<SessionId> {
        let sid = self.next_session_id;
        self.next_session_id += 1;

        let token = self.next_session_token;
        self.next_session_token += 1;

        self.poll.register(
            &stream,
            Token(token),
            Ready::readable() | Ready::writable(),
            PollOpt::edge(),
        )?;

        let log = self.log.new(logging::o!("session_id" => sid));
        logging::debug!(log, "session installed"; "host" => &host);

        let now = self.clock.now_micros();
        let session = Session {
            id: sid,
            token,
            stream: Some(stream),
            gateway,
            behavior: Some(behavior),
            params,
            subscriptions: Vec::new(),
            pending: UpdateBuffer::default(),
            connect,
            kill: false,
            host,
            update_tokens: params.max_update_items_per_second,
            last_refill: now,
            log,
        };

        self.sessions.insert(sid, session);
        self.session_tokens.insert(token, sid);
        self.refresh_central();

        if connect == ConnectPhase::Ready {
            self.dispatch_attached(sid, now);
        }

        Ok(sid)
    }

    fn refresh_central(&mut self) {
        let _ = self.central.remove_field("session_count");
        self.central
            .add_u32("session_count", self.sessions.len() as u32)
            .expect("Central state field type drifted");
    }

    /// One pass of the event loop: wait for readiness up to the earliest
    /// pulse, service I/O, fire due pulses, flush updates, apply removals.
    pub fn run_once(&mut self, max_wait: Option<Duration>) -> Result<()> {
        let now = self.clock.now_micros();

        let mut timeout = self
            .next_wakeup(now)
            .map(|at| Duration::from_micros(at.saturating_sub(now)));

        if let Some(cap) = max_wait {
            timeout = Some(timeout.map_or(cap, |t| t.min(cap)));
        }

        self.poll.poll(&mut self.events, timeout)?;

        let ready: Vec<(usize, bool, bool)> = self
            .events
            .iter()
            .map(|event| {
                let readiness = event.readiness();
                (event.token().0, readiness.is_readable(), readiness.is_writable())
            })
            .collect();

        let now = self.clock.now_micros();

        for (token, readable, writable) in ready {
            if token < FACTORY_TOKEN_LIMIT {
                self.accept_pending(token, now);
            } else if let Some(&sid) = self.session_tokens.get(&token) {
                self.handle_session_event(sid, readable, writable, now);
            }
        }

        let now = self.clock.now_micros();
        self.fire_pulses(now);
        self.flush_updates(now);
        self.drive_output();
        self.process_kills(now);

        Ok(())
    }

    /// Runs the loop until `request_shutdown`, then detaches every session.
    pub fn serve(&mut self) -> Result<()> {
        while !self.shutdown {
            self.run_once(None)?;
        }

        let sids: Vec<SessionId> = self.sessions.keys().copied().collect();
        let now = self.clock.now_micros();
        for sid in sids {
            self.remove_session(sid, now);
        }

        Ok(())
    }

    fn accept_pending(&mut self, token: usize, now: u64) {
        loop {
            // The entry may have been removed by a callback in this pass
            let addr = match self.factories.iter().find(|(_, e)| e.token == token) {
                Some((&addr, _)) => addr,
                None => return,
            };

            let accepted = {
                let entry = self.factories.get_mut(&addr).expect("Factory vanished");

                match entry.listener.accept() {
                    Ok((stream, peer)) => {
                        if !entry.factory.accepts(&peer) {
                            logging::info!(self.log, "connection refused"; "peer" => %peer);
                            continue;
                        }

                        let params = entry.factory.initial_params(&peer);
                        let gateway = entry.factory.create_gateway(self.default_policy, &self.msg_pool);
                        match entry.factory.create(&peer, &self.log) {
                            Ok(behavior) => Some((stream, peer, behavior, gateway, params)),
                            Err(err) => {
                                logging::warn!(self.log, "factory refused session";
                                               "peer" => %peer, "error" => %err);
                                continue;
                            }
                        }
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => None,
                    Err(e) => {
                        logging::error!(self.log, "accept failed"; "error" => %e);
                        None
                    }
                }
            };

            match accepted {
                Some((stream, peer, behavior, gateway, params)) => {
                    let installed = self.install_session(
                        stream,
                        behavior,
                        gateway,
                        params,
                        ConnectPhase::Ready,
                        peer.ip().to_string(),
                    );

                    if installed.is_err() {
                        logging::warn!(self.log, "failed to install accepted session");
                    }
                }
                None => return,
            }
        }
    }

    fn handle_session_event(&mut self, sid: SessionId, readable: bool, writable: bool, now: u64) {
        let phase = match self.sessions.get(&sid) {
            Some(session) => session.connect,
            None => return,
        };

        if let ConnectPhase::Connecting { .. } = phase {
            // Any readiness on a connecting socket resolves the connect:
            // writable means success, error readiness surfaces via take_error
            let connected = {
                let session = self.sessions.get_mut(&sid).expect("Session vanished");
                let stream = session.stream.as_ref().expect("Connecting session has no stream");

                match stream.take_error() {
                    Ok(None) => true,
                    _ => false,
                }
            };

            if connected {
                self.sessions.get_mut(&sid).expect("Session vanished").connect = ConnectPhase::Ready;
                self.dispatch_connect_completed(sid, true, now);
                self.dispatch_attached(sid, now);
            } else {
                self.dispatch_connect_completed(sid, false, now);
                self.mark_kill(sid);
                return;
            }
        }

        if readable {
            self.do_input(sid, now);
        }

        if writable {
            self.do_output(sid);
        }
    }

    fn do_input(&mut self, sid: SessionId, now: u64) {
        let outcome = {
            let session = match self.sessions.get_mut(&sid) {
                Some(session) => session,
                None => return,
            };

            if session.kill || session.stream.is_none() {
                return;
            }

            let Session { stream, gateway, .. } = session;
            gateway.receive(stream.as_mut().expect("Stream checked above"))
        };

        match outcome {
            Ok(result) => {
                if result.eof {
                    self.mark_kill(sid);
                }
            }
            Err(_) => {
                self.mark_kill(sid);
                return;
            }
        }

        loop {
            let next = match self.sessions.get_mut(&sid) {
                Some(session) => session.gateway.next_message(),
                None => return,
            };

            match next {
                Ok(msg) => self.dispatch_message(sid, msg, now),
                Err(Error::Wait) => break,
                Err(err) => {
                    let log = &self.log;
                    logging::warn!(log, "gateway fault, disconnecting";
                                   "session_id" => sid, "error" => %err);
                    self.mark_kill(sid);
                    break;
                }
            }
        }
    }

    fn do_output(&mut self, sid: SessionId) {
        let failed = {
            let session = match self.sessions.get_mut(&sid) {
                Some(session) => session,
                None => return,
            };

            if session.kill || session.stream.is_none() || session.connect != ConnectPhase::Ready {
                return;
            }

            let Session { stream, gateway, .. } = session;
            gateway
                .flush(stream.as_mut().expect("Stream checked above"))
                .has_failed()
        };

        if failed {
            self.mark_kill(sid);
        }
    }

    fn mark_kill(&mut self, sid: SessionId) {
        if let Some(session) = self.sessions.get_mut(&sid) {
            session.kill = true;
        }
        self.kills.push(sid);
    }

    fn dispatch_message(&mut self, sid: SessionId, msg: MessageRef, now: u64) {
        let mut behavior = match self.sessions.get_mut(&sid).and_then(|s| s.behavior.take()) {
            Some(behavior) => behavior,
            None => return,
        };

        let result = {
            let mut ctx = self.ctx(sid, now);
            behavior.message_received(&mut ctx, msg)
        };

        if let Some(session) = self.sessions.get_mut(&sid) {
            session.behavior = Some(behavior);
        }

        if result.has_failed() {
            let log = &self.log;
            logging::warn!(log, "session failed to process message";
                           "session_id" => sid, "error" => %result.unwrap_err());
            self.mark_kill(sid);
        }
    }

    fn dispatch_attached(&mut self, sid: SessionId, now: u64) {
        let mut behavior = match self.sessions.get_mut(&sid).and_then(|s| s.behavior.take()) {
            Some(behavior) => behavior,
            None => return,
        };

        let result = {
            let mut ctx = self.ctx(sid, now);
            behavior.attached(&mut ctx)
        };

        if let Some(session) = self.sessions.get_mut(&sid) {
            session.behavior = Some(behavior);
        }

        if result.has_failed() {
            self.mark_kill(sid);
        }
    }

    fn dispatch_connect_completed(&mut self, sid: SessionId, succeeded: bool, now: u64) {
        let mut behavior = match self.sessions.get_mut(&sid).and_then(|s| s.behavior.take()) {
            Some(behavior) => behavior,
            None => return,
        };

        {
            let mut ctx = self.ctx(sid, now);
            behavior.async_connect_completed(&mut ctx, succeeded);
        }

        if let Some(session) = self.sessions.get_mut(&sid) {
            session.behavior = Some(behavior);
        }
    }

    fn ctx(&mut self, sid: SessionId, now: u64) -> ServerCtx {
        ServerCtx {
            own_id: sid,
            now,
            tree: &mut self.tree,
            sessions: &mut self.sessions,
            central: &mut self.central,
            msg_pool: &self.msg_pool,
            kills: &mut self.kills,
            log: &self.log,
        }
    }

    /// Earliest absolute wakeup over connect deadlines, rate-limit refills
    /// and behavior pulses.
    fn next_wakeup(&self, now: u64) -> Option<u64> {
        let mut earliest: Option<u64> = None;
        let mut consider = |candidate: u64| {
            earliest = Some(earliest.map_or(candidate, |e| e.min(candidate)));
        };

        for session in self.sessions.values() {
            if let ConnectPhase::Connecting { deadline: Some(deadline) } = session.connect {
                consider(deadline);
            }

            if !session.pending.is_empty()
                && session.params.max_update_items_per_second > 0
                && session.update_tokens == 0
            {
                consider(session.last_refill + REFILL_INTERVAL_MICROS);
            }

            if let Some(behavior) = session.behavior.as_ref() {
                if let Some(at) = behavior.pulse_time(now) {
                    consider(at);
                }
            }
        }

        earliest
    }

    fn fire_pulses(&mut self, now: u64) {
        let sids: Vec<SessionId> = self.sessions.keys().copied().collect();

        for sid in sids {
            let (connect_expired, refill, pulse_due) = {
                let session = match self.sessions.get(&sid) {
                    Some(session) => session,
                    None => continue,
                };

                let connect_expired = matches!(
                    session.connect,
                    ConnectPhase::Connecting { deadline: Some(deadline) } if deadline <= now
                );

                let refill = session.params.max_update_items_per_second > 0
                    && now.saturating_sub(session.last_refill) >= REFILL_INTERVAL_MICROS;

                let pulse_due = session
                    .behavior
                    .as_ref()
                    .and_then(|b| b.pulse_time(now))
                    .map_or(false, |at| at <= now);

                (connect_expired, refill, pulse_due)
            };

            if connect_expired {
                self.dispatch_connect_completed(sid, false, now);
                self.mark_kill(sid);
                continue;
            }

            if refill {
                let session = self.sessions.get_mut(&sid).expect("Session vanished");
                session.update_tokens = session.params.max_update_items_per_second;
                session.last_refill = now;
            }

            if pulse_due {
                self.dispatch_pulse(sid, now);
            }
        }
    }

    fn dispatch_pulse(&mut self, sid: SessionId, now: u64) {
        let (mut behavior, scheduled) = {
            let session = match self.sessions.get_mut(&sid) {
                Some(session) => session,
                None => return,
            };

            let scheduled = session
                .behavior
                .as_ref()
                .and_then(|b| b.pulse_time(now))
                .unwrap_or(now);

            match session.behavior.take() {
                Some(behavior) => (behavior, scheduled),
                None => return,
            }
        };

        {
            let mut ctx = self.ctx(sid, now);
            behavior.pulse(&mut ctx, now, scheduled);
        }

        if let Some(session) = self.sessions.get_mut(&sid) {
            session.behavior = Some(behavior);
        }
    }

    /// Converts pending update buffers into outgoing messages, honoring each
    /// session's item-rate budget; unconsumed items carry over.
    fn flush_updates(&mut self, _now: u64) {
        let sids: Vec<SessionId> = self.sessions.keys().copied().collect();

        for sid in sids {
            let update = {
                let session = match self.sessions.get_mut(&sid) {
                    Some(session) => session,
                    None => continue,
                };

                if session.kill || session.pending.is_empty() {
                    continue;
                }

                let budget = fiber::choose!(
                    session.params.max_update_items_per_second == 0 => usize::max_value(),
                    session.update_tokens as usize
                );

                let before = session.pending.len();
                let update = session.pending.drain_into(budget, RESULT_DATA_ITEMS);
                let consumed = before - session.pending.len();

                if session.params.max_update_items_per_second > 0 {
                    session.update_tokens -= consumed as u32;
                }

                update
            };

            if let Some(update) = update {
                let msg = self.msg_pool.obtain_with(|slot| *slot = update);
                let overflow = {
                    let session = self.sessions.get_mut(&sid).expect("Session vanished");
                    session.gateway.enqueue(msg).has_failed()
                };

                if overflow {
                    let log = &self.log;
                    logging::warn!(log, "update queue overrun, disconnecting"; "session_id" => sid);
                    self.mark_kill(sid);
                }
            }
        }
    }

    /// Opportunistically pushes buffered output; the poll's writable edges
    /// resume any stream that saturates here.
    fn drive_output(&mut self) {
        let sids: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, s)| !s.kill && s.gateway.has_output())
            .map(|(&sid, _)| sid)
            .collect();

        for sid in sids {
            self.do_output(sid);
        }
    }

    fn process_kills(&mut self, now: u64) {
        loop {
            let marked: Vec<SessionId> = self
                .sessions
                .iter()
                .filter(|(_, s)| s.kill)
                .map(|(&sid, _)| sid)
                .chain(self.kills.drain(..))
                .collect();

            if marked.is_empty() {
                return;
            }

            for sid in marked {
                self.remove_session(sid, now);
            }
        }
    }

    fn remove_session(&mut self, sid: SessionId, now: u64) {
        let mut session = match self.sessions.swap_remove(&sid) {
            Some(session) => session,
            None => return,
        };

        logging::debug!(session.log, "removing session");

        if let Some(mut behavior) = session.behavior.take() {
            let mut ctx = self.ctx(sid, now);
            behavior.detached(&mut ctx);
        }

        let root = self.tree.root();
        self.tree.purge_subscriber(root, sid);

        if let Some(stream) = session.stream.take() {
            let _ = self.poll.deregister(&stream);
        }

        self.session_tokens.remove(&session.token);
        self.refresh_central();
    }
}
