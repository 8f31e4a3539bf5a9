use crate::message::MessageRef;
use crate::path::SegmentPattern;
use crate::support::{Error, Result, SessionId};
use crate::wire;
use hashbrown::HashMap;

/// Slot index of a node in the tree arena. Ids are recycled after removal;
/// holding one across mutations is only valid for nodes known to be alive.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct NodeId(u32);

impl NodeId {
    #[inline]
    fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum IndexOp {
    Inserted,
    Removed,
}

/// Receives change notifications synchronously, while the affected node is
/// still fully intact. The subscription fanout lives behind this trait.
pub trait TreeSink {
    fn node_created(&mut self, tree: &NodeTree, node: NodeId);
    fn node_changed(&mut self, tree: &NodeTree, node: NodeId, old_payload: Option<&MessageRef>);
    /// Called before the node is detached; its children are already gone.
    fn node_removed(&mut self, tree: &NodeTree, node: NodeId);
    fn index_changed(&mut self, tree: &NodeTree, node: NodeId, op: IndexOp, pos: usize, child: &str);
}

/// Sink for mutations nobody needs to observe (tests, teardown).
pub struct NullSink;

impl TreeSink for NullSink {
    fn node_created(&mut self, _: &NodeTree, _: NodeId) {}
    fn node_changed(&mut self, _: &NodeTree, _: NodeId, _: Option<&MessageRef>) {}
    fn node_removed(&mut self, _: &NodeTree, _: NodeId) {}
    fn index_changed(&mut self, _: &NodeTree, _: NodeId, _: IndexOp, _: usize, _: &str) {}
}

/// One vertex of the shared tree: a name, an optional payload, an unordered
/// child map, an optional ordered index over a subset of the children, and
/// the per-node subscriber counters.
pub struct DataNode {
    name: String,
    parent: Option<NodeId>,
    depth: u32,
    payload: Option<MessageRef>,
    children: HashMap<String, NodeId>,
    index: Option<Vec<NodeId>>,
    subscribers: HashMap<SessionId, u32>,
    // 0 means "recompute on demand"
    cached_data_checksum: u32,
    max_child_id_hint: u64,
}

impl DataNode {
    fn new(name: String, parent: Option<NodeId>, depth: u32, payload: Option<MessageRef>) -> DataNode {
        DataNode {
            name,
            parent,
            depth,
            payload,
            children: HashMap::new(),
            index: None,
            subscribers: HashMap::new(),
            cached_data_checksum: 0,
            max_child_id_hint: 0,
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    #[inline]
    pub fn depth(&self) -> u32 {
        self.depth
    }

    #[inline]
    pub fn payload(&self) -> Option<&MessageRef> {
        self.payload.as_ref()
    }

    #[inline]
    pub fn child(&self, name: &str) -> Option<NodeId> {
        self.children.get(name).copied()
    }

    #[inline]
    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    pub fn children(&self) -> impl Iterator<Item = (&str, NodeId)> {
        self.children.iter().map(|(name, &id)| (name.as_str(), id))
    }

    /// The ordered index, when one has been established.
    #[inline]
    pub fn index(&self) -> Option<&[NodeId]> {
        self.index.as_deref()
    }

    pub fn subscribers(&self) -> impl Iterator<Item = (SessionId, u32)> + '_ {
        self.subscribers.iter().map(|(&session, &count)| (session, count))
    }

    #[inline]
    pub fn is_subscribed(&self, session: SessionId) -> bool {
        self.subscribers.contains_key(&session)
    }

    fn index_position(&self, id: NodeId) -> Option<usize> {
        self.index.as_ref().and_then(|index| index.iter().position(|&e| e == id))
    }
}

/// Numeric value of an auto-generated child name: `I` followed by decimal
/// digits. Scans leading digits only, yielding zero when none follow.
fn auto_name_value(name: &str) -> Option<u64> {
    let rest = name.strip_prefix('I')?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();

    Some(digits.parse().unwrap_or(0))
}

/// The hierarchical data store. Node slots live in an arena with a free list;
/// parent links are plain ids, so ownership stays acyclic.
pub struct NodeTree {
    nodes: Vec<Option<DataNode>>,
    free: Vec<u32>,
    root: NodeId,
    live: usize,
}

impl NodeTree {
    pub fn new() -> NodeTree {
        let root = DataNode::new(String::new(), None, 0, None);

        NodeTree {
            nodes: vec![Some(root)],
            free: Vec::new(),
            root: NodeId(0),
            live: 1,
        }
    }

    #[inline]
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Number of live nodes, including the root.
    #[inline]
    pub fn len(&self) -> usize {
        self.live
    }

    #[inline]
    pub fn node(&self, id: NodeId) -> &DataNode {
        self.nodes[id.index()].as_ref().expect("Stale node id")
    }

    #[inline]
    fn node_mut(&mut self, id: NodeId) -> &mut DataNode {
        self.nodes[id.index()].as_mut().expect("Stale node id")
    }

    #[inline]
    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.get(id.index()).map_or(false, Option::is_some)
    }

    /// Absolute path of a node; the root is `/`.
    pub fn node_path(&self, id: NodeId) -> String {
        let segments = self.path_segments(id);

        if segments.is_empty() {
            return "/".to_owned();
        }

        let mut path = String::new();
        for segment in &segments {
            path.push('/');
            path.push_str(segment);
        }

        path
    }

    /// Path segments of a node, root first.
    pub fn path_segments(&self, id: NodeId) -> Vec<&str> {
        let mut segments = Vec::new();
        let mut cursor = Some(id);

        while let Some(current) = cursor {
            let node = self.node(current);
            if node.parent.is_some() {
                segments.push(node.name.as_str());
            }
            cursor = node.parent;
        }

        segments.reverse();
        segments
    }

    fn alloc(&mut self, node: DataNode) -> NodeId {
        self.live += 1;

        match self.free.pop() {
            Some(slot) => {
                self.nodes[slot as usize] = Some(node);
                NodeId(slot)
            }
            None => {
                self.nodes.push(Some(node));
                NodeId((self.nodes.len() - 1) as u32)
            }
        }
    }

    fn release(&mut self, id: NodeId) {
        self.nodes[id.index()] = None;
        self.free.push(id.0);
        self.live -= 1;
    }

    /// Inserts a child under `parent`, or replaces the payload of an existing
    /// child of that name. Fresh nodes are announced through
    /// `sink.node_created`, replacements through `sink.node_changed`.
    pub fn put_child(
        &mut self,
        parent: NodeId,
        name: &str,
        payload: Option<MessageRef>,
        sink: &mut dyn TreeSink,
    ) -> Result<NodeId> {
        if name.is_empty() || name.contains('/') {
            return Err(Error::BadArgument);
        }

        if let Some(existing) = self.node(parent).child(name) {
            self.set_data(existing, payload, sink);
            return Ok(existing);
        }

        let depth = self.node(parent).depth + 1;
        let child = self.alloc(DataNode::new(name.to_owned(), Some(parent), depth, payload));

        let parent_node = self.node_mut(parent);
        parent_node.children.insert(name.to_owned(), child);

        if let Some(value) = auto_name_value(name) {
            parent_node.max_child_id_hint = parent_node.max_child_id_hint.max(value + 1);
        }

        sink.node_created(self, child);

        Ok(child)
    }

    /// Replaces the payload. The previous payload rides along to the sink so
    /// sessions that asked for old values can include it.
    pub fn set_data(&mut self, id: NodeId, payload: Option<MessageRef>, sink: &mut dyn TreeSink) {
        let node = self.node_mut(id);
        let old_payload = std::mem::replace(&mut node.payload, payload);
        node.cached_data_checksum = 0;

        sink.node_changed(self, id, old_payload.as_ref());
    }

    /// Removes the named child and its whole subtree, children before
    /// parents. Every removed node is reported; indexed children also produce
    /// an index removal on their parent.
    pub fn remove_child(&mut self, parent: NodeId, name: &str, sink: &mut dyn TreeSink) -> Result<()> {
        let child = self.node(parent).child(name).ok_or(Error::DataNotFound)?;

        self.remove_subtree(child, sink);

        Ok(())
    }

    /// Depth-first removal of a node and everything below it.
    pub fn remove_subtree(&mut self, id: NodeId, sink: &mut dyn TreeSink) {
        let names: Vec<String> = self.node(id).children.keys().cloned().collect();

        for name in names {
            if let Some(child) = self.node(id).child(&name) {
                self.remove_subtree(child, sink);
            }
        }

        sink.node_removed(self, id);

        let (parent, name) = {
            let node = self.node(id);
            (node.parent, node.name.clone())
        };

        if let Some(parent) = parent {
            if let Some(pos) = self.node(parent).index_position(id) {
                self.node_mut(parent)
                    .index
                    .as_mut()
                    .expect("Index vanished mid-removal")
                    .remove(pos);
                sink.index_changed(self, parent, IndexOp::Removed, pos, &name);
            }

            self.node_mut(parent).children.remove(&name);
        }

        self.release(id);
    }

    /// Creates a child and places it in the ordered index, in front of the
    /// indexed child named `before` or at the end. Without a `name` a fresh
    /// `I<counter>` auto-name is synthesized.
    pub fn insert_ordered_child(
        &mut self,
        parent: NodeId,
        before: Option<&str>,
        name: Option<&str>,
        payload: Option<MessageRef>,
        sink: &mut dyn TreeSink,
    ) -> Result<NodeId> {
        let name = match name {
            Some(name) => {
                if self.node(parent).child(name).is_some() {
                    return Err(Error::BadArgument);
                }
                name.to_owned()
            }
            None => {
                let mut counter = self.node(parent).max_child_id_hint;
                loop {
                    let candidate = format!("I{}", counter);
                    if self.node(parent).child(&candidate).is_none() {
                        break candidate;
                    }
                    counter += 1;
                }
            }
        };

        let pos = self.index_insert_position(parent, before);
        let child = self.put_child(parent, &name, payload, sink)?;

        let parent_node = self.node_mut(parent);
        parent_node.index.get_or_insert_with(Vec::new).insert(pos, child);

        sink.index_changed(self, parent, IndexOp::Inserted, pos, &name);

        Ok(child)
    }

    fn index_insert_position(&self, parent: NodeId, before: Option<&str>) -> usize {
        let node = self.node(parent);
        let index_len = node.index().map_or(0, |index| index.len());

        match before {
            Some(before) => node
                .child(before)
                .and_then(|id| node.index_position(id))
                .unwrap_or(index_len),
            None => index_len,
        }
    }

    /// Adds an existing child into the ordered index at `pos` (clamped).
    pub fn insert_index_entry_at(
        &mut self,
        parent: NodeId,
        pos: usize,
        name: &str,
        sink: &mut dyn TreeSink,
    ) -> Result<()> {
        if self.node(parent).children.is_empty() {
            return Err(Error::BadObject);
        }

        let child = self.node(parent).child(name).ok_or(Error::DataNotFound)?;

        let parent_node = self.node_mut(parent);
        let index = parent_node.index.get_or_insert_with(Vec::new);
        let pos = pos.min(index.len());
        index.insert(pos, child);

        sink.index_changed(self, parent, IndexOp::Inserted, pos, name);

        Ok(())
    }

    /// Removes an index entry; the child node itself remains.
    pub fn remove_index_entry_at(
        &mut self,
        parent: NodeId,
        pos: usize,
        sink: &mut dyn TreeSink,
    ) -> Result<()> {
        let removed = {
            let parent_node = self.node_mut(parent);
            let index = parent_node.index.as_mut().ok_or(Error::DataNotFound)?;

            if pos >= index.len() {
                return Err(Error::DataNotFound);
            }

            index.remove(pos)
        };

        let name = self.node(removed).name.clone();
        sink.index_changed(self, parent, IndexOp::Removed, pos, &name);

        Ok(())
    }

    /// Moves an indexed child so it sits just before `before`, or at the end.
    /// A child missing from the index is inserted without a matching removal.
    pub fn reorder_child(
        &mut self,
        parent: NodeId,
        name: &str,
        before: Option<&str>,
        sink: &mut dyn TreeSink,
    ) -> Result<()> {
        let child = self.node(parent).child(name).ok_or(Error::DataNotFound)?;

        if let Some(old_pos) = self.node(parent).index_position(child) {
            self.node_mut(parent)
                .index
                .as_mut()
                .expect("Index vanished mid-reorder")
                .remove(old_pos);
            sink.index_changed(self, parent, IndexOp::Removed, old_pos, name);
        }

        let pos = self.index_insert_position(parent, before);

        let parent_node = self.node_mut(parent);
        parent_node.index.get_or_insert_with(Vec::new).insert(pos, child);

        sink.index_changed(self, parent, IndexOp::Inserted, pos, name);

        Ok(())
    }

    pub fn increment_subscriber(&mut self, id: NodeId, session: SessionId) {
        *self.node_mut(id).subscribers.entry(session).or_insert(0) += 1;
    }

    /// Decrements the per-session counter, dropping the entry at zero.
    pub fn decrement_subscriber(&mut self, id: NodeId, session: SessionId) {
        let node = self.node_mut(id);

        if let Some(count) = node.subscribers.get_mut(&session) {
            *count -= 1;
            if *count == 0 {
                node.subscribers.remove(&session);
            }
        }
    }

    /// Strips a session's subscriber entries from the whole subtree.
    pub fn purge_subscriber(&mut self, id: NodeId, session: SessionId) {
        let children: Vec<NodeId> = self.node(id).children.values().copied().collect();

        self.node_mut(id).subscribers.remove(&session);

        for child in children {
            self.purge_subscriber(child, session);
        }
    }

    /// Finds all nodes matching the compiled per-segment patterns, walking
    /// down from `start`. `max_depth` prunes the recursion.
    pub fn find_nodes(
        &self,
        start: NodeId,
        pattern: &[SegmentPattern],
        max_depth: usize,
        out: &mut Vec<NodeId>,
    ) {
        let (head, rest) = match pattern.split_first() {
            Some(split) => split,
            None => {
                out.push(start);
                return;
            }
        };

        if max_depth == 0 {
            return;
        }

        match head.as_literal() {
            Some(name) => {
                if let Some(child) = self.node(start).child(name) {
                    self.find_nodes(child, rest, max_depth - 1, out);
                }
            }
            None => {
                for (name, child) in self.node(start).children() {
                    if head.matches(name) {
                        self.find_nodes(child, rest, max_depth - 1, out);
                    }
                }
            }
        }
    }

    /// Resolves a path string to the first matching node. An empty path
    /// yields `start` itself; a leading `/` restarts from the root.
    pub fn find_first_matching_node(
        &self,
        start: NodeId,
        path: &str,
        max_depth: usize,
    ) -> Result<Option<NodeId>> {
        let (absolute, segments) = crate::path::split_path(path)?;
        let origin = if absolute { self.root } else { start };

        if segments.is_empty() {
            return Ok(Some(origin));
        }

        let pattern = segments
            .iter()
            .map(|s| SegmentPattern::compile(s))
            .collect::<Result<Vec<_>>>()?;

        let mut found = Vec::new();
        self.find_nodes(origin, &pattern, max_depth, &mut found);

        Ok(found.first().copied())
    }

    /// Depth-bounded checksum: the node's own name+payload sum, plus the
    /// indexed child names, plus the children's checksums one level shallower.
    pub fn checksum(&self, id: NodeId, depth: u32) -> u32 {
        let mut sum = self.data_checksum(id);

        if depth > 0 {
            let node = self.node(id);

            if let Some(index) = node.index() {
                for &entry in index {
                    sum = sum.wrapping_add(wire::checksum_bytes(self.node(entry).name.as_bytes()));
                }
            }

            for (_, child) in node.children() {
                sum = sum.wrapping_add(self.checksum(child, depth - 1));
            }
        }

        sum
    }

    /// Cached name+payload checksum. The cache is zeroed by `set_data`; a
    /// computed value of zero is simply recomputed next time.
    pub fn data_checksum(&self, id: NodeId) -> u32 {
        let node = self.node(id);

        if node.cached_data_checksum != 0 {
            return node.cached_data_checksum;
        }

        let mut sum = wire::checksum_bytes(node.name.as_bytes());
        if let Some(payload) = node.payload() {
            sum = sum.wrapping_add(wire::checksum(payload));
        }

        sum
    }

    /// Recomputes and stores the data checksum. Callers with mutable access
    /// use this to warm the cache.
    pub fn refresh_data_checksum(&mut self, id: NodeId) -> u32 {
        let sum = self.data_checksum(id);
        self.node_mut(id).cached_data_checksum = sum;
        sum
    }
}
