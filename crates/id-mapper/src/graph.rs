//! Identity graph over `(service, native_id)` nodes.
//!
//! Nodes live in an arena and are addressed by dense [`NodeId`]s; a lookup
//! table maps each [`NodeKey`] to its slot. Groups are a disjoint-set forest
//! with path compression. Whenever a group holds a base-service node, that
//! node is the group's root, so a group keeps its identity while peripheral
//! services are attached to it over later runs.
//!
//! Merges are never applied directly: [`IdentityGraph::propose_merge`] asks the
//! [`ConflictResolver`] first. Pending edges sit in two lanes and committed
//! (pinned) edges always drain before freshly hinted ones.

use crate::normalizer::{canonical_id, ServiceRecord};
use crate::resolver::{ConflictRecord, ConflictResolver, Resolution};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared::{MediaKind, MediaType, SeasonInfo, Service};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::{debug, trace};

/// Services consulted first when picking a group's media type
const TYPE_PRIORITY: [Service; 3] = [Service::Anilist, Service::Mal, Service::Kitsu];

/// A `(service, native_id)` pair, written as `service:id`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeKey {
    pub service: Service,
    pub native_id: String,
}

impl NodeKey {
    pub fn new(service: Service, native_id: impl Into<String>) -> Self {
        Self {
            service,
            native_id: native_id.into(),
        }
    }
}

impl Ord for NodeKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.service
            .cmp(&other.service)
            .then_with(|| compare_native_ids(self.service, &self.native_id, &other.native_id))
    }
}

impl PartialOrd for NodeKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for NodeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.service, self.native_id)
    }
}

impl TryFrom<String> for NodeKey {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let (service, native_id) = value
            .split_once(':')
            .ok_or_else(|| format!("node key without ':' separator: {}", value))?;
        let service =
            Service::from_alias(service).ok_or_else(|| format!("unknown service in node key: {}", value))?;
        if native_id.is_empty() {
            return Err(format!("node key without id: {}", value));
        }
        Ok(NodeKey::new(service, native_id))
    }
}

impl From<NodeKey> for String {
    fn from(key: NodeKey) -> Self {
        key.to_string()
    }
}

/// Order ids numerically where the service uses numbers
pub fn compare_native_ids(service: Service, a: &str, b: &str) -> Ordering {
    if service.has_numeric_ids() {
        if let (Ok(a_num), Ok(b_num)) = (a.parse::<u64>(), b.parse::<u64>()) {
            return a_num.cmp(&b_num);
        }
    }
    a.cmp(b)
}

/// Dense index of a node in the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// How much an edge is trusted
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trust {
    /// Claimed by a freshly scraped record
    Hinted,
    /// Taken from the previously committed mapping
    Pinned,
}

impl std::fmt::Display for Trust {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Trust::Hinted => write!(f, "hinted"),
            Trust::Pinned => write!(f, "pinned"),
        }
    }
}

/// Assertion that two nodes denote the same title.
///
/// For hinted edges `from` is the node of the record making the claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrossReferenceEdge {
    pub from: NodeId,
    pub to: NodeId,
    pub trust: Trust,
}

/// Order-independent identity of an edge, persisted for rejected edges
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EdgeKey {
    pub from: NodeKey,
    pub to: NodeKey,
}

impl EdgeKey {
    pub fn new(a: NodeKey, b: NodeKey) -> Self {
        if a <= b {
            Self { from: a, to: b }
        } else {
            Self { from: b, to: a }
        }
    }
}

/// What happened to a proposed merge
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    Merged,
    /// Both nodes already shared a group
    AlreadyJoined,
    Rejected(Vec<ConflictRecord>),
}

#[derive(Debug, Clone, Default)]
struct NodeAttrs {
    media_type: Option<MediaType>,
    titles: Vec<String>,
    season: Option<SeasonInfo>,
    episodes: Option<u32>,
    aired: Option<NaiveDate>,
    /// Seen as a scraped record in this pass
    observed: bool,
    /// Present in the committed mapping
    pinned: bool,
}

#[derive(Debug, Clone)]
struct Node {
    key: NodeKey,
    parent: NodeId,
    attrs: NodeAttrs,
}

/// Snapshot of one resolved group
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityGroup {
    pub representative: NodeKey,
    /// Id of the base-service node, None while unanchored
    pub base_id: Option<String>,
    pub ids: BTreeMap<Service, String>,
    pub media_type: Option<MediaType>,
    pub season: Option<SeasonInfo>,
    /// False when every node is a placeholder nobody has vouched for
    pub observed: bool,
}

impl IdentityGroup {
    pub fn is_anchored(&self) -> bool {
        self.base_id.is_some()
    }
}

/// Union-find over every node referenced during a pass
#[derive(Debug)]
pub struct IdentityGraph {
    kind: MediaKind,
    nodes: Vec<Node>,
    index: HashMap<NodeKey, NodeId>,
    /// Members of each group by service, keyed by root
    members: HashMap<NodeId, BTreeMap<Service, NodeId>>,
    pinned_edges: VecDeque<CrossReferenceEdge>,
    hinted_edges: VecDeque<CrossReferenceEdge>,
}

impl IdentityGraph {
    pub fn new(kind: MediaKind) -> Self {
        Self {
            kind,
            nodes: Vec::new(),
            index: HashMap::new(),
            members: HashMap::new(),
            pinned_edges: VecDeque::new(),
            hinted_edges: VecDeque::new(),
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Number of nodes, placeholders included
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node_id(&self, key: &NodeKey) -> Option<NodeId> {
        self.index.get(key).copied()
    }

    pub fn key(&self, id: NodeId) -> &NodeKey {
        &self.nodes[id.index()].key
    }

    /// First known title of a node
    pub fn title(&self, id: NodeId) -> Option<&str> {
        self.nodes[id.index()].attrs.titles.first().map(String::as_str)
    }

    pub fn episodes(&self, id: NodeId) -> Option<u32> {
        self.nodes[id.index()].attrs.episodes
    }

    pub fn aired(&self, id: NodeId) -> Option<NaiveDate> {
        self.nodes[id.index()].attrs.aired
    }

    /// Fold a scraped record into the graph and queue its hinted edges
    pub fn ingest(&mut self, record: ServiceRecord) -> NodeId {
        let node = self.ensure_node(NodeKey::new(record.service, record.native_id));

        {
            let attrs = &mut self.nodes[node.index()].attrs;
            attrs.observed = true;
            if record.media_type.is_some() {
                attrs.media_type = record.media_type;
            }
            if record.season_hint.is_some() {
                attrs.season = record.season_hint;
            }
            if record.episodes.is_some() {
                attrs.episodes = record.episodes;
            }
            if record.aired.is_some() {
                attrs.aired = record.aired;
            }
            for title in record.title_variants {
                if !attrs.titles.contains(&title) {
                    attrs.titles.push(title);
                }
            }
        }

        for (service, native_id) in record.foreign_id_hints {
            let target = self.ensure_node(NodeKey::new(service, native_id));
            self.hinted_edges.push_back(CrossReferenceEdge {
                from: node,
                to: target,
                trust: Trust::Hinted,
            });
        }

        trace!(node = %self.key(node), "Ingested record");
        node
    }

    /// Re-assert a group from the committed mapping as pinned edges.
    ///
    /// Ids are canonicalized like scraped ones, so a hand-edited entry lands
    /// on the same node. The base-service id anchors the edges when present.
    pub fn pin(
        &mut self,
        ids: &[(Service, String)],
        media_type: Option<MediaType>,
        season: Option<SeasonInfo>,
    ) {
        let kind = self.kind;
        let base = kind.base_service();
        let mut nodes: Vec<(Service, NodeId)> = ids
            .iter()
            .filter(|(service, _)| kind.includes(*service))
            .filter_map(|(service, id)| {
                let canonical = canonical_id(*service, &Value::String(id.clone()));
                if canonical.is_none() {
                    debug!(%service, id = %id, "Ignoring unusable committed id");
                }
                canonical.map(|id| (*service, id))
            })
            .map(|(service, id)| (service, self.ensure_node(NodeKey::new(service, id))))
            .collect();
        nodes.sort_by_key(|(service, _)| *service != base);

        let Some(&(_, anchor)) = nodes.first() else {
            return;
        };

        for &(_, node) in &nodes {
            let attrs = &mut self.nodes[node.index()].attrs;
            attrs.pinned = true;
            if attrs.media_type.is_none() {
                attrs.media_type = media_type;
            }
        }
        if let Some(season) = season {
            let attrs = &mut self.nodes[anchor.index()].attrs;
            if attrs.season.is_none() {
                attrs.season = Some(season);
            }
        }

        for &(_, node) in nodes.iter().skip(1) {
            self.pinned_edges.push_back(CrossReferenceEdge {
                from: anchor,
                to: node,
                trust: Trust::Pinned,
            });
        }
    }

    /// Next edge awaiting resolution; pinned edges come first
    pub fn next_edge(&mut self) -> Option<CrossReferenceEdge> {
        self.pinned_edges
            .pop_front()
            .or_else(|| self.hinted_edges.pop_front())
    }

    pub fn pending_edges(&self) -> usize {
        self.pinned_edges.len() + self.hinted_edges.len()
    }

    pub fn edge_key(&self, edge: &CrossReferenceEdge) -> EdgeKey {
        EdgeKey::new(self.key(edge.from).clone(), self.key(edge.to).clone())
    }

    /// Ask the resolver whether the groups of the edge's endpoints may be
    /// joined, and join them if it approves
    pub fn propose_merge(
        &mut self,
        edge: &CrossReferenceEdge,
        resolver: &ConflictResolver,
    ) -> MergeOutcome {
        let root_a = self.find(edge.from);
        let root_b = self.find(edge.to);
        if root_a == root_b {
            return MergeOutcome::AlreadyJoined;
        }

        match resolver.resolve(self, root_a, root_b, edge) {
            Resolution::Approve => {
                let root = self.union(root_a, root_b);
                debug!(
                    from = %self.key(edge.from),
                    to = %self.key(edge.to),
                    root = %self.key(root),
                    trust = %edge.trust,
                    "Merged groups"
                );
                MergeOutcome::Merged
            }
            Resolution::Reject(conflicts) => MergeOutcome::Rejected(conflicts),
        }
    }

    /// Root of a node's group, compressing the path on the way
    pub fn find(&mut self, id: NodeId) -> NodeId {
        let root = self.root_of(id);
        let mut current = id;
        while current != root {
            let next = self.nodes[current.index()].parent;
            self.nodes[current.index()].parent = root;
            current = next;
        }
        root
    }

    /// Group members by service, for a root node
    pub fn members(&self, root: NodeId) -> Option<&BTreeMap<Service, NodeId>> {
        self.members.get(&root)
    }

    /// Snapshot of the group containing `key`
    pub fn group_of(&self, key: &NodeKey) -> Option<IdentityGroup> {
        let id = self.node_id(key)?;
        Some(self.snapshot(self.root_of(id)))
    }

    /// Lazily walk every current group.
    ///
    /// The iterator borrows the graph, so it must be dropped before the next
    /// merge; ask again afterwards for a fresh view.
    pub fn groups(&self) -> Groups<'_> {
        Groups {
            graph: self,
            next: 0,
        }
    }

    fn root_of(&self, id: NodeId) -> NodeId {
        let mut current = id;
        loop {
            let parent = self.nodes[current.index()].parent;
            if parent == current {
                return current;
            }
            current = parent;
        }
    }

    fn ensure_node(&mut self, key: NodeKey) -> NodeId {
        if let Some(&id) = self.index.get(&key) {
            return id;
        }

        let id = NodeId(self.nodes.len() as u32);
        self.members
            .insert(id, BTreeMap::from([(key.service, id)]));
        self.index.insert(key.clone(), id);
        self.nodes.push(Node {
            key,
            parent: id,
            attrs: NodeAttrs::default(),
        });
        id
    }

    /// Join two roots. The root holding the base-service node stays root;
    /// otherwise the larger group wins, then the older node.
    fn union(&mut self, a: NodeId, b: NodeId) -> NodeId {
        let base = self.kind.base_service();
        let weight = |root: NodeId| {
            let members = self.members.get(&root);
            (
                members.is_some_and(|m| m.contains_key(&base)),
                members.map_or(0, BTreeMap::len),
                std::cmp::Reverse(root),
            )
        };
        let (root, child) = if weight(a) >= weight(b) { (a, b) } else { (b, a) };

        self.nodes[child.index()].parent = root;
        let absorbed = self.members.remove(&child).unwrap_or_default();
        self.members.entry(root).or_default().extend(absorbed);
        root
    }

    fn snapshot(&self, root: NodeId) -> IdentityGroup {
        let base = self.kind.base_service();
        let members = self.members.get(&root).cloned().unwrap_or_default();
        let attrs = |id: &NodeId| &self.nodes[id.index()].attrs;

        let media_type = TYPE_PRIORITY
            .iter()
            .chain(Service::ALL.iter())
            .filter_map(|service| members.get(service))
            .find_map(|id| attrs(id).media_type);

        let mut season = SeasonInfo::default();
        for id in members.get(&base).into_iter().chain(members.values()) {
            if let Some(found) = attrs(id).season {
                season.merge_missing(&found);
            }
        }

        IdentityGroup {
            representative: self.key(root).clone(),
            base_id: members.get(&base).map(|id| self.key(*id).native_id.clone()),
            ids: members
                .iter()
                .map(|(service, id)| (*service, self.key(*id).native_id.clone()))
                .collect(),
            media_type,
            season: (!season.is_empty()).then_some(season),
            observed: members.values().any(|id| attrs(id).observed || attrs(id).pinned),
        }
    }
}

/// Iterator over the groups of a graph, one per root
pub struct Groups<'a> {
    graph: &'a IdentityGraph,
    next: usize,
}

impl Iterator for Groups<'_> {
    type Item = IdentityGroup;

    fn next(&mut self) -> Option<Self::Item> {
        while self.next < self.graph.nodes.len() {
            let id = NodeId(self.next as u32);
            self.next += 1;
            if self.graph.nodes[id.index()].parent == id {
                return Some(self.graph.snapshot(id));
            }
        }
        None
    }
}
