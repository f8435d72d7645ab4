//! # Graph Index
//!
//! Adjacency over the current version of every entity.
//!
//! The index holds ids only; payloads stay in the Entity Store. It is
//! updated incrementally by the store inside the same critical section as
//! the journal append, so a reader never sees an entity without its edges or
//! an edge without its entity.
//!
//! All data structures use `BTreeMap`/`BTreeSet` for deterministic ordering.

use crate::primitives::MAX_TRAVERSAL_DEPTH;
use crate::types::{Entity, EntityId, EntityKind, Payload};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Current endpoints of an edge entity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct EdgeRef {
    pub edge: EntityId,
    pub from: EntityId,
    pub to: EntityId,
    pub relation: String,
}

/// One adjacency entry: `(relation, neighbor, edge id)`.
type Adjacent = (String, EntityId, EntityId);

/// Adjacency lists keyed by entity id, in both directions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphIndex {
    nodes: BTreeSet<EntityId>,
    edges: BTreeMap<EntityId, EdgeRef>,
    outgoing: BTreeMap<EntityId, BTreeSet<Adjacent>>,
    incoming: BTreeMap<EntityId, BTreeSet<Adjacent>>,
}

impl GraphIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a newly committed version into the index.
    ///
    /// A new version of an existing edge replaces its old adjacency entries.
    /// A tombstone removes the entity from the index.
    pub fn apply(&mut self, entity: &Entity) {
        match &entity.payload {
            Payload::Node(_) => {
                self.nodes.insert(entity.id);
            }
            Payload::Retired(EntityKind::Node) => {
                self.nodes.remove(&entity.id);
            }
            Payload::Retired(EntityKind::Edge) => {
                if let Some(old) = self.edges.remove(&entity.id) {
                    self.unlink(&old);
                }
            }
            Payload::Edge(edge) => {
                if let Some(old) = self.edges.remove(&entity.id) {
                    self.unlink(&old);
                }
                let edge_ref = EdgeRef {
                    edge: entity.id,
                    from: edge.from,
                    to: edge.to,
                    relation: edge.relation.clone(),
                };
                self.outgoing.entry(edge.from).or_default().insert((
                    edge.relation.clone(),
                    edge.to,
                    entity.id,
                ));
                self.incoming.entry(edge.to).or_default().insert((
                    edge.relation.clone(),
                    edge.from,
                    entity.id,
                ));
                self.edges.insert(entity.id, edge_ref);
            }
        }
    }

    fn unlink(&mut self, old: &EdgeRef) {
        if let Some(out) = self.outgoing.get_mut(&old.from) {
            out.remove(&(old.relation.clone(), old.to, old.edge));
            if out.is_empty() {
                self.outgoing.remove(&old.from);
            }
        }
        if let Some(inc) = self.incoming.get_mut(&old.to) {
            inc.remove(&(old.relation.clone(), old.from, old.edge));
            if inc.is_empty() {
                self.incoming.remove(&old.to);
            }
        }
    }

    pub fn contains_node(&self, id: EntityId) -> bool {
        self.nodes.contains(&id)
    }

    pub fn contains_edge(&self, id: EntityId) -> bool {
        self.edges.contains_key(&id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Current endpoints of an edge entity.
    pub fn edge(&self, id: EntityId) -> Option<&EdgeRef> {
        self.edges.get(&id)
    }

    /// Targets of outgoing edges, optionally restricted to one relation.
    pub fn neighbors(&self, id: EntityId, relation: Option<&str>) -> BTreeSet<EntityId> {
        Self::select(self.outgoing.get(&id), relation)
    }

    /// Sources of incoming edges, optionally restricted to one relation.
    pub fn incoming(&self, id: EntityId, relation: Option<&str>) -> BTreeSet<EntityId> {
        Self::select(self.incoming.get(&id), relation)
    }

    fn select(adjacent: Option<&BTreeSet<Adjacent>>, relation: Option<&str>) -> BTreeSet<EntityId> {
        adjacent
            .into_iter()
            .flatten()
            .filter(|(rel, _, _)| relation.is_none_or(|r| r == rel))
            .map(|(_, neighbor, _)| *neighbor)
            .collect()
    }

    /// Ids of every edge that starts or ends at `id`.
    pub fn incident_edges(&self, id: EntityId) -> BTreeSet<EntityId> {
        self.outgoing
            .get(&id)
            .into_iter()
            .chain(self.incoming.get(&id))
            .flatten()
            .map(|(_, _, edge)| *edge)
            .collect()
    }

    /// Edge ids running from `from` to `to`, any relation.
    pub fn edges_between(&self, from: EntityId, to: EntityId) -> Vec<EntityId> {
        self.outgoing
            .get(&from)
            .into_iter()
            .flatten()
            .filter(|(_, neighbor, _)| *neighbor == to)
            .map(|(_, _, edge)| *edge)
            .collect()
    }

    /// Edges whose source and target are the same entity.
    pub fn self_loops(&self, id: EntityId) -> Vec<EntityId> {
        self.edges_between(id, id)
    }

    /// Lazy depth-first enumeration of paths starting at `start`.
    ///
    /// Each yielded path begins with `start` and has at least one hop. A hop
    /// is followed only when `predicate` accepts it. No node repeats within a
    /// path, so cycles terminate. `max_depth` is clamped to
    /// `MAX_TRAVERSAL_DEPTH`.
    pub fn traverse<P>(&self, start: EntityId, max_depth: usize, predicate: P) -> Traversal<'_, P>
    where
        P: FnMut(&Hop<'_>) -> bool,
    {
        let max_depth = max_depth.min(MAX_TRAVERSAL_DEPTH);
        let stack = if self.outgoing.contains_key(&start) || self.nodes.contains(&start) {
            vec![vec![start]]
        } else {
            Vec::new()
        };
        Traversal {
            graph: self,
            max_depth,
            predicate,
            stack,
            pending: None,
        }
    }

    /// Shortest hop path from `from` to `to` (BFS, deterministic tie order).
    pub fn path_between(
        &self,
        from: EntityId,
        to: EntityId,
        max_depth: usize,
    ) -> Option<Vec<EntityId>> {
        if from == to {
            return Some(vec![from]);
        }
        let max_depth = max_depth.min(MAX_TRAVERSAL_DEPTH);
        let mut prev: BTreeMap<EntityId, EntityId> = BTreeMap::new();
        let mut visited = BTreeSet::from([from]);
        let mut queue = VecDeque::from([(from, 0usize)]);

        while let Some((current, depth)) = queue.pop_front() {
            if depth >= max_depth {
                continue;
            }
            for next in self.neighbors(current, None) {
                if !visited.insert(next) {
                    continue;
                }
                prev.insert(next, current);
                if next == to {
                    let mut path = vec![to];
                    let mut cursor = to;
                    while let Some(&p) = prev.get(&cursor) {
                        path.push(p);
                        cursor = p;
                    }
                    path.reverse();
                    return Some(path);
                }
                queue.push_back((next, depth.saturating_add(1)));
            }
        }
        None
    }
}

// =============================================================================
// TRAVERSAL
// =============================================================================

/// A single candidate step offered to a traversal predicate.
#[derive(Debug, Clone, Copy)]
pub struct Hop<'a> {
    pub edge: EntityId,
    pub from: EntityId,
    pub to: EntityId,
    pub relation: &'a str,
    /// Depth the path will have after taking this hop.
    pub depth: usize,
}

/// Iterator returned by [`GraphIndex::traverse`].
///
/// A path's children are offered to the predicate only when the iterator is
/// advanced past that path.
pub struct Traversal<'a, P> {
    graph: &'a GraphIndex,
    max_depth: usize,
    predicate: P,
    stack: Vec<Vec<EntityId>>,
    pending: Option<Vec<EntityId>>,
}

impl<P> Traversal<'_, P>
where
    P: FnMut(&Hop<'_>) -> bool,
{
    fn expand(&mut self, path: Vec<EntityId>) {
        let depth = path.len().saturating_sub(1);
        if depth >= self.max_depth {
            return;
        }
        let Some(&tip) = path.last() else {
            return;
        };
        let graph = self.graph;
        let Some(adjacent) = graph.outgoing.get(&tip) else {
            return;
        };
        // Push in reverse so the smallest entry is explored first.
        for (relation, to, edge) in adjacent.iter().rev() {
            if path.contains(to) {
                continue;
            }
            let hop = Hop {
                edge: *edge,
                from: tip,
                to: *to,
                relation,
                depth: depth.saturating_add(1),
            };
            if (self.predicate)(&hop) {
                let mut extended = path.clone();
                extended.push(*to);
                self.stack.push(extended);
            }
        }
    }
}

impl<P> Iterator for Traversal<'_, P>
where
    P: FnMut(&Hop<'_>) -> bool,
{
    type Item = Vec<EntityId>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(previous) = self.pending.take() {
            self.expand(previous);
        }
        while let Some(path) = self.stack.pop() {
            if path.len() > 1 {
                self.pending = Some(path.clone());
                return Some(path);
            }
            self.expand(path);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Actor, EntityKind, NodeLabel, Provenance};
    use chrono::Utc;
    use serde_json::json;

    fn node(id: EntityId) -> Entity {
        let now = Utc::now();
        Entity {
            id,
            kind: EntityKind::Node,
            version: 1,
            prev_version: None,
            payload: Payload::node(NodeLabel::Generic, json!({})),
            provenance: Provenance::new(now),
            created_by: Actor::System,
            tx_id: None,
            committed_at: now,
        }
    }

    fn edge(id: EntityId, version: u64, from: EntityId, to: EntityId, relation: &str) -> Entity {
        Entity {
            kind: EntityKind::Edge,
            version,
            payload: Payload::edge(from, to, relation),
            ..node(id)
        }
    }

    fn chain(len: usize) -> (GraphIndex, Vec<EntityId>) {
        let mut graph = GraphIndex::new();
        let ids: Vec<EntityId> = (0..len).map(|_| EntityId::new()).collect();
        for id in &ids {
            graph.apply(&node(*id));
        }
        for pair in ids.windows(2) {
            graph.apply(&edge(EntityId::new(), 1, pair[0], pair[1], "next"));
        }
        (graph, ids)
    }

    #[test]
    fn neighbors_filter_by_relation() {
        let mut graph = GraphIndex::new();
        let (a, b, c) = (EntityId::new(), EntityId::new(), EntityId::new());
        for id in [a, b, c] {
            graph.apply(&node(id));
        }
        graph.apply(&edge(EntityId::new(), 1, a, b, "supports"));
        graph.apply(&edge(EntityId::new(), 1, a, c, "contradicts"));

        assert_eq!(graph.neighbors(a, None), BTreeSet::from([b, c]));
        assert_eq!(graph.neighbors(a, Some("supports")), BTreeSet::from([b]));
        assert_eq!(graph.incoming(c, None), BTreeSet::from([a]));
        assert!(graph.neighbors(b, None).is_empty());
        assert_eq!(graph.edge_count(), 2);
        assert!(graph.contains_node(c));
        assert!(!graph.contains_edge(c));
    }

    #[test]
    fn tombstones_leave_the_index() {
        let mut graph = GraphIndex::new();
        let (a, b) = (EntityId::new(), EntityId::new());
        let e = EntityId::new();
        graph.apply(&node(a));
        graph.apply(&node(b));
        graph.apply(&edge(e, 1, a, b, "supports"));
        assert_eq!(graph.incident_edges(b), BTreeSet::from([e]));

        graph.apply(&Entity {
            kind: EntityKind::Edge,
            version: 2,
            payload: Payload::Retired(EntityKind::Edge),
            ..node(e)
        });
        assert!(!graph.contains_edge(e));
        assert!(graph.neighbors(a, None).is_empty());
        assert!(graph.incoming(b, None).is_empty());

        graph.apply(&Entity {
            version: 2,
            payload: Payload::Retired(EntityKind::Node),
            ..node(b)
        });
        assert!(!graph.contains_node(b));
        assert_eq!(graph.node_count(), 1);
    }

    #[test]
    fn new_edge_version_moves_adjacency() {
        let mut graph = GraphIndex::new();
        let (a, b, c) = (EntityId::new(), EntityId::new(), EntityId::new());
        let e = EntityId::new();
        graph.apply(&edge(e, 1, a, b, "r"));
        graph.apply(&edge(e, 2, a, c, "r"));

        assert_eq!(graph.neighbors(a, None), BTreeSet::from([c]));
        assert!(graph.incoming(b, None).is_empty());
        assert_eq!(graph.edge_count(), 1);
    }

    #[test]
    fn traverse_respects_depth() {
        let (graph, ids) = chain(5);
        let paths: Vec<_> = graph.traverse(ids[0], 2, |_| true).collect();
        assert_eq!(paths.len(), 2);
        assert!(paths.iter().all(|p| p.len() <= 3));
        assert_eq!(paths[1], vec![ids[0], ids[1], ids[2]]);
    }

    #[test]
    fn traverse_terminates_on_cycles() {
        let (mut graph, ids) = chain(3);
        graph.apply(&edge(EntityId::new(), 1, ids[2], ids[0], "next"));

        let paths: Vec<_> = graph.traverse(ids[0], 50, |_| true).collect();
        // a->b, a->b->c; c->a would revisit a
        assert_eq!(paths.len(), 2);
    }

    #[test]
    fn traverse_honors_predicate_and_is_lazy() {
        let (graph, ids) = chain(4);
        let mut offered = 0;
        let first = graph
            .traverse(ids[0], 10, |hop| {
                offered += 1;
                hop.relation == "next"
            })
            .next();
        assert_eq!(first, Some(vec![ids[0], ids[1]]));
        assert_eq!(offered, 1);

        let none: Vec<_> = graph.traverse(ids[0], 10, |_| false).collect();
        assert!(none.is_empty());
    }

    #[test]
    fn traverse_unknown_start_is_empty() {
        let (graph, _) = chain(2);
        assert_eq!(graph.traverse(EntityId::new(), 3, |_| true).count(), 0);
    }

    #[test]
    fn path_between_finds_shortest_route() {
        let (mut graph, ids) = chain(4);
        graph.apply(&edge(EntityId::new(), 1, ids[0], ids[3], "jump"));
        assert_eq!(graph.path_between(ids[0], ids[3], 10), Some(vec![ids[0], ids[3]]));
        assert_eq!(graph.path_between(ids[3], ids[0], 10), None);
    }

    #[test]
    fn self_loops_are_reported() {
        let mut graph = GraphIndex::new();
        let a = EntityId::new();
        graph.apply(&node(a));
        let loop_edge = EntityId::new();
        graph.apply(&edge(loop_edge, 1, a, a, "reflects"));
        assert_eq!(graph.self_loops(a), vec![loop_edge]);
        // A self-loop never extends a path.
        assert_eq!(graph.traverse(a, 5, |_| true).count(), 0);
    }
}
