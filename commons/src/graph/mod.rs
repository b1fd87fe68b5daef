use std::str::FromStr;
use std::sync::{Arc, Weak};

use fnv::{FnvHashMap, FnvHashSet};
use serde::{Deserialize, Serialize};

use crate::err::{GraphFlowError, Result};
use crate::{EdgeId, NodeId};

/// Which adjacency a traversal follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    In,
    Out,
    Both,
}

impl FromStr for Direction {
    type Err = GraphFlowError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "in" => Ok(Direction::In),
            "out" => Ok(Direction::Out),
            "both" => Ok(Direction::Both),
            other => Err(GraphFlowError::config(format!(
                "unknown neighbor direction {:?}, expected in/out/both",
                other
            ))),
        }
    }
}

/// The single-machine graph capability consumed by samplers and the
/// partitioner: adjacency queries over an immutable graph.
pub trait GraphIndex: Send + Sync {
    fn num_nodes(&self) -> usize;
    fn num_edges(&self) -> usize;
    fn is_readonly(&self) -> bool;

    /// Adjacent `(neighbor, edge_id)` pairs of a node.
    fn neighbors(&self, node: NodeId, dir: Direction) -> Vec<(NodeId, EdgeId)>;

    fn degree(&self, node: NodeId, dir: Direction) -> usize;
}

/// Immutable CSR adjacency over a global edge list. Edge ids are positions
/// in the original edge list; both in- and out-adjacency are materialized.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CsrGraph {
    num_nodes: usize,
    src: Vec<NodeId>,
    dst: Vec<NodeId>,
    out_indptr: Vec<usize>,
    out_edges: Vec<usize>,
    in_indptr: Vec<usize>,
    in_edges: Vec<usize>,
}

impl CsrGraph {
    pub fn from_edges(num_nodes: usize, edges: &[(NodeId, NodeId)]) -> Result<Self> {
        for &(u, v) in edges {
            if u as usize >= num_nodes || v as usize >= num_nodes {
                return Err(GraphFlowError::config(format!(
                    "edge ({}, {}) references a node outside [0, {})",
                    u, v, num_nodes
                )));
            }
        }
        let src: Vec<NodeId> = edges.iter().map(|&(u, _)| u).collect();
        let dst: Vec<NodeId> = edges.iter().map(|&(_, v)| v).collect();
        let (out_indptr, out_edges) = Self::build_csr(num_nodes, &src);
        let (in_indptr, in_edges) = Self::build_csr(num_nodes, &dst);
        Ok(CsrGraph {
            num_nodes,
            src,
            dst,
            out_indptr,
            out_edges,
            in_indptr,
            in_edges,
        })
    }

    fn build_csr(num_nodes: usize, keys: &[NodeId]) -> (Vec<usize>, Vec<usize>) {
        let mut indptr = vec![0usize; num_nodes + 1];
        for &k in keys {
            indptr[k as usize + 1] += 1;
        }
        for i in 0..num_nodes {
            indptr[i + 1] += indptr[i];
        }
        let mut cursor = indptr.clone();
        let mut edges = vec![0usize; keys.len()];
        for (eid, &k) in keys.iter().enumerate() {
            edges[cursor[k as usize]] = eid;
            cursor[k as usize] += 1;
        }
        (indptr, edges)
    }

    pub fn edge_endpoints(&self, edge: EdgeId) -> Result<(NodeId, NodeId)> {
        let idx = edge as usize;
        if idx >= self.src.len() {
            return Err(GraphFlowError::OutOfRange {
                id: edge,
                count: self.src.len() as u64,
            });
        }
        Ok((self.src[idx], self.dst[idx]))
    }

    fn adjacency(&self, node: NodeId, dir: Direction) -> Vec<(NodeId, EdgeId)> {
        let v = node as usize;
        let pick = |indptr: &[usize], edges: &[usize], incoming: bool| {
            edges[indptr[v]..indptr[v + 1]]
                .iter()
                .map(|&e| {
                    let other = if incoming { self.src[e] } else { self.dst[e] };
                    (other, e as EdgeId)
                })
                .collect::<Vec<_>>()
        };
        match dir {
            Direction::In => pick(&self.in_indptr, &self.in_edges, true),
            Direction::Out => pick(&self.out_indptr, &self.out_edges, false),
            Direction::Both => {
                let mut all = pick(&self.in_indptr, &self.in_edges, true);
                all.extend(pick(&self.out_indptr, &self.out_edges, false));
                all
            }
        }
    }

    /// Induced subgraph over `nodes` (first occurrence wins on duplicates).
    /// The view holds a weak back-reference to this graph so parent and
    /// child never form an ownership cycle.
    pub fn subgraph(self: &Arc<Self>, nodes: &[NodeId]) -> Result<Subgraph> {
        let mut induced_nodes = Vec::with_capacity(nodes.len());
        let mut local_of = FnvHashMap::default();
        for &n in nodes {
            if n as usize >= self.num_nodes {
                return Err(GraphFlowError::OutOfRange {
                    id: n,
                    count: self.num_nodes as u64,
                });
            }
            if !local_of.contains_key(&n) {
                local_of.insert(n, induced_nodes.len() as NodeId);
                induced_nodes.push(n);
            }
        }
        let mut induced_edges = Vec::new();
        let mut local_edges = Vec::new();
        for eid in 0..self.src.len() {
            if let (Some(&u), Some(&v)) = (local_of.get(&self.src[eid]), local_of.get(&self.dst[eid]))
            {
                induced_edges.push(eid as EdgeId);
                local_edges.push((u, v));
            }
        }
        let graph = CsrGraph::from_edges(induced_nodes.len(), &local_edges)?;
        Ok(Subgraph {
            parent: Arc::downgrade(self),
            graph,
            induced_nodes,
            induced_edges,
        })
    }
}

impl GraphIndex for CsrGraph {
    fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    fn num_edges(&self) -> usize {
        self.src.len()
    }

    fn is_readonly(&self) -> bool {
        true
    }

    fn neighbors(&self, node: NodeId, dir: Direction) -> Vec<(NodeId, EdgeId)> {
        self.adjacency(node, dir)
    }

    fn degree(&self, node: NodeId, dir: Direction) -> usize {
        let v = node as usize;
        match dir {
            Direction::In => self.in_indptr[v + 1] - self.in_indptr[v],
            Direction::Out => self.out_indptr[v + 1] - self.out_indptr[v],
            Direction::Both => self.degree(node, Direction::In) + self.degree(node, Direction::Out),
        }
    }
}

/// A node-induced view of a parent graph. Holds the induced global id
/// arrays plus a relabeled local adjacency; the parent reference is weak.
pub struct Subgraph {
    parent: Weak<CsrGraph>,
    graph: CsrGraph,
    induced_nodes: Vec<NodeId>,
    induced_edges: Vec<EdgeId>,
}

impl Subgraph {
    pub fn parent(&self) -> Option<Arc<CsrGraph>> {
        self.parent.upgrade()
    }

    pub fn graph(&self) -> &CsrGraph {
        &self.graph
    }

    /// Parent-graph node ids, indexed by local id.
    pub fn induced_nodes(&self) -> &[NodeId] {
        &self.induced_nodes
    }

    /// Parent-graph edge ids, indexed by local edge id.
    pub fn induced_edges(&self) -> &[EdgeId] {
        &self.induced_edges
    }
}

/// Remove duplicates preserving first-occurrence order.
pub fn unique_in_order(ids: &[NodeId]) -> Vec<NodeId> {
    let mut seen = FnvHashSet::default();
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diamond() -> CsrGraph {
        // 0 -> 1, 0 -> 2, 1 -> 3, 2 -> 3
        CsrGraph::from_edges(4, &[(0, 1), (0, 2), (1, 3), (2, 3)]).unwrap()
    }

    #[test]
    fn adjacency_by_direction() {
        let g = diamond();
        assert_eq!(g.num_nodes(), 4);
        assert_eq!(g.num_edges(), 4);
        assert_eq!(g.neighbors(3, Direction::In), vec![(1, 2), (2, 3)]);
        assert_eq!(g.neighbors(0, Direction::Out), vec![(1, 0), (2, 1)]);
        assert_eq!(g.degree(3, Direction::In), 2);
        assert_eq!(g.degree(0, Direction::Both), 2);
        let mut both = g.neighbors(1, Direction::Both);
        both.sort_unstable();
        assert_eq!(both, vec![(0, 0), (3, 2)]);
    }

    #[test]
    fn rejects_edges_outside_node_range() {
        assert!(CsrGraph::from_edges(2, &[(0, 2)]).is_err());
    }

    #[test]
    fn subgraph_induces_nodes_and_edges() {
        let g = Arc::new(diamond());
        let sg = g.subgraph(&[0, 1, 3]).unwrap();
        assert_eq!(sg.induced_nodes(), &[0, 1, 3]);
        assert_eq!(sg.induced_edges(), &[0, 2]); // 0->1 and 1->3
        assert_eq!(sg.graph().num_nodes(), 3);
        assert_eq!(sg.graph().neighbors(2, Direction::In), vec![(1, 1)]);
        assert!(sg.parent().is_some());
    }

    #[test]
    fn subgraph_parent_reference_is_weak() {
        let g = Arc::new(diamond());
        let sg = g.subgraph(&[0, 1]).unwrap();
        drop(g);
        assert!(sg.parent().is_none());
        // The induced arrays remain usable without the parent.
        assert_eq!(sg.induced_nodes(), &[0, 1]);
    }
}
