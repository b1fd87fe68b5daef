//! Offline partitioning: cut the graph with a pluggable method, expand each
//! part by halo rings for k-hop locality, renumber to dense local ids, and
//! emit per-partition shards plus the partition book.

pub mod manifest;

use std::fs;
use std::path::{Path, PathBuf};

use fnv::{FnvHashMap, FnvHashSet};
use log::{debug, info};
use rand::Rng;

use crate::err::{GraphFlowError, Result};
use crate::frame::FeatureFrame;
use crate::graph::{CsrGraph, Direction, GraphIndex};
use crate::{EdgeId, NodeId, PartId};

pub use manifest::{
    load_book, load_manifest, load_partition, BookData, LoadedPartition, PartFiles,
    PartStructure, PartitionManifest,
};

/// The external cut algorithm, treated as a black box producing one owner
/// per node. Implementations validate their own inputs before returning.
pub trait PartitionMethod: Send + Sync {
    fn name(&self) -> &'static str;
    fn assign(&self, graph: &CsrGraph, num_parts: usize) -> Result<Vec<PartId>>;
}

/// Uniform random assignment. Useless for locality, handy for tests and as
/// the baseline the cut heuristics are measured against.
#[derive(Debug, Default)]
pub struct RandomPartition;

impl PartitionMethod for RandomPartition {
    fn name(&self) -> &'static str {
        "random"
    }

    fn assign(&self, graph: &CsrGraph, num_parts: usize) -> Result<Vec<PartId>> {
        let mut rng = rand::rng();
        Ok((0..graph.num_nodes())
            .map(|_| rng.random_range(0..num_parts))
            .collect())
    }
}

/// Greedy edge-cut heuristic: order nodes by BFS over the undirected
/// adjacency, then cut the order into weight-balanced contiguous runs.
/// Neighboring nodes land in the same part far more often than random.
#[derive(Debug, Default)]
pub struct EdgeCutPartition {
    node_weights: Option<Vec<f64>>,
}

impl EdgeCutPartition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Balance parts by per-node weights instead of node counts.
    pub fn with_node_weights(node_weights: Vec<f64>) -> Self {
        EdgeCutPartition {
            node_weights: Some(node_weights),
        }
    }
}

impl PartitionMethod for EdgeCutPartition {
    fn name(&self) -> &'static str {
        "edge-cut"
    }

    fn assign(&self, graph: &CsrGraph, num_parts: usize) -> Result<Vec<PartId>> {
        let n = graph.num_nodes();
        if let Some(w) = &self.node_weights {
            if w.len() != n {
                return Err(GraphFlowError::config(format!(
                    "{} node weights for a graph of {} nodes",
                    w.len(),
                    n
                )));
            }
            if w.iter().any(|&x| x < 0.0) {
                return Err(GraphFlowError::config("node weights must be non-negative"));
            }
        }

        // BFS visitation order across all components.
        let mut order = Vec::with_capacity(n);
        let mut visited = vec![false; n];
        for start in 0..n {
            if visited[start] {
                continue;
            }
            visited[start] = true;
            let mut queue = std::collections::VecDeque::from([start as NodeId]);
            while let Some(v) = queue.pop_front() {
                order.push(v);
                for (u, _) in graph.neighbors(v, Direction::Both) {
                    if !visited[u as usize] {
                        visited[u as usize] = true;
                        queue.push_back(u);
                    }
                }
            }
        }

        let weight = |v: NodeId| -> f64 {
            self.node_weights
                .as_ref()
                .map(|w| w[v as usize])
                .unwrap_or(1.0)
        };
        let total: f64 = order.iter().map(|&v| weight(v)).sum();
        let mut assignment = vec![0; n];
        let mut accumulated = 0.0;
        for &v in &order {
            let part = ((accumulated / total) * num_parts as f64) as usize;
            assignment[v as usize] = part.min(num_parts - 1);
            accumulated += weight(v);
        }
        Ok(assignment)
    }
}

/// Cut `graph` into `num_parts` partitions and write the on-disk layout
/// under `out_dir/name/`. Halo rings of depth `num_hops` are replicated
/// into each part so local k-hop sampling needs no remote calls. With
/// `contiguous` set, global ids are reshuffled so each part owns contiguous
/// node/edge ranges (enabling the binary-search partition book).
///
/// All configuration errors surface before anything touches the
/// filesystem, and the manifest goes last: a crash mid-emission leaves
/// shards without a manifest, never the reverse.
#[allow(clippy::too_many_arguments)]
pub fn partition_graph(
    graph: &CsrGraph,
    name: &str,
    num_parts: usize,
    out_dir: &Path,
    num_hops: usize,
    method: &dyn PartitionMethod,
    node_feats: Option<&FeatureFrame>,
    edge_feats: Option<&FeatureFrame>,
    contiguous: bool,
) -> Result<PathBuf> {
    let num_nodes = graph.num_nodes();
    let num_edges = graph.num_edges();
    if num_parts == 0 {
        return Err(GraphFlowError::config("num_parts must be at least 1"));
    }
    if name.is_empty() {
        return Err(GraphFlowError::config("graph name must not be empty"));
    }
    if let Some(frame) = node_feats {
        if frame.num_rows() != num_nodes {
            return Err(GraphFlowError::config(format!(
                "node features have {} rows for {} nodes",
                frame.num_rows(),
                num_nodes
            )));
        }
    }
    if let Some(frame) = edge_feats {
        if frame.num_rows() != num_edges {
            return Err(GraphFlowError::config(format!(
                "edge features have {} rows for {} edges",
                frame.num_rows(),
                num_edges
            )));
        }
    }

    let assignment = method.assign(graph, num_parts)?;
    if assignment.len() != num_nodes {
        return Err(GraphFlowError::config(format!(
            "method {:?} assigned {} nodes out of {}",
            method.name(),
            assignment.len(),
            num_nodes
        )));
    }
    if let Some(&bad) = assignment.iter().find(|&&p| p >= num_parts) {
        return Err(GraphFlowError::config(format!(
            "method {:?} produced partition id {} >= {}",
            method.name(),
            bad,
            num_parts
        )));
    }
    info!(
        "partitioning {:?}: {} nodes, {} edges into {} part(s) via {} (hops={}, contiguous={})",
        name, num_nodes, num_edges, num_parts, method.name(), num_hops, contiguous
    );

    // Optionally reshuffle global ids so ownership becomes range-contiguous.
    let owned_graph;
    let owned_node_feats;
    let owned_edge_feats;
    let (graph, assignment, node_feats, edge_feats) = if contiguous {
        let (g, a, nf, ef) = reshuffle_contiguous(graph, &assignment, node_feats, edge_feats)?;
        owned_graph = g;
        owned_node_feats = nf;
        owned_edge_feats = ef;
        (
            &owned_graph,
            a,
            owned_node_feats.as_ref(),
            owned_edge_feats.as_ref(),
        )
    } else {
        (graph, assignment, node_feats, edge_feats)
    };

    // Edges follow their destination's owner.
    let mut edge_map = Vec::with_capacity(num_edges);
    for e in 0..num_edges as u64 {
        let (_, dst) = graph.edge_endpoints(e)?;
        edge_map.push(assignment[dst as usize]);
    }

    let graph_dir = out_dir.join(name);
    fs::create_dir_all(&graph_dir)?;

    let mut parts = Vec::with_capacity(num_parts);
    for part_id in 0..num_parts {
        let files = emit_partition(
            graph,
            &graph_dir,
            part_id,
            &assignment,
            &edge_map,
            num_hops,
            node_feats,
            edge_feats,
        )?;
        parts.push(files);
    }

    let book_file = format!("{}.book.bin", name);
    manifest::write_bin(
        &graph_dir.join(&book_file),
        &BookData {
            num_parts,
            contiguous,
            node_map: assignment,
            edge_map,
        },
    )?;

    let manifest = PartitionManifest {
        graph_name: name.to_string(),
        num_parts,
        num_hops,
        num_nodes,
        num_edges,
        contiguous,
        partition_book: book_file,
        parts,
    };
    let manifest_file = manifest::manifest_path(out_dir, name);
    manifest::write_manifest(&manifest_file, &manifest)?;
    info!("wrote manifest {}", manifest_file.display());
    Ok(manifest_file)
}

/// Renumber nodes and edges so each partition owns one contiguous id range,
/// returning the remapped graph, ownership array and reordered features.
fn reshuffle_contiguous(
    graph: &CsrGraph,
    assignment: &[PartId],
    node_feats: Option<&FeatureFrame>,
    edge_feats: Option<&FeatureFrame>,
) -> Result<(CsrGraph, Vec<PartId>, Option<FeatureFrame>, Option<FeatureFrame>)> {
    let num_nodes = graph.num_nodes();

    let mut node_order: Vec<NodeId> = (0..num_nodes as u64).collect();
    node_order.sort_by_key(|&v| (assignment[v as usize], v));
    let mut old2new = vec![0 as NodeId; num_nodes];
    for (new_id, &old_id) in node_order.iter().enumerate() {
        old2new[old_id as usize] = new_id as NodeId;
    }

    let mut endpoints = Vec::with_capacity(graph.num_edges());
    for e in 0..graph.num_edges() as u64 {
        endpoints.push(graph.edge_endpoints(e)?);
    }
    let mut edge_order: Vec<EdgeId> = (0..graph.num_edges() as u64).collect();
    edge_order.sort_by_key(|&e| {
        let (_, dst) = endpoints[e as usize];
        (assignment[dst as usize], e)
    });
    let edges: Vec<(NodeId, NodeId)> = edge_order
        .iter()
        .map(|&e| {
            let (src, dst) = endpoints[e as usize];
            (old2new[src as usize], old2new[dst as usize])
        })
        .collect();

    let new_assignment: Vec<PartId> = node_order.iter().map(|&v| assignment[v as usize]).collect();
    let new_graph = CsrGraph::from_edges(num_nodes, &edges)?;
    let new_node_feats = node_feats.map(|f| f.gather_rows(&node_order)).transpose()?;
    let new_edge_feats = edge_feats.map(|f| f.gather_rows(&edge_order)).transpose()?;
    Ok((new_graph, new_assignment, new_node_feats, new_edge_feats))
}

#[allow(clippy::too_many_arguments)]
fn emit_partition(
    graph: &CsrGraph,
    graph_dir: &Path,
    part_id: PartId,
    node_map: &[PartId],
    edge_map: &[PartId],
    num_hops: usize,
    node_feats: Option<&FeatureFrame>,
    edge_feats: Option<&FeatureFrame>,
) -> Result<PartFiles> {
    let owned: Vec<NodeId> = node_map
        .iter()
        .enumerate()
        .filter(|(_, &p)| p == part_id)
        .map(|(v, _)| v as NodeId)
        .collect();

    // Halo expansion: everything reachable within num_hops of an owned node.
    let mut local_set: FnvHashSet<NodeId> = owned.iter().copied().collect();
    let mut frontier = owned.clone();
    for _ in 0..num_hops {
        let mut next = Vec::new();
        for &v in &frontier {
            for (u, _) in graph.neighbors(v, Direction::Both) {
                if local_set.insert(u) {
                    next.push(u);
                }
            }
        }
        frontier = next;
    }
    let mut halo: Vec<NodeId> = local_set
        .iter()
        .copied()
        .filter(|v| node_map[*v as usize] != part_id)
        .collect();
    halo.sort_unstable();

    // Owned first, halo after, both ascending; the partition book's
    // local-id mapping depends on this order.
    let mut global_nids = owned.clone();
    global_nids.extend_from_slice(&halo);
    let mut local_of = FnvHashMap::default();
    for (local, &gid) in global_nids.iter().enumerate() {
        local_of.insert(gid, local as NodeId);
    }
    let inner_node: Vec<bool> = global_nids
        .iter()
        .map(|&v| node_map[v as usize] == part_id)
        .collect();

    // Induced edges over the local node set, ascending global edge id.
    let mut global_eids = Vec::new();
    let mut local_edges = Vec::new();
    for e in 0..graph.num_edges() as u64 {
        let (src, dst) = graph.edge_endpoints(e)?;
        if let (Some(&ls), Some(&ld)) = (local_of.get(&src), local_of.get(&dst)) {
            global_eids.push(e);
            local_edges.push((ls, ld));
        }
    }
    let local_graph = CsrGraph::from_edges(global_nids.len(), &local_edges)?;

    let owned_edges: Vec<EdgeId> = edge_map
        .iter()
        .enumerate()
        .filter(|(_, &p)| p == part_id)
        .map(|(e, _)| e as EdgeId)
        .collect();

    debug!(
        "partition {}: {} owned + {} halo node(s), {} induced edge(s)",
        part_id,
        owned.len(),
        halo.len(),
        global_eids.len()
    );

    let part_dir = graph_dir.join(format!("part{}", part_id));
    fs::create_dir_all(&part_dir)?;

    let structure = PartStructure {
        part_id,
        graph: local_graph,
        global_nids,
        global_eids,
        inner_node,
        num_owned_nodes: owned.len(),
    };
    let structure_file = format!("part{}/graph.bin", part_id);
    manifest::write_bin(&graph_dir.join(&structure_file), &structure)?;

    let node_shard = match node_feats {
        Some(frame) => frame.gather_rows(&owned)?,
        None => FeatureFrame::new(owned.len()),
    };
    let node_file = format!("part{}/node_feat.bin", part_id);
    manifest::write_bin(&graph_dir.join(&node_file), &node_shard)?;

    let edge_shard = match edge_feats {
        Some(frame) => frame.gather_rows(&owned_edges)?,
        None => FeatureFrame::new(owned_edges.len()),
    };
    let edge_file = format!("part{}/edge_feat.bin", part_id);
    manifest::write_bin(&graph_dir.join(&edge_file), &edge_shard)?;

    Ok(PartFiles {
        structure: structure_file,
        node_feats: node_file,
        edge_feats: edge_file,
        num_nodes: owned.len(),
        num_edges: owned_edges.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partbook::PartitionBook;
    use crate::tensor::Tensor;

    fn grid_graph(n: usize) -> CsrGraph {
        // A path graph with both directions, plenty of locality to cut.
        let mut edges = Vec::new();
        for i in 0..(n as u64 - 1) {
            edges.push((i, i + 1));
            edges.push((i + 1, i));
        }
        CsrGraph::from_edges(n, &edges).unwrap()
    }

    fn labels(n: usize) -> FeatureFrame {
        let mut frame = FeatureFrame::new(n);
        let values: Vec<i64> = (0..n as i64).collect();
        frame.insert("labels", Tensor::from_slice(&values)).unwrap();
        frame
    }

    #[test]
    fn partition_and_reload_preserves_counts() {
        let dir = tempfile::tempdir().unwrap();
        let graph = grid_graph(10_000);
        let feats = labels(10_000);
        let manifest_path = partition_graph(
            &graph,
            "grid",
            4,
            dir.path(),
            2,
            &EdgeCutPartition::new(),
            Some(&feats),
            None,
            false,
        )
        .unwrap();

        let manifest = load_manifest(&manifest_path).unwrap();
        assert_eq!(manifest.num_parts, 4);
        assert_eq!(manifest.num_nodes, 10_000);
        let mut total_owned = 0;
        for part_id in 0..4 {
            let part = load_partition(&manifest_path, part_id).unwrap();
            assert_eq!(part.book.num_partitions(), 4);
            let meta = part.book.metadata().to_vec();
            assert_eq!(
                part.book.partid2nids(part_id).unwrap().len(),
                meta[part_id].num_nodes
            );
            assert_eq!(part.num_owned_nodes, meta[part_id].num_nodes);
            // Owned nodes map straight back to local ranks 0..k.
            let owned: Vec<u64> = part.global_nids[..part.num_owned_nodes].to_vec();
            let locals = part.book.nid2localnid(&owned, part_id).unwrap();
            assert_eq!(locals, (0..owned.len() as u64).collect::<Vec<_>>());
            // Feature shard rows line up with owned nodes.
            assert_eq!(part.node_feats.num_rows(), part.num_owned_nodes);
            let got = part
                .node_feats
                .get("labels", &[0])
                .unwrap()
                .to_vec::<i64>()
                .unwrap();
            assert_eq!(got[0], owned[0] as i64);
            total_owned += part.num_owned_nodes;
        }
        assert_eq!(total_owned, 10_000);
    }

    #[test]
    fn halo_depth_covers_requested_hops() {
        let dir = tempfile::tempdir().unwrap();
        let graph = grid_graph(40);
        let manifest_path = partition_graph(
            &graph,
            "halo",
            2,
            dir.path(),
            2,
            &EdgeCutPartition::new(),
            None,
            None,
            false,
        )
        .unwrap();
        let part = load_partition(&manifest_path, 0).unwrap();
        // Every in-neighbor within 2 hops of an owned node is local.
        let local: FnvHashSet<u64> = part.global_nids.iter().copied().collect();
        for &v in &part.global_nids[..part.num_owned_nodes] {
            for (u, _) in graph.neighbors(v, Direction::In) {
                assert!(local.contains(&u));
                for (w, _) in graph.neighbors(u, Direction::In) {
                    assert!(local.contains(&w));
                }
            }
        }
        assert!(part.inner_node[..part.num_owned_nodes].iter().all(|&b| b));
        assert!(part.inner_node[part.num_owned_nodes..].iter().all(|&b| !b));
    }

    #[test]
    fn contiguous_mode_yields_range_book() {
        let dir = tempfile::tempdir().unwrap();
        let graph = grid_graph(60);
        let feats = labels(60);
        let manifest_path = partition_graph(
            &graph,
            "ranges",
            3,
            dir.path(),
            1,
            &EdgeCutPartition::new(),
            Some(&feats),
            None,
            true,
        )
        .unwrap();
        let part = load_partition(&manifest_path, 1).unwrap();
        // Ownership map is sorted, so each part owns one contiguous range.
        let owned = part.book.partid2nids(1).unwrap();
        let first = owned[0];
        assert_eq!(
            owned,
            (first..first + owned.len() as u64).collect::<Vec<_>>()
        );
        let sum: usize = part.book.metadata().iter().map(|m| m.num_nodes).sum();
        assert_eq!(sum, 60);
    }

    #[test]
    fn config_errors_precede_io() {
        let dir = tempfile::tempdir().unwrap();
        let graph = grid_graph(10);
        let bad_feats = labels(7);
        let err = partition_graph(
            &graph,
            "bad",
            2,
            dir.path(),
            1,
            &EdgeCutPartition::new(),
            Some(&bad_feats),
            None,
            false,
        );
        assert!(matches!(err, Err(GraphFlowError::Config(_))));
        // Nothing was written, not even the graph directory.
        assert!(!dir.path().join("bad").exists());
    }

    #[test]
    fn weighted_method_validates_weight_length() {
        let graph = grid_graph(10);
        let method = EdgeCutPartition::with_node_weights(vec![1.0; 3]);
        assert!(matches!(
            method.assign(&graph, 2),
            Err(GraphFlowError::Config(_))
        ));
    }

    #[test]
    fn edge_cut_beats_random_on_locality() {
        let graph = grid_graph(200);
        let cut_edges = |assignment: &[PartId]| -> usize {
            (0..graph.num_edges() as u64)
                .filter(|&e| {
                    let (s, d) = graph.edge_endpoints(e).unwrap();
                    assignment[s as usize] != assignment[d as usize]
                })
                .count()
        };
        let greedy = EdgeCutPartition::new().assign(&graph, 4).unwrap();
        let random = RandomPartition.assign(&graph, 4).unwrap();
        assert!(cut_edges(&greedy) < cut_edges(&random));
    }
}
