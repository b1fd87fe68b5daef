//! On-disk layout of a partitioned graph: binary shards per partition plus
//! one JSON manifest tying them together. The manifest is always written
//! last, so its existence implies every shard it references exists.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::info;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::err::{GraphFlowError, Result};
use crate::frame::FeatureFrame;
use crate::graph::CsrGraph;
use crate::partbook::{GraphPartitionBook, PartitionBook, RangePartitionBook};
use crate::{EdgeId, NodeId, PartId};

/// Files and counts for one partition, paths relative to the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartFiles {
    pub structure: String,
    pub node_feats: String,
    pub edge_feats: String,
    pub num_nodes: usize,
    pub num_edges: usize,
}

/// Top-level description of a partitioned graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionManifest {
    pub graph_name: String,
    pub num_parts: usize,
    pub num_hops: usize,
    pub num_nodes: usize,
    pub num_edges: usize,
    /// Whether global ids were reshuffled to partition-contiguous ranges.
    pub contiguous: bool,
    pub partition_book: String,
    pub parts: Vec<PartFiles>,
}

/// Raw partition book arrays as stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookData {
    pub num_parts: usize,
    pub contiguous: bool,
    pub node_map: Vec<PartId>,
    pub edge_map: Vec<PartId>,
}

impl BookData {
    /// Contiguous books get the binary-search flavor, everything else the
    /// full lookup table.
    pub fn into_book(self) -> Result<Arc<dyn PartitionBook>> {
        if self.contiguous {
            let node_starts = boundaries(&self.node_map, self.num_parts)?;
            let edge_starts = boundaries(&self.edge_map, self.num_parts)?;
            Ok(Arc::new(RangePartitionBook::new(node_starts, edge_starts)?))
        } else {
            Ok(Arc::new(GraphPartitionBook::new(
                self.num_parts,
                self.node_map,
                self.edge_map,
            )?))
        }
    }
}

fn boundaries(map: &[PartId], num_parts: usize) -> Result<Vec<u64>> {
    let mut counts = vec![0u64; num_parts];
    for (i, &owner) in map.iter().enumerate() {
        if owner >= num_parts {
            return Err(GraphFlowError::config(format!(
                "map entry {} exceeds partition count {}",
                owner, num_parts
            )));
        }
        if i > 0 && map[i - 1] > owner {
            return Err(GraphFlowError::config(
                "contiguous book requires a sorted ownership map",
            ));
        }
        counts[owner] += 1;
    }
    let mut starts = vec![0u64; num_parts + 1];
    for p in 0..num_parts {
        starts[p + 1] = starts[p] + counts[p];
    }
    Ok(starts)
}

/// Per-partition structure shard: the local adjacency plus the arrays that
/// tie local ids back to global ones. Owned nodes come first (ascending
/// global id), halo nodes after (ascending global id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartStructure {
    pub part_id: PartId,
    pub graph: CsrGraph,
    pub global_nids: Vec<NodeId>,
    pub global_eids: Vec<EdgeId>,
    /// True for owned (inner) nodes, false for halo replicas.
    pub inner_node: Vec<bool>,
    pub num_owned_nodes: usize,
}

/// Everything a server needs after loading its partition.
pub struct LoadedPartition {
    pub part_id: PartId,
    pub graph: Arc<CsrGraph>,
    pub global_nids: Vec<NodeId>,
    pub global_eids: Vec<EdgeId>,
    pub inner_node: Vec<bool>,
    pub num_owned_nodes: usize,
    pub node_feats: FeatureFrame,
    pub edge_feats: FeatureFrame,
    pub book: Arc<dyn PartitionBook>,
    pub manifest: PartitionManifest,
}

pub(crate) fn write_bin<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let file = File::create(path)?;
    bincode::serialize_into(BufWriter::new(file), value)
        .map_err(|e| GraphFlowError::internal(format!("write {}: {}", path.display(), e)))
}

pub(crate) fn read_bin<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path)?;
    bincode::deserialize_from(BufReader::new(file))
        .map_err(|e| GraphFlowError::Deserialization(format!("read {}: {}", path.display(), e)))
}

pub fn load_manifest(manifest_path: &Path) -> Result<PartitionManifest> {
    let file = File::open(manifest_path)?;
    serde_json::from_reader(BufReader::new(file))
        .map_err(|e| GraphFlowError::Deserialization(format!("{}: {}", manifest_path.display(), e)))
}

pub(crate) fn write_manifest(manifest_path: &Path, manifest: &PartitionManifest) -> Result<()> {
    let file = File::create(manifest_path)?;
    serde_json::to_writer_pretty(BufWriter::new(file), manifest)
        .map_err(|e| GraphFlowError::internal(format!("{}: {}", manifest_path.display(), e)))
}

/// Load only the shared partition book, which is all a routing-side client
/// needs.
pub fn load_book(manifest_path: &Path) -> Result<Arc<dyn PartitionBook>> {
    let manifest = load_manifest(manifest_path)?;
    let base = manifest_path.parent().unwrap_or_else(|| Path::new("."));
    let book_data: BookData = read_bin(&base.join(&manifest.partition_book))?;
    book_data.into_book()
}

/// Load one partition referenced by a manifest: its local graph, feature
/// shards and the shared partition book.
pub fn load_partition(manifest_path: &Path, part_id: PartId) -> Result<LoadedPartition> {
    let manifest = load_manifest(manifest_path)?;
    if part_id >= manifest.num_parts {
        return Err(GraphFlowError::config(format!(
            "partition {} out of range, graph {:?} has {} partitions",
            part_id, manifest.graph_name, manifest.num_parts
        )));
    }
    let base = manifest_path.parent().unwrap_or_else(|| Path::new("."));
    let book_data: BookData = read_bin(&base.join(&manifest.partition_book))?;
    let book = book_data.into_book()?;

    let files = &manifest.parts[part_id];
    let structure: PartStructure = read_bin(&base.join(&files.structure))?;
    if structure.part_id != part_id {
        return Err(GraphFlowError::Deserialization(format!(
            "structure shard claims partition {}, expected {}",
            structure.part_id, part_id
        )));
    }
    let node_feats: FeatureFrame = read_bin(&base.join(&files.node_feats))?;
    let edge_feats: FeatureFrame = read_bin(&base.join(&files.edge_feats))?;

    info!(
        "loaded partition {} of {:?}: {} local node(s) ({} owned), {} local edge(s)",
        part_id,
        manifest.graph_name,
        structure.global_nids.len(),
        structure.num_owned_nodes,
        structure.global_eids.len()
    );

    Ok(LoadedPartition {
        part_id,
        graph: Arc::new(structure.graph),
        global_nids: structure.global_nids,
        global_eids: structure.global_eids,
        inner_node: structure.inner_node,
        num_owned_nodes: structure.num_owned_nodes,
        node_feats,
        edge_feats,
        book,
        manifest,
    })
}

pub(crate) fn manifest_path(out_dir: &Path, name: &str) -> PathBuf {
    out_dir.join(name).join(format!("{}.json", name))
}
