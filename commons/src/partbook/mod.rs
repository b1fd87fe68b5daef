use fnv::FnvHashMap;

use crate::err::{GraphFlowError, Result};
use crate::{EdgeId, NodeId, PartId};

/// Per-partition summary derived from the node/edge maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PartitionMetadata {
    pub num_nodes: usize,
    pub num_edges: usize,
}

/// Authoritative global-id to (partition, local-id) mapping. Built once from
/// the partitioner's output and read-only for the lifetime of a run; every
/// server and client shares it by reference.
pub trait PartitionBook: Send + Sync {
    fn num_partitions(&self) -> usize;

    /// Vectorised owner lookup for global node ids.
    fn nid2partid(&self, ids: &[NodeId]) -> Result<Vec<PartId>>;

    /// Vectorised owner lookup for global edge ids.
    fn eid2partid(&self, ids: &[EdgeId]) -> Result<Vec<PartId>>;

    /// Local ids of global node ids within `part_id`. Defined only for ids
    /// owned by that partition; a foreign id is an error, never a silent
    /// wrong answer.
    fn nid2localnid(&self, ids: &[NodeId], part_id: PartId) -> Result<Vec<u64>>;

    fn eid2localeid(&self, ids: &[EdgeId], part_id: PartId) -> Result<Vec<u64>>;

    /// All global node ids owned by a partition, in local-id order.
    fn partid2nids(&self, part_id: PartId) -> Result<Vec<NodeId>>;

    fn partid2eids(&self, part_id: PartId) -> Result<Vec<EdgeId>>;

    fn metadata(&self) -> &[PartitionMetadata];
}

fn check_part(part_id: PartId, num_parts: usize) -> Result<()> {
    if part_id >= num_parts {
        return Err(GraphFlowError::config(format!(
            "partition id {} out of range, book has {} partitions",
            part_id, num_parts
        )));
    }
    Ok(())
}

/// Map-backed partition book: one owner entry per global id. Local ids are
/// ranks among a partition's owned ids in ascending global order, matching
/// the order the partitioner writes per-partition files.
pub struct GraphPartitionBook {
    num_parts: usize,
    node_map: Vec<PartId>,
    edge_map: Vec<PartId>,
    nids_per_part: Vec<Vec<NodeId>>,
    eids_per_part: Vec<Vec<EdgeId>>,
    node_local: FnvHashMap<NodeId, u64>,
    edge_local: FnvHashMap<EdgeId, u64>,
    meta: Vec<PartitionMetadata>,
}

impl GraphPartitionBook {
    pub fn new(num_parts: usize, node_map: Vec<PartId>, edge_map: Vec<PartId>) -> Result<Self> {
        if num_parts == 0 {
            return Err(GraphFlowError::config("partition book needs at least one partition"));
        }
        for (&owner, kind) in node_map
            .iter()
            .map(|o| (o, "node"))
            .chain(edge_map.iter().map(|o| (o, "edge")))
        {
            if owner >= num_parts {
                return Err(GraphFlowError::config(format!(
                    "{} map entry {} exceeds partition count {}",
                    kind, owner, num_parts
                )));
            }
        }

        let mut nids_per_part = vec![Vec::new(); num_parts];
        for (nid, &owner) in node_map.iter().enumerate() {
            nids_per_part[owner].push(nid as NodeId);
        }
        let mut eids_per_part = vec![Vec::new(); num_parts];
        for (eid, &owner) in edge_map.iter().enumerate() {
            eids_per_part[owner].push(eid as EdgeId);
        }

        let mut node_local = FnvHashMap::default();
        for ids in &nids_per_part {
            for (local, &gid) in ids.iter().enumerate() {
                node_local.insert(gid, local as u64);
            }
        }
        let mut edge_local = FnvHashMap::default();
        for ids in &eids_per_part {
            for (local, &gid) in ids.iter().enumerate() {
                edge_local.insert(gid, local as u64);
            }
        }

        let meta = (0..num_parts)
            .map(|p| PartitionMetadata {
                num_nodes: nids_per_part[p].len(),
                num_edges: eids_per_part[p].len(),
            })
            .collect();

        Ok(GraphPartitionBook {
            num_parts,
            node_map,
            edge_map,
            nids_per_part,
            eids_per_part,
            node_local,
            edge_local,
            meta,
        })
    }

    pub fn node_map(&self) -> &[PartId] {
        &self.node_map
    }

    pub fn edge_map(&self) -> &[PartId] {
        &self.edge_map
    }

    fn lookup_owners(map: &[PartId], ids: &[u64]) -> Result<Vec<PartId>> {
        let count = map.len() as u64;
        ids.iter()
            .map(|&id| {
                map.get(id as usize)
                    .copied()
                    .ok_or(GraphFlowError::OutOfRange { id, count })
            })
            .collect()
    }

    fn lookup_locals(
        map: &[PartId],
        local: &FnvHashMap<u64, u64>,
        ids: &[u64],
        part_id: PartId,
    ) -> Result<Vec<u64>> {
        ids.iter()
            .map(|&id| {
                match map.get(id as usize) {
                    Some(&owner) if owner == part_id => Ok(local[&id]),
                    Some(_) => Err(GraphFlowError::ForeignId { id, part_id }),
                    None => Err(GraphFlowError::OutOfRange {
                        id,
                        count: map.len() as u64,
                    }),
                }
            })
            .collect()
    }
}

impl PartitionBook for GraphPartitionBook {
    fn num_partitions(&self) -> usize {
        self.num_parts
    }

    fn nid2partid(&self, ids: &[NodeId]) -> Result<Vec<PartId>> {
        Self::lookup_owners(&self.node_map, ids)
    }

    fn eid2partid(&self, ids: &[EdgeId]) -> Result<Vec<PartId>> {
        Self::lookup_owners(&self.edge_map, ids)
    }

    fn nid2localnid(&self, ids: &[NodeId], part_id: PartId) -> Result<Vec<u64>> {
        check_part(part_id, self.num_parts)?;
        Self::lookup_locals(&self.node_map, &self.node_local, ids, part_id)
    }

    fn eid2localeid(&self, ids: &[EdgeId], part_id: PartId) -> Result<Vec<u64>> {
        check_part(part_id, self.num_parts)?;
        Self::lookup_locals(&self.edge_map, &self.edge_local, ids, part_id)
    }

    fn partid2nids(&self, part_id: PartId) -> Result<Vec<NodeId>> {
        check_part(part_id, self.num_parts)?;
        Ok(self.nids_per_part[part_id].clone())
    }

    fn partid2eids(&self, part_id: PartId) -> Result<Vec<EdgeId>> {
        check_part(part_id, self.num_parts)?;
        Ok(self.eids_per_part[part_id].clone())
    }

    fn metadata(&self) -> &[PartitionMetadata] {
        &self.meta
    }
}

/// Partition book for contiguously renumbered graphs: partition `p` owns the
/// half-open id range `[starts[p], starts[p+1])`. Owner lookup is a binary
/// search over the boundaries instead of a full map.
pub struct RangePartitionBook {
    node_starts: Vec<u64>,
    edge_starts: Vec<u64>,
    meta: Vec<PartitionMetadata>,
}

impl RangePartitionBook {
    /// `node_starts`/`edge_starts` have `num_parts + 1` entries, ascending,
    /// starting at zero; the last entry is the global count.
    pub fn new(node_starts: Vec<u64>, edge_starts: Vec<u64>) -> Result<Self> {
        for (starts, kind) in [(&node_starts, "node"), (&edge_starts, "edge")] {
            if starts.len() < 2 || starts[0] != 0 {
                return Err(GraphFlowError::config(format!(
                    "{} boundaries must begin at zero and cover at least one partition",
                    kind
                )));
            }
            if starts.windows(2).any(|w| w[0] > w[1]) {
                return Err(GraphFlowError::config(format!(
                    "{} boundaries must be non-decreasing",
                    kind
                )));
            }
        }
        if node_starts.len() != edge_starts.len() {
            return Err(GraphFlowError::config(
                "node and edge boundaries disagree on partition count",
            ));
        }
        let meta = node_starts
            .windows(2)
            .zip(edge_starts.windows(2))
            .map(|(n, e)| PartitionMetadata {
                num_nodes: (n[1] - n[0]) as usize,
                num_edges: (e[1] - e[0]) as usize,
            })
            .collect();
        Ok(RangePartitionBook {
            node_starts,
            edge_starts,
            meta,
        })
    }

    fn owner(starts: &[u64], id: u64) -> Result<PartId> {
        let count = *starts.last().unwrap_or(&0);
        if id >= count {
            return Err(GraphFlowError::OutOfRange { id, count });
        }
        // First boundary strictly greater than id, minus one.
        let idx = starts.partition_point(|&s| s <= id);
        Ok(idx - 1)
    }
}

impl PartitionBook for RangePartitionBook {
    fn num_partitions(&self) -> usize {
        self.node_starts.len() - 1
    }

    fn nid2partid(&self, ids: &[NodeId]) -> Result<Vec<PartId>> {
        ids.iter().map(|&id| Self::owner(&self.node_starts, id)).collect()
    }

    fn eid2partid(&self, ids: &[EdgeId]) -> Result<Vec<PartId>> {
        ids.iter().map(|&id| Self::owner(&self.edge_starts, id)).collect()
    }

    fn nid2localnid(&self, ids: &[NodeId], part_id: PartId) -> Result<Vec<u64>> {
        check_part(part_id, self.num_partitions())?;
        ids.iter()
            .map(|&id| {
                let owner = Self::owner(&self.node_starts, id)?;
                if owner != part_id {
                    return Err(GraphFlowError::ForeignId { id, part_id });
                }
                Ok(id - self.node_starts[part_id])
            })
            .collect()
    }

    fn eid2localeid(&self, ids: &[EdgeId], part_id: PartId) -> Result<Vec<u64>> {
        check_part(part_id, self.num_partitions())?;
        ids.iter()
            .map(|&id| {
                let owner = Self::owner(&self.edge_starts, id)?;
                if owner != part_id {
                    return Err(GraphFlowError::ForeignId { id, part_id });
                }
                Ok(id - self.edge_starts[part_id])
            })
            .collect()
    }

    fn partid2nids(&self, part_id: PartId) -> Result<Vec<NodeId>> {
        check_part(part_id, self.num_partitions())?;
        Ok((self.node_starts[part_id]..self.node_starts[part_id + 1]).collect())
    }

    fn partid2eids(&self, part_id: PartId) -> Result<Vec<EdgeId>> {
        check_part(part_id, self.num_partitions())?;
        Ok((self.edge_starts[part_id]..self.edge_starts[part_id + 1]).collect())
    }

    fn metadata(&self) -> &[PartitionMetadata] {
        &self.meta
    }
}
