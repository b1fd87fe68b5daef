pub mod conf;
pub mod err;
pub mod frame;
pub mod graph;
pub mod partbook;
pub mod partition;
pub mod rpc;
pub mod sampling;
pub mod service;
pub mod tensor;

/// Global node identifier.
pub type NodeId = u64;
/// Global edge identifier.
pub type EdgeId = u64;
/// Partition identifier, always in `[0, num_partitions)`.
pub type PartId = usize;
