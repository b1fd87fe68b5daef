use std::collections::HashMap;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::err::{GraphFlowError, Result};
use crate::tensor::Tensor;

/// Columnar feature storage: named tensors sharing a leading row axis.
/// Values are opaque buffers to this layer; only row counts are validated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeatureFrame {
    num_rows: usize,
    columns: HashMap<String, Tensor>,
}

impl FeatureFrame {
    pub fn new(num_rows: usize) -> Self {
        FeatureFrame {
            num_rows,
            columns: HashMap::new(),
        }
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(|k| k.as_str())
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) -> Result<()> {
        if tensor.num_rows() != self.num_rows {
            return Err(GraphFlowError::config(format!(
                "column has {} rows, frame expects {}",
                tensor.num_rows(),
                self.num_rows
            )));
        }
        self.columns.insert(name.into(), tensor);
        Ok(())
    }

    pub fn column(&self, name: &str) -> Option<&Tensor> {
        self.columns.get(name)
    }

    /// Gather rows of a column.
    pub fn get(&self, name: &str, rows: &[u64]) -> Result<Tensor> {
        let column = self.columns.get(name).ok_or_else(|| {
            GraphFlowError::config(format!("unknown feature column {:?}", name))
        })?;
        column.rows(rows)
    }

    /// Scatter values into rows of a column.
    pub fn set(&mut self, name: &str, rows: &[u64], values: &Tensor) -> Result<()> {
        let column = self.columns.get_mut(name).ok_or_else(|| {
            GraphFlowError::config(format!("unknown feature column {:?}", name))
        })?;
        column.scatter_rows(rows, values)
    }

    /// A new frame holding the given rows of every column.
    pub fn gather_rows(&self, rows: &[u64]) -> Result<FeatureFrame> {
        let mut out = FeatureFrame::new(rows.len());
        for (name, column) in &self.columns {
            out.insert(name.clone(), column.rows(rows)?)?;
        }
        Ok(out)
    }
}

/// Server-side stateful resource: a concurrent named-tensor store serving
/// pull/push row requests. Row-level synchronization is per entry; callers
/// needing cross-key atomicity must coordinate themselves.
#[derive(Debug, Default)]
pub struct KvStore {
    entries: DashMap<String, Tensor>,
}

impl KvStore {
    pub fn new() -> Self {
        KvStore {
            entries: DashMap::new(),
        }
    }

    pub fn init(&self, name: impl Into<String>, tensor: Tensor) {
        self.entries.insert(name.into(), tensor);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn pull(&self, name: &str, rows: &[u64]) -> Result<Tensor> {
        let entry = self.entries.get(name).ok_or_else(|| {
            GraphFlowError::config(format!("unknown kv entry {:?}", name))
        })?;
        entry.rows(rows)
    }

    pub fn push(&self, name: &str, rows: &[u64], values: &Tensor) -> Result<()> {
        let mut entry = self.entries.get_mut(name).ok_or_else(|| {
            GraphFlowError::config(format!("unknown kv entry {:?}", name))
        })?;
        entry.scatter_rows(rows, values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::DType;

    #[test]
    fn frame_validates_row_counts() {
        let mut frame = FeatureFrame::new(4);
        assert!(frame.insert("feat", Tensor::zeros(DType::F32, &[4, 2])).is_ok());
        assert!(frame.insert("bad", Tensor::zeros(DType::F32, &[3, 2])).is_err());
    }

    #[test]
    fn frame_get_set_round_trip() {
        let mut frame = FeatureFrame::new(3);
        frame
            .insert("labels", Tensor::from_slice(&[10i64, 11, 12]))
            .unwrap();
        let picked = frame.get("labels", &[2, 0]).unwrap();
        assert_eq!(picked.to_vec::<i64>().unwrap(), vec![12, 10]);
        frame.set("labels", &[1], &Tensor::from_slice(&[99i64])).unwrap();
        assert_eq!(
            frame.get("labels", &[0, 1, 2]).unwrap().to_vec::<i64>().unwrap(),
            vec![10, 99, 12]
        );
        assert!(frame.get("missing", &[0]).is_err());
    }

    #[test]
    fn kv_pull_push() {
        let kv = KvStore::new();
        kv.init("emb", Tensor::zeros(DType::I64, &[4]));
        kv.push("emb", &[1, 3], &Tensor::from_slice(&[5i64, 7])).unwrap();
        assert_eq!(
            kv.pull("emb", &[0, 1, 2, 3]).unwrap().to_vec::<i64>().unwrap(),
            vec![0, 5, 0, 7]
        );
        assert!(kv.pull("nope", &[0]).is_err());
    }
}
