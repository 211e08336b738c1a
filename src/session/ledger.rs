//! ledger.rs
//! Side table of captured activations, indexed by node.

use crate::graph::NodeId;
use crate::tensor::Tensor;
use std::sync::Arc;

/// Captured node outputs of the most recent forward evaluation.
///
/// Every forward evaluation starts a new generation and drops all earlier captures,
/// so a value read from the ledger always belongs to the latest evaluation.
#[derive(Debug, Clone, Default)]
pub struct ActivationLedger {
    values: Vec<Option<Arc<Tensor>>>,
    generation: u64,
}

impl ActivationLedger {
    pub fn new() -> Self { Self::default() }

    pub fn ensure_capacity(&mut self, size: usize) {
        if self.values.len() < size {
            self.values.resize(size, None);
        }
    }

    /// Clears every capture and bumps the generation.
    pub fn begin_evaluation(&mut self) -> u64 {
        self.values.iter_mut().for_each(|slot| *slot = None);
        self.generation += 1;
        self.generation
    }

    /// Zero until the first forward evaluation.
    #[inline(always)]
    pub fn generation(&self) -> u64 { self.generation }

    #[inline(always)]
    pub fn get(&self, node_id: NodeId) -> Option<&Arc<Tensor>> {
        self.values.get(node_id.index())?.as_ref()
    }

    #[inline(always)]
    pub fn record(&mut self, node_id: NodeId, value: Arc<Tensor>) {
        let idx = node_id.index();
        if idx >= self.values.len() {
            self.values.resize(idx + 1, None);
        }
        self.values[idx] = Some(value);
    }

    pub fn invalidate(&mut self, node_ids: impl IntoIterator<Item = NodeId>) {
        for id in node_ids {
            if let Some(slot) = self.values.get_mut(id.index()) {
                *slot = None;
            }
        }
    }

    pub fn captured(&self) -> usize {
        self.values.iter().filter(|v| v.is_some()).count()
    }
}
