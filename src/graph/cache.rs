//! Per-model graph cache, keyed by model identity.
use super::builder::build_graph;
use super::dag::OperationGraph;
use crate::model::{Model, ModelId};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct GraphCache {
    graphs: HashMap<ModelId, Arc<OperationGraph>>,
}

impl GraphCache {
    pub fn new() -> Self { Self::default() }

    /// Returns the graph traced from `model`, tracing it on first use.
    pub fn get_or_build(&mut self, model: &Model) -> Arc<OperationGraph> {
        self.graphs.entry(model.id()).or_insert_with(|| Arc::new(build_graph(model))).clone()
    }

    pub fn evict(&mut self, model: ModelId) -> Option<Arc<OperationGraph>> {
        self.graphs.remove(&model)
    }

    pub fn len(&self) -> usize { self.graphs.len() }
    pub fn is_empty(&self) -> bool { self.graphs.is_empty() }
}
