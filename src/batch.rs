//! Independent attributions for many inputs in parallel.
//!
//! A session holds the activations of one evaluation, so every rayon worker builds
//! its own from the shared graph and reuses it for the inputs it is handed.
use crate::config::PropagationConfig;
use crate::error::Result;
use crate::graph::OperationGraph;
use crate::model::Model;
use crate::session::{Attribution, RapSession, SeedRelevance};
use crate::tensor::Tensor;
use rayon::prelude::*;
use std::sync::Arc;
use tracing::debug;

/// Attributes every input in `inputs`, results in input order.
///
/// Fails with the first error in input order; no partial results are returned.
pub fn attribute_all(
    model: &Model,
    graph: Arc<OperationGraph>,
    inputs: &[Tensor],
    seed: &SeedRelevance,
    config: &PropagationConfig,
) -> Result<Vec<Attribution>> {
    // Surface session errors once, before any worker starts.
    RapSession::with_graph(model, Arc::clone(&graph), config.clone())?;
    debug!(inputs = inputs.len(), "attributing batch");

    inputs
        .par_iter()
        .map_init(
            || RapSession::with_graph(model, Arc::clone(&graph), config.clone()),
            |session, input| match session {
                Ok(session) => session.attribute(input, seed),
                Err(e) => Err(e.clone()),
            },
        )
        .collect()
}
