// Crate root: module layout, the public surface, and the `_core` Python module
// when built with the `python` feature.

pub mod analysis;
pub mod batch;
#[cfg(feature = "python")]
pub mod bindings;
pub mod config;
pub mod display;
pub mod error;
pub mod graph;
pub mod model;
pub mod rules;
pub mod session;
pub mod tensor;

pub use batch::attribute_all;
pub use config::{AddSplit, PropagationConfig, Traversal};
pub use error::{RelpropError, Result, TopologyError};
pub use graph::{build_graph, GraphCache, NodeId, OperationGraph};
pub use model::{FunctionOp, Layer, Model, ModelBuilder};
pub use rules::{RelProp, Relevance};
pub use session::{Attribution, RapSession, SeedRelevance};
pub use tensor::Tensor;

use std::sync::Arc;

/// One-shot attribution against a graph traced earlier from `model`
/// (see [`build_graph`] and [`GraphCache`]): attach, evaluate and propagate.
///
/// For repeated calls on the same model, keep a [`RapSession`] instead.
pub fn attribute(
    graph: &Arc<OperationGraph>,
    model: &Model,
    input: &Tensor,
    seed: &SeedRelevance,
    config: PropagationConfig,
) -> Result<Attribution> {
    RapSession::with_graph(model, Arc::clone(graph), config)?.attribute(input, seed)
}

#[cfg(feature = "python")]
mod python_module {
    use crate::bindings::python::{PyExplainer, PyModelBuilder};
    use pyo3::prelude::*;

    #[pyfunction]
    fn rust_core_version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    /// The `_core` extension module.
    #[pymodule]
    fn _core(_py: Python, m: &Bound<'_, PyModule>) -> PyResult<()> {
        m.add_function(wrap_pyfunction!(rust_core_version, m)?)?;
        m.add_class::<PyModelBuilder>()?;
        m.add_class::<PyExplainer>()?;
        Ok(())
    }
}
