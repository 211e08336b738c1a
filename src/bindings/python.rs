use crate::analysis::validation::Validator;
use crate::config::PropagationConfig;
use crate::display::trace;
use crate::graph::{build_graph, NodeId, OperationGraph};
use crate::model::{BatchNorm2d, FunctionOp, Layer, Model, ModelBuilder};
use crate::session::{Attribution, RapSession, SeedRelevance};
use crate::tensor::{self, conv::Conv2dGeometry, Tensor};
use ndarray::{Array1, Array2, Array4};
use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use std::sync::Arc;

fn to_tensor(values: Vec<f32>, shape: &[usize]) -> PyResult<Tensor> {
    tensor::tensor(shape, values).map_err(|e| PyValueError::new_err(e.to_string()))
}

fn from_tensor(t: Tensor) -> (Vec<f32>, Vec<usize>) {
    let shape = t.shape().to_vec();
    (t.into_iter().collect(), shape)
}

fn seed_for(target: Option<usize>) -> SeedRelevance {
    target.map_or(SeedRelevance::Predicted, SeedRelevance::Target)
}

#[pyclass(name = "_ModelBuilder")]
#[derive(Debug, Default)]
pub struct PyModelBuilder {
    inner: ModelBuilder,
}

impl PyModelBuilder {
    fn push_layer(&mut self, name: &str, layer: Layer, arg: usize) -> PyResult<usize> {
        layer.check_params().map_err(|e| PyValueError::new_err(e.to_string()))?;
        self.inner
            .layer(name, layer, NodeId::new(arg))
            .map(|id| id.index())
            .map_err(|e| PyValueError::new_err(e.to_string()))
    }
}

#[pymethods]
impl PyModelBuilder {
    #[new]
    pub fn new() -> Self { Self::default() }

    pub fn input(&mut self, name: &str) -> usize {
        self.inner.input(name).index()
    }

    #[pyo3(signature = (name, arg, weight, out_features, in_features, bias=None))]
    pub fn linear(
        &mut self,
        name: &str,
        arg: usize,
        weight: Vec<f32>,
        out_features: usize,
        in_features: usize,
        bias: Option<Vec<f32>>,
    ) -> PyResult<usize> {
        let weight = Array2::from_shape_vec((out_features, in_features), weight)
            .map_err(|_| PyValueError::new_err("weight does not match (out_features, in_features)"))?;
        self.push_layer(name, Layer::linear(weight, bias.map(Array1::from)), arg)
    }

    #[pyo3(signature = (name, arg, weight, shape, bias=None, stride=(1, 1), padding=(0, 0)))]
    pub fn conv2d(
        &mut self,
        name: &str,
        arg: usize,
        weight: Vec<f32>,
        shape: (usize, usize, usize, usize),
        bias: Option<Vec<f32>>,
        stride: (usize, usize),
        padding: (usize, usize),
    ) -> PyResult<usize> {
        let weight = Array4::from_shape_vec(shape, weight)
            .map_err(|_| PyValueError::new_err("weight does not match the kernel shape"))?;
        let layer = Layer::conv2d(weight, bias.map(Array1::from), Conv2dGeometry { stride, padding });
        self.push_layer(name, layer, arg)
    }

    #[pyo3(signature = (name, arg, gamma, beta, running_mean, running_var, eps=1e-5))]
    pub fn batch_norm2d(
        &mut self,
        name: &str,
        arg: usize,
        gamma: Vec<f32>,
        beta: Vec<f32>,
        running_mean: Vec<f32>,
        running_var: Vec<f32>,
        eps: f32,
    ) -> PyResult<usize> {
        let channels = gamma.len();
        if [beta.len(), running_mean.len(), running_var.len()].iter().any(|&n| n != channels) {
            return Err(PyValueError::new_err("batch norm statistics must have one value per channel"));
        }
        let norm = BatchNorm2d {
            gamma: Array1::from(gamma),
            beta: Array1::from(beta),
            running_mean: Array1::from(running_mean),
            running_var: Array1::from(running_var),
            eps,
        };
        self.push_layer(name, Layer::BatchNorm2d(norm), arg)
    }

    /// Element-wise layers: "relu", "dropout", "sigmoid", "tanh".
    pub fn activation(&mut self, kind: &str, name: &str, arg: usize) -> PyResult<usize> {
        let layer = match kind {
            "relu" => Layer::ReLU,
            "dropout" => Layer::Dropout,
            "sigmoid" => Layer::Sigmoid,
            "tanh" => Layer::Tanh,
            _ => return Err(PyValueError::new_err(format!("Unknown activation '{}'", kind))),
        };
        self.push_layer(name, layer, arg)
    }

    /// Pooling layers: "max", "avg" take `size` as the kernel, "adaptive_avg" as the output size.
    #[pyo3(signature = (kind, name, arg, size, stride=None))]
    pub fn pool2d(
        &mut self,
        kind: &str,
        name: &str,
        arg: usize,
        size: (usize, usize),
        stride: Option<(usize, usize)>,
    ) -> PyResult<usize> {
        let stride = stride.unwrap_or(size);
        let layer = match kind {
            "max" => Layer::MaxPool2d { kernel: size, stride },
            "avg" => Layer::AvgPool2d { kernel: size, stride },
            "adaptive_avg" => Layer::AdaptiveAvgPool2d { output: size },
            _ => return Err(PyValueError::new_err(format!("Unknown pooling '{}'", kind))),
        };
        self.push_layer(name, layer, arg)
    }

    pub fn add(&mut self, name: &str, lhs: usize, rhs: usize) -> PyResult<usize> {
        self.inner
            .call(name, FunctionOp::Add, &[NodeId::new(lhs), NodeId::new(rhs)])
            .map(|id| id.index())
            .map_err(|e| PyValueError::new_err(e.to_string()))
    }

    #[pyo3(signature = (name, arg, start_dim=1))]
    pub fn flatten(&mut self, name: &str, arg: usize, start_dim: usize) -> PyResult<usize> {
        self.inner
            .call(name, FunctionOp::Flatten { start_dim }, &[NodeId::new(arg)])
            .map(|id| id.index())
            .map_err(|e| PyValueError::new_err(e.to_string()))
    }

    pub fn output(&mut self, arg: usize) -> PyResult<usize> {
        self.inner.output(NodeId::new(arg)).map(|id| id.index()).map_err(|e| PyValueError::new_err(e.to_string()))
    }

    /// Consumes the recorded program. The builder is empty afterwards.
    #[pyo3(signature = (config_json=None))]
    pub fn build(&mut self, config_json: Option<&str>) -> PyResult<PyExplainer> {
        let config = match config_json {
            Some(json) => PropagationConfig::from_json(json).map_err(|e| PyValueError::new_err(e.to_string()))?,
            None => PropagationConfig::default(),
        };
        let model = std::mem::take(&mut self.inner).build().map_err(|e| PyValueError::new_err(e.to_string()))?;
        let graph = Arc::new(build_graph(&model));
        // Structural problems surface here rather than on the first attribution.
        RapSession::with_graph(&model, Arc::clone(&graph), config.clone())
            .map_err(|e| PyValueError::new_err(e.to_string()))?;
        Ok(PyExplainer { model: Arc::new(model), graph, config })
    }
}

/// A built model with its traced graph.
///
/// The graph is traced once and shared. Each call opens a fresh session over it, so
/// rules are re-attached per call: a Python object cannot hold a session that
/// borrows the model it owns. Attachment only binds rules, it never re-traces.
#[pyclass(name = "_Explainer")]
#[derive(Debug, Clone)]
pub struct PyExplainer {
    model: Arc<Model>,
    graph: Arc<OperationGraph>,
    config: PropagationConfig,
}

impl PyExplainer {
    fn run(&self, values: Vec<f32>, shape: Vec<usize>, target: Option<usize>) -> PyResult<(Attribution, String)> {
        let input = to_tensor(values, &shape)?;
        let config = self.config.clone().with_trace(true);
        let mut session = RapSession::with_graph(&self.model, Arc::clone(&self.graph), config)
            .map_err(|e| PyRuntimeError::new_err(e.to_string()))?;
        let attribution =
            session.attribute(&input, &seed_for(target)).map_err(|e| PyRuntimeError::new_err(e.to_string()))?;
        let text = session.trace().map(|t| trace::format_trace(&self.graph, t)).unwrap_or_default();
        Ok((attribution, text))
    }
}

#[pymethods]
impl PyExplainer {
    /// Attribution for one input, as flat values plus shape.
    #[pyo3(signature = (values, shape, target=None))]
    pub fn attribute(&self, values: Vec<f32>, shape: Vec<usize>, target: Option<usize>) -> PyResult<(Vec<f32>, Vec<usize>)> {
        let (attribution, _) = self.run(values, shape, target)?;
        Ok(from_tensor(attribution.values))
    }

    /// Channel-summed heatmap for image inputs.
    #[pyo3(signature = (values, shape, target=None))]
    pub fn heatmap(&self, values: Vec<f32>, shape: Vec<usize>, target: Option<usize>) -> PyResult<(Vec<f32>, Vec<usize>)> {
        let (attribution, _) = self.run(values, shape, target)?;
        let heat = attribution.channel_heatmap().map_err(|e| PyValueError::new_err(e.to_string()))?;
        Ok(from_tensor(heat))
    }

    #[pyo3(signature = (values, shape, target=None))]
    pub fn summary_json(&self, values: Vec<f32>, shape: Vec<usize>, target: Option<usize>) -> PyResult<String> {
        let (attribution, _) = self.run(values, shape, target)?;
        attribution.summary().to_json().map_err(|e| PyRuntimeError::new_err(e.to_string()))
    }

    #[pyo3(signature = (values, shape, target=None))]
    pub fn trace_relevance(&self, values: Vec<f32>, shape: Vec<usize>, target: Option<usize>) -> PyResult<String> {
        let (_, text) = self.run(values, shape, target)?;
        Ok(text)
    }

    /// Every validation issue, blocking or not, as text.
    pub fn validate(&self) -> Vec<String> {
        Validator::new(&self.graph).report().into_iter().map(|i| i.message).collect()
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }
}
