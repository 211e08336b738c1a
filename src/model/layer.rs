//! Stateful layers and their eval-mode forward computation.
use crate::error::{RelpropError, Result};
use crate::tensor::{self, conv, pool, Conv2dGeometry, PoolMode, PoolWindow, Tensor};
use ndarray::{Array1, Array2, Array4, Axis};
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub struct Linear {
    /// `[out_features, in_features]`
    pub weight: Array2<f32>,
    pub bias: Option<Array1<f32>>,
}

impl Linear {
    pub fn new(weight: Array2<f32>, bias: Option<Array1<f32>>) -> Self {
        Self { weight, bias }
    }

    /// One bias per output feature.
    pub fn check_params(&self) -> Result<()> {
        match &self.bias {
            Some(bias) if bias.len() != self.weight.nrows() => {
                Err(RelpropError::shape("linear bias", &[self.weight.nrows()], &[bias.len()]))
            }
            _ => Ok(()),
        }
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.check_params()?;
        let (xm, squeeze) = tensor::as_matrix(x)?;
        if xm.ncols() != self.weight.ncols() {
            return Err(RelpropError::shape("linear input features", &[self.weight.ncols()], &[xm.ncols()]));
        }
        let mut y = xm.dot(&self.weight.t());
        if let Some(bias) = &self.bias {
            y += bias;
        }
        Ok(tensor::from_matrix(y, squeeze))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Conv2d {
    /// `[out_channels, in_channels, kernel_h, kernel_w]`
    pub weight: Tensor,
    pub bias: Option<Array1<f32>>,
    pub geometry: Conv2dGeometry,
}

impl Conv2d {
    pub fn new(weight: Array4<f32>, bias: Option<Array1<f32>>, geometry: Conv2dGeometry) -> Self {
        Self { weight: weight.into_dyn(), bias, geometry }
    }

    /// A rank-4 kernel and one bias per output channel.
    pub fn check_params(&self) -> Result<()> {
        if self.weight.ndim() != 4 {
            return Err(RelpropError::shape("conv2d kernel rank", &[4], &[self.weight.ndim()]));
        }
        let out_channels = self.weight.shape()[0];
        match &self.bias {
            Some(bias) if bias.len() != out_channels => {
                Err(RelpropError::shape("conv2d bias", &[out_channels], &[bias.len()]))
            }
            _ => Ok(()),
        }
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.check_params()?;
        let mut y = conv::conv2d(x, &self.weight, self.geometry)?;
        if let Some(bias) = &self.bias {
            for (oc, mut plane) in y.axis_iter_mut(Axis(1)).enumerate() {
                let b = bias[oc];
                plane.mapv_inplace(|v| v + b);
            }
        }
        Ok(y)
    }
}

/// Batch normalisation in inference mode (running statistics), channel axis 1.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchNorm2d {
    pub gamma: Array1<f32>,
    pub beta: Array1<f32>,
    pub running_mean: Array1<f32>,
    pub running_var: Array1<f32>,
    pub eps: f32,
}

impl BatchNorm2d {
    /// Identity statistics for `channels` channels.
    pub fn identity(channels: usize) -> Self {
        Self {
            gamma: Array1::ones(channels),
            beta: Array1::zeros(channels),
            running_mean: Array1::zeros(channels),
            running_var: Array1::ones(channels),
            eps: 1e-5,
        }
    }

    /// Per-channel multiplier `gamma / sqrt(var + eps)`.
    pub fn scale(&self) -> Array1<f32> {
        Array1::from_iter(self.gamma.iter().zip(&self.running_var).map(|(&g, &v)| g / (v + self.eps).sqrt()))
    }

    /// `beta`, `running_mean` and `running_var` carry one entry per `gamma` channel.
    pub fn check_params(&self) -> Result<()> {
        let channels = self.gamma.len();
        for (context, stats) in
            [("batch norm beta", &self.beta), ("batch norm running mean", &self.running_mean), ("batch norm running var", &self.running_var)]
        {
            if stats.len() != channels {
                return Err(RelpropError::shape(context, &[channels], &[stats.len()]));
            }
        }
        Ok(())
    }

    pub(crate) fn check_channels(&self, x: &Tensor) -> Result<()> {
        self.check_params()?;
        if x.ndim() < 2 || x.shape()[1] != self.gamma.len() {
            return Err(RelpropError::shape("batch norm channels", &[self.gamma.len()], x.shape()));
        }
        Ok(())
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.check_channels(x)?;
        let scale = self.scale();
        let mut y = x.clone();
        for (ch, mut plane) in y.axis_iter_mut(Axis(1)).enumerate() {
            let (m, s, b) = (self.running_mean[ch], scale[ch], self.beta[ch]);
            plane.mapv_inplace(|v| (v - m) * s + b);
        }
        Ok(y)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Layer {
    Linear(Linear),
    Conv2d(Conv2d),
    ReLU,
    /// Identity in inference mode.
    Dropout,
    MaxPool2d { kernel: (usize, usize), stride: (usize, usize) },
    AvgPool2d { kernel: (usize, usize), stride: (usize, usize) },
    AdaptiveAvgPool2d { output: (usize, usize) },
    BatchNorm2d(BatchNorm2d),
    Sequential(Vec<Layer>),
    Sigmoid,
    Tanh,
}

/// The type identity of a layer, used as the key of the module rule table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerType {
    Linear,
    Conv2d,
    ReLU,
    Dropout,
    MaxPool2d,
    AvgPool2d,
    AdaptiveAvgPool2d,
    BatchNorm2d,
    Sequential,
    Sigmoid,
    Tanh,
}

impl LayerType {
    pub fn name(&self) -> &'static str {
        match self {
            LayerType::Linear => "Linear",
            LayerType::Conv2d => "Conv2d",
            LayerType::ReLU => "ReLU",
            LayerType::Dropout => "Dropout",
            LayerType::MaxPool2d => "MaxPool2d",
            LayerType::AvgPool2d => "AvgPool2d",
            LayerType::AdaptiveAvgPool2d => "AdaptiveAvgPool2d",
            LayerType::BatchNorm2d => "BatchNorm2d",
            LayerType::Sequential => "Sequential",
            LayerType::Sigmoid => "Sigmoid",
            LayerType::Tanh => "Tanh",
        }
    }
}

impl fmt::Display for LayerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Layer {
    pub fn linear(weight: Array2<f32>, bias: Option<Array1<f32>>) -> Self {
        Layer::Linear(Linear::new(weight, bias))
    }

    pub fn conv2d(weight: Array4<f32>, bias: Option<Array1<f32>>, geometry: Conv2dGeometry) -> Self {
        Layer::Conv2d(Conv2d::new(weight, bias, geometry))
    }

    /// Parameter consistency of the layer and, for `Sequential`, of every child.
    pub fn check_params(&self) -> Result<()> {
        match self {
            Layer::Linear(l) => l.check_params(),
            Layer::Conv2d(c) => c.check_params(),
            Layer::BatchNorm2d(bn) => bn.check_params(),
            Layer::Sequential(layers) => layers.iter().try_for_each(Layer::check_params),
            _ => Ok(()),
        }
    }

    pub fn layer_type(&self) -> LayerType {
        match self {
            Layer::Linear(_) => LayerType::Linear,
            Layer::Conv2d(_) => LayerType::Conv2d,
            Layer::ReLU => LayerType::ReLU,
            Layer::Dropout => LayerType::Dropout,
            Layer::MaxPool2d { .. } => LayerType::MaxPool2d,
            Layer::AvgPool2d { .. } => LayerType::AvgPool2d,
            Layer::AdaptiveAvgPool2d { .. } => LayerType::AdaptiveAvgPool2d,
            Layer::BatchNorm2d(_) => LayerType::BatchNorm2d,
            Layer::Sequential(_) => LayerType::Sequential,
            Layer::Sigmoid => LayerType::Sigmoid,
            Layer::Tanh => LayerType::Tanh,
        }
    }

    /// Window geometry and reduction for the pooling layers.
    pub fn pooling(&self) -> Option<(PoolWindow, PoolMode)> {
        match *self {
            Layer::MaxPool2d { kernel, stride } => Some((PoolWindow::Fixed { kernel, stride }, PoolMode::Max)),
            Layer::AvgPool2d { kernel, stride } => Some((PoolWindow::Fixed { kernel, stride }, PoolMode::Average)),
            Layer::AdaptiveAvgPool2d { output } => Some((PoolWindow::Adaptive { output }, PoolMode::Average)),
            _ => None,
        }
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Layer::Linear(l) => l.forward(x),
            Layer::Conv2d(c) => c.forward(x),
            Layer::ReLU => Ok(tensor::positive(x)),
            Layer::Dropout => Ok(x.clone()),
            Layer::MaxPool2d { .. } | Layer::AvgPool2d { .. } | Layer::AdaptiveAvgPool2d { .. } => {
                let (window, mode) = self.pooling().ok_or_else(|| RelpropError::Config("not a pooling layer".into()))?;
                pool::pool2d(x, window, mode)
            }
            Layer::BatchNorm2d(bn) => bn.forward(x),
            Layer::Sequential(layers) => {
                let mut h = x.clone();
                for layer in layers {
                    h = layer.forward(&h)?;
                }
                Ok(h)
            }
            Layer::Sigmoid => Ok(x.mapv(|v| 1.0 / (1.0 + (-v).exp()))),
            Layer::Tanh => Ok(x.mapv(f32::tanh)),
        }
    }
}
