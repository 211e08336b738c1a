//! Alpha-beta redistribution for the affine layers (Linear, Conv2d).
//!
//! With `x+`/`x-` and `w+`/`w-` the positive and negative parts of the captured input
//! and of the weights, and
//!
//! `f(w1, w2) = x+ * grad(x+·w1, R / (x+·w1)) + x- * grad(x-·w2, R / (x-·w2))`,
//!
//! the input relevance is `alpha * f(w+, w-) - beta * f(w-, w+)` with `beta = alpha - 1`.
//! Biases take no part.
use super::{single_input, RelProp, Relevance};
use crate::error::{RelpropError, Result};
use crate::model::{Conv2d, Linear};
use crate::tensor::{self, conv, Conv2dGeometry, Tensor};
use ndarray::Array2;
use smallvec::smallvec;

pub(crate) fn alpha_beta<W, A, G>(relevance: &Tensor, x: &Tensor, w_pos: &W, w_neg: &W, alpha: f32, apply: A, grad: G) -> Result<Tensor>
where
    A: Fn(&Tensor, &W) -> Result<Tensor>,
    G: Fn(&Tensor, &W) -> Result<Tensor>,
{
    let x_pos = tensor::positive(x);
    let x_neg = tensor::negative(x);

    let f = |w1: &W, w2: &W| -> Result<Tensor> {
        let z1 = apply(&x_pos, w1)?;
        let z2 = apply(&x_neg, w2)?;
        tensor::ensure_same_shape("relevance at affine output", &z1, relevance)?;
        let c1 = &x_pos * &grad(&tensor::safe_divide(relevance, &z1)?, w1)?;
        let c2 = &x_neg * &grad(&tensor::safe_divide(relevance, &z2)?, w2)?;
        Ok(c1 + c2)
    };

    let activator = f(w_pos, w_neg)?;
    let beta = alpha - 1.0;
    if beta == 0.0 {
        return Ok(activator * alpha);
    }
    let inhibitor = f(w_neg, w_pos)?;
    Ok(activator * alpha - inhibitor * beta)
}

pub struct LinearRule {
    w_pos: Array2<f32>,
    w_neg: Array2<f32>,
    alpha: f32,
}

impl LinearRule {
    pub fn new(layer: &Linear, alpha: f32) -> Self {
        Self { w_pos: layer.weight.mapv(|v| v.max(0.0)), w_neg: layer.weight.mapv(|v| v.min(0.0)), alpha }
    }
}

fn linear_apply(x: &Tensor, w: &Array2<f32>) -> Result<Tensor> {
    let (m, squeeze) = tensor::as_matrix(x)?;
    if m.ncols() != w.ncols() {
        return Err(RelpropError::shape("linear input features", &[w.ncols()], &[m.ncols()]));
    }
    Ok(tensor::from_matrix(m.dot(&w.t()), squeeze))
}

fn linear_grad(s: &Tensor, w: &Array2<f32>) -> Result<Tensor> {
    let (m, squeeze) = tensor::as_matrix(s)?;
    if m.ncols() != w.nrows() {
        return Err(RelpropError::shape("linear output features", &[w.nrows()], &[m.ncols()]));
    }
    Ok(tensor::from_matrix(m.dot(w), squeeze))
}

impl RelProp for LinearRule {
    fn name(&self) -> &'static str {
        "Linear"
    }

    fn relprop(&self, relevance: &Tensor, inputs: &[&Tensor]) -> Result<Relevance> {
        let x = single_input(self.name(), inputs)?;
        let r = alpha_beta(relevance, x, &self.w_pos, &self.w_neg, self.alpha, linear_apply, linear_grad)?;
        Ok(smallvec![r])
    }
}

pub struct Conv2dRule {
    w_pos: Tensor,
    w_neg: Tensor,
    geometry: Conv2dGeometry,
    alpha: f32,
}

impl Conv2dRule {
    pub fn new(layer: &Conv2d, alpha: f32) -> Self {
        Self {
            w_pos: tensor::positive(&layer.weight),
            w_neg: tensor::negative(&layer.weight),
            geometry: layer.geometry,
            alpha,
        }
    }
}

impl RelProp for Conv2dRule {
    fn name(&self) -> &'static str {
        "Conv2d"
    }

    fn relprop(&self, relevance: &Tensor, inputs: &[&Tensor]) -> Result<Relevance> {
        let x = single_input(self.name(), inputs)?;
        let geom = self.geometry;
        let shape = x.shape().to_vec();
        let r = alpha_beta(
            relevance,
            x,
            &self.w_pos,
            &self.w_neg,
            self.alpha,
            |x, w| conv::conv2d(x, w, geom),
            |s, w| conv::conv2d_input_grad(s, w, &shape, geom),
        )?;
        Ok(smallvec![r])
    }
}
