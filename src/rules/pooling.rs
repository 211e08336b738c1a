//! z-rule for the pooling layers: `R_in = X * grad(Z, R / Z)` with `Z = pool(X)`.
use super::{single_input, RelProp, Relevance};
use crate::error::Result;
use crate::tensor::{self, pool, PoolMode, PoolWindow, Tensor};
use smallvec::smallvec;

pub struct PoolingRule {
    name: &'static str,
    window: PoolWindow,
    mode: PoolMode,
}

impl PoolingRule {
    pub fn new(name: &'static str, window: PoolWindow, mode: PoolMode) -> Self {
        Self { name, window, mode }
    }
}

impl RelProp for PoolingRule {
    fn name(&self) -> &'static str {
        self.name
    }

    fn relprop(&self, relevance: &Tensor, inputs: &[&Tensor]) -> Result<Relevance> {
        let x = single_input(self.name, inputs)?;
        let z = pool::pool2d(x, self.window, self.mode)?;
        tensor::ensure_same_shape("relevance at pooling output", &z, relevance)?;
        let s = tensor::safe_divide(relevance, &z)?;
        let c = pool::pool2d_input_grad(x, &s, self.window, self.mode)?;
        Ok(smallvec![x * &c])
    }
}
