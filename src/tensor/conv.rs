//! Direct 2-D convolution over `[batch, channels, height, width]` tensors and its
//! gradient with respect to the input.
use super::Tensor;
use crate::error::{RelpropError, Result};
use ndarray::{Array4, ArrayView4, Ix4};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conv2dGeometry {
    pub stride: (usize, usize),
    pub padding: (usize, usize),
}

impl Default for Conv2dGeometry {
    fn default() -> Self {
        Self { stride: (1, 1), padding: (0, 0) }
    }
}

impl Conv2dGeometry {
    pub fn output_size(&self, input: (usize, usize), kernel: (usize, usize)) -> Result<(usize, usize)> {
        let (h, w) = input;
        let (kh, kw) = kernel;
        let (sh, sw) = self.stride;
        let (ph, pw) = self.padding;
        if sh == 0 || sw == 0 || h + 2 * ph < kh || w + 2 * pw < kw {
            return Err(RelpropError::shape("conv2d window", &[kh, kw], &[h + 2 * ph, w + 2 * pw]));
        }
        Ok(((h + 2 * ph - kh) / sh + 1, (w + 2 * pw - kw) / sw + 1))
    }

    /// Maps an output position plus kernel offset back to an input coordinate,
    /// or `None` when it falls into the zero padding.
    #[inline(always)]
    fn source(&self, out: (usize, usize), k: (usize, usize), input: (usize, usize)) -> Option<(usize, usize)> {
        let i = (out.0 * self.stride.0 + k.0) as isize - self.padding.0 as isize;
        let j = (out.1 * self.stride.1 + k.1) as isize - self.padding.1 as isize;
        if i < 0 || j < 0 || i as usize >= input.0 || j as usize >= input.1 {
            return None;
        }
        Some((i as usize, j as usize))
    }
}

pub(crate) fn view4<'a>(t: &'a Tensor, context: &str) -> Result<ArrayView4<'a, f32>> {
    t.view()
        .into_dimensionality::<Ix4>()
        .map_err(|_| RelpropError::shape(format!("{} (rank 4)", context), &[0, 0, 0, 0], t.shape()))
}

/// `out[n, o, i, j] = sum_{c, ki, kj} x[n, c, i*s + ki - p, j*s + kj - p] * w[o, c, ki, kj]`.
/// Bias is not applied here.
pub fn conv2d(x: &Tensor, weight: &Tensor, geom: Conv2dGeometry) -> Result<Tensor> {
    let x4 = view4(x, "conv2d input")?;
    let w4 = view4(weight, "conv2d weight")?;
    let (n, c, h, w) = x4.dim();
    let (o, wc, kh, kw) = w4.dim();
    if wc != c {
        return Err(RelpropError::shape("conv2d input channels", &[wc], &[c]));
    }
    let (oh, ow) = geom.output_size((h, w), (kh, kw))?;

    let mut out = Array4::<f32>::zeros((n, o, oh, ow));
    for b in 0..n {
        for oc in 0..o {
            for i in 0..oh {
                for j in 0..ow {
                    let mut acc = 0.0;
                    for ic in 0..c {
                        for ki in 0..kh {
                            for kj in 0..kw {
                                if let Some((si, sj)) = geom.source((i, j), (ki, kj), (h, w)) {
                                    acc += x4[[b, ic, si, sj]] * w4[[oc, ic, ki, kj]];
                                }
                            }
                        }
                    }
                    out[[b, oc, i, j]] = acc;
                }
            }
        }
    }
    Ok(out.into_dyn())
}

/// Gradient of `sum(conv2d(x, w) * s)` with respect to `x`, for an input of `input_shape`.
pub fn conv2d_input_grad(s: &Tensor, weight: &Tensor, input_shape: &[usize], geom: Conv2dGeometry) -> Result<Tensor> {
    let s4 = view4(s, "conv2d upstream signal")?;
    let w4 = view4(weight, "conv2d weight")?;
    let &[n, c, h, w] = input_shape else {
        return Err(RelpropError::shape("conv2d input (rank 4)", &[0, 0, 0, 0], input_shape));
    };
    let (o, wc, kh, kw) = w4.dim();
    let expected = geom.output_size((h, w), (kh, kw))?;
    if wc != c || s4.dim() != (n, o, expected.0, expected.1) {
        return Err(RelpropError::shape("conv2d upstream signal", &[n, o, expected.0, expected.1], s.shape()));
    }

    let mut grad = Array4::<f32>::zeros((n, c, h, w));
    for b in 0..n {
        for oc in 0..o {
            for i in 0..expected.0 {
                for j in 0..expected.1 {
                    let sv = s4[[b, oc, i, j]];
                    if sv == 0.0 {
                        continue;
                    }
                    for ic in 0..c {
                        for ki in 0..kh {
                            for kj in 0..kw {
                                if let Some((si, sj)) = geom.source((i, j), (ki, kj), (h, w)) {
                                    grad[[b, ic, si, sj]] += sv * w4[[oc, ic, ki, kj]];
                                }
                            }
                        }
                    }
                }
            }
        }
    }
    Ok(grad.into_dyn())
}
