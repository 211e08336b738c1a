//! 2-D max/average pooling with fixed or adaptive windows.
use super::conv::view4;
use super::Tensor;
use crate::error::{RelpropError, Result};
use ndarray::Array4;
use std::ops::Range;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolWindow {
    Fixed { kernel: (usize, usize), stride: (usize, usize) },
    /// Windows chosen so that the output has exactly this spatial size.
    Adaptive { output: (usize, usize) },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolMode {
    Max,
    Average,
}

impl PoolWindow {
    pub fn output_size(&self, h: usize, w: usize) -> Result<(usize, usize)> {
        match *self {
            PoolWindow::Fixed { kernel: (kh, kw), stride: (sh, sw) } => {
                if kh == 0 || kw == 0 || sh == 0 || sw == 0 || kh > h || kw > w {
                    return Err(RelpropError::shape("pool2d window", &[kh, kw], &[h, w]));
                }
                Ok(((h - kh) / sh + 1, (w - kw) / sw + 1))
            }
            PoolWindow::Adaptive { output: (oh, ow) } => {
                if oh == 0 || ow == 0 || h == 0 || w == 0 {
                    return Err(RelpropError::shape("adaptive pool2d output", &[oh, ow], &[h, w]));
                }
                Ok((oh, ow))
            }
        }
    }

    /// Input rows (or columns, with `axis = 1`) covered by output position `i`.
    #[inline(always)]
    fn span(&self, axis: usize, i: usize, len: usize, out_len: usize) -> Range<usize> {
        match *self {
            PoolWindow::Fixed { kernel, stride } => {
                let (k, s) = if axis == 0 { (kernel.0, stride.0) } else { (kernel.1, stride.1) };
                i * s..i * s + k
            }
            PoolWindow::Adaptive { .. } => {
                let start = i * len / out_len;
                let end = ((i + 1) * len + out_len - 1) / out_len;
                start..end
            }
        }
    }
}

fn windows(window: PoolWindow, h: usize, w: usize) -> Result<Vec<((usize, usize), Range<usize>, Range<usize>)>> {
    let (oh, ow) = window.output_size(h, w)?;
    let mut out = Vec::with_capacity(oh * ow);
    for i in 0..oh {
        let rows = window.span(0, i, h, oh);
        for j in 0..ow {
            out.push(((i, j), rows.clone(), window.span(1, j, w, ow)));
        }
    }
    Ok(out)
}

pub fn pool2d(x: &Tensor, window: PoolWindow, mode: PoolMode) -> Result<Tensor> {
    let x4 = view4(x, "pool2d input")?;
    let (n, c, h, w) = x4.dim();
    let (oh, ow) = window.output_size(h, w)?;
    let spans = windows(window, h, w)?;

    let mut out = Array4::<f32>::zeros((n, c, oh, ow));
    for b in 0..n {
        for ch in 0..c {
            for ((i, j), rows, cols) in &spans {
                let region = x4.slice(ndarray::s![b, ch, rows.clone(), cols.clone()]);
                out[[b, ch, *i, *j]] = match mode {
                    PoolMode::Max => region.fold(f32::NEG_INFINITY, |m, &v| m.max(v)),
                    PoolMode::Average => region.sum() / region.len() as f32,
                };
            }
        }
    }
    Ok(out.into_dyn())
}

/// Gradient of `sum(pool2d(x) * s)` with respect to `x`.
///
/// Max pooling routes each signal to the first maximal element of its window;
/// average pooling spreads it evenly over the window.
pub fn pool2d_input_grad(x: &Tensor, s: &Tensor, window: PoolWindow, mode: PoolMode) -> Result<Tensor> {
    let x4 = view4(x, "pool2d input")?;
    let s4 = view4(s, "pool2d upstream signal")?;
    let (n, c, h, w) = x4.dim();
    let (oh, ow) = window.output_size(h, w)?;
    if s4.dim() != (n, c, oh, ow) {
        return Err(RelpropError::shape("pool2d upstream signal", &[n, c, oh, ow], s.shape()));
    }
    let spans = windows(window, h, w)?;

    let mut grad = Array4::<f32>::zeros((n, c, h, w));
    for b in 0..n {
        for ch in 0..c {
            for ((i, j), rows, cols) in &spans {
                let sv = s4[[b, ch, *i, *j]];
                match mode {
                    PoolMode::Max => {
                        let mut best = (rows.start, cols.start);
                        let mut best_v = f32::NEG_INFINITY;
                        for r in rows.clone() {
                            for q in cols.clone() {
                                let v = x4[[b, ch, r, q]];
                                if v > best_v {
                                    best_v = v;
                                    best = (r, q);
                                }
                            }
                        }
                        grad[[b, ch, best.0, best.1]] += sv;
                    }
                    PoolMode::Average => {
                        let share = sv / (rows.len() * cols.len()) as f32;
                        for r in rows.clone() {
                            for q in cols.clone() {
                                grad[[b, ch, r, q]] += share;
                            }
                        }
                    }
                }
            }
        }
    }
    Ok(grad.into_dyn())
}
