//! Dense activations and relevance values.
//!
//! Everything that flows along graph edges is a `Tensor`, a dynamically ranked
//! `ndarray` array of `f32`. The helpers here cover what the layers and the
//! relevance rules need beyond plain `ndarray` arithmetic.
pub mod conv;
pub mod pool;

use crate::error::{RelpropError, Result};
use ndarray::{ArrayD, ArrayView2, Axis, Ix2, IxDyn, Zip};

pub use conv::Conv2dGeometry;
pub use pool::{PoolMode, PoolWindow};

pub type Tensor = ArrayD<f32>;

/// Builds a tensor from row-major values.
pub fn tensor(shape: &[usize], values: Vec<f32>) -> Result<Tensor> {
    let len = values.len();
    Tensor::from_shape_vec(IxDyn(shape), values)
        .map_err(|_| RelpropError::shape("tensor construction", shape, &[len]))
}

/// Reinterprets `t` with a new shape, keeping row-major element order.
pub fn reshape(t: &Tensor, shape: &[usize]) -> Result<Tensor> {
    if t.len() != shape.iter().product::<usize>() {
        return Err(RelpropError::shape("reshape", shape, t.shape()));
    }
    tensor(shape, t.iter().copied().collect())
}

pub fn ensure_same_shape(context: &str, expected: &Tensor, actual: &Tensor) -> Result<()> {
    if expected.shape() != actual.shape() {
        return Err(RelpropError::shape(context, expected.shape(), actual.shape()));
    }
    Ok(())
}

/// Elementwise `a / b`, yielding 0 wherever `b` is exactly 0.
pub fn safe_divide(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    ensure_same_shape("safe_divide", a, b)?;
    Ok(Zip::from(a).and(b).map_collect(|&a, &b| if b == 0.0 { 0.0 } else { a / b }))
}

#[inline]
pub fn positive(t: &Tensor) -> Tensor {
    t.mapv(|v| v.max(0.0))
}

#[inline]
pub fn negative(t: &Tensor) -> Tensor {
    t.mapv(|v| v.min(0.0))
}

/// Views a rank-1 or rank-2 tensor as a `[batch, features]` matrix.
/// The flag is true when the input was rank-1 and a batch axis was inserted.
pub fn as_matrix(t: &Tensor) -> Result<(ArrayView2<'_, f32>, bool)> {
    match t.ndim() {
        1 => {
            let view = t.view().insert_axis(Axis(0)).into_dimensionality::<Ix2>();
            view.map(|v| (v, true))
                .map_err(|_| RelpropError::shape("matrix view", &[1, t.len()], t.shape()))
        }
        2 => t
            .view()
            .into_dimensionality::<Ix2>()
            .map(|v| (v, false))
            .map_err(|_| RelpropError::shape("matrix view", &[0, 0], t.shape())),
        _ => Err(RelpropError::shape("matrix view (rank 1 or 2)", &[0, 0], t.shape())),
    }
}

/// Undoes the batch axis inserted by [`as_matrix`].
pub fn from_matrix(m: ndarray::Array2<f32>, squeeze: bool) -> Tensor {
    if squeeze {
        m.index_axis_move(Axis(0), 0).into_dyn()
    } else {
        m.into_dyn()
    }
}

/// Index of the first maximal element, ignoring NaN.
pub fn argmax<'a>(values: impl IntoIterator<Item = &'a f32>) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &v) in values.into_iter().enumerate() {
        if v.is_nan() {
            continue;
        }
        match best {
            Some((_, b)) if v <= b => {}
            _ => best = Some((i, v)),
        }
    }
    best.map(|(i, _)| i)
}

/// One-hot relevance over the last axis of `output`, one hot entry per lane.
///
/// With `target = None` each lane is seeded at its own argmax. Returns the seed
/// together with the chosen class of every lane.
pub fn one_hot(output: &Tensor, target: Option<usize>) -> Result<(Tensor, Vec<usize>)> {
    if output.ndim() == 0 || output.is_empty() {
        return Err(RelpropError::shape("one-hot seed", &[1], output.shape()));
    }
    let axis = Axis(output.ndim() - 1);
    let classes = output.len_of(axis);
    let mut seed = Tensor::zeros(output.raw_dim());
    let mut chosen = Vec::new();

    for (lane, mut out) in output.lanes(axis).into_iter().zip(seed.lanes_mut(axis)) {
        let idx = match target {
            Some(t) if t < classes => t,
            Some(t) => return Err(RelpropError::shape("one-hot target class", &[classes], &[t])),
            None => argmax(lane.iter()).unwrap_or(0),
        };
        out[idx] = 1.0;
        chosen.push(idx);
    }
    Ok((seed, chosen))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_safe_divide_zero_denominator() {
        let a = array![1.0f32, 2.0, 3.0].into_dyn();
        let b = array![2.0f32, 0.0, -3.0].into_dyn();
        let q = safe_divide(&a, &b).unwrap();
        assert_eq!(q, array![0.5f32, 0.0, -1.0].into_dyn());
    }

    #[test]
    fn test_safe_divide_rejects_shape_mismatch() {
        let a = array![1.0f32, 2.0].into_dyn();
        let b = array![1.0f32].into_dyn();
        assert!(matches!(safe_divide(&a, &b), Err(RelpropError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_reshape_keeps_row_major_order() {
        let t = tensor(&[2, 3], (0..6).map(|v| v as f32).collect()).unwrap();
        let r = reshape(&t.t().to_owned().into_dyn(), &[6]).unwrap();
        // Transposed logical order is column-major of the original.
        assert_eq!(r.iter().copied().collect::<Vec<_>>(), vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
        assert!(reshape(&t, &[4]).is_err());
    }

    #[test]
    fn test_one_hot_per_row() {
        let out = tensor(&[2, 3], vec![0.1, 0.7, 0.2, 0.9, 0.0, 0.3]).unwrap();
        let (seed, chosen) = one_hot(&out, None).unwrap();
        assert_eq!(chosen, vec![1, 0]);
        assert_eq!(seed, tensor(&[2, 3], vec![0.0, 1.0, 0.0, 1.0, 0.0, 0.0]).unwrap());

        let (seed, chosen) = one_hot(&out, Some(2)).unwrap();
        assert_eq!(chosen, vec![2, 2]);
        assert_eq!(seed.sum(), 2.0);
        assert!(one_hot(&out, Some(3)).is_err());
    }

    #[test]
    fn test_matrix_round_trip_for_vectors() {
        let v = array![1.0f32, 2.0].into_dyn();
        let (m, squeezed) = as_matrix(&v).unwrap();
        assert!(squeezed);
        assert_eq!(m.dim(), (1, 2));
        assert_eq!(from_matrix(m.to_owned(), squeezed), v);
    }
}
