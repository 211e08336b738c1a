//! Stateless operations called between layers (merges, reshapes, user functions).
use crate::error::{RelpropError, Result};
use crate::tensor::{self, Tensor};
use std::fmt;
use std::sync::Arc;

/// Stable identifier of a built-in stateless operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OpCode {
    Add,
    Flatten,
}

impl OpCode {
    pub const ALL: [OpCode; 2] = [OpCode::Add, OpCode::Flatten];

    /// Canonical operation name, as it appears in call descriptors.
    pub fn name(&self) -> &'static str {
        match self {
            OpCode::Add => "add",
            OpCode::Flatten => "flatten",
        }
    }
}

pub type CustomForward = Arc<dyn Fn(&[&Tensor]) -> Result<Tensor> + Send + Sync>;

/// A user-supplied stateless operation known only through a call descriptor,
/// e.g. `"<built-in method add of type object>"` or `"torch.flatten"`.
#[derive(Clone)]
pub struct CustomOp {
    pub descriptor: String,
    pub arity: usize,
    forward: CustomForward,
}

impl CustomOp {
    pub fn new<F>(descriptor: impl Into<String>, arity: usize, forward: F) -> Self
    where
        F: Fn(&[&Tensor]) -> Result<Tensor> + Send + Sync + 'static,
    {
        Self { descriptor: descriptor.into(), arity, forward: Arc::new(forward) }
    }
}

impl fmt::Debug for CustomOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomOp").field("descriptor", &self.descriptor).field("arity", &self.arity).finish()
    }
}

#[derive(Debug, Clone)]
pub enum FunctionOp {
    /// Elementwise sum of two same-shaped tensors.
    Add,
    /// Collapses every axis from `start_dim` onwards into one.
    Flatten { start_dim: usize },
    Custom(CustomOp),
}

impl FunctionOp {
    pub fn arity(&self) -> usize {
        match self {
            FunctionOp::Add => 2,
            FunctionOp::Flatten { .. } => 1,
            FunctionOp::Custom(op) => op.arity,
        }
    }

    /// Direct identity, available for built-in operations only.
    pub fn code(&self) -> Option<OpCode> {
        match self {
            FunctionOp::Add => Some(OpCode::Add),
            FunctionOp::Flatten { .. } => Some(OpCode::Flatten),
            FunctionOp::Custom(_) => None,
        }
    }

    pub fn descriptor(&self) -> String {
        match self {
            FunctionOp::Custom(op) => op.descriptor.clone(),
            other => other.code().map(|c| c.name().to_string()).unwrap_or_default(),
        }
    }

    pub fn apply(&self, args: &[&Tensor]) -> Result<Tensor> {
        if args.len() != self.arity() {
            return Err(RelpropError::ArityMismatch { name: self.descriptor(), expected: self.arity(), actual: args.len() });
        }
        match self {
            FunctionOp::Add => {
                tensor::ensure_same_shape("add operands", args[0], args[1])?;
                Ok(args[0] + args[1])
            }
            FunctionOp::Flatten { start_dim } => {
                let x = args[0];
                if *start_dim >= x.ndim() {
                    return Err(RelpropError::shape("flatten start_dim", &[x.ndim()], &[*start_dim]));
                }
                let mut shape = x.shape()[..*start_dim].to_vec();
                shape.push(x.shape()[*start_dim..].iter().product());
                tensor::reshape(x, &shape)
            }
            FunctionOp::Custom(op) => (op.forward)(args),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::tensor;

    #[test]
    fn test_flatten_keeps_batch_axis() {
        let x = tensor(&[2, 3, 2, 2], vec![0.0; 24]).unwrap();
        let y = FunctionOp::Flatten { start_dim: 1 }.apply(&[&x]).unwrap();
        assert_eq!(y.shape(), &[2, 12]);
        assert!(FunctionOp::Flatten { start_dim: 4 }.apply(&[&x]).is_err());
    }

    #[test]
    fn test_add_requires_matching_shapes() {
        let a = tensor(&[2], vec![1.0, 2.0]).unwrap();
        let b = tensor(&[2], vec![3.0, 4.0]).unwrap();
        assert_eq!(FunctionOp::Add.apply(&[&a, &b]).unwrap(), tensor(&[2], vec![4.0, 6.0]).unwrap());
        let c = tensor(&[3], vec![0.0; 3]).unwrap();
        assert!(FunctionOp::Add.apply(&[&a, &c]).is_err());
        assert!(matches!(FunctionOp::Add.apply(&[&a]), Err(RelpropError::ArityMismatch { .. })));
    }

    #[test]
    fn test_custom_op_runs_closure() {
        let double = FunctionOp::Custom(CustomOp::new("<built-in function mul>", 1, |args| Ok(args[0] * 2.0)));
        let x = tensor(&[2], vec![1.0, -1.0]).unwrap();
        assert_eq!(double.apply(&[&x]).unwrap(), tensor(&[2], vec![2.0, -2.0]).unwrap());
        assert_eq!(double.code(), None);
        assert_eq!(double.descriptor(), "<built-in function mul>");
    }
}
