//! Defines the `Edge` type, representing a data dependency between two nodes.

/// A data dependency from a producer to one argument position of a consumer.
///
/// Example: `C = add(A, B)` yields `A -> C` with `slot: 0` and `B -> C` with `slot: 1`.
/// `add(A, A)` yields two parallel edges from `A`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Edge {
    pub slot: u32,
}
