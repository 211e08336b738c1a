//! Defines the core data structures for the operation graph.
pub mod builder;
pub mod cache;
pub mod dag;
pub mod edge;
pub mod node;

// Re-export key types for convenient access
pub use builder::{build_graph, GraphBuilder};
pub use cache::GraphCache;
pub use dag::OperationGraph;
pub use edge::Edge;
pub use node::{FunctionRef, Method, NodeId, NodeKind, OperationNode};
