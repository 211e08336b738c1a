//! Propagation settings.
use crate::error::{RelpropError, Result};
use serde::{Deserialize, Serialize};

/// How the driver walks the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Traversal {
    /// Reverse topological schedule. Stack depth does not grow with model depth.
    #[default]
    Scheduled,
    /// Memoised post-order recursion from the root.
    Recursive,
}

/// How an elementwise add divides relevance between its operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddSplit {
    /// In proportion to each operand's contribution to the sum.
    #[default]
    Proportional,
    /// Half to each operand.
    Equal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PropagationConfig {
    pub traversal: Traversal,
    /// Weight of the positive (activator) term of the alpha-beta rule. `beta = alpha - 1`.
    pub alpha: f32,
    pub add_split: AddSplit,
    /// Added to batch-norm denominators.
    pub stabilizer: f32,
    /// Keep the relevance computed at every node.
    pub record_trace: bool,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            traversal: Traversal::Scheduled,
            alpha: 1.0,
            add_split: AddSplit::Proportional,
            stabilizer: 1e-9,
            record_trace: false,
        }
    }
}

impl PropagationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_traversal(mut self, traversal: Traversal) -> Self {
        self.traversal = traversal;
        self
    }

    pub fn with_alpha(mut self, alpha: f32) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn with_add_split(mut self, split: AddSplit) -> Self {
        self.add_split = split;
        self
    }

    pub fn with_trace(mut self, record: bool) -> Self {
        self.record_trace = record;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !self.alpha.is_finite() || self.alpha < 1.0 {
            return Err(RelpropError::Config(format!("alpha must be >= 1, got {}", self.alpha)));
        }
        if !self.stabilizer.is_finite() || self.stabilizer <= 0.0 {
            return Err(RelpropError::Config(format!("stabilizer must be positive, got {}", self.stabilizer)));
        }
        Ok(())
    }

    /// Parses and validates a JSON document. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| RelpropError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_defaults_are_valid() {
        let config = PropagationConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.alpha, 1.0);
        assert_eq!(config.traversal, Traversal::Scheduled);
    }

    #[test]
    fn test_from_json_fills_missing_fields() {
        let config = PropagationConfig::from_json(r#"{"traversal": "recursive", "add_split": "equal"}"#).unwrap();
        assert_eq!(config.traversal, Traversal::Recursive);
        assert_eq!(config.add_split, AddSplit::Equal);
        assert_eq!(config.alpha, 1.0);
        assert!(!config.record_trace);
    }

    #[rstest]
    #[case(r#"{"alpha": 0.5}"#)]
    #[case(r#"{"stabilizer": 0.0}"#)]
    #[case(r#"{"traversal": "sideways"}"#)]
    #[case("not json")]
    fn test_from_json_rejects(#[case] json: &str) {
        assert!(matches!(PropagationConfig::from_json(json), Err(RelpropError::Config(_))));
    }

    #[test]
    fn test_builder_methods() {
        let config = PropagationConfig::new().with_alpha(2.0).with_trace(true);
        assert_eq!(config.alpha, 2.0);
        assert!(config.record_trace);
    }
}
