//! Seeding relevance at the prediction and packaging the result.
use crate::error::{RelpropError, Result};
use crate::tensor::{self, Tensor};
use ndarray::Axis;
use serde::{Deserialize, Serialize};

/// Where the relevance walk starts.
#[derive(Debug, Clone, PartialEq)]
pub enum SeedRelevance {
    /// One-hot at the predicted class (argmax over the last axis, per row).
    Predicted,
    /// One-hot at the given class for every row.
    Target(usize),
    /// A caller-built relevance tensor shaped like the prediction.
    Explicit(Tensor),
}

impl SeedRelevance {
    /// Builds the seed for `prediction`, with the chosen class per row when one-hot.
    pub fn resolve(&self, prediction: &Tensor) -> Result<(Tensor, Option<Vec<usize>>)> {
        match self {
            SeedRelevance::Predicted => tensor::one_hot(prediction, None).map(|(s, c)| (s, Some(c))),
            SeedRelevance::Target(class) => tensor::one_hot(prediction, Some(*class)).map(|(s, c)| (s, Some(c))),
            SeedRelevance::Explicit(seed) => {
                tensor::ensure_same_shape("explicit seed relevance", prediction, seed)?;
                Ok((seed.clone(), None))
            }
        }
    }
}

/// Relevance attributed to the primary input.
#[derive(Debug, Clone)]
pub struct Attribution {
    /// Shaped like the input.
    pub values: Tensor,
    pub seed: Tensor,
    pub prediction: Tensor,
    /// Seeded class per row, when the seed was one-hot.
    pub classes: Option<Vec<usize>>,
}

impl Attribution {
    pub fn total(&self) -> f32 {
        self.values.sum()
    }

    /// `|sum(attribution) - sum(seed)|`. Zero for fully conserving rule chains.
    pub fn conservation_gap(&self) -> f32 {
        (self.values.sum() - self.seed.sum()).abs()
    }

    /// For image inputs `[batch, channels, h, w]`: relevance summed over channels,
    /// laid out channels-last as `[batch, h, w, 1]`.
    pub fn channel_heatmap(&self) -> Result<Tensor> {
        if self.values.ndim() != 4 {
            return Err(RelpropError::shape("channel heatmap (rank 4)", &[0, 0, 0, 0], self.values.shape()));
        }
        let summed = self.values.sum_axis(Axis(1));
        Ok(summed.insert_axis(Axis(3)))
    }

    pub fn summary(&self) -> AttributionSummary {
        AttributionSummary {
            shape: self.values.shape().to_vec(),
            total: self.total(),
            seed_total: self.seed.sum(),
            conservation_gap: self.conservation_gap(),
            classes: self.classes.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributionSummary {
    pub shape: Vec<usize>,
    pub total: f32,
    pub seed_total: f32,
    pub conservation_gap: f32,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub classes: Option<Vec<usize>>,
}

impl AttributionSummary {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| RelpropError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn sample() -> Attribution {
        Attribution {
            values: tensor::tensor(&[1, 2, 1, 2], vec![0.1, 0.2, 0.3, 0.4]).unwrap(),
            seed: array![0.0f32, 1.0].into_dyn(),
            prediction: array![0.2f32, 0.9].into_dyn(),
            classes: Some(vec![1]),
        }
    }

    #[test]
    fn test_seed_resolution() {
        let pred = array![0.2f32, 0.9, 0.1].into_dyn();
        let (seed, classes) = SeedRelevance::Predicted.resolve(&pred).unwrap();
        assert_eq!(seed, array![0.0f32, 1.0, 0.0].into_dyn());
        assert_eq!(classes, Some(vec![1]));

        let (seed, _) = SeedRelevance::Target(2).resolve(&pred).unwrap();
        assert_eq!(seed, array![0.0f32, 0.0, 1.0].into_dyn());

        let explicit = SeedRelevance::Explicit(array![0.5f32, 0.5].into_dyn());
        assert!(matches!(explicit.resolve(&pred), Err(RelpropError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_channel_heatmap_sums_channels() {
        let heat = sample().channel_heatmap().unwrap();
        assert_eq!(heat.shape(), &[1, 1, 2, 1]);
        approx::assert_abs_diff_eq!(heat[[0, 0, 0, 0]], 0.4, epsilon = 1e-6);
        approx::assert_abs_diff_eq!(heat[[0, 0, 1, 0]], 0.6, epsilon = 1e-6);
    }

    #[test]
    fn test_summary_json() {
        let summary = sample().summary();
        approx::assert_abs_diff_eq!(summary.conservation_gap, 0.0, epsilon = 1e-6);
        let json = summary.to_json().unwrap();
        let back: AttributionSummary = serde_json::from_str(&json).unwrap();
        assert_eq!(back.shape, vec![1, 2, 1, 2]);
        assert_eq!(back.classes, Some(vec![1]));
    }
}
