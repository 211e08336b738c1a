//! A nested layer list: inner activations are recomputed from the captured input,
//! then the child rules run back to front.
use super::{registry, single_input, RelProp, Relevance};
use crate::config::PropagationConfig;
use crate::error::{RelpropError, Result};
use crate::model::Layer;
use crate::tensor::Tensor;
use smallvec::smallvec;

pub struct SequentialRule<'m> {
    layers: &'m [Layer],
    children: Vec<Box<dyn RelProp + 'm>>,
}

impl<'m> SequentialRule<'m> {
    pub fn new(layers: &'m [Layer], config: &PropagationConfig) -> Result<Self> {
        let children = layers
            .iter()
            .map(|layer| {
                registry::rule_for_module(layer.layer_type())
                    .ok_or_else(|| RelpropError::Config(format!("no rule for nested {}", layer.layer_type())))?
                    .bind_layer(layer, config)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { layers, children })
    }
}

impl RelProp for SequentialRule<'_> {
    fn name(&self) -> &'static str {
        "Sequential"
    }

    fn relprop(&self, relevance: &Tensor, inputs: &[&Tensor]) -> Result<Relevance> {
        let x = single_input(self.name(), inputs)?;

        let mut activations = Vec::with_capacity(self.layers.len() + 1);
        activations.push(x.clone());
        for layer in self.layers {
            let next = layer.forward(&activations[activations.len() - 1])?;
            activations.push(next);
        }

        let mut r = relevance.clone();
        for (child, input) in self.children.iter().zip(&activations).rev() {
            let mut out = child.relprop(&r, &[input])?;
            r = out.swap_remove(0);
        }
        Ok(smallvec![r])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Linear;
    use crate::rules::linear::LinearRule;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn layers() -> Vec<Layer> {
        vec![
            Layer::linear(array![[1.0, 2.0], [0.5, 0.5]], None),
            Layer::ReLU,
            Layer::linear(array![[1.0, 3.0]], None),
        ]
    }

    #[test]
    fn test_sequential_matches_manual_chain() {
        let layers = layers();
        let config = PropagationConfig::default();
        let rule = SequentialRule::new(&layers, &config).unwrap();
        let x = array![1.0f32, 1.0].into_dyn();
        let r = array![1.0f32].into_dyn();
        let out = rule.relprop(&r, &[&x]).unwrap();

        // By hand: h = [3, 1], last layer splits 1 as [3/6, 3/6].
        let Layer::Linear(first) = &layers[0] else { unreachable!() };
        let h = array![3.0f32, 1.0].into_dyn();
        let r_h = LinearRule::new(&Linear::new(array![[1.0, 3.0]], None), 1.0).relprop(&r, &[&h]).unwrap();
        let r_x = LinearRule::new(first, 1.0).relprop(&r_h[0], &[&x]).unwrap();
        for (a, b) in out[0].iter().zip(r_x[0].iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-6);
        }
        assert_abs_diff_eq!(out[0].sum(), 1.0, epsilon = 1e-5);
    }

    #[test]
    fn test_sequential_refuses_unsupported_children() {
        let layers = vec![Layer::ReLU, Layer::Sigmoid];
        assert!(SequentialRule::new(&layers, &PropagationConfig::default()).is_err());
    }
}
