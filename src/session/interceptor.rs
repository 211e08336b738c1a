//! Attaches one rule per layer so that forward evaluations capture what the rules need.
use crate::analysis::topology;
use crate::config::PropagationConfig;
use crate::graph::{Method, NodeKind, OperationGraph};
use crate::model::{LayerId, Model};
use crate::rules::{registry, RelProp};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// Rules attached to layers, keyed by layer. A layer called at several nodes has one rule.
#[derive(Default)]
pub struct RuleBook<'m> {
    rules: HashMap<LayerId, Box<dyn RelProp + 'm>>,
    unsupported: HashSet<LayerId>,
}

impl<'m> RuleBook<'m> {
    pub fn new() -> Self {
        Self { rules: HashMap::new(), unsupported: HashSet::new() }
    }

    #[inline(always)]
    pub fn get(&self, layer: LayerId) -> Option<&(dyn RelProp + 'm)> {
        self.rules.get(&layer).map(|r| r.as_ref())
    }

    pub fn is_attached(&self, layer: LayerId) -> bool {
        self.rules.contains_key(&layer)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

pub struct Interceptor<'a, 'm> {
    graph: &'a OperationGraph,
    model: &'m Model,
    config: &'a PropagationConfig,
}

impl<'a, 'm> Interceptor<'a, 'm> {
    pub fn new(graph: &'a OperationGraph, model: &'m Model, config: &'a PropagationConfig) -> Self {
        Self { graph, model, config }
    }

    /// Visits every node reachable from the inputs once and attaches a rule to each
    /// layer that has none yet. Returns how many rules were newly attached.
    ///
    /// Layers without a registered rule are skipped; they only become an error if a
    /// propagation needs them.
    pub fn attach(&self, book: &mut RuleBook<'m>) -> usize {
        let reachable = topology::downstream_from(self.graph, self.graph.placeholders());
        let mut ids: Vec<_> = reachable.into_iter().collect();
        ids.sort_unstable();

        let mut attached = 0;
        for id in ids {
            let Some(node) = self.graph.node(id) else { continue };
            let (NodeKind::Module, Method::Layer { id: layer_id, layer_type }) = (node.kind, &node.method) else {
                continue;
            };
            if book.is_attached(*layer_id) || book.unsupported.contains(layer_id) {
                continue;
            }
            let Some(named) = self.model.layer(*layer_id) else { continue };

            let bound = registry::rule_for_module(*layer_type)
                .ok_or_else(|| format!("no rule registered for {}", layer_type))
                .and_then(|kind| kind.bind_layer(&named.layer, self.config).map_err(|e| e.to_string()));
            match bound {
                Ok(rule) => {
                    book.rules.insert(*layer_id, rule);
                    attached += 1;
                }
                Err(reason) => {
                    warn!(layer = %named.name, node = %node.name, %reason, "layer left without a relevance rule");
                    book.unsupported.insert(*layer_id);
                }
            }
        }
        debug!(attached, total = book.len(), "attached relevance rules");
        attached
    }
}
