//! Static tables binding operation identity to a rule kind.
//!
//! Three tables: stateful layers by type, built-in functions by op code, and the
//! name table used for operations only known through a call descriptor. The
//! function and name tables must cover the same operations.
use super::RuleKind;
use crate::graph::{Method, NodeKind, OperationNode};
use crate::model::{LayerType, OpCode};

pub const SUPPORTED_MODULES: &[(LayerType, RuleKind)] = &[
    (LayerType::Sequential, RuleKind::Sequential),
    (LayerType::ReLU, RuleKind::PassThrough),
    (LayerType::Dropout, RuleKind::PassThrough),
    (LayerType::MaxPool2d, RuleKind::ZPool),
    (LayerType::AdaptiveAvgPool2d, RuleKind::ZPool),
    (LayerType::AvgPool2d, RuleKind::ZPool),
    (LayerType::BatchNorm2d, RuleKind::BatchNorm),
    (LayerType::Linear, RuleKind::AlphaBeta),
    (LayerType::Conv2d, RuleKind::AlphaBeta),
];

pub const SUPPORTED_FUNCTIONS: &[(OpCode, RuleKind)] = &[
    (OpCode::Add, RuleKind::AddMerge),
    (OpCode::Flatten, RuleKind::Flatten),
];

pub const SUPPORTED_BUILTINS: &[(&str, OpCode)] = &[
    ("add", OpCode::Add),
    ("flatten", OpCode::Flatten),
];

pub fn rule_for_module(layer_type: LayerType) -> Option<RuleKind> {
    SUPPORTED_MODULES.iter().find(|(t, _)| *t == layer_type).map(|(_, k)| *k)
}

pub fn rule_for_function(code: OpCode) -> Option<RuleKind> {
    SUPPORTED_FUNCTIONS.iter().find(|(c, _)| *c == code).map(|(_, k)| *k)
}

/// Resolves a canonical operation name through the name table.
pub fn rule_for_builtin(name: &str) -> Option<RuleKind> {
    SUPPORTED_BUILTINS.iter().find(|(n, _)| *n == name).and_then(|(_, code)| rule_for_function(*code))
}

/// Recovers the canonical operation name from a call descriptor.
///
/// `"<built-in method add of type object at 0x..>"` -> `add`,
/// `"<built-in function mul>"` -> `mul`, `"torch.flatten"` -> `flatten`.
pub fn canonical_name(descriptor: &str) -> Option<String> {
    let descriptor = descriptor.trim();
    let name = match descriptor.strip_prefix('<').and_then(|d| d.strip_suffix('>')) {
        Some(inner) => inner.split(' ').nth(2)?,
        None => descriptor.rsplit('.').next()?,
    };
    let valid = !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    valid.then(|| name.to_string())
}

/// The rule kind a node resolves to, or `None` when no table covers it.
/// Inputs and the output sink always pass relevance through.
pub fn rule_for_node(node: &OperationNode) -> Option<RuleKind> {
    match (node.kind, &node.method) {
        (NodeKind::Placeholder | NodeKind::Output, _) => Some(RuleKind::PassThrough),
        (NodeKind::Module, Method::Layer { layer_type, .. }) => rule_for_module(*layer_type),
        (NodeKind::Function, Method::Function(f)) => match (f.code, &f.builtin_name) {
            (Some(code), _) => rule_for_function(code),
            (None, Some(name)) => rule_for_builtin(name),
            (None, None) => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_function_and_name_tables_agree() {
        for (code, kind) in SUPPORTED_FUNCTIONS {
            assert_eq!(rule_for_builtin(code.name()), Some(*kind), "{:?} missing from name table", code);
        }
        for (name, code) in SUPPORTED_BUILTINS {
            assert_eq!(*name, code.name());
            assert!(rule_for_function(*code).is_some(), "{} has no function rule", name);
        }
        assert_eq!(SUPPORTED_FUNCTIONS.len(), SUPPORTED_BUILTINS.len());
        assert_eq!(OpCode::ALL.len(), SUPPORTED_FUNCTIONS.len());
    }

    #[rstest]
    #[case("<built-in method add of type object at 0x7f01>", Some("add"))]
    #[case("<built-in function flatten>", Some("flatten"))]
    #[case("<built-in function mul>", Some("mul"))]
    #[case("torch.flatten", Some("flatten"))]
    #[case("add", Some("add"))]
    #[case("<lambda>", None)]
    #[case("", None)]
    fn test_canonical_name(#[case] descriptor: &str, #[case] expected: Option<&str>) {
        assert_eq!(canonical_name(descriptor).as_deref(), expected);
    }

    #[rstest]
    #[case(LayerType::Linear, Some(RuleKind::AlphaBeta))]
    #[case(LayerType::ReLU, Some(RuleKind::PassThrough))]
    #[case(LayerType::AdaptiveAvgPool2d, Some(RuleKind::ZPool))]
    #[case(LayerType::Sigmoid, None)]
    #[case(LayerType::Tanh, None)]
    fn test_module_table(#[case] layer_type: LayerType, #[case] expected: Option<RuleKind>) {
        assert_eq!(rule_for_module(layer_type), expected);
    }

    #[test]
    fn test_unknown_builtin_is_unresolved() {
        assert_eq!(rule_for_builtin("mul"), None);
    }
}
