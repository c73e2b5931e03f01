// Helper functions for extracting values from KDL nodes

use kdl::{KdlNode, KdlValue};

use crate::{ConfigError, ConfigResult};

pub(crate) fn first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

pub(crate) fn all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

fn prop<'a>(node: &'a KdlNode, name: &str) -> Option<&'a KdlValue> {
    // Last occurrence wins, as in KDL property semantics.
    node.entries()
        .iter()
        .rev()
        .find(|e| e.name().map(|n| n.value() == name).unwrap_or(false))
        .map(|e| e.value())
}

pub(crate) fn string_prop(node: &KdlNode, name: &str) -> Option<String> {
    prop(node, name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

pub(crate) fn bool_prop(node: &KdlNode, name: &str) -> Option<bool> {
    prop(node, name).and_then(|v| v.as_bool())
}

/// A non-negative integer property; a present but malformed value is an error.
pub(crate) fn u32_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<u32>> {
    match prop(node, name) {
        None => Ok(None),
        Some(value) => to_u32(value, name).map(Some),
    }
}

pub(crate) fn u32_arg(node: &KdlNode, field: &str) -> ConfigResult<u32> {
    let value = node
        .entries()
        .iter()
        .find(|e| e.name().is_none())
        .map(|e| e.value())
        .ok_or_else(|| ConfigError::MissingField(field.to_string()))?;
    to_u32(value, field)
}

fn to_u32(value: &KdlValue, field: &str) -> ConfigResult<u32> {
    value
        .as_integer()
        .and_then(|i| u32::try_from(i).ok())
        .ok_or_else(|| ConfigError::invalid(field, format!("expected a non-negative integer, got {}", value)))
}

/// Children of the form `KEY "value"`, as used by `env { ... }` blocks.
pub(crate) fn key_value_children(node: &KdlNode) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            let key = child.name().value().to_string();
            if let Some(val) = first_string_arg(child) {
                pairs.push((key, val));
            }
        }
    }
    pairs
}
