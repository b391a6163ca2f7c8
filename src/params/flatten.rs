//! Flattening of nested configuration into dotted parameter paths

use std::collections::HashSet;

use super::value::{ConfigNode, ConfigTree, OrderedMap, ParamValue};
use crate::errors::{Result, ScriptError};

/// Flattened parameters: dotted path to leaf value, in traversal order
pub type FlatParams = OrderedMap<ParamValue>;

/// Suffix appended to the shell variable holding a grid-searched parameter
pub const PARAM_VAR_SUFFIX: &str = "_param";

/// Flatten a configuration tree into dotted paths.
///
/// Each level keeps its insertion order. Lists are leaves.
pub fn flatten(tree: &ConfigTree) -> Result<FlatParams> {
    flatten_where(tree, |_, _| true)
}

/// Flatten a configuration tree, keeping only leaves accepted by `keep`.
///
/// Collisions are detected on every leaf, including the rejected ones.
pub fn flatten_where<F>(tree: &ConfigTree, keep: F) -> Result<FlatParams>
where
    F: Fn(&str, &ParamValue) -> bool,
{
    let mut flat = FlatParams::new();
    let mut seen = HashSet::new();
    gather(tree, None, &keep, &mut seen, &mut flat)?;
    Ok(flat)
}

fn gather<F>(
    tree: &ConfigTree,
    prefix: Option<&str>,
    keep: &F,
    seen: &mut HashSet<String>,
    flat: &mut FlatParams,
) -> Result<()>
where
    F: Fn(&str, &ParamValue) -> bool,
{
    for (key, node) in tree.iter() {
        let path = match prefix {
            Some(prefix) => format!("{}.{}", prefix, key),
            None => key.to_string(),
        };
        match node {
            ConfigNode::Tree(subtree) => gather(subtree, Some(&path), keep, seen, flat)?,
            ConfigNode::Value(value) => {
                if !seen.insert(path.clone()) {
                    return Err(ScriptError::Collision { path });
                }
                if keep(&path, value) {
                    flat.insert(path, value.clone());
                }
            }
        }
    }
    Ok(())
}

/// Rebuild a nested tree from dotted paths.
///
/// A later path wins when it conflicts with an earlier one
/// (`a=1` followed by `a.b=2` yields `a: {b: 2}`).
pub fn unflatten(flat: &FlatParams) -> ConfigTree {
    let mut tree = ConfigTree::new();
    for (path, value) in flat.iter() {
        let mut override_tree = ConfigTree::new();
        let mut segments: Vec<&str> = path.split('.').collect();
        let leaf = segments.pop().unwrap_or_default();
        override_tree.set(leaf, value.clone());
        while let Some(segment) = segments.pop() {
            let mut parent = ConfigTree::new();
            parent.set_tree(segment, override_tree);
            override_tree = parent;
        }
        tree.merge(override_tree);
    }
    tree
}

/// Shell variable name used for a grid-searched parameter path.
///
/// All `.` and `/` characters are deleted, so distinct paths such as `a.b`
/// and `a/b` share a variable; callers must check for that.
pub fn param_variable(path: &str) -> String {
    let mut name: String = path.chars().filter(|c| *c != '.' && *c != '/').collect();
    name.push_str(PARAM_VAR_SUFFIX);
    name
}
