//! Grid-search expansion of list-valued parameters
//!
//! A grid search takes the list values of a selection of parameter paths,
//! enumerates their Cartesian product and drops every combination matched
//! by an exclusion rule. The surviving combinations become the tasks of the
//! job, numbered from 0 in product order.

use log::debug;
use serde::{Deserialize, Serialize};

use super::flatten::FlatParams;
use super::value::{OrderedMap, ParamValue};
use crate::errors::{Result, ScriptError};

/// A partial assignment of grid-searched paths.
///
/// A combination is excluded when it agrees with the rule on every key the
/// rule names; keys the rule leaves out match anything.
pub type ExclusionRule = OrderedMap<ParamValue>;

/// How the selected lists are combined into tasks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GridMode {
    /// Cartesian product, leftmost path varying slowest
    #[default]
    Product,
    /// Element-wise pairing; every list must have the same length
    Zip,
}

/// Grid-search selection and exclusion rules
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GridSearch {
    selected: Vec<String>,
    exclude: Vec<ExclusionRule>,
    mode: GridMode,
}

/// Result of expanding a grid search over flattened parameters
#[derive(Debug, Clone, PartialEq)]
pub struct GridExpansion {
    /// Number of combinations that survived the exclusion rules
    pub n_jobs: usize,
    /// Grid-searched paths in flattened order
    pub paths: Vec<String>,
    /// Parameters with each grid path rewritten to its per-task values
    pub expanded: FlatParams,
}

impl GridSearch {
    pub fn new<I, S>(selected: I, exclude: Vec<ExclusionRule>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut paths: Vec<String> = Vec::new();
        for path in selected {
            let path = path.into();
            if !paths.contains(&path) {
                paths.push(path);
            }
        }
        Self {
            selected: paths,
            exclude,
            mode: GridMode::Product,
        }
    }

    pub fn with_mode(mut self, mode: GridMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn mode(&self) -> GridMode {
        self.mode
    }

    pub fn selected(&self) -> &[String] {
        &self.selected
    }

    pub fn exclude(&self) -> &[ExclusionRule] {
        &self.exclude
    }

    pub fn is_empty(&self) -> bool {
        self.selected.is_empty()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.selected.iter().any(|p| p == path)
    }

    /// Check that every exclusion key is one of the selected paths
    pub fn validate_exclusions(&self) -> Result<()> {
        for rule in &self.exclude {
            for key in rule.keys() {
                if !self.contains(key) {
                    return Err(ScriptError::validation(format!(
                        "exclusion rule key '{}' is not a grid-search parameter; \
                         keys of excluded items must be a subset of the grid-search keys",
                        key
                    )));
                }
            }
        }
        Ok(())
    }

    /// Expand the selected list parameters into per-task values
    pub fn expand(&self, flat: &FlatParams) -> Result<GridExpansion> {
        self.validate_exclusions()?;

        for path in &self.selected {
            match flat.get(path) {
                None => {
                    return Err(ScriptError::validation(format!(
                        "grid-search parameter '{}' does not exist",
                        path
                    )));
                }
                Some(value) if !value.is_list() => {
                    return Err(ScriptError::validation(format!(
                        "grid-search parameter '{}' must be a list, got {}",
                        path, value
                    )));
                }
                Some(_) => {}
            }
        }

        // Flattened order, not selection order
        let mut paths = Vec::new();
        let mut axes: Vec<&[ParamValue]> = Vec::new();
        for (path, value) in flat.iter() {
            if self.contains(path)
                && let Some(items) = value.as_list()
            {
                paths.push(path.to_string());
                axes.push(items);
            }
        }

        let candidates = match self.mode {
            GridMode::Product => cartesian_product(&axes),
            GridMode::Zip => zip_axes(&paths, &axes)?,
        };
        let combinations: Vec<Vec<&ParamValue>> = candidates
            .into_iter()
            .filter(|combo| !self.is_excluded(&paths, combo))
            .collect();
        let n_jobs = combinations.len();
        debug!(
            "Grid search over {:?}: {} combination(s) after {} exclusion rule(s)",
            paths,
            n_jobs,
            self.exclude.len()
        );

        if n_jobs == 0 {
            return Err(ScriptError::validation(
                "grid search produced no combinations; \
                 an empty list or the exclusion rules remove every combination",
            ));
        }

        let mut expanded = flat.clone();
        for (axis, path) in paths.iter().enumerate() {
            let per_task: Vec<ParamValue> =
                combinations.iter().map(|combo| combo[axis].clone()).collect();
            expanded.insert(path.clone(), ParamValue::List(per_task));
        }

        Ok(GridExpansion {
            n_jobs,
            paths,
            expanded,
        })
    }

    fn is_excluded(&self, paths: &[String], combo: &[&ParamValue]) -> bool {
        self.exclude.iter().any(|rule| {
            rule.iter().all(|(key, excluded)| {
                paths
                    .iter()
                    .position(|p| p == key)
                    .is_some_and(|axis| combo[axis].loosely_eq(excluded))
            })
        })
    }
}

impl GridExpansion {
    /// Values of every grid-searched path for one task
    pub fn task_params(&self, task_id: usize) -> Result<OrderedMap<ParamValue>> {
        if task_id >= self.n_jobs {
            return Err(ScriptError::validation(format!(
                "task id {} is out of range; it should be >= 0 and < {}",
                task_id, self.n_jobs
            )));
        }
        let mut params = OrderedMap::new();
        for path in &self.paths {
            if let Some(ParamValue::List(values)) = self.expanded.get(path) {
                params.insert(path.clone(), values[task_id].clone());
            }
        }
        Ok(params)
    }
}

/// Cartesian product with the leftmost axis varying slowest
fn cartesian_product<'a>(axes: &[&'a [ParamValue]]) -> Vec<Vec<&'a ParamValue>> {
    let mut product: Vec<Vec<&ParamValue>> = vec![Vec::new()];
    for axis in axes {
        let mut next = Vec::with_capacity(product.len() * axis.len());
        for prefix in &product {
            for value in axis.iter() {
                let mut combo = prefix.clone();
                combo.push(value);
                next.push(combo);
            }
        }
        product = next;
    }
    product
}

/// Element-wise combination of equally long axes
fn zip_axes<'a>(paths: &[String], axes: &[&'a [ParamValue]]) -> Result<Vec<Vec<&'a ParamValue>>> {
    let Some(first) = axes.first() else {
        return Ok(vec![Vec::new()]);
    };
    let len = first.len();
    if let Some(axis) = axes.iter().position(|values| values.len() != len) {
        return Err(ScriptError::validation(format!(
            "zip mode requires lists of equal length: '{}' has {} values, '{}' has {}",
            paths[0],
            len,
            paths[axis],
            axes[axis].len()
        )));
    }
    Ok((0..len)
        .map(|i| axes.iter().map(|values| &values[i]).collect())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::flatten::flatten;
    use crate::params::value::ConfigTree;
    use serde_json::json;

    fn flat_ab() -> FlatParams {
        flatten(&ConfigTree::from_json(&json!({"a": [1, 2], "b": [3, 4]})).unwrap()).unwrap()
    }

    fn rule(value: serde_json::Value) -> ExclusionRule {
        let serde_json::Value::Object(map) = value else {
            panic!("rule must be an object");
        };
        map.iter()
            .map(|(k, v)| (k.clone(), ParamValue::from_json(v).unwrap()))
            .collect()
    }

    fn ints(values: &[i64]) -> ParamValue {
        ParamValue::List(values.iter().map(|v| ParamValue::Int(*v)).collect())
    }

    #[test]
    fn test_full_product() {
        let expansion = GridSearch::new(["a", "b"], vec![]).expand(&flat_ab()).unwrap();
        assert_eq!(expansion.n_jobs, 4);
        assert_eq!(expansion.expanded.get("a"), Some(&ints(&[1, 1, 2, 2])));
        assert_eq!(expansion.expanded.get("b"), Some(&ints(&[3, 4, 3, 4])));
    }

    #[test]
    fn test_exclude_full_rule() {
        let grid = GridSearch::new(["a", "b"], vec![rule(json!({"a": 1, "b": 3}))]);
        let expansion = grid.expand(&flat_ab()).unwrap();
        assert_eq!(expansion.n_jobs, 3);
        assert_eq!(expansion.expanded.get("a"), Some(&ints(&[1, 2, 2])));
        assert_eq!(expansion.expanded.get("b"), Some(&ints(&[4, 3, 4])));
    }

    #[test]
    fn test_exclude_partial_rule() {
        let grid = GridSearch::new(["a", "b"], vec![rule(json!({"a": 1}))]);
        let expansion = grid.expand(&flat_ab()).unwrap();
        assert_eq!(expansion.n_jobs, 2);
        assert_eq!(expansion.expanded.get("a"), Some(&ints(&[2, 2])));
        assert_eq!(expansion.expanded.get("b"), Some(&ints(&[3, 4])));
    }

    #[test]
    fn test_exclude_matches_numbers_by_value() {
        let flat = flatten(&ConfigTree::from_json(&json!({"lr": [1.0, 2.0]})).unwrap()).unwrap();
        let grid = GridSearch::new(["lr"], vec![[("lr", ParamValue::Int(1))].into_iter().collect()]);
        let expansion = grid.expand(&flat).unwrap();
        assert_eq!(expansion.n_jobs, 1);
        assert_eq!(
            expansion.expanded.get("lr"),
            Some(&ParamValue::List(vec![ParamValue::Float(2.0)]))
        );
    }

    #[test]
    fn test_exclude_unknown_key() {
        let grid = GridSearch::new(["a"], vec![rule(json!({"b": 3}))]);
        assert!(matches!(
            grid.expand(&flat_ab()),
            Err(ScriptError::Validation(_))
        ));
    }

    #[test]
    fn test_selection_order_follows_flattened_order() {
        let expansion = GridSearch::new(["b", "a"], vec![]).expand(&flat_ab()).unwrap();
        assert_eq!(expansion.paths, vec!["a", "b"]);
        assert_eq!(expansion.expanded.get("a"), Some(&ints(&[1, 1, 2, 2])));
    }

    #[test]
    fn test_unselected_lists_pass_through() {
        let expansion = GridSearch::new(["a"], vec![]).expand(&flat_ab()).unwrap();
        assert_eq!(expansion.n_jobs, 2);
        assert_eq!(expansion.expanded.get("b"), Some(&ints(&[3, 4])));
    }

    #[test]
    fn test_everything_excluded_is_an_error() {
        let grid = GridSearch::new(["a", "b"], vec![rule(json!({"a": 1})), rule(json!({"a": 2}))]);
        assert!(matches!(
            grid.expand(&flat_ab()),
            Err(ScriptError::Validation(_))
        ));
    }

    #[test]
    fn test_missing_or_scalar_path() {
        let flat = flatten(&ConfigTree::from_json(&json!({"a": 1})).unwrap()).unwrap();
        assert!(GridSearch::new(["a"], vec![]).expand(&flat).is_err());
        assert!(GridSearch::new(["missing"], vec![]).expand(&flat).is_err());
    }

    #[test]
    fn test_zip_mode() {
        let grid = GridSearch::new(["a", "b"], vec![rule(json!({"b": 4}))]).with_mode(GridMode::Zip);
        let expansion = grid.expand(&flat_ab()).unwrap();
        assert_eq!(expansion.n_jobs, 1);
        assert_eq!(expansion.expanded.get("a"), Some(&ints(&[1])));
        assert_eq!(expansion.expanded.get("b"), Some(&ints(&[3])));
    }

    #[test]
    fn test_zip_mode_length_mismatch() {
        let flat = flatten(&ConfigTree::from_json(&json!({"a": [1, 2], "b": [3]})).unwrap()).unwrap();
        let grid = GridSearch::new(["a", "b"], vec![]).with_mode(GridMode::Zip);
        assert!(matches!(grid.expand(&flat), Err(ScriptError::Validation(_))));
    }

    #[test]
    fn test_task_params() {
        let expansion = GridSearch::new(["a", "b"], vec![]).expand(&flat_ab()).unwrap();
        let task = expansion.task_params(2).unwrap();
        assert_eq!(task.get("a"), Some(&ParamValue::Int(2)));
        assert_eq!(task.get("b"), Some(&ParamValue::Int(3)));
        assert!(expansion.task_params(4).is_err());
    }
}
