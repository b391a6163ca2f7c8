//! Parameter handling: typed configuration values, flattening and grid search

pub mod flatten;
pub mod grid_search;
pub mod value;

pub use flatten::{FlatParams, flatten, flatten_where, param_variable, unflatten};
pub use grid_search::{ExclusionRule, GridExpansion, GridMode, GridSearch};
pub use value::{ConfigNode, ConfigTree, OrderedMap, ParamValue};
