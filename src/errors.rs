//! Error types for script generation and parsing

use thiserror::Error;

/// Errors raised while expanding parameters, assembling or parsing scripts.
///
/// Every variant is fatal: nothing in the crate retries or swallows them.
#[derive(Error, Debug)]
pub enum ScriptError {
    /// Missing or contradictory job configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Two distinct nested locations flatten to the same dotted path
    #[error("Parameter path collision: '{path}' is produced by more than one nested location")]
    Collision { path: String },

    /// Two grid-search paths map to the same shell variable once sanitized
    #[error(
        "Shell variable collision: '{first}' and '{second}' both map to variable '{variable}'"
    )]
    VariableCollision {
        first: String,
        second: String,
        variable: String,
    },

    /// Grid-search selection, exclusion rules or task ids are inconsistent
    #[error("Validation error: {0}")]
    Validation(String),

    /// The run-command template cannot be rendered
    #[error("Template error: {0}")]
    Template(String),

    /// A script could not be parsed back into a job description
    #[error("Parse error: {0}")]
    Parse(String),

    /// A job request file could not be decoded
    #[error("Request error: {0}")]
    Request(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ScriptError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn template(msg: impl Into<String>) -> Self {
        Self::Template(msg.into())
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    pub fn request(msg: impl Into<String>) -> Self {
        Self::Request(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, ScriptError>;
