//! Run-command templates
//!
//! A run command such as `python {script_name} {all_params}` is parsed once
//! into literal text and typed placeholders. Rendering fails if a
//! placeholder has no value, so a half-substituted command never reaches a
//! script.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::{Result, ScriptError};
use crate::params::OrderedMap;

/// A named slot in a run-command template
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Placeholder {
    ScriptName,
    NumGpus,
    Params,
    GridSearchParams,
    GridSearchString,
    AllParams,
    /// Any other name, filled from extra run arguments
    Extra(String),
}

impl Placeholder {
    pub fn from_name(name: &str) -> Placeholder {
        match name {
            "script_name" => Placeholder::ScriptName,
            "num_gpus" => Placeholder::NumGpus,
            "params" => Placeholder::Params,
            "grid_search_params" => Placeholder::GridSearchParams,
            "grid_search_string" => Placeholder::GridSearchString,
            "all_params" => Placeholder::AllParams,
            other => Placeholder::Extra(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Placeholder::ScriptName => "script_name",
            Placeholder::NumGpus => "num_gpus",
            Placeholder::Params => "params",
            Placeholder::GridSearchParams => "grid_search_params",
            Placeholder::GridSearchString => "grid_search_string",
            Placeholder::AllParams => "all_params",
            Placeholder::Extra(name) => name,
        }
    }

    pub fn is_builtin(&self) -> bool {
        !matches!(self, Placeholder::Extra(_))
    }

    /// Whether the placeholder expands to parameter tokens
    pub fn carries_params(&self) -> bool {
        matches!(
            self,
            Placeholder::Params | Placeholder::GridSearchParams | Placeholder::AllParams
        )
    }
}

impl fmt::Display for Placeholder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}", self.name())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Literal(String),
    Slot(Placeholder),
}

/// A parsed run-command template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RunTemplate {
    source: String,
    #[serde(skip)]
    segments: Vec<Segment>,
}

impl RunTemplate {
    /// Parse a template. `{{` and `}}` are literal braces.
    pub fn parse(source: &str) -> Result<RunTemplate> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = source.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    let mut closed = false;
                    for c in chars.by_ref() {
                        if c == '}' {
                            closed = true;
                            break;
                        }
                        name.push(c);
                    }
                    if !closed {
                        return Err(ScriptError::template(format!(
                            "unclosed '{{' in run command '{}'",
                            source
                        )));
                    }
                    if !is_identifier(&name) {
                        return Err(ScriptError::template(format!(
                            "invalid placeholder '{{{}}}' in run command '{}'; \
                             only named placeholders are supported",
                            name, source
                        )));
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Slot(Placeholder::from_name(&name)));
                }
                '}' => {
                    return Err(ScriptError::template(format!(
                        "single '}}' encountered in run command '{}'",
                        source
                    )));
                }
                other => literal.push(other),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(RunTemplate {
            source: source.to_string(),
            segments,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn placeholders(&self) -> impl Iterator<Item = &Placeholder> {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::Slot(placeholder) => Some(placeholder),
            Segment::Literal(_) => None,
        })
    }

    pub fn uses(&self, placeholder: &Placeholder) -> bool {
        self.placeholders().any(|p| p == placeholder)
    }

    pub fn render(&self, substitutions: &Substitutions) -> Result<String> {
        let mut rendered = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => rendered.push_str(text),
                Segment::Slot(placeholder) => match substitutions.value(placeholder) {
                    Some(value) => rendered.push_str(&value),
                    None => {
                        return Err(ScriptError::template(format!(
                            "placeholder {} in run command '{}' has no value",
                            placeholder, self.source
                        )));
                    }
                },
            }
        }
        Ok(rendered)
    }
}

impl TryFrom<String> for RunTemplate {
    type Error = ScriptError;

    fn try_from(value: String) -> Result<Self> {
        RunTemplate::parse(&value)
    }
}

impl From<RunTemplate> for String {
    fn from(value: RunTemplate) -> Self {
        value.source
    }
}

impl fmt::Display for RunTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Values for every placeholder of a run command
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Substitutions {
    pub script_name: String,
    pub num_gpus: u32,
    pub params: String,
    pub grid_search_params: String,
    pub grid_search_string: String,
    pub all_params: String,
    /// Values for non-builtin placeholders
    pub extra: OrderedMap<String>,
}

impl Substitutions {
    fn value(&self, placeholder: &Placeholder) -> Option<String> {
        match placeholder {
            Placeholder::ScriptName => Some(self.script_name.clone()),
            Placeholder::NumGpus => Some(self.num_gpus.to_string()),
            Placeholder::Params => Some(self.params.clone()),
            Placeholder::GridSearchParams => Some(self.grid_search_params.clone()),
            Placeholder::GridSearchString => Some(self.grid_search_string.clone()),
            Placeholder::AllParams => Some(self.all_params.clone()),
            Placeholder::Extra(name) => self.extra.get(name).cloned(),
        }
    }
}
