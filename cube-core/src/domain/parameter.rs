//! Plugin parameter kinds and typed values

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Declared type of a plugin parameter
///
/// Each kind carries its own validator (see [`ParameterKind::validate`]), so the
/// set of accepted parameter types is closed and checked by pattern match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterKind {
    String,
    Integer,
    Float,
    Boolean,
    Path,
    Unextpath,
}

/// A validated parameter value, tagged with its kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum ParameterValue {
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Path(String),
    Unextpath(String),
}

/// Errors produced while validating a raw parameter value
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParameterError {
    #[error("expected a value of type {kind}, got {value}")]
    TypeMismatch { kind: ParameterKind, value: String },

    #[error("a path value cannot be empty")]
    EmptyPath,

    #[error("invalid path component in {0:?}")]
    InvalidPath(String),
}

impl ParameterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParameterKind::String => "string",
            ParameterKind::Integer => "integer",
            ParameterKind::Float => "float",
            ParameterKind::Boolean => "boolean",
            ParameterKind::Path => "path",
            ParameterKind::Unextpath => "unextpath",
        }
    }

    /// Whether values of this kind reference storage paths
    pub fn is_path(&self) -> bool {
        matches!(self, ParameterKind::Path | ParameterKind::Unextpath)
    }

    /// Validate a raw JSON value and convert it into a typed value
    ///
    /// Numeric and boolean kinds also accept their string spelling, since
    /// overrides often arrive as form data.
    pub fn validate(&self, raw: &Value) -> Result<ParameterValue, ParameterError> {
        match self {
            ParameterKind::String => validate_string(raw),
            ParameterKind::Integer => validate_integer(raw),
            ParameterKind::Float => validate_float(raw),
            ParameterKind::Boolean => validate_boolean(raw),
            ParameterKind::Path => validate_path(raw, *self).map(ParameterValue::Path),
            ParameterKind::Unextpath => validate_path(raw, *self).map(ParameterValue::Unextpath),
        }
    }
}

impl fmt::Display for ParameterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ParameterKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "string" => Ok(ParameterKind::String),
            "integer" => Ok(ParameterKind::Integer),
            "float" => Ok(ParameterKind::Float),
            "boolean" => Ok(ParameterKind::Boolean),
            "path" => Ok(ParameterKind::Path),
            "unextpath" => Ok(ParameterKind::Unextpath),
            other => Err(format!("unknown parameter type: {}", other)),
        }
    }
}

impl ParameterValue {
    pub fn kind(&self) -> ParameterKind {
        match self {
            ParameterValue::String(_) => ParameterKind::String,
            ParameterValue::Integer(_) => ParameterKind::Integer,
            ParameterValue::Float(_) => ParameterKind::Float,
            ParameterValue::Boolean(_) => ParameterKind::Boolean,
            ParameterValue::Path(_) => ParameterKind::Path,
            ParameterValue::Unextpath(_) => ParameterKind::Unextpath,
        }
    }

    /// Plain JSON representation, without the kind tag
    pub fn to_json(&self) -> Value {
        match self {
            ParameterValue::String(s) | ParameterValue::Path(s) | ParameterValue::Unextpath(s) => {
                Value::String(s.clone())
            }
            ParameterValue::Integer(i) => Value::from(*i),
            ParameterValue::Float(f) => Value::from(*f),
            ParameterValue::Boolean(b) => Value::Bool(*b),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParameterValue::String(s) | ParameterValue::Path(s) | ParameterValue::Unextpath(s) => {
                Some(s)
            }
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParameterValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Comma separated storage paths held by a path-typed value
    pub fn paths(&self) -> Vec<&str> {
        match self {
            ParameterValue::Path(s) | ParameterValue::Unextpath(s) => s
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Command line spelling of the value
    pub fn to_cli_string(&self) -> String {
        match self {
            ParameterValue::String(s) | ParameterValue::Path(s) | ParameterValue::Unextpath(s) => {
                s.clone()
            }
            ParameterValue::Integer(i) => i.to_string(),
            ParameterValue::Float(f) => f.to_string(),
            ParameterValue::Boolean(b) => b.to_string(),
        }
    }
}

// =============================================================================
// Validators
// =============================================================================

fn mismatch(kind: ParameterKind, raw: &Value) -> ParameterError {
    ParameterError::TypeMismatch {
        kind,
        value: raw.to_string(),
    }
}

fn validate_string(raw: &Value) -> Result<ParameterValue, ParameterError> {
    match raw {
        Value::String(s) => Ok(ParameterValue::String(s.clone())),
        _ => Err(mismatch(ParameterKind::String, raw)),
    }
}

fn validate_integer(raw: &Value) -> Result<ParameterValue, ParameterError> {
    match raw {
        Value::Number(n) => n
            .as_i64()
            .map(ParameterValue::Integer)
            .ok_or_else(|| mismatch(ParameterKind::Integer, raw)),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map(ParameterValue::Integer)
            .map_err(|_| mismatch(ParameterKind::Integer, raw)),
        _ => Err(mismatch(ParameterKind::Integer, raw)),
    }
}

fn validate_float(raw: &Value) -> Result<ParameterValue, ParameterError> {
    match raw {
        Value::Number(n) => n
            .as_f64()
            .map(ParameterValue::Float)
            .ok_or_else(|| mismatch(ParameterKind::Float, raw)),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite())
            .map(ParameterValue::Float)
            .ok_or_else(|| mismatch(ParameterKind::Float, raw)),
        _ => Err(mismatch(ParameterKind::Float, raw)),
    }
}

fn validate_boolean(raw: &Value) -> Result<ParameterValue, ParameterError> {
    match raw {
        Value::Bool(b) => Ok(ParameterValue::Boolean(*b)),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Ok(ParameterValue::Boolean(true)),
            "false" => Ok(ParameterValue::Boolean(false)),
            _ => Err(mismatch(ParameterKind::Boolean, raw)),
        },
        _ => Err(mismatch(ParameterKind::Boolean, raw)),
    }
}

/// Normalizes a comma separated list of storage paths.
///
/// Leading and trailing slashes are stripped from every path and parent
/// references are rejected.
fn validate_path(raw: &Value, kind: ParameterKind) -> Result<String, ParameterError> {
    let Value::String(s) = raw else {
        return Err(mismatch(kind, raw));
    };

    let mut normalized = Vec::new();
    for path in s.split(',') {
        let path = path.trim().trim_matches('/');
        if path.is_empty() {
            continue;
        }
        if path.split('/').any(|part| part == "..") {
            return Err(ParameterError::InvalidPath(path.to_string()));
        }
        normalized.push(path);
    }

    if normalized.is_empty() {
        return Err(ParameterError::EmptyPath);
    }
    Ok(normalized.join(","))
}
