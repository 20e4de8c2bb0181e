//! Script/command argument values

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};

/// An argument passed between script code, the REPL and device commands
///
/// Integers and their decimal string form convert into each other losslessly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Integer argument
    Int(i64),
    /// Text argument
    Str(String),
}

impl Value {
    /// Integer view; `None` for strings that are not decimal integers
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::Str(s) => s.trim().parse().ok(),
        }
    }

    /// String view
    pub fn as_str(&self) -> Cow<'_, str> {
        match self {
            Value::Int(n) => Cow::Owned(n.to_string()),
            Value::Str(s) => Cow::Borrowed(s),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{}", n),
            Value::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n.into())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}
