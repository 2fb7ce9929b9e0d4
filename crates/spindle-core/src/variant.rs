use std::fmt;

use serde::{Deserialize, Serialize};

/// The value a Spec assigns to one build option.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VariantValue {
    Bool(bool),
    Single(String),
}

impl VariantValue {
    /// `true`/`false` collapse to booleans so `shared=true` equals `+shared`.
    pub fn from_text(value: &str) -> Self {
        match value {
            "true" | "True" => Self::Bool(true),
            "false" | "False" => Self::Bool(false),
            other => Self::Single(other.to_string()),
        }
    }

    pub fn is_bool(&self) -> bool {
        matches!(self, Self::Bool(_))
    }

    pub fn render(&self, name: &str) -> String {
        match self {
            Self::Bool(true) => format!("+{name}"),
            Self::Bool(false) => format!("~{name}"),
            Self::Single(value) => format!(" {name}={value}"),
        }
    }
}

impl fmt::Display for VariantValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(value) => write!(f, "{value}"),
            Self::Single(value) => f.write_str(value),
        }
    }
}

/// The closed set of values a declared variant accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VariantDomain {
    Bool,
    OneOf(Vec<String>),
}

impl VariantDomain {
    pub fn admits(&self, value: &VariantValue) -> bool {
        match (self, value) {
            (Self::Bool, VariantValue::Bool(_)) => true,
            (Self::OneOf(values), VariantValue::Single(value)) => values.contains(value),
            (Self::OneOf(values), VariantValue::Bool(flag)) => {
                values.iter().any(|allowed| allowed == &flag.to_string())
            }
            _ => false,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Bool => "true, false".to_string(),
            Self::OneOf(values) => values.join(", "),
        }
    }
}
