//! Condition matchers.
//!
//! Trigger conditions and worker requirements are written as loosely typed
//! YAML/JSON values. They are compiled once into a [`Matcher`] tree so that
//! regexes are never re-compiled per event.
//!
//! Compilation rules:
//! - a string without regex metacharacters is an exact match; a `.` on its
//!   own does not count, so versions and host names stay literal
//! - any other string is a regex with full-match semantics
//! - `{ regex: "..." }` and `{ exact: "..." }` force the interpretation
//! - a boolean, or a list of booleans, accepts those boolean values
//! - any other list accepts a value matching one of its elements
//! - a map matches a map partially: every declared key must match
//! - an empty map matches only an empty map
//! - `null` matches a missing or null value

use crate::error::{CoreError, CoreResult};
use regex::Regex;
use serde_json::{Map, Value};

/// A compiled condition.
#[derive(Debug, Clone)]
pub enum Matcher {
    /// String equality.
    Exact(String),

    /// Full-match regex.
    Regex(Regex),

    /// Accepted boolean values.
    BoolSet { accept_true: bool, accept_false: bool },

    /// Any of the alternatives.
    OneOf(Vec<Matcher>),

    /// Partial map match.
    Object(Vec<(String, Matcher)>),

    /// Missing or null.
    Absent,

    /// Equality for numbers and other literals.
    Literal(Value),
}

const REGEX_META: &[char] = &[
    '*', '+', '?', '[', ']', '(', ')', '{', '}', '|', '^', '$', '\\',
];

impl Matcher {
    /// Compile a condition value.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if a regex does not compile.
    pub fn compile(value: &Value) -> CoreResult<Matcher> {
        match value {
            Value::Null => Ok(Matcher::Absent),
            Value::Bool(b) => Ok(Matcher::BoolSet {
                accept_true: *b,
                accept_false: !*b,
            }),
            Value::Number(_) => Ok(Matcher::Literal(value.clone())),
            Value::String(s) => Self::compile_str(s),
            Value::Array(items) => {
                if !items.is_empty() && items.iter().all(Value::is_boolean) {
                    let accepts = |b: bool| items.iter().any(|v| v.as_bool() == Some(b));
                    return Ok(Matcher::BoolSet {
                        accept_true: accepts(true),
                        accept_false: accepts(false),
                    });
                }
                let alternatives = items.iter().map(Matcher::compile).collect::<CoreResult<_>>()?;
                Ok(Matcher::OneOf(alternatives))
            }
            Value::Object(map) => {
                if map.len() == 1 {
                    if let Some(Value::String(pattern)) = map.get("regex") {
                        return Self::regex(pattern);
                    }
                    if let Some(Value::String(exact)) = map.get("exact") {
                        return Ok(Matcher::Exact(exact.clone()));
                    }
                }
                Self::compile_map(map).map(Matcher::Object)
            }
        }
    }

    /// Compile a map of conditions, one matcher per key.
    pub fn compile_map(map: &Map<String, Value>) -> CoreResult<Vec<(String, Matcher)>> {
        map.iter()
            .map(|(k, v)| {
                Matcher::compile(v)
                    .map(|m| (k.clone(), m))
                    .map_err(|e| in_condition(k, e))
            })
            .collect()
    }

    /// Compile a map whose string values are all exact matches.
    pub fn exact_object(map: &Map<String, Value>) -> Matcher {
        let fields = map
            .iter()
            .map(|(k, v)| {
                let m = match v {
                    Value::String(s) => Matcher::Exact(s.clone()),
                    other => Matcher::Literal(other.clone()),
                };
                (k.clone(), m)
            })
            .collect();
        Matcher::Object(fields)
    }

    fn compile_str(s: &str) -> CoreResult<Matcher> {
        if s.contains(REGEX_META) {
            Self::regex(s)
        } else {
            Ok(Matcher::Exact(s.to_string()))
        }
    }

    /// Compile a full-match regex.
    pub fn regex(pattern: &str) -> CoreResult<Matcher> {
        Regex::new(&format!("^(?:{pattern})$"))
            .map(Matcher::Regex)
            .map_err(|e| CoreError::Validation(format!("invalid regex '{pattern}': {e}")))
    }

    /// Returns `true` if `value` satisfies the matcher.
    ///
    /// A missing value is treated as an empty string by string matchers,
    /// as `false` by boolean matchers.
    pub fn matches(&self, value: Option<&Value>) -> bool {
        let value = value.filter(|v| !v.is_null());
        match self {
            Matcher::Absent => value.is_none(),
            Matcher::Exact(expected) => {
                value.and_then(scalar_str).as_deref() == Some(expected.as_str())
            }
            Matcher::Regex(re) => match value {
                None => re.is_match(""),
                Some(v) => scalar_str(v).is_some_and(|s| re.is_match(&s)),
            },
            Matcher::BoolSet {
                accept_true,
                accept_false,
            } => match value {
                None => *accept_false,
                Some(Value::Bool(true)) => *accept_true,
                Some(Value::Bool(false)) => *accept_false,
                Some(_) => false,
            },
            Matcher::OneOf(alternatives) => match value {
                Some(Value::Array(items)) => {
                    !items.is_empty()
                        && items
                            .iter()
                            .all(|item| alternatives.iter().any(|m| m.matches(Some(item))))
                }
                other => alternatives.iter().any(|m| m.matches(other)),
            },
            Matcher::Object(fields) => match value {
                Some(Value::Object(map)) => {
                    if fields.is_empty() {
                        map.is_empty()
                    } else {
                        fields.iter().all(|(k, m)| m.matches(map.get(k)))
                    }
                }
                _ => false,
            },
            Matcher::Literal(expected) => value == Some(expected),
        }
    }
}

fn in_condition(key: &str, err: CoreError) -> CoreError {
    match err {
        CoreError::Validation(msg) => CoreError::Validation(format!("condition '{key}': {msg}")),
        other => other,
    }
}

fn scalar_str(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// A compiled set of conditions evaluated against an attribute map.
#[derive(Debug, Clone, Default)]
pub struct CompiledConditions {
    fields: Vec<(String, Matcher)>,
}

impl CompiledConditions {
    /// Compile trigger conditions.
    ///
    /// `queryParams` is always compiled with exact string semantics.
    pub fn compile(conditions: &Map<String, Value>) -> CoreResult<Self> {
        let mut fields = Vec::with_capacity(conditions.len());
        for (key, value) in conditions {
            let matcher = match (key.as_str(), value) {
                (QUERY_PARAMS, Value::Object(map)) => Matcher::exact_object(map),
                _ => Matcher::compile(value).map_err(|e| in_condition(key, e))?,
            };
            fields.push((key.clone(), matcher));
        }
        Ok(Self { fields })
    }

    /// Returns `true` if a condition on `key` is declared.
    pub fn declares(&self, key: &str) -> bool {
        self.fields.iter().any(|(k, _)| k == key)
    }

    /// Returns `true` if every condition matches.
    pub fn matches(&self, attributes: &Map<String, Value>) -> bool {
        self.fields
            .iter()
            .all(|(key, matcher)| matcher.matches(attributes.get(key)))
    }
}

/// Attribute carrying HTTP query parameters.
pub const QUERY_PARAMS: &str = "queryParams";
