//! `${name}` substitution and boolean expression evaluation over a
//! parameter pool.

use regex::{Captures, Regex};
use rhai::{Dynamic, Engine, Scope};
use serde_json::Value;

use crate::core::errors::{MasterError, Result};
use crate::model::ParamPool;

const MAX_OPERATIONS: u64 = 10_000;

pub struct ExpressionEvaluator {
    engine: Engine,
    placeholder: Regex,
    identifier: Regex,
}

impl std::fmt::Debug for ExpressionEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpressionEvaluator").finish_non_exhaustive()
    }
}

impl ExpressionEvaluator {
    pub fn new() -> Result<Self> {
        let mut engine = Engine::new();
        engine.set_max_operations(MAX_OPERATIONS);
        engine.set_max_expr_depths(32, 32);
        engine.set_max_string_size(64 * 1024);

        Ok(Self {
            engine,
            placeholder: Regex::new(r"\$\{\s*([A-Za-z0-9_.\-]+)\s*\}").map_err(regex_error)?,
            identifier: Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").map_err(regex_error)?,
        })
    }

    /// Replace every `${name}` with its value from `pool`. Unknown names are
    /// left in place.
    pub fn substitute(&self, text: &str, pool: &ParamPool) -> String {
        self.placeholder
            .replace_all(text, |caps: &Captures| match pool.get(&caps[1]) {
                Some(value) => render(value),
                None => caps[0].to_string(),
            })
            .into_owned()
    }

    /// Substitute placeholders in every string of a JSON value. A string that
    /// is exactly one placeholder takes the typed value.
    pub fn substitute_value(&self, value: &Value, pool: &ParamPool) -> Value {
        match value {
            Value::String(text) => {
                if let Some(caps) = self.placeholder.captures(text) {
                    if caps[0].len() == text.len() {
                        if let Some(found) = pool.get(&caps[1]) {
                            return found.clone();
                        }
                    }
                }
                Value::String(self.substitute(text, pool))
            }
            Value::Array(items) => Value::Array(items.iter().map(|v| self.substitute_value(v, pool)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.substitute_value(v, pool)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Evaluate `expression` to a boolean. Pool entries are visible both as
    /// `${name}` placeholders and as plain variables. Placeholders become
    /// script literals, so text values compare as strings.
    pub fn evaluate_bool(&self, expression: &str, pool: &ParamPool) -> Result<bool> {
        let script = self.substitute_script(expression, pool);
        let mut scope = Scope::new();
        for (name, value) in pool {
            if self.identifier.is_match(name) {
                scope.push_dynamic(name.clone(), to_dynamic(value));
            }
        }
        self.engine
            .eval_expression_with_scope::<bool>(&mut scope, &script)
            .map_err(|e| MasterError::expression(expression, e.to_string()))
    }

    /// Placeholders inside a string literal are spliced in as escaped text,
    /// everywhere else they become literals.
    fn substitute_script(&self, script: &str, pool: &ParamPool) -> String {
        self.placeholder
            .replace_all(script, |caps: &Captures| {
                let Some(value) = pool.get(&caps[1]) else {
                    return caps[0].to_string();
                };
                let start = caps.get(0).map_or(0, |m| m.start());
                if inside_string(&script[..start]) {
                    escape(&render(value))
                } else {
                    script_literal(value)
                }
            })
            .into_owned()
    }
}

/// Same typing as `to_dynamic`, written as script source.
fn script_literal(value: &Value) -> String {
    match value {
        Value::Null => "()".to_string(),
        Value::Bool(_) | Value::Number(_) => value.to_string(),
        Value::String(s) => {
            let trimmed = s.trim();
            let numeric = trimmed.parse::<i64>().is_ok() || trimmed.parse::<f64>().is_ok_and(f64::is_finite);
            if numeric || trimmed.parse::<bool>().is_ok() {
                trimmed.to_string()
            } else {
                quote(s)
            }
        }
        Value::Array(items) => format!("[{}]", items.iter().map(script_literal).collect::<Vec<_>>().join(", ")),
        Value::Object(_) => quote(&value.to_string()),
    }
}

fn quote(text: &str) -> String {
    format!("\"{}\"", escape(text))
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out
}

/// Whether `prefix` ends inside an open double-quoted literal.
fn inside_string(prefix: &str) -> bool {
    let mut open = false;
    let mut escaped = false;
    for c in prefix.chars() {
        match c {
            '\\' if open => escaped = !escaped,
            '"' if !escaped => open = !open,
            _ => escaped = false,
        }
    }
    open
}

fn regex_error(err: regex::Error) -> MasterError {
    MasterError::internal(format!("invalid pattern: {}", err))
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Parameter values usually arrive as strings; numeric and boolean looking
/// strings are typed so comparisons behave.
fn to_dynamic(value: &Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Dynamic::from(i),
            None => Dynamic::from(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => {
            let trimmed = s.trim();
            if let Ok(i) = trimmed.parse::<i64>() {
                Dynamic::from(i)
            } else if let Ok(f) = trimmed.parse::<f64>() {
                Dynamic::from(f)
            } else if let Ok(b) = trimmed.parse::<bool>() {
                Dynamic::from(b)
            } else {
                Dynamic::from(s.clone())
            }
        }
        Value::Array(items) => Dynamic::from_array(items.iter().map(to_dynamic).collect()),
        Value::Object(_) => Dynamic::from(value.to_string()),
    }
}
