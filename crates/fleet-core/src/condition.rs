//! Predicate language used by event routes and handoff routes.
//!
//! Grammar (case-insensitive keywords):
//!
//! ```text
//! condition := conjunction (("OR" | "||") conjunction)*
//! conjunction := clause (("AND" | "&&") clause)*
//! clause := path op value | path "exists"
//! op := == | != | >= | <= | > | < | ≥ | ≤ | contains | in
//! value := "quoted" | 'quoted' | number | true | false | null | bare_word | [value, ...]
//! ```
//!
//! Paths are dotted lookups into a [`Context`]. A clause over a missing path
//! is false.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::error::{FleetError, Result};
use crate::types::Context;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Op {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Contains,
    In,
    Exists,
}

#[derive(Debug, Clone, PartialEq)]
struct Clause {
    path: String,
    op: Op,
    value: Value,
}

/// A parsed condition expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    source: String,
    any_of: Vec<Vec<Clause>>,
}

fn clause_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([A-Za-z_][\w.:\-]*)\s*(==|!=|>=|<=|≥|≤|>|<|=|(?i:contains)\b|(?i:in)\b|(?i:exists)$)\s*(.*)$")
            .expect("clause regex is valid")
    })
}

impl Condition {
    /// Parse an expression. An empty expression always matches.
    pub fn parse(expr: &str) -> Result<Self> {
        let err = |reason: &str| FleetError::Condition {
            expr: expr.to_string(),
            reason: reason.to_string(),
        };

        let mut any_of = Vec::new();
        if expr.trim().is_empty() {
            return Ok(Self {
                source: String::new(),
                any_of,
            });
        }

        for disjunct in split_keyword(expr, &["or", "||"]) {
            let mut all_of = Vec::new();
            for raw in split_keyword(&disjunct, &["and", "&&"]) {
                let raw = raw.trim();
                if raw.is_empty() {
                    return Err(err("empty clause"));
                }
                let caps = clause_regex()
                    .captures(raw)
                    .ok_or_else(|| err(&format!("cannot parse clause '{}'", raw)))?;
                let path = caps[1].to_string();
                let op = match caps[2].to_lowercase().as_str() {
                    "==" | "=" => Op::Eq,
                    "!=" => Op::Ne,
                    ">=" | "≥" => Op::Ge,
                    "<=" | "≤" => Op::Le,
                    ">" => Op::Gt,
                    "<" => Op::Lt,
                    "contains" => Op::Contains,
                    "in" => Op::In,
                    "exists" => Op::Exists,
                    other => return Err(err(&format!("unknown operator '{}'", other))),
                };
                let rest = caps.get(3).map(|m| m.as_str().trim()).unwrap_or("");
                let value = match op {
                    Op::Exists => {
                        if !rest.is_empty() {
                            return Err(err("'exists' takes no operand"));
                        }
                        Value::Null
                    }
                    _ if rest.is_empty() => return Err(err(&format!("missing operand in '{}'", raw))),
                    Op::In => parse_list(rest).ok_or_else(|| err("'in' expects [a, b, ...]"))?,
                    _ => parse_literal(rest),
                };
                if matches!(op, Op::Gt | Op::Ge | Op::Lt | Op::Le) && as_number(&value).is_none() {
                    return Err(err(&format!("'{}' compares against a non-number", raw)));
                }
                all_of.push(Clause { path, op, value });
            }
            any_of.push(all_of);
        }

        Ok(Self {
            source: expr.to_string(),
            any_of,
        })
    }

    /// Evaluate against a context.
    pub fn evaluate(&self, ctx: &Context) -> bool {
        if self.any_of.is_empty() {
            return true;
        }
        self.any_of
            .iter()
            .any(|all_of| all_of.iter().all(|c| c.matches(ctx)))
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

/// Parse and evaluate an optional expression in one go. `None` always matches.
pub fn evaluate(expr: Option<&str>, ctx: &Context) -> Result<bool> {
    match expr {
        None => Ok(true),
        Some(e) => Ok(Condition::parse(e)?.evaluate(ctx)),
    }
}

impl Clause {
    fn matches(&self, ctx: &Context) -> bool {
        let Some(actual) = ctx.lookup(&self.path) else {
            return false;
        };
        match self.op {
            Op::Exists => !actual.is_null(),
            Op::Eq => values_equal(actual, &self.value),
            Op::Ne => !values_equal(actual, &self.value),
            Op::Gt | Op::Ge | Op::Lt | Op::Le => {
                let (Some(a), Some(b)) = (as_number(actual), as_number(&self.value)) else {
                    return false;
                };
                match self.op {
                    Op::Gt => a > b,
                    Op::Ge => a >= b,
                    Op::Lt => a < b,
                    _ => a <= b,
                }
            }
            Op::Contains => match actual {
                Value::String(s) => self.value.as_str().is_some_and(|needle| s.contains(needle)),
                Value::Array(items) => items.iter().any(|i| values_equal(i, &self.value)),
                _ => false,
            },
            Op::In => self
                .value
                .as_array()
                .is_some_and(|items| items.iter().any(|i| values_equal(actual, i))),
        }
    }
}

fn values_equal(actual: &Value, expected: &Value) -> bool {
    if let (Some(a), Some(b)) = (as_number(actual), as_number(expected)) {
        if actual.is_number() || expected.is_number() {
            return (a - b).abs() < f64::EPSILON;
        }
    }
    match (actual, expected) {
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Null, Value::Null) => true,
        // Bare words compare against the JSON rendering of non-strings.
        (other, Value::String(b)) => !other.is_string() && other.to_string() == *b,
        _ => actual == expected,
    }
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn parse_literal(raw: &str) -> Value {
    let raw = raw.trim();
    if raw.len() >= 2
        && ((raw.starts_with('"') && raw.ends_with('"'))
            || (raw.starts_with('\'') && raw.ends_with('\'')))
    {
        return Value::String(raw[1..raw.len() - 1].to_string());
    }
    match raw {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        "null" => return Value::Null,
        _ => {}
    }
    if let Ok(i) = raw.parse::<i64>() {
        return Value::from(i);
    }
    if let Ok(f) = raw.parse::<f64>() {
        return Value::from(f);
    }
    Value::String(raw.to_string())
}

fn parse_list(raw: &str) -> Option<Value> {
    let inner = raw.trim().strip_prefix('[')?.strip_suffix(']')?;
    let items = split_outside_quotes(inner, ',')
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .map(|s| parse_literal(&s))
        .collect();
    Some(Value::Array(items))
}

/// Split on whitespace-delimited keywords, ignoring text inside quotes.
fn split_keyword(expr: &str, keywords: &[&str]) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut word = String::new();

    let flush_word = |word: &mut String, current: &mut String, parts: &mut Vec<String>| {
        if keywords.iter().any(|k| word.eq_ignore_ascii_case(k)) {
            parts.push(std::mem::take(current));
        } else {
            current.push_str(word);
        }
        word.clear();
    };

    for c in expr.chars() {
        match quote {
            Some(q) => {
                word.push(c);
                if c == q {
                    quote = None;
                }
            }
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                word.push(c);
            }
            None if c.is_whitespace() => {
                flush_word(&mut word, &mut current, &mut parts);
                current.push(c);
            }
            None => word.push(c),
        }
    }
    flush_word(&mut word, &mut current, &mut parts);
    parts.push(current);
    parts
}

fn split_outside_quotes(s: &str, sep: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    for c in s.chars() {
        match quote {
            Some(q) => {
                current.push(c);
                if c == q {
                    quote = None;
                }
            }
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                current.push(c);
            }
            None if c == sep => parts.push(std::mem::take(&mut current)),
            None => current.push(c),
        }
    }
    parts.push(current);
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(v: Value) -> Context {
        Context::from_value(v)
    }

    #[test]
    fn test_intent_threshold() {
        let cond = Condition::parse("intent == send_proposal AND confidence ≥ 0.7").unwrap();
        assert!(cond.evaluate(&ctx(json!({"intent": "send_proposal", "confidence": 0.82}))));
        assert!(!cond.evaluate(&ctx(json!({"intent": "send_proposal", "confidence": 0.5}))));
        assert!(!cond.evaluate(&ctx(json!({"intent": "schedule_call", "confidence": 0.9}))));
    }

    #[test]
    fn test_quoted_equals_and_not_equals() {
        let c = ctx(json!({"status": "success"}));
        assert!(evaluate(Some(r#"status == "success""#), &c).unwrap());
        assert!(!evaluate(Some(r#"status == "failure""#), &c).unwrap());
        assert!(evaluate(Some(r#"status != "failure""#), &c).unwrap());
        assert!(!evaluate(Some(r#"status != "success""#), &c).unwrap());
    }

    #[test]
    fn test_or_has_lower_precedence() {
        let cond = Condition::parse("a == 1 AND b == 2 OR c == 3").unwrap();
        assert!(cond.evaluate(&ctx(json!({"a": 1, "b": 2}))));
        assert!(cond.evaluate(&ctx(json!({"c": 3}))));
        assert!(!cond.evaluate(&ctx(json!({"a": 1, "c": 4}))));
    }

    #[test]
    fn test_keywords_inside_quotes_are_literal() {
        let cond = Condition::parse(r#"title == "pros and cons""#).unwrap();
        assert!(cond.evaluate(&ctx(json!({"title": "pros and cons"}))));
    }

    #[test]
    fn test_contains_and_in() {
        let c = ctx(json!({"output": "file created", "tags": ["hot", "q3"], "stage": "won"}));
        assert!(evaluate(Some(r#"output contains "created""#), &c).unwrap());
        assert!(evaluate(Some("tags contains hot"), &c).unwrap());
        assert!(!evaluate(Some("tags contains cold"), &c).unwrap());
        assert!(evaluate(Some(r#"stage in ["won", "lost"]"#), &c).unwrap());
        assert!(!evaluate(Some("stage in [open]"), &c).unwrap());
    }

    #[test]
    fn test_dotted_paths_and_exists() {
        let c = ctx(json!({"deal": {"amount": 12000, "owner": null}}));
        assert!(evaluate(Some("deal.amount > 10000"), &c).unwrap());
        assert!(evaluate(Some("deal.amount exists"), &c).unwrap());
        assert!(!evaluate(Some("deal.owner exists"), &c).unwrap());
    }

    #[test]
    fn test_missing_key_is_false() {
        let c = Context::new();
        assert!(!evaluate(Some(r#"missing == "value""#), &c).unwrap());
        assert!(!evaluate(Some(r#"missing != "value""#), &c).unwrap());
    }

    #[test]
    fn test_numeric_string_and_bool_equality() {
        let c = ctx(json!({"count": "3", "urgent": true}));
        assert!(evaluate(Some("count == 3"), &c).unwrap());
        assert!(evaluate(Some("count >= 2"), &c).unwrap());
        assert!(evaluate(Some("urgent == true"), &c).unwrap());
    }

    #[test]
    fn test_empty_expression_matches() {
        assert!(Condition::parse("  ").unwrap().evaluate(&Context::new()));
        assert!(evaluate(None, &Context::new()).unwrap());
    }

    #[test]
    fn test_malformed_expressions_error() {
        for bad in [
            "this is not valid",
            "confidence >= high",
            "a == 1 AND",
            "== 3",
            "stage in won",
            "x exists now",
        ] {
            assert!(
                matches!(Condition::parse(bad), Err(FleetError::Condition { .. })),
                "expected parse error for {bad:?}"
            );
        }
    }
}
