//! Connection guards.
//!
//! A `Constraint` is evaluated against the instance variables at the moment a
//! split gateway runs, never earlier. Guards can be built directly or parsed
//! from short expressions such as `age < 18` or
//! `approved == true && (amount > 1000 || vip)`.

use crate::error::{ProcessError, ProcessResult};
use crate::types::Value;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Neq,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Constraint {
    Always,
    /// Variable exists and is not null.
    IsSet {
        variable: String,
    },
    /// `variable op value`; `variable` may be a dotted path into an object.
    Compare {
        variable: String,
        op: CompareOp,
        value: Value,
    },
    Not(Box<Constraint>),
    And(Vec<Constraint>),
    Or(Vec<Constraint>),
}

impl Constraint {
    pub fn compare(variable: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        Self::Compare {
            variable: variable.into(),
            op,
            value: value.into(),
        }
    }

    pub fn parse(expression: &str) -> ProcessResult<Self> {
        let tokens = tokenize(expression)?;
        let mut parser = Parser {
            expression,
            tokens,
            pos: 0,
        };
        let constraint = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(parser.error("unexpected trailing input"));
        }
        Ok(constraint)
    }

    pub fn evaluate(&self, variables: &BTreeMap<String, Value>) -> bool {
        match self {
            Constraint::Always => true,
            Constraint::IsSet { variable } => {
                lookup(variables, variable).is_some_and(|v| !v.is_null())
            }
            Constraint::Compare {
                variable,
                op,
                value,
            } => {
                let actual = lookup(variables, variable).unwrap_or(&Value::Null);
                compare_values(actual, *op, value)
            }
            Constraint::Not(inner) => !inner.evaluate(variables),
            Constraint::And(all) => all.iter().all(|c| c.evaluate(variables)),
            Constraint::Or(any) => any.iter().any(|c| c.evaluate(variables)),
        }
    }
}

fn lookup<'a>(variables: &'a BTreeMap<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = variables.get(segments.next()?)?;
    for segment in segments {
        current = current.get(segment)?;
    }
    Some(current)
}

fn compare_values(actual: &Value, op: CompareOp, expected: &Value) -> bool {
    let ordering = match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => None,
        },
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    };
    match (op, ordering) {
        (CompareOp::Eq, Some(o)) => o == Ordering::Equal,
        (CompareOp::Eq, None) => actual == expected,
        (CompareOp::Neq, Some(o)) => o != Ordering::Equal,
        (CompareOp::Neq, None) => actual != expected,
        // Booleans and nulls have no meaningful order.
        (_, _) if actual.is_boolean() || actual.is_null() => false,
        (CompareOp::Lt, Some(o)) => o == Ordering::Less,
        (CompareOp::Le, Some(o)) => o != Ordering::Greater,
        (CompareOp::Gt, Some(o)) => o == Ordering::Greater,
        (CompareOp::Ge, Some(o)) => o != Ordering::Less,
        (_, None) => false,
    }
}

// ── Expression parsing ──

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Ident(String),
    Literal(Value),
    Op(CompareOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

fn tokenize(expression: &str) -> ProcessResult<Vec<Token>> {
    let chars: Vec<char> = expression.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    let err = |msg: String| ProcessError::InvalidDefinition(format!("guard '{expression}': {msg}"));

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '&' | '|' => {
                if chars.get(i + 1) != Some(&c) {
                    return Err(err(format!("expected '{c}{c}' at {i}")));
                }
                tokens.push(if c == '&' { Token::And } else { Token::Or });
                i += 2;
            }
            '=' | '!' | '<' | '>' => {
                let next_is_eq = chars.get(i + 1) == Some(&'=');
                let token = match (c, next_is_eq) {
                    ('=', true) => Token::Op(CompareOp::Eq),
                    ('!', true) => Token::Op(CompareOp::Neq),
                    ('<', true) => Token::Op(CompareOp::Le),
                    ('>', true) => Token::Op(CompareOp::Ge),
                    ('<', false) => Token::Op(CompareOp::Lt),
                    ('>', false) => Token::Op(CompareOp::Gt),
                    ('!', false) => Token::Not,
                    _ => return Err(err(format!("unexpected '=' at {i}"))),
                };
                i += if next_is_eq { 2 } else { 1 };
                tokens.push(token);
            }
            '\'' | '"' => {
                let start = i + 1;
                let end = chars[start..]
                    .iter()
                    .position(|&ch| ch == c)
                    .map(|p| start + p)
                    .ok_or_else(|| err("unterminated string".to_string()))?;
                let text: String = chars[start..end].iter().collect();
                tokens.push(Token::Literal(Value::String(text)));
                i = end + 1;
            }
            c if c.is_ascii_digit()
                || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) =>
            {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let value = if text.contains('.') {
                    text.parse::<f64>()
                        .ok()
                        .and_then(serde_json::Number::from_f64)
                        .map(Value::Number)
                } else {
                    text.parse::<i64>().ok().map(Value::from)
                };
                tokens.push(Token::Literal(
                    value.ok_or_else(|| err(format!("bad number '{text}'")))?,
                ));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Token::Literal(Value::Bool(true)),
                    "false" => Token::Literal(Value::Bool(false)),
                    "null" => Token::Literal(Value::Null),
                    _ => Token::Ident(word),
                });
            }
            other => return Err(err(format!("unexpected '{other}' at {i}"))),
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    expression: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser<'_> {
    fn error(&self, msg: &str) -> ProcessError {
        ProcessError::InvalidDefinition(format!(
            "guard '{}': {} (token {})",
            self.expression, msg, self.pos
        ))
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn parse_or(&mut self) -> ProcessResult<Constraint> {
        let mut terms = vec![self.parse_and()?];
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            terms.push(self.parse_and()?);
        }
        Ok(if terms.len() == 1 {
            terms.remove(0)
        } else {
            Constraint::Or(terms)
        })
    }

    fn parse_and(&mut self) -> ProcessResult<Constraint> {
        let mut terms = vec![self.parse_unary()?];
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            terms.push(self.parse_unary()?);
        }
        Ok(if terms.len() == 1 {
            terms.remove(0)
        } else {
            Constraint::And(terms)
        })
    }

    fn parse_unary(&mut self) -> ProcessResult<Constraint> {
        match self.next() {
            Some(Token::Not) => Ok(Constraint::Not(Box::new(self.parse_unary()?))),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(self.error("expected ')'")),
                }
            }
            Some(Token::Ident(variable)) => match self.peek() {
                Some(Token::Op(op)) => {
                    let op = *op;
                    self.pos += 1;
                    match self.next() {
                        Some(Token::Literal(value)) => Ok(Constraint::Compare {
                            variable,
                            op,
                            value,
                        }),
                        _ => Err(self.error("expected literal after operator")),
                    }
                }
                // A bare variable reads as `variable == true`.
                _ => Ok(Constraint::compare(variable, CompareOp::Eq, true)),
            },
            Some(Token::Literal(Value::Bool(true))) => Ok(Constraint::Always),
            _ => Err(self.error("expected variable, '!' or '('")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(value: Value) -> BTreeMap<String, Value> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_parse_simple_comparison() {
        let c = Constraint::parse("age < 18").unwrap();
        assert_eq!(c, Constraint::compare("age", CompareOp::Lt, 18));
        assert!(c.evaluate(&vars(json!({"age": 10}))));
        assert!(!c.evaluate(&vars(json!({"age": 30}))));
        assert!(!c.evaluate(&vars(json!({}))), "missing variable is never < 18");
    }

    #[test]
    fn test_parse_boolean_composition() {
        let c = Constraint::parse("approved == true && (amount > 1000 || vip)").unwrap();
        assert!(c.evaluate(&vars(json!({"approved": true, "amount": 5000}))));
        assert!(c.evaluate(&vars(json!({"approved": true, "amount": 5, "vip": true}))));
        assert!(!c.evaluate(&vars(json!({"approved": false, "amount": 5000}))));
        assert!(!c.evaluate(&vars(json!({"approved": true, "amount": 5}))));
    }

    #[test]
    fn test_strings_paths_and_negation() {
        let c = Constraint::parse("customer.tier == 'gold' && !blocked").unwrap();
        assert!(c.evaluate(&vars(json!({"customer": {"tier": "gold"}, "blocked": false}))));
        assert!(!c.evaluate(&vars(json!({"customer": {"tier": "silver"}}))));

        let c = Constraint::parse("score >= 2.5").unwrap();
        assert!(c.evaluate(&vars(json!({"score": 2.5}))));
        assert!(!c.evaluate(&vars(json!({"score": 2}))));
    }

    #[test]
    fn test_is_set_and_mismatched_types() {
        let c = Constraint::IsSet {
            variable: "owner".into(),
        };
        assert!(c.evaluate(&vars(json!({"owner": "ann"}))));
        assert!(!c.evaluate(&vars(json!({"owner": null}))));

        let c = Constraint::compare("age", CompareOp::Gt, 3);
        assert!(!c.evaluate(&vars(json!({"age": "old"}))));
        let c = Constraint::compare("age", CompareOp::Neq, 3);
        assert!(c.evaluate(&vars(json!({"age": "old"}))));
    }

    #[test]
    fn test_parse_errors() {
        assert!(Constraint::parse("age <").is_err());
        assert!(Constraint::parse("age = 3").is_err());
        assert!(Constraint::parse("(age < 3").is_err());
        assert!(Constraint::parse("age < 3 junk").is_err());
        assert!(Constraint::parse("name == 'open").is_err());
    }
}
