use std::collections::BTreeMap;

use serde::Deserialize;

use crate::error::{EngineError, Result};
use crate::template::types::{
    Expression, OutputSpec, ParamType, ParameterSpec, ResourceDecl, Template, VariableSpec,
};
use crate::template::validator;

// ─── Raw document shape ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RawTemplate {
    #[serde(default)]
    parameters: BTreeMap<String, RawParameter>,
    #[serde(default)]
    variables: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    resources: Vec<RawResource>,
    #[serde(default)]
    outputs: BTreeMap<String, RawOutput>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawParameter {
    #[serde(rename = "type")]
    param_type: ParamType,
    #[serde(default)]
    default_value: Option<serde_json::Value>,
    #[serde(default)]
    allowed_values: Vec<serde_json::Value>,
    #[serde(default)]
    min_length: Option<usize>,
    #[serde(default)]
    max_length: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawResource {
    name: String,
    #[serde(rename = "type")]
    resource_type: String,
    #[serde(default)]
    api_version: String,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    condition: Option<String>,
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(default)]
    slot: Option<String>,
    #[serde(default)]
    existing: bool,
    #[serde(default)]
    properties: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct RawOutput {
    value: serde_json::Value,
}

// ─── Entry point ────────────────────────────────────────────────────────────

/// Parse a JSON template document into the unified IR and run static
/// validation over it.
pub fn parse_template(src: &str) -> Result<Template> {
    let raw: RawTemplate =
        serde_json::from_str(src).map_err(|e| EngineError::template(format!("invalid JSON: {e}")))?;

    let parameters = raw
        .parameters
        .into_iter()
        .map(|(name, p)| ParameterSpec {
            name,
            param_type: p.param_type,
            default: p.default_value,
            allowed_values: p.allowed_values,
            min_length: p.min_length,
            max_length: p.max_length,
        })
        .collect();

    let variables = raw
        .variables
        .into_iter()
        .map(|(name, value)| {
            Ok(VariableSpec {
                name,
                value: convert_value(&value)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let resources = raw
        .resources
        .into_iter()
        .map(|r| {
            let condition = r
                .condition
                .as_deref()
                .map(parse_condition_string)
                .transpose()?;
            Ok(ResourceDecl {
                name: r.name,
                resource_type: r.resource_type,
                api_version: r.api_version,
                location: r.location,
                condition,
                depends_on: r.depends_on,
                slot: r.slot,
                existing: r.existing,
                properties: convert_value(&r.properties)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let outputs = raw
        .outputs
        .into_iter()
        .map(|(name, o)| {
            Ok(OutputSpec {
                name,
                value: convert_value(&o.value)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let template = Template {
        parameters,
        variables,
        resources,
        outputs,
    };
    validator::validate(&template)?;
    Ok(template)
}

/// Convert a JSON value into an expression tree, parsing `${...}`
/// interpolations embedded in strings.
fn convert_value(value: &serde_json::Value) -> Result<Expression> {
    match value {
        serde_json::Value::String(s) => parse_interpolated(s),
        serde_json::Value::Object(map) => {
            let mut entries = BTreeMap::new();
            for (k, v) in map {
                entries.insert(k.clone(), convert_value(v)?);
            }
            Ok(Expression::Object(entries))
        }
        serde_json::Value::Array(items) => Ok(Expression::Array(
            items.iter().map(convert_value).collect::<Result<Vec<_>>>()?,
        )),
        other => Ok(Expression::Literal(other.clone())),
    }
}

/// A condition is either a bare `${expr}` string or a plain literal
/// ("true"/"false" tolerated for hand-written templates).
fn parse_condition_string(s: &str) -> Result<Expression> {
    match s.trim() {
        "true" => Ok(Expression::Literal(serde_json::Value::Bool(true))),
        "false" => Ok(Expression::Literal(serde_json::Value::Bool(false))),
        other => parse_interpolated(other),
    }
}

/// Split a string with `${...}` interpolations. A string that is a single
/// whole-string interpolation yields the inner expression directly (the
/// value may be non-string); mixed strings become a `concat(...)` call.
fn parse_interpolated(s: &str) -> Result<Expression> {
    if !s.contains("${") {
        return Ok(Expression::string(s));
    }

    let mut parts: Vec<Expression> = Vec::new();
    let mut remaining = s;

    while let Some(start) = remaining.find("${") {
        if start > 0 {
            parts.push(Expression::string(&remaining[..start]));
        }
        let Some(end) = remaining[start + 2..].find('}') else {
            return Err(EngineError::template(format!(
                "unterminated interpolation in '{s}'"
            )));
        };
        let inner = &remaining[start + 2..start + 2 + end];
        parts.push(parse_expression(inner)?);
        remaining = &remaining[start + 2 + end + 1..];
    }
    if !remaining.is_empty() {
        parts.push(Expression::string(remaining));
    }

    if parts.len() == 1 {
        Ok(parts.into_iter().next().unwrap())
    } else {
        Ok(Expression::Call {
            name: "concat".to_string(),
            args: parts,
        })
    }
}

// ─── Expression mini-parser ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    True,
    False,
    LParen,
    RParen,
    Comma,
    Dot,
    Bang,
    EqEq,
    AndAnd,
    OrOr,
}

fn lex(src: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = src.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '.' => {
                chars.next();
                tokens.push(Token::Dot);
            }
            '!' => {
                chars.next();
                tokens.push(Token::Bang);
            }
            '=' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::EqEq);
                } else {
                    return Err(EngineError::template(format!("unexpected '=' in '{src}'")));
                }
            }
            '&' => {
                chars.next();
                if chars.peek() == Some(&'&') {
                    chars.next();
                    tokens.push(Token::AndAnd);
                } else {
                    return Err(EngineError::template(format!("unexpected '&' in '{src}'")));
                }
            }
            '|' => {
                chars.next();
                if chars.peek() == Some(&'|') {
                    chars.next();
                    tokens.push(Token::OrOr);
                } else {
                    return Err(EngineError::template(format!("unexpected '|' in '{src}'")));
                }
            }
            '\'' => {
                chars.next();
                let mut lit = String::new();
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(ch) => lit.push(ch),
                        None => {
                            return Err(EngineError::template(format!(
                                "unterminated string literal in '{src}'"
                            )))
                        }
                    }
                }
                tokens.push(Token::Str(lit));
            }
            '0'..='9' | '-' => {
                let mut num = String::new();
                num.push(c);
                chars.next();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() {
                        num.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let n: i64 = num
                    .parse()
                    .map_err(|_| EngineError::template(format!("bad number '{num}' in '{src}'")))?;
                tokens.push(Token::Int(n));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
                        ident.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match ident.as_str() {
                    "true" => tokens.push(Token::True),
                    "false" => tokens.push(Token::False),
                    _ => tokens.push(Token::Ident(ident)),
                }
            }
            other => {
                return Err(EngineError::template(format!(
                    "unexpected character '{other}' in '{src}'"
                )))
            }
        }
    }

    Ok(tokens)
}

struct ExprParser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    src: &'a str,
}

/// Parse the inside of a `${...}` interpolation.
pub fn parse_expression(src: &str) -> Result<Expression> {
    let tokens = lex(src)?;
    let mut parser = ExprParser {
        tokens,
        pos: 0,
        src,
    };
    let expr = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(EngineError::template(format!(
            "trailing tokens in expression '{src}'"
        )));
    }
    Ok(expr)
}

impl ExprParser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, tok: Token) -> Result<()> {
        match self.next() {
            Some(t) if t == tok => Ok(()),
            other => Err(EngineError::template(format!(
                "expected {tok:?}, found {other:?} in '{}'",
                self.src
            ))),
        }
    }

    fn parse_or(&mut self) -> Result<Expression> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::OrOr) {
            self.next();
            let right = self.parse_and()?;
            left = Expression::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expression> {
        let mut left = self.parse_equality()?;
        while self.peek() == Some(&Token::AndAnd) {
            self.next();
            let right = self.parse_equality()?;
            left = Expression::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expression> {
        let left = self.parse_unary()?;
        if self.peek() == Some(&Token::EqEq) {
            self.next();
            let right = self.parse_unary()?;
            return Ok(Expression::Eq(Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expression> {
        if self.peek() == Some(&Token::Bang) {
            self.next();
            let inner = self.parse_unary()?;
            return Ok(Expression::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expression> {
        match self.next() {
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Str(s)) => Ok(Expression::string(s)),
            Some(Token::Int(n)) => Ok(Expression::Literal(serde_json::json!(n))),
            Some(Token::True) => Ok(Expression::Literal(serde_json::Value::Bool(true))),
            Some(Token::False) => Ok(Expression::Literal(serde_json::Value::Bool(false))),
            Some(Token::Ident(first)) => {
                // Function call?
                if self.peek() == Some(&Token::LParen) {
                    self.next();
                    let mut args = Vec::new();
                    if self.peek() != Some(&Token::RParen) {
                        loop {
                            args.push(self.parse_or()?);
                            match self.peek() {
                                Some(Token::Comma) => {
                                    self.next();
                                }
                                _ => break,
                            }
                        }
                    }
                    self.expect(Token::RParen)?;
                    return Ok(Expression::Call { name: first, args });
                }

                // Dotted reference path.
                let mut parts = vec![first];
                while self.peek() == Some(&Token::Dot) {
                    self.next();
                    match self.next() {
                        Some(Token::Ident(part)) => parts.push(part),
                        other => {
                            return Err(EngineError::template(format!(
                                "expected identifier after '.', found {other:?} in '{}'",
                                self.src
                            )))
                        }
                    }
                }
                Ok(Expression::Reference(parts))
            }
            other => Err(EngineError::template(format!(
                "unexpected token {other:?} in '{}'",
                self.src
            ))),
        }
    }
}
