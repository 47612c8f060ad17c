//! Template expressions embedded in document scalars.
//!
//! Expressions are parsed into a small AST and evaluated against a typed
//! context tree; nothing is substituted textually before parsing the YAML.
//!
//! ```text
//! pipeline := term ( "|" function )*
//! function := "default" term | "quote" | "upper" | "lower" | "toString"
//! term     := path | string | number | "true" | "false" | "null"
//! path     := ( "." segment )+
//! ```

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use super::values::lookup;
use crate::error::RenderError;

static RE_EXPRESSION: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\{\{(.*?)\}\}").unwrap());

#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    Path(Vec<String>),
    Literal(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Function {
    Default(Term),
    Quote,
    Upper,
    Lower,
    ToString,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    pub head: Term,
    pub functions: Vec<Function>,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Path(Vec<String>),
    Ident(String),
    Literal(Value),
    Pipe,
}

/// Values visible to expressions: `.Values`, `.Target` and `.Release`.
pub struct Context {
    root: Value,
}

impl Context {
    pub fn new(values: Value, target: Value, release: Value) -> Self {
        let mut root = Map::new();
        root.insert("Values".into(), values);
        root.insert("Target".into(), target);
        root.insert("Release".into(), release);
        Self {
            root: Value::Object(root),
        }
    }

    fn resolve(&self, term: &Term) -> Option<Value> {
        match term {
            Term::Literal(v) => Some(v.clone()),
            Term::Path(path) => lookup(&self.root, path).cloned(),
        }
    }
}

/// Failure while evaluating one scalar, before document attribution.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprError {
    Malformed { expression: String, reason: String },
    Undefined(String),
}

impl ExprError {
    pub fn into_render_error(self, document: &str) -> RenderError {
        match self {
            ExprError::Malformed { expression, reason } => RenderError::Malformed {
                document: document.to_string(),
                expression,
                reason,
            },
            ExprError::Undefined(path) => RenderError::UndefinedValue {
                document: document.to_string(),
                path,
            },
        }
    }
}

/// Evaluates every expression in a document tree. Mapping keys are left as is.
pub fn evaluate_tree(value: &Value, context: &Context) -> Result<Value, ExprError> {
    match value {
        Value::String(s) => evaluate_scalar(s, context),
        Value::Array(items) => items
            .iter()
            .map(|item| evaluate_tree(item, context))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| evaluate_tree(v, context).map(|v| (k.clone(), v)))
            .collect::<Result<Map<_, _>, _>>()
            .map(Value::Object),
        other => Ok(other.clone()),
    }
}

/// Evaluates one scalar. A scalar that is exactly one expression keeps the
/// expression's type; otherwise results are interpolated as strings.
pub fn evaluate_scalar(text: &str, context: &Context) -> Result<Value, ExprError> {
    if !text.contains("{{") && !text.contains("}}") {
        return Ok(Value::String(text.to_string()));
    }

    let mut output = String::new();
    let mut last = 0;
    let mut matches = 0;
    let mut whole: Option<Value> = None;

    for capture in RE_EXPRESSION.captures_iter(text) {
        let (Some(full), Some(inner)) = (capture.get(0), capture.get(1)) else {
            continue;
        };
        check_literal_text(&text[last..full.start()], text)?;

        let pipeline = parse(inner.as_str())?;
        let value = evaluate(&pipeline, context)?;

        matches += 1;
        if full.start() == 0 && full.end() == text.len() {
            whole = Some(value.clone());
        }
        output.push_str(&text[last..full.start()]);
        output.push_str(&to_display_string(&value));
        last = full.end();
    }
    check_literal_text(&text[last..], text)?;
    output.push_str(&text[last..]);

    match (matches, whole) {
        (1, Some(value)) => Ok(value),
        _ => Ok(Value::String(output)),
    }
}

fn check_literal_text(segment: &str, text: &str) -> Result<(), ExprError> {
    if segment.contains("{{") || segment.contains("}}") {
        return Err(ExprError::Malformed {
            expression: text.to_string(),
            reason: "unbalanced braces".to_string(),
        });
    }
    Ok(())
}

pub fn parse(expression: &str) -> Result<Pipeline, ExprError> {
    let malformed = |reason: String| ExprError::Malformed {
        expression: expression.trim().to_string(),
        reason,
    };

    let tokens = tokenize(expression).map_err(&malformed)?;
    let mut tokens = tokens.into_iter().peekable();

    let head = match tokens.next() {
        Some(token) => term_from(token).map_err(&malformed)?,
        None => return Err(malformed("empty expression".to_string())),
    };

    let mut functions = Vec::new();
    while let Some(token) = tokens.next() {
        if token != Token::Pipe {
            return Err(malformed(format!("expected '|', found {:?}", token)));
        }
        let name = match tokens.next() {
            Some(Token::Ident(name)) => name,
            other => return Err(malformed(format!("expected function name, found {:?}", other))),
        };
        let function = match name.as_str() {
            "default" => {
                let arg = match tokens.next() {
                    Some(token) if token != Token::Pipe => term_from(token).map_err(&malformed)?,
                    _ => return Err(malformed("default requires an argument".to_string())),
                };
                Function::Default(arg)
            }
            "quote" => Function::Quote,
            "upper" => Function::Upper,
            "lower" => Function::Lower,
            "toString" => Function::ToString,
            other => return Err(malformed(format!("unknown function '{}'", other))),
        };
        functions.push(function);
    }

    Ok(Pipeline { head, functions })
}

fn term_from(token: Token) -> Result<Term, String> {
    match token {
        Token::Path(path) => Ok(Term::Path(path)),
        Token::Literal(value) => Ok(Term::Literal(value)),
        Token::Ident(name) => Err(format!("unexpected identifier '{}'", name)),
        Token::Pipe => Err("unexpected '|'".to_string()),
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c == '|' {
            tokens.push(Token::Pipe);
            i += 1;
        } else if c == '.' {
            let mut segments = Vec::new();
            while i < chars.len() && chars[i] == '.' {
                i += 1;
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '-')
                {
                    i += 1;
                }
                if start == i {
                    return Err("empty path segment".to_string());
                }
                segments.push(chars[start..i].iter().collect());
            }
            tokens.push(Token::Path(segments));
        } else if c == '"' {
            i += 1;
            let mut literal = String::new();
            loop {
                match chars.get(i) {
                    None => return Err("unterminated string literal".to_string()),
                    Some('"') => {
                        i += 1;
                        break;
                    }
                    Some('\\') => {
                        match chars.get(i + 1) {
                            Some('n') => literal.push('\n'),
                            Some('t') => literal.push('\t'),
                            Some(&escaped) => literal.push(escaped),
                            None => return Err("unterminated string literal".to_string()),
                        }
                        i += 2;
                    }
                    Some(&ch) => {
                        literal.push(ch);
                        i += 1;
                    }
                }
            }
            tokens.push(Token::Literal(Value::String(literal)));
        } else if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) {
            let start = i;
            i += 1;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            let value = if let Ok(n) = text.parse::<i64>() {
                Value::from(n)
            } else {
                text.parse::<f64>()
                    .ok()
                    .and_then(serde_json::Number::from_f64)
                    .map(Value::Number)
                    .ok_or_else(|| format!("invalid number '{}'", text))?
            };
            tokens.push(Token::Literal(value));
        } else if c.is_alphabetic() {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            tokens.push(match word.as_str() {
                "true" => Token::Literal(Value::Bool(true)),
                "false" => Token::Literal(Value::Bool(false)),
                "null" => Token::Literal(Value::Null),
                _ => Token::Ident(word),
            });
        } else {
            return Err(format!("unexpected character '{}'", c));
        }
    }

    Ok(tokens)
}

fn describe(term: &Term) -> String {
    match term {
        Term::Path(path) => format!(".{}", path.join(".")),
        Term::Literal(value) => value.to_string(),
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

pub fn evaluate(pipeline: &Pipeline, context: &Context) -> Result<Value, ExprError> {
    let mut current = context.resolve(&pipeline.head);

    for function in &pipeline.functions {
        current = match function {
            Function::Default(fallback) => match current {
                Some(value) if !is_empty(&value) => Some(value),
                _ => Some(
                    context
                        .resolve(fallback)
                        .ok_or_else(|| ExprError::Undefined(describe(fallback)))?,
                ),
            },
            other => {
                let value = current.ok_or_else(|| ExprError::Undefined(describe(&pipeline.head)))?;
                let text = to_display_string(&value);
                Some(Value::String(match other {
                    Function::Quote => Value::String(text).to_string(),
                    Function::Upper => text.to_uppercase(),
                    Function::Lower => text.to_lowercase(),
                    _ => text,
                }))
            }
        };
    }

    current.ok_or_else(|| ExprError::Undefined(describe(&pipeline.head)))
}

/// String form used when an expression is interpolated into text.
pub fn to_display_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(_) | Value::Number(_) => value.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}
