//! Value templates.
//!
//! Entity configurations may carry templates such as
//! `{{ value_json.humidity | int }}` that turn a raw MQTT payload into the
//! value the entity cares about. Only the expression subset used by MQTT
//! devices is supported: literal text with `{{ expr }}` blocks, where an
//! expression is `value` or `value_json` followed by attribute/index access
//! and an optional filter chain.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

/// Errors raised while parsing or rendering a template
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TemplateError {
    #[error("unterminated expression starting at byte {0}")]
    Unterminated(usize),

    #[error("empty expression at byte {0}")]
    EmptyExpression(usize),

    #[error("unknown variable: {0}")]
    UnknownVariable(String),

    #[error("invalid attribute access: {0}")]
    InvalidPath(String),

    #[error("unknown filter: {0}")]
    UnknownFilter(String),

    #[error("cannot convert {0} to a number")]
    NotANumber(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Var {
    Value,
    ValueJson,
}

#[derive(Debug, Clone, PartialEq)]
enum PathSegment {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone, PartialEq)]
enum Filter {
    ToJson,
    Int,
    Float,
    Lower,
    Upper,
    Trim,
    Default(Value),
}

#[derive(Debug, Clone, PartialEq)]
struct Expr {
    var: Var,
    path: Vec<PathSegment>,
    filters: Vec<Filter>,
}

#[derive(Debug, Clone, PartialEq)]
enum Part {
    Literal(String),
    Expr(Expr),
}

/// A parsed value template
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "String")]
pub struct Template {
    source: String,
    parts: Vec<Part>,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let mut parts = Vec::new();
        let mut rest = source;
        let mut offset = 0;

        while let Some(start) = rest.find("{{") {
            if start > 0 {
                parts.push(Part::Literal(rest[..start].to_string()));
            }
            let after = &rest[start + 2..];
            let end = after
                .find("}}")
                .ok_or(TemplateError::Unterminated(offset + start))?;
            parts.push(Part::Expr(parse_expr(after[..end].trim(), offset + start)?));

            let consumed = start + 2 + end + 2;
            offset += consumed;
            rest = &rest[consumed..];
        }
        if !rest.is_empty() {
            parts.push(Part::Literal(rest.to_string()));
        }

        Ok(Self {
            source: source.to_string(),
            parts,
        })
    }

    /// Render against a raw payload.
    ///
    /// `value` is the payload text; `value_json` is the payload parsed as JSON,
    /// or undefined when it does not parse. Undefined values render empty.
    pub fn render(&self, payload: &str) -> Result<String, TemplateError> {
        let value_json: Option<Value> = serde_json::from_str(payload).ok();
        let mut out = String::new();

        for part in &self.parts {
            match part {
                Part::Literal(text) => out.push_str(text),
                Part::Expr(expr) => {
                    if let Some(value) = expr.evaluate(payload, value_json.as_ref())? {
                        out.push_str(&display(&value));
                    }
                }
            }
        }

        Ok(out)
    }

    /// Render, falling back to the raw payload when rendering fails.
    pub fn render_with_possible_json_value(&self, payload: &str) -> String {
        match self.render(payload) {
            Ok(rendered) => rendered,
            Err(e) => {
                warn!(
                    "Error rendering template {:?} for payload {:?}: {}",
                    self.source, payload, e
                );
                payload.to_string()
            }
        }
    }
}

impl FromStr for Template {
    type Err = TemplateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Template {
    type Error = TemplateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl Expr {
    fn evaluate(
        &self,
        payload: &str,
        value_json: Option<&Value>,
    ) -> Result<Option<Value>, TemplateError> {
        let mut current = match self.var {
            Var::Value => Some(Value::String(payload.to_string())),
            Var::ValueJson => value_json.cloned(),
        };

        for segment in &self.path {
            current = current.and_then(|v| lookup(v, segment));
        }

        for filter in &self.filters {
            current = filter.apply(current)?;
        }

        Ok(current)
    }
}

impl Filter {
    fn apply(&self, value: Option<Value>) -> Result<Option<Value>, TemplateError> {
        Ok(match self {
            Filter::Default(fallback) => Some(value.unwrap_or_else(|| fallback.clone())),
            Filter::ToJson => value.map(|v| Value::String(v.to_string())),
            Filter::Int => Some(Value::from(to_integer(value)?)),
            Filter::Float => Some(Value::from(to_number(value)?)),
            Filter::Lower => value.map(|v| Value::String(display(&v).to_lowercase())),
            Filter::Upper => value.map(|v| Value::String(display(&v).to_uppercase())),
            Filter::Trim => value.map(|v| Value::String(display(&v).trim().to_string())),
        })
    }
}

/// Finite numeric value of `value`; `inf` and `nan` are not numbers here
fn to_number(value: Option<Value>) -> Result<f64, TemplateError> {
    let number = match &value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        Some(Value::Bool(b)) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    };
    number
        .filter(|n| n.is_finite())
        .ok_or_else(|| not_a_number(value.as_ref()))
}

/// Truncated integer value of `value`, which must fit in an i64
fn to_integer(value: Option<Value>) -> Result<i64, TemplateError> {
    // 2^63 is exactly representable; i64::MAX is not
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;

    let shown = not_a_number(value.as_ref());
    let number = to_number(value)?.trunc();
    if (-LIMIT..LIMIT).contains(&number) {
        Ok(number as i64)
    } else {
        Err(shown)
    }
}

fn not_a_number(value: Option<&Value>) -> TemplateError {
    TemplateError::NotANumber(value.map(display).unwrap_or_else(|| "undefined".to_string()))
}

fn lookup(value: Value, segment: &PathSegment) -> Option<Value> {
    match (value, segment) {
        (Value::Object(mut map), PathSegment::Key(key)) => map.remove(key),
        (Value::Array(mut items), PathSegment::Index(i)) if *i < items.len() => {
            Some(items.swap_remove(*i))
        }
        (Value::Array(items), PathSegment::Key(key)) => key
            .parse::<usize>()
            .ok()
            .and_then(|i| items.into_iter().nth(i)),
        _ => None,
    }
}

/// Strings render as-is; everything else renders as JSON text.
fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn unquote(s: &str) -> Option<&str> {
    let bytes = s.as_bytes();
    if bytes.len() >= 2
        && (bytes[0] == b'\'' || bytes[0] == b'"')
        && bytes[bytes.len() - 1] == bytes[0]
    {
        Some(&s[1..s.len() - 1])
    } else {
        None
    }
}

/// Split on `|` outside of quoted strings.
fn split_filters(src: &str) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut quote: Option<char> = None;
    let mut start = 0;

    for (i, c) in src.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '|') => {
                pieces.push(&src[start..i]);
                start = i + 1;
            }
            (None, _) => {}
        }
    }
    pieces.push(&src[start..]);
    pieces
}

fn parse_expr(src: &str, at: usize) -> Result<Expr, TemplateError> {
    let mut pieces = split_filters(src).into_iter();
    let head = pieces.next().unwrap_or_default().trim();
    if head.is_empty() {
        return Err(TemplateError::EmptyExpression(at));
    }

    let (var, path) = parse_access(head)?;
    let filters = pieces
        .map(|f| parse_filter(f.trim()))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Expr { var, path, filters })
}

fn parse_access(head: &str) -> Result<(Var, Vec<PathSegment>), TemplateError> {
    let invalid = || TemplateError::InvalidPath(head.to_string());

    let ident_end = head.find(['.', '[']).unwrap_or(head.len());
    let var = match head[..ident_end].trim() {
        "value" => Var::Value,
        "value_json" => Var::ValueJson,
        other => return Err(TemplateError::UnknownVariable(other.to_string())),
    };

    let mut path = Vec::new();
    let mut rest = &head[ident_end..];
    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix('.') {
            let end = after.find(['.', '[']).unwrap_or(after.len());
            let key = &after[..end];
            if key.is_empty() || !key.chars().all(|c| c.is_alphanumeric() || c == '_') {
                return Err(invalid());
            }
            path.push(PathSegment::Key(key.to_string()));
            rest = &after[end..];
        } else if let Some(after) = rest.strip_prefix('[') {
            let end = after.find(']').ok_or_else(invalid)?;
            let inner = after[..end].trim();
            let segment = match unquote(inner) {
                Some(key) => PathSegment::Key(key.to_string()),
                None => PathSegment::Index(inner.parse().map_err(|_| invalid())?),
            };
            path.push(segment);
            rest = &after[end + 1..];
        } else {
            return Err(invalid());
        }
    }

    Ok((var, path))
}

fn parse_filter(src: &str) -> Result<Filter, TemplateError> {
    let unknown = || TemplateError::UnknownFilter(src.to_string());

    let (name, arg) = match src.find('(') {
        Some(open) => {
            let inner = src[open + 1..].strip_suffix(')').ok_or_else(unknown)?;
            (src[..open].trim(), Some(inner.trim()))
        }
        None => (src, None),
    };

    match (name, arg) {
        ("tojson", None) => Ok(Filter::ToJson),
        ("int", None) => Ok(Filter::Int),
        ("float", None) => Ok(Filter::Float),
        ("lower", None) => Ok(Filter::Lower),
        ("upper", None) => Ok(Filter::Upper),
        ("trim", None) => Ok(Filter::Trim),
        ("default" | "d", Some(arg)) => {
            let fallback = match unquote(arg) {
                Some(s) => Value::String(s.to_string()),
                None => serde_json::from_str(arg).map_err(|_| unknown())?,
            };
            Ok(Filter::Default(fallback))
        }
        _ => Err(unknown()),
    }
}

/// How a raw payload becomes the value a handler works with.
///
/// Resolved once when the configuration is loaded.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Extractor {
    /// Use the payload unchanged
    #[default]
    Identity,
    /// Render the payload through a template
    Template(Template),
}

impl Extractor {
    pub fn from_template(template: Option<&Template>) -> Self {
        match template {
            Some(t) => Self::Template(t.clone()),
            None => Self::Identity,
        }
    }

    pub fn extract(&self, payload: &str) -> String {
        match self {
            Self::Identity => payload.to_string(),
            Self::Template(t) => t.render_with_possible_json_value(payload),
        }
    }
}
