//! Environment templates: literals with `${VAR}` style host references and
//! `${service:NAME}` network references.
//!
//! Templates are parsed when the manifest loads (syntax errors are
//! configuration errors) and resolved when the service launches.

use std::fmt;

use crate::error::{Result, StackError};

/// How a missing host variable is handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fallback {
    /// `${VAR}` / `$VAR`: the variable must be set
    Required,
    /// `${VAR:?message}`: must be set and non-empty, custom error
    RequiredWithMessage(String),
    /// `${VAR:-default}`: used when unset or empty
    DefaultIfEmpty(String),
    /// `${VAR-default}`: used only when unset
    DefaultIfUnset(String),
}

/// One piece of a parsed template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    HostVar { name: String, fallback: Fallback },
    ServiceAddress(String),
}

/// A parsed environment value or mount path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    raw: String,
    segments: Vec<Segment>,
}

/// Lookups a template needs during resolution.
pub trait TemplateContext {
    /// Host environment lookup.
    fn host_var(&self, name: &str) -> Option<String>;
    /// Network address of another service.
    fn service_address(&self, service: &str) -> Result<String>;
}

/// Resolves host variables from the process environment and refuses
/// service references. Used where no network fabric exists yet.
pub struct ProcessEnv;

impl TemplateContext for ProcessEnv {
    fn host_var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }

    fn service_address(&self, service: &str) -> Result<String> {
        Err(StackError::UnresolvedAddress(format!(
            "service '{}' has no address in this context",
            service
        )))
    }
}

impl Template {
    /// Parse a raw value.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = raw.char_indices().peekable();

        while let Some((i, c)) = chars.next() {
            if c != '$' {
                literal.push(c);
                continue;
            }
            match chars.peek().map(|&(_, c)| c) {
                Some('$') => {
                    chars.next();
                    literal.push('$');
                }
                Some('{') => {
                    chars.next();
                    let start = i + 2;
                    let end = raw[start..]
                        .find('}')
                        .map(|off| start + off)
                        .ok_or_else(|| {
                            StackError::Config(format!("unterminated '${{' in '{}'", raw))
                        })?;
                    let body = &raw[start..end];
                    while chars.peek().is_some_and(|&(j, _)| j <= end) {
                        chars.next();
                    }
                    flush(&mut literal, &mut segments);
                    segments.push(parse_braced(body, raw)?);
                }
                Some(c) if c == '_' || c.is_ascii_alphabetic() => {
                    let mut name = String::new();
                    while let Some(&(_, c)) = chars.peek() {
                        if c == '_' || c.is_ascii_alphanumeric() {
                            name.push(c);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    flush(&mut literal, &mut segments);
                    segments.push(Segment::HostVar {
                        name,
                        fallback: Fallback::Required,
                    });
                }
                _ => literal.push('$'),
            }
        }
        flush(&mut literal, &mut segments);

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    /// A template holding a fixed string (no substitution).
    pub fn literal(value: &str) -> Self {
        Self {
            raw: value.replace('$', "$$"),
            segments: vec![Segment::Literal(value.to_string())],
        }
    }

    /// The text as written in the manifest.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Host variables this template reads.
    pub fn host_vars(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::HostVar { name, .. } => Some(name.as_str()),
            _ => None,
        })
    }

    /// Services whose address this template reads.
    pub fn service_refs(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::ServiceAddress(name) => Some(name.as_str()),
            _ => None,
        })
    }

    /// Substitute every reference. The first unresolvable reference fails
    /// the whole value.
    pub fn resolve(&self, ctx: &dyn TemplateContext) -> Result<String> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(s) => out.push_str(s),
                Segment::ServiceAddress(service) => out.push_str(&ctx.service_address(service)?),
                Segment::HostVar { name, fallback } => {
                    let value = ctx.host_var(name);
                    match (fallback, value) {
                        (Fallback::Required, Some(v)) => out.push_str(&v),
                        (Fallback::Required, None) => {
                            return Err(StackError::Config(format!(
                                "required host variable '{}' is not set",
                                name
                            )))
                        }
                        (Fallback::RequiredWithMessage(msg), v) => match v {
                            Some(v) if !v.is_empty() => out.push_str(&v),
                            _ => {
                                return Err(StackError::Config(format!(
                                    "required host variable '{}' is not set: {}",
                                    name, msg
                                )))
                            }
                        },
                        (Fallback::DefaultIfEmpty(default), v) => match v {
                            Some(v) if !v.is_empty() => out.push_str(&v),
                            _ => out.push_str(default),
                        },
                        (Fallback::DefaultIfUnset(default), v) => {
                            out.push_str(v.as_deref().unwrap_or(default))
                        }
                    }
                }
            }
        }
        Ok(out)
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn flush(literal: &mut String, segments: &mut Vec<Segment>) {
    if !literal.is_empty() {
        segments.push(Segment::Literal(std::mem::take(literal)));
    }
}

fn parse_braced(body: &str, raw: &str) -> Result<Segment> {
    if let Some(service) = body.strip_prefix("service:") {
        if service.is_empty() {
            return Err(StackError::Config(format!(
                "empty service reference in '{}'",
                raw
            )));
        }
        return Ok(Segment::ServiceAddress(service.to_string()));
    }

    let name_end = body
        .find(|c: char| !(c == '_' || c.is_ascii_alphanumeric()))
        .unwrap_or(body.len());
    let name = &body[..name_end];
    if name.is_empty() || name.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(StackError::Config(format!(
            "invalid variable reference '${{{}}}' in '{}'",
            body, raw
        )));
    }

    let rest = &body[name_end..];
    let fallback = if rest.is_empty() {
        Fallback::Required
    } else if let Some(msg) = rest.strip_prefix(":?") {
        Fallback::RequiredWithMessage(msg.to_string())
    } else if let Some(default) = rest.strip_prefix(":-") {
        Fallback::DefaultIfEmpty(default.to_string())
    } else if let Some(default) = rest.strip_prefix('-') {
        Fallback::DefaultIfUnset(default.to_string())
    } else {
        return Err(StackError::Config(format!(
            "unsupported modifier '{}' in '{}'",
            rest, raw
        )));
    };

    Ok(Segment::HostVar {
        name: name.to_string(),
        fallback,
    })
}
