//! RFC 6570 Level 1 URI templates (`{var}` occupying an entire path segment).
//!
//! Templates are matched and expanded one path segment at a time. A segment
//! is either a literal string or a single variable; Level 1 does not support
//! mixing literal text and a variable within the same segment, nor operators
//! (`{+var}`, `{#var}`, ...).

use std::collections::HashMap;
use std::fmt;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};

/// RFC 3986 unreserved characters are left unescaped; everything else that
/// `NON_ALPHANUMERIC` would otherwise escape stays escaped.
const UNRESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Variable(String),
}

/// An error parsing or expanding a URI template.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TemplateError {
    /// A `{...}` expression was left unclosed.
    #[error("unclosed variable expression in template {0:?}")]
    UnclosedVariable(String),
    /// A `{}` expression was empty, or a variable name contained characters
    /// Level 1 does not support (operators, mixed literal/variable segments).
    #[error("invalid variable expression in template {0:?}")]
    InvalidVariable(String),
    /// `expand` was called without a value for a variable the template declares.
    #[error("missing value for template variable {0:?}")]
    MissingVariable(String),
}

/// A parsed RFC 6570 Level 1 URI template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UriTemplate {
    raw: String,
    segments: Vec<Segment>,
}

impl UriTemplate {
    /// Parse a template string such as `/users/{id}/posts/{postId}`.
    pub fn parse(template: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        for part in template.split('/') {
            if part.is_empty() {
                segments.push(Segment::Literal(String::new()));
                continue;
            }
            if let Some(inner) = part.strip_prefix('{') {
                let Some(name) = inner.strip_suffix('}') else {
                    return Err(TemplateError::UnclosedVariable(template.to_string()));
                };
                if name.is_empty() || !is_valid_varname(name) {
                    return Err(TemplateError::InvalidVariable(template.to_string()));
                }
                segments.push(Segment::Variable(name.to_string()));
            } else if part.contains('{') || part.contains('}') {
                // mixed literal+variable segment: not representable at Level 1
                return Err(TemplateError::InvalidVariable(template.to_string()));
            } else {
                segments.push(Segment::Literal(part.to_string()));
            }
        }
        Ok(Self {
            raw: template.to_string(),
            segments,
        })
    }

    /// The original template string as registered.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Names of the variables this template declares, in segment order.
    pub fn variables(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Variable(name) => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    /// Number of literal characters before the first variable segment;
    /// used to rank templates by specificity (longer literal prefix wins).
    pub fn literal_prefix_len(&self) -> usize {
        let mut len = 0;
        for seg in &self.segments {
            match seg {
                Segment::Literal(lit) => len += lit.len() + 1, // +1 for the '/'
                Segment::Variable(_) => break,
            }
        }
        len
    }

    /// Attempt to match a concrete URI path against this template, returning
    /// the captured variables (percent-decoded) on success.
    pub fn matches(&self, uri: &str) -> Option<HashMap<String, String>> {
        let parts: Vec<&str> = uri.split('/').collect();
        if parts.len() != self.segments.len() {
            return None;
        }
        let mut vars = HashMap::new();
        for (seg, part) in self.segments.iter().zip(parts.iter()) {
            match seg {
                Segment::Literal(lit) => {
                    if lit != part {
                        return None;
                    }
                }
                Segment::Variable(name) => {
                    let decoded = percent_encoding::percent_decode_str(part)
                        .decode_utf8()
                        .ok()?;
                    vars.insert(name.clone(), decoded.into_owned());
                }
            }
        }
        Some(vars)
    }

    /// Expand the template against a variable map, percent-encoding values
    /// per RFC 3986 unreserved-character rules.
    pub fn expand(&self, vars: &HashMap<String, String>) -> Result<String, TemplateError> {
        let mut out_segments = Vec::with_capacity(self.segments.len());
        for seg in &self.segments {
            match seg {
                Segment::Literal(lit) => out_segments.push(lit.clone()),
                Segment::Variable(name) => {
                    let value = vars
                        .get(name)
                        .ok_or_else(|| TemplateError::MissingVariable(name.clone()))?;
                    out_segments.push(utf8_percent_encode(value, UNRESERVED).to_string());
                }
            }
        }
        Ok(out_segments.join("/"))
    }

    /// Whether two templates could both match some concrete URI: true unless
    /// a literal segment at the same position differs between them.
    pub fn conflicts_with(&self, other: &Self) -> bool {
        if self.segments.len() != other.segments.len() {
            return false;
        }
        self.segments
            .iter()
            .zip(other.segments.iter())
            .all(|(a, b)| match (a, b) {
                (Segment::Literal(x), Segment::Literal(y)) => x == y,
                _ => true,
            })
    }
}

impl fmt::Display for UriTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

fn is_valid_varname(name: &str) -> bool {
    name.bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'.')
}

/// A set of templates matched together, e.g. the resource-template list of a
/// registry. Templates are tried longest-literal-prefix-first, ties broken
/// lexicographically by template string.
#[derive(Debug, Default)]
pub struct TemplateMatcher {
    templates: Vec<UriTemplate>,
}

impl TemplateMatcher {
    /// Create an empty matcher.
    pub fn new() -> Self {
        Self {
            templates: Vec::new(),
        }
    }

    /// Register a template. Returns an error if it conflicts with an
    /// already-registered template (would produce an ambiguous match for
    /// some concrete URI).
    pub fn register(&mut self, template: UriTemplate) -> Result<(), UriTemplate> {
        if let Some(existing) = self.templates.iter().find(|t| t.conflicts_with(&template)) {
            return Err(existing.clone());
        }
        self.templates.push(template);
        self.sort();
        Ok(())
    }

    fn sort(&mut self) {
        self.templates.sort_by(|a, b| {
            b.literal_prefix_len()
                .cmp(&a.literal_prefix_len())
                .then_with(|| a.raw.cmp(&b.raw))
        });
    }

    /// Find the first matching template (in specificity order) for a
    /// concrete URI, returning the template and its captured variables.
    pub fn find(&self, uri: &str) -> Option<(&UriTemplate, HashMap<String, String>)> {
        self.templates
            .iter()
            .find_map(|t| t.matches(uri).map(|vars| (t, vars)))
    }

    /// Iterate templates in registration/specificity order.
    pub fn iter(&self) -> impl Iterator<Item = &UriTemplate> {
        self.templates.iter()
    }
}
