//! Express-style path templates (`/blog/:slug`, `/docs/:path*`, `/:id(\d+)`).
//!
//! A template is parsed once into tokens, which drive both matching (extracting
//! named parameters from a concrete path) and compilation (substituting
//! parameters back into a destination). Values are neither encoded nor
//! validated against their pattern when compiling.

use std::collections::BTreeMap;

use regex::Regex;
use thiserror::Error;

/// Parameters captured from a path or a predicate, keyed by name.
pub type Params = BTreeMap<String, String>;

const DEFAULT_PATTERN: &str = "[^/#?]+?";
const PREFIX_CHARS: [char; 2] = ['/', '.'];
/// Interception-route markers that look like groups but are literal text.
const LITERAL_GROUPS: [&str; 3] = ["(...)", "(..)", "(.)"];

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("invalid path template `{template}`: {reason}")]
    Invalid { template: String, reason: String },
    #[error("missing value for parameter `{0}`")]
    MissingParam(String),
    #[error("template regex failed to compile: {0}")]
    Regex(#[from] regex::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Modifier {
    Optional,
    ZeroOrMore,
    OneOrMore,
}

impl Modifier {
    fn from_char(c: char) -> Option<Self> {
        match c {
            '?' => Some(Self::Optional),
            '*' => Some(Self::ZeroOrMore),
            '+' => Some(Self::OneOrMore),
            _ => None,
        }
    }

    fn may_be_absent(self) -> bool {
        matches!(self, Self::Optional | Self::ZeroOrMore)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Param {
    name: String,
    prefix: String,
    pattern: String,
    modifier: Option<Modifier>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(String),
    Param(Param),
}

#[derive(Debug, Clone)]
pub struct PathTemplate {
    source: String,
    tokens: Vec<Token>,
    matcher: Regex,
}

impl PathTemplate {
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let tokens = tokenize(source)?;
        let matcher = Regex::new(&format!("^{}[/#?]?$", regex_body(&tokens)))?;
        Ok(Self {
            source: source.to_string(),
            tokens,
            matcher,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Whether the template declares any parameter.
    pub fn has_params(&self) -> bool {
        self.tokens.iter().any(|t| matches!(t, Token::Param(_)))
    }

    /// Extract parameters from `path`, or `None` when the template does not match.
    pub fn match_path(&self, path: &str) -> Option<Params> {
        let captures = self.matcher.captures(path)?;
        let mut params = Params::new();
        for (index, param) in self.params().enumerate() {
            if let Some(value) = captures.name(&group_name(index)) {
                params.insert(param.name.clone(), value.as_str().to_string());
            }
        }
        Some(params)
    }

    /// Substitute `params` into the template. Absent optional parameters are
    /// dropped together with their prefix.
    pub fn compile(&self, params: &Params) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(self.source.len());
        for token in &self.tokens {
            match token {
                Token::Literal(text) => out.push_str(text),
                Token::Param(param) => match params.get(&param.name) {
                    Some(value) => {
                        out.push_str(&param.prefix);
                        out.push_str(value);
                    }
                    None if param.modifier.is_some_and(Modifier::may_be_absent) => {}
                    None => return Err(TemplateError::MissingParam(param.name.clone())),
                },
            }
        }
        Ok(out)
    }

    fn params(&self) -> impl Iterator<Item = &Param> {
        self.tokens.iter().filter_map(|t| match t {
            Token::Param(p) => Some(p),
            Token::Literal(_) => None,
        })
    }
}

fn group_name(index: usize) -> String {
    format!("__p{index}")
}

fn tokenize(source: &str) -> Result<Vec<Token>, TemplateError> {
    let invalid = |reason: &str| TemplateError::Invalid {
        template: source.to_string(),
        reason: reason.to_string(),
    };

    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut literal = String::new();
    let mut unnamed = 0usize;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c == '\\' {
            match chars.get(i + 1) {
                Some(&next) => {
                    literal.push(next);
                    i += 2;
                }
                None => {
                    literal.push(c);
                    i += 1;
                }
            }
            continue;
        }

        if c == '('
            && let Some(marker) = literal_group_at(&chars[i..])
        {
            literal.push_str(marker);
            i += marker.chars().count();
            continue;
        }

        if c != ':' && c != '(' {
            literal.push(c);
            i += 1;
            continue;
        }

        let mut name = String::new();
        if c == ':' {
            i += 1;
            while let Some(&n) = chars.get(i) {
                if n.is_ascii_alphanumeric() || n == '_' {
                    name.push(n);
                    i += 1;
                } else {
                    break;
                }
            }
            if name.is_empty() {
                return Err(invalid("missing parameter name"));
            }
        }

        let mut pattern = None;
        if chars.get(i) == Some(&'(') && literal_group_at(&chars[i..]).is_none() {
            let (group, consumed) =
                read_group(&chars[i..]).ok_or_else(|| invalid("unbalanced pattern"))?;
            if group.is_empty() {
                return Err(invalid("empty pattern"));
            }
            pattern = Some(group);
            i += consumed;
        }

        if name.is_empty() {
            name = unnamed.to_string();
            unnamed += 1;
        }

        let modifier = chars.get(i).copied().and_then(Modifier::from_char);
        if modifier.is_some() {
            i += 1;
        }

        let prefix = match literal.chars().last() {
            Some(last) if PREFIX_CHARS.contains(&last) => {
                literal.pop();
                last.to_string()
            }
            _ => String::new(),
        };
        if !literal.is_empty() {
            tokens.push(Token::Literal(std::mem::take(&mut literal)));
        }

        tokens.push(Token::Param(Param {
            name,
            prefix,
            pattern: pattern.unwrap_or_else(|| DEFAULT_PATTERN.to_string()),
            modifier,
        }));
    }

    if !literal.is_empty() {
        tokens.push(Token::Literal(literal));
    }
    Ok(tokens)
}

fn literal_group_at(chars: &[char]) -> Option<&'static str> {
    LITERAL_GROUPS.into_iter().find(|marker| {
        let marker: Vec<char> = marker.chars().collect();
        chars.starts_with(&marker)
    })
}

/// Read a balanced `( ... )` group, returning its inner text and the number of
/// chars consumed including both parentheses.
fn read_group(chars: &[char]) -> Option<(String, usize)> {
    let mut depth = 0usize;
    let mut inner = String::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '\\' => {
                inner.push(c);
                if let Some(&next) = chars.get(i + 1) {
                    inner.push(next);
                    i += 1;
                }
            }
            '(' => {
                if depth > 0 {
                    inner.push(c);
                }
                depth += 1;
            }
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some((inner, i + 1));
                }
                inner.push(c);
            }
            _ => inner.push(c),
        }
        i += 1;
    }
    None
}

fn regex_body(tokens: &[Token]) -> String {
    let mut body = String::new();
    let mut index = 0;
    for token in tokens {
        match token {
            Token::Literal(text) => body.push_str(&regex::escape(text)),
            Token::Param(param) => {
                let group = group_name(index);
                index += 1;
                let pattern = &param.pattern;
                let prefix = regex::escape(&param.prefix);
                let modifier = match param.modifier {
                    Some(Modifier::Optional) => "?",
                    Some(Modifier::ZeroOrMore) => "*",
                    Some(Modifier::OneOrMore) => "+",
                    None => "",
                };

                if prefix.is_empty() {
                    body.push_str(&format!("(?P<{group}>{pattern}){modifier}"));
                } else if matches!(
                    param.modifier,
                    Some(Modifier::ZeroOrMore | Modifier::OneOrMore)
                ) {
                    let optional = if param.modifier == Some(Modifier::ZeroOrMore) {
                        "?"
                    } else {
                        ""
                    };
                    body.push_str(&format!(
                        "(?:{prefix}(?P<{group}>(?:{pattern})(?:{prefix}(?:{pattern}))*)){optional}"
                    ));
                } else {
                    body.push_str(&format!("(?:{prefix}(?P<{group}>{pattern})){modifier}"));
                }
            }
        }
    }
    body
}

/// Translate a manifest regular expression into the syntax accepted by `regex`.
///
/// Manifests escape `/` as `\/`, which is a no-op in the source syntax.
pub fn compile_manifest_regex(source: &str) -> Result<Regex, regex::Error> {
    let mut translated = String::with_capacity(source.len());
    let mut chars = source.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('/') => translated.push('/'),
                Some(next) => {
                    translated.push('\\');
                    translated.push(next);
                }
                None => translated.push('\\'),
            }
        } else {
            translated.push(c);
        }
    }
    Regex::new(&translated)
}
