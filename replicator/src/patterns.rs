//! Patterns compiles operator-supplied namespace lists and label selectors
//! into matchers.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use tracing::warn;

use crate::annotations::split_list;
use crate::{Error, Result};

static DNS_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("static pattern"));

/// Is_dns_label reports whether `s` is a valid DNS-1123 label, i.e. a literal
/// namespace name.
fn is_dns_label(s: &str) -> bool {
    s.len() <= 63 && DNS_LABEL.is_match(s)
}

/// NamespaceFilter matches namespace names against a comma list of literal
/// names and regular expressions.
///
/// Entries that are valid DNS-1123 labels are literals; everything else is
/// compiled as an anchored regex. Entries that fail to compile are logged and
/// skipped, they do not disable the rest of the list.
#[derive(Debug, Default)]
pub struct NamespaceFilter {
    literals: Vec<String>,
    patterns: Vec<Regex>,
}

impl NamespaceFilter {
    /// Compile builds a filter from an annotation value.
    pub fn compile(value: &str) -> NamespaceFilter {
        let mut filter = NamespaceFilter::default();
        for entry in split_list(value) {
            if is_dns_label(entry) {
                filter.literals.push(entry.to_string());
                continue;
            }
            match Regex::new(&format!("^(?:{entry})$")) {
                Ok(re) => filter.patterns.push(re),
                Err(err) => warn!(entry, error = %err, "unusable namespace pattern, skipping"),
            }
        }
        filter
    }

    /// Matches reports whether `namespace` equals any literal or matches any
    /// pattern.
    pub fn matches(&self, namespace: &str) -> bool {
        self.literals.iter().any(|l| l == namespace)
            || self.patterns.iter().any(|re| re.is_match(namespace))
    }

    /// Is_empty reports whether the filter has no usable entries. An empty
    /// filter matches nothing.
    pub fn is_empty(&self) -> bool {
        self.literals.is_empty() && self.patterns.is_empty()
    }
}

/// LabelSelector is a parsed Kubernetes label-selector expression, evaluated
/// against namespace labels.
#[derive(Debug)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

#[derive(Debug)]
enum Requirement {
    Eq(String, String),
    Ne(String, String),
    In(String, Vec<String>),
    NotIn(String, Vec<String>),
}

impl LabelSelector {
    /// Parse parses selector syntax: comma-joined requirements of the forms
    /// `k=v`, `k==v`, `k!=v`, `k in (a,b)` and `k notin (a,b)`.
    ///
    /// A bare key (the "exists" form) is rejected; in this annotation
    /// vocabulary it is far more likely a typo than intent.
    pub fn parse(expr: &str) -> Result<LabelSelector> {
        let mut requirements = Vec::new();
        for req in split_requirements(expr) {
            let req = req.trim();
            if req.is_empty() {
                continue;
            }
            requirements.push(parse_requirement(req)?);
        }
        if requirements.is_empty() {
            return Err(Error::Parse(format!("empty label selector {expr:?}")));
        }
        Ok(LabelSelector { requirements })
    }

    /// Matches reports whether every requirement holds for `labels`.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|req| match req {
            Requirement::Eq(k, v) => labels.get(k) == Some(v),
            Requirement::Ne(k, v) => labels.get(k) != Some(v),
            Requirement::In(k, vs) => labels.get(k).is_some_and(|v| vs.contains(v)),
            Requirement::NotIn(k, vs) => !labels.get(k).is_some_and(|v| vs.contains(v)),
        })
    }
}

/// Split_requirements splits on commas that are not inside a `(…)` value set.
fn split_requirements(expr: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in expr.char_indices() {
        match c {
            '(' => depth = depth.saturating_add(1),
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                out.push(&expr[start..i]);
                start = i.saturating_add(1);
            }
            _ => {}
        }
    }
    out.push(&expr[start..]);
    out
}

fn parse_requirement(req: &str) -> Result<Requirement> {
    let bad = |msg: &str| Error::Parse(format!("label selector requirement {req:?}: {msg}"));

    if let Some((key, rest)) = split_keyword(req, " notin ") {
        return Ok(Requirement::NotIn(
            validate_key(key, &bad)?,
            parse_value_set(rest, &bad)?,
        ));
    }
    if let Some((key, rest)) = split_keyword(req, " in ") {
        return Ok(Requirement::In(
            validate_key(key, &bad)?,
            parse_value_set(rest, &bad)?,
        ));
    }
    if let Some((key, value)) = req.split_once("!=") {
        return Ok(Requirement::Ne(
            validate_key(key, &bad)?,
            value.trim().to_string(),
        ));
    }
    if let Some((key, value)) = req.split_once("==") {
        return Ok(Requirement::Eq(
            validate_key(key, &bad)?,
            value.trim().to_string(),
        ));
    }
    if let Some((key, value)) = req.split_once('=') {
        return Ok(Requirement::Eq(
            validate_key(key, &bad)?,
            value.trim().to_string(),
        ));
    }
    Err(bad("bare keys are not accepted, use key=value or key in (…)"))
}

fn split_keyword<'a>(req: &'a str, keyword: &str) -> Option<(&'a str, &'a str)> {
    req.find(keyword)
        .map(|at| (&req[..at], &req[at.saturating_add(keyword.len())..]))
}

fn validate_key(key: &str, bad: &impl Fn(&str) -> Error) -> Result<String> {
    let key = key.trim();
    if key.is_empty() || key.contains(['!', '=', '(', ')', ',']) {
        return Err(bad("invalid key"));
    }
    Ok(key.to_string())
}

fn parse_value_set(rest: &str, bad: &impl Fn(&str) -> Error) -> Result<Vec<String>> {
    let rest = rest.trim();
    let inner = rest
        .strip_prefix('(')
        .and_then(|r| r.strip_suffix(')'))
        .ok_or_else(|| bad("want a parenthesized value set"))?;
    let values: Vec<String> = split_list(inner).map(String::from).collect();
    if values.is_empty() {
        return Err(bad("empty value set"));
    }
    Ok(values)
}
