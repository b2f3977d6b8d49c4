//! Annotations holds the canonical names of the control annotations and the
//! helpers that parse their values.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use kube::ResourceExt;

use crate::{Error, Result};

/// PREFIX is the namespace all control annotations live under.
pub const PREFIX: &str = "replicator.v1.mittwald.de/";

/// Annotation returns the provided argument as a name in the replicator's
/// annotation space.
fn annotation<S: AsRef<str>>(s: S) -> String {
    let mut out = String::from(PREFIX);
    out.push_str(s.as_ref());
    out
}

/// REPLICATION_ALLOWED gates any pull from the annotated source.
pub static REPLICATION_ALLOWED: LazyLock<String> =
    LazyLock::new(|| annotation("replication-allowed"));
/// REPLICATION_ALLOWED_NAMESPACES lists namespaces (or patterns) a pull
/// target may live in.
pub static REPLICATION_ALLOWED_NAMESPACES: LazyLock<String> =
    LazyLock::new(|| annotation("replication-allowed-namespaces"));
/// REPLICATE_FROM names the source a pull target follows.
pub static REPLICATE_FROM: LazyLock<String> = LazyLock::new(|| annotation("replicate-from"));
/// REPLICATE_TO lists namespaces (or patterns) to push copies into.
pub static REPLICATE_TO: LazyLock<String> = LazyLock::new(|| annotation("replicate-to"));
/// REPLICATE_TO_MATCHING selects push namespaces by their labels.
pub static REPLICATE_TO_MATCHING: LazyLock<String> =
    LazyLock::new(|| annotation("replicate-to-matching"));
/// REPLICATED_AT is the controller's timestamp stamp on replicated objects.
pub static REPLICATED_AT: LazyLock<String> = LazyLock::new(|| annotation("replicated-at"));
/// REPLICATED_FROM_VERSION records the source resourceVersion a replica was
/// built from.
pub static REPLICATED_FROM_VERSION: LazyLock<String> =
    LazyLock::new(|| annotation("replicated-from-version"));
/// REPLICATED_KEYS lists the data keys the controller copied onto a
/// Secret/ConfigMap replica.
pub static REPLICATED_KEYS: LazyLock<String> = LazyLock::new(|| annotation("replicated-keys"));
/// KEEP_OWNER_REFERENCES preserves ownerReferences on push copies.
pub static KEEP_OWNER_REFERENCES: LazyLock<String> =
    LazyLock::new(|| annotation("keep-owner-references"));
/// STRIP_LABELS drops labels on push copies.
pub static STRIP_LABELS: LazyLock<String> = LazyLock::new(|| annotation("strip-labels"));

/// Get returns the named annotation of `obj`, if present.
pub fn get<'a, K: ResourceExt>(obj: &'a K, name: &str) -> Option<&'a str> {
    obj.annotations().get(name).map(String::as_str)
}

/// Truthy reports whether an annotation value is exactly `"true"`.
///
/// The comparison is case-sensitive; anything else, typos included, reads as
/// false.
pub fn truthy(value: Option<&str>) -> bool {
    value == Some("true")
}

/// Split_list iterates the trimmed, non-empty entries of a comma list.
pub fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

/// Parse_source_ref parses a `replicate-from` value into `(namespace, name)`.
///
/// Accepts `namespace/name` or a bare `name`, which implies `own_namespace`.
pub fn parse_source_ref(value: &str, own_namespace: &str) -> Result<(String, String)> {
    let mut parts = value.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(name), None, _) if !name.is_empty() => {
            Ok((own_namespace.to_string(), name.to_string()))
        }
        (Some(ns), Some(name), None) if !ns.is_empty() && !name.is_empty() => {
            Ok((ns.to_string(), name.to_string()))
        }
        _ => Err(Error::Parse(format!(
            "invalid object reference {value:?}, want \"name\" or \"namespace/name\""
        ))),
    }
}

/// Replicated_key_set parses a `replicated-keys` annotation value into a set.
pub fn replicated_key_set(value: &str) -> BTreeSet<String> {
    split_list(value).map(String::from).collect()
}
