use std::collections::BTreeSet;

use json_patch::PatchOperation;
use k8s_openapi::api::core::v1::Secret;

use super::{Replicate, remove_op};
use crate::annotations::{self, REPLICATED_KEYS};
use crate::Context;

impl Replicate for Secret {
    /// Copies `data` by value. Keys the target received on an earlier pass
    /// (listed in its `replicated-keys` annotation) but which have since left
    /// the source are dropped; keys the operator added by hand are never
    /// touched. `type` is immutable in the API, so an existing target keeps
    /// its own and only a fresh one takes the source's.
    fn copy_payload(source: &Self, target: &mut Self, _ctx: &Context) -> Option<Vec<String>> {
        let prev = annotations::get(target, &REPLICATED_KEYS)
            .map(annotations::replicated_key_set)
            .unwrap_or_default();
        let mut data = target.data.take().unwrap_or_default();
        for key in &prev {
            data.remove(key);
        }
        let mut copied = Vec::new();
        for (key, value) in source.data.iter().flatten() {
            data.insert(key.clone(), value.clone());
            copied.push(key.clone());
        }
        target.data = (!data.is_empty()).then_some(data);
        if target.type_.is_none() {
            target.type_ = source.type_.clone();
        }
        copied.sort();
        Some(copied)
    }

    fn clear_payload(target: &Self) -> Vec<PatchOperation> {
        match target.data {
            Some(_) => vec![remove_op(["data"])],
            None => vec![],
        }
    }

    fn remove_keys(target: &Self, keys: &[String]) -> Option<Vec<PatchOperation>> {
        let data = target.data.as_ref()?;
        Some(
            keys.iter()
                .filter(|k| data.contains_key(k.as_str()))
                .map(|k| remove_op(["data", k.as_str()]))
                .collect(),
        )
    }

    fn key_set(target: &Self) -> Option<BTreeSet<String>> {
        Some(target.data.iter().flatten().map(|(k, _)| k.clone()).collect())
    }
}
