use std::collections::BTreeSet;

use json_patch::PatchOperation;
use k8s_openapi::api::core::v1::ConfigMap;

use super::{Replicate, remove_op};
use crate::annotations::{self, REPLICATED_KEYS};
use crate::Context;

impl Replicate for ConfigMap {
    /// Copies `data` and `binaryData` with the same merge semantics as
    /// Secret: previously replicated keys that left the source are removed,
    /// operator-added keys survive. Tracked keys span both maps.
    fn copy_payload(source: &Self, target: &mut Self, _ctx: &Context) -> Option<Vec<String>> {
        let prev = annotations::get(target, &REPLICATED_KEYS)
            .map(annotations::replicated_key_set)
            .unwrap_or_default();
        let mut data = target.data.take().unwrap_or_default();
        let mut binary = target.binary_data.take().unwrap_or_default();
        for key in &prev {
            data.remove(key);
            binary.remove(key);
        }
        let mut copied = Vec::new();
        for (key, value) in source.data.iter().flatten() {
            data.insert(key.clone(), value.clone());
            copied.push(key.clone());
        }
        for (key, value) in source.binary_data.iter().flatten() {
            binary.insert(key.clone(), value.clone());
            copied.push(key.clone());
        }
        target.data = (!data.is_empty()).then_some(data);
        target.binary_data = (!binary.is_empty()).then_some(binary);
        copied.sort();
        Some(copied)
    }

    fn clear_payload(target: &Self) -> Vec<PatchOperation> {
        let mut ops = Vec::new();
        if target.data.is_some() {
            ops.push(remove_op(["data"]));
        }
        if target.binary_data.is_some() {
            ops.push(remove_op(["binaryData"]));
        }
        ops
    }

    fn remove_keys(target: &Self, keys: &[String]) -> Option<Vec<PatchOperation>> {
        let mut ops = Vec::new();
        for key in keys {
            if target
                .data
                .as_ref()
                .is_some_and(|d| d.contains_key(key.as_str()))
            {
                ops.push(remove_op(["data", key.as_str()]));
            } else if target
                .binary_data
                .as_ref()
                .is_some_and(|d| d.contains_key(key.as_str()))
            {
                ops.push(remove_op(["binaryData", key.as_str()]));
            }
        }
        Some(ops)
    }

    fn key_set(target: &Self) -> Option<BTreeSet<String>> {
        Some(
            target
                .data
                .iter()
                .flatten()
                .map(|(k, _)| k.clone())
                .chain(target.binary_data.iter().flatten().map(|(k, _)| k.clone()))
                .collect(),
        )
    }
}
