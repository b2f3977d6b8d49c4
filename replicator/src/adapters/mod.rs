//! Adapters holds the per-kind hooks the generic engine is parameterized by.
//!
//! The engine owns everything kind-independent: informers, permission checks,
//! annotation stamps, create/update/patch/delete plumbing. An adapter only
//! says what a kind's payload is, how to blank it, and which keys it tracks.

use std::collections::BTreeSet;
use std::future::Future;

use json_patch::{PatchOperation, RemoveOperation, jsonptr::PointerBuf};
use k8s_openapi::NamespaceResourceScope;
use serde::{Serialize, de::DeserializeOwned};

use crate::{Context, Result};

mod config_map;
mod role;
mod role_binding;
mod secret;
mod service;
mod service_account;

/// Replicate is implemented by every kind the controller can replicate.
///
/// `copy_payload` is used for pull and push alike: the engine hands it either
/// the live target (update) or a fresh skeleton (create), so hooks that need
/// to preserve target-side state (a Secret's `type`, a RoleBinding's
/// immutable `roleRef`) can read it off the target before overwriting.
#[allow(async_fn_in_trait)]
pub trait Replicate:
    kube::Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Default
    + std::fmt::Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// Overwrite `target`'s payload from `source`.
    ///
    /// Returns the sorted list of copied data keys for kinds with
    /// `replicated-keys` tracking, `None` otherwise.
    fn copy_payload(source: &Self, target: &mut Self, ctx: &Context) -> Option<Vec<String>>;

    /// JSON-Patch operations that blank the replicated payload of a detached
    /// pull target, leaving its shell. Only paths present on `target` may be
    /// emitted, `remove` fails on absent paths.
    fn clear_payload(target: &Self) -> Vec<PatchOperation>;

    /// JSON-Patch operations removing `keys` from the target's payload, for
    /// the partial teardown of a push target. `None` when the kind has no
    /// key-level granularity (it is then always deleted whole).
    fn remove_keys(_target: &Self, _keys: &[String]) -> Option<Vec<PatchOperation>> {
        None
    }

    /// The target's current tracked data-key set, for kinds that stamp
    /// `replicated-keys`.
    fn key_set(_target: &Self) -> Option<BTreeSet<String>> {
        None
    }

    /// Pre-create check before pushing into `namespace`.
    fn before_push(
        _source: &Self,
        _ctx: &Context,
        _namespace: &str,
    ) -> impl Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }
}

/// Remove_op builds a JSON-Patch `remove` for the pointer assembled from
/// `tokens`. Token encoding handles any `/` or `~` escaping.
pub(crate) fn remove_op<'a, I>(tokens: I) -> PatchOperation
where
    I: IntoIterator<Item = &'a str>,
{
    PatchOperation::Remove(RemoveOperation {
        path: PointerBuf::from_tokens(tokens),
    })
}
