#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

//! Replicator keeps copies of annotated Kubernetes objects in sync across the
//! namespaces of a single cluster.
//!
//! Operators declare intent with `replicator.v1.mittwald.de/*` annotations:
//! "replicate-from" pulls a source's payload into a pre-created target,
//! "replicate-to" / "replicate-to-matching" push controller-owned copies into
//! every matching namespace. The engine is generic over the object kind; the
//! per-kind adapters in [`adapters`] contribute only the payload projection.

use std::{sync::LazyLock, time::Duration};

/// Prelude is the common set of types for the engine and adapter modules.
pub(crate) mod prelude {
    pub use std::{
        collections::{BTreeMap, BTreeSet},
        sync::Arc,
    };

    pub use futures::prelude::*;
    pub use k8s_openapi::api::core;
    pub use kube::{
        self, Resource, ResourceExt,
        api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
        runtime::{
            reflector::{self, ObjectRef, Store},
            watcher,
        },
    };
    pub use tokio_util::sync::CancellationToken;
    pub use tracing::{debug, error, info, instrument, trace, warn};

    pub use crate::{CONTROLLER_NAME, CREATE_PARAMS, Context, Error, Result};
}

pub mod adapters;
pub mod annotations;
pub mod engine;
pub mod index;
pub mod liveness;
pub mod metrics;
pub mod namespaces;
pub mod patterns;

#[cfg(test)]
pub(crate) mod testing;

/// Error enumerates everything that can go wrong inside the controller.
///
/// The first few variants form the replication taxonomy; the `#[from]`
/// variants wrap infrastructure failures that are fatal at startup.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// NotPermitted means the source's permission annotations disallow the
    /// requested replication. The target is left untouched.
    #[error("replication not permitted: {0}")]
    NotPermitted(String),
    /// Parse means an annotation value was malformed. The annotation is
    /// skipped; other semantics on the same object proceed.
    #[error("annotation parse error: {0}")]
    Parse(String),
    /// Kube is a generic error from the `kube` crate. Conflict, NotFound and
    /// transient network failures all surface here; see [`Error::is_conflict`]
    /// and [`Error::is_not_found`].
    #[error("kube error: {0}")]
    Kube(#[from] kube::Error),
    /// KubeConfig indicates the provided kubeconfig could not be loaded.
    #[error("kubeconfig error: {0}")]
    KubeConfig(#[from] kube::config::KubeconfigError),
    /// InferConfig indicates the process was unable to find a kubeconfig.
    #[error("kubeconfig error: {0}")]
    InferConfig(#[from] kube::config::InferConfigError),
    /// TracingConfig indicates the error came from the tracing setup.
    #[error("tracing_subscriber error: {0}")]
    TracingConfig(#[from] tracing_subscriber::filter::ParseError),
    /// Tracing indicates the error came from installing the tracing subscriber.
    #[error("tracing error: {0}")]
    Tracing(#[from] tracing::subscriber::SetGlobalDefaultError),
    /// Io indicates some OS-level I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Json indicates a JSON serialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    /// JsonPatch indicates a JSON patch failed to apply.
    #[error("json patch error: {0}")]
    JsonPatch(#[from] json_patch::PatchError),
    /// AddrParse indicates the provided string failed to parse into an address.
    #[error("parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),
    /// Join indicates an error joining tasks.
    #[error("tokio error: {0}")]
    Join(#[from] tokio::task::JoinError),
    /// Metrics indicates the Prometheus recorder could not be installed.
    #[error("metrics exporter error: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),
    /// Other is a catch-all error.
    #[error("some other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Is_conflict reports whether this is an optimistic-concurrency loss on
    /// an update. The next watch event retries it.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 409)
    }

    /// Is_not_found reports whether the API server said the object is absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 404)
    }
}

/// Result typedef for the controller.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Context is the configuration shared by every per-kind replicator.
pub struct Context {
    /// Client is the k8s client. This should only ever be `clone()`'d out of
    /// the Context; it is safe for concurrent use.
    pub client: kube::Client,
    /// Allow_all disables the `replication-allowed` gate for pulls.
    pub allow_all: bool,
    /// Resync is the informer relist cadence and the sync-probe timeout.
    pub resync: Duration,
    /// Cluster_domain is the DNS suffix used for Service ExternalName
    /// projections, usually `cluster.local`.
    pub cluster_domain: String,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ctx")
    }
}

/// CREATE_PARAMS is the default post parameters.
pub static CREATE_PARAMS: LazyLock<kube::api::PostParams> =
    LazyLock::new(|| kube::api::PostParams {
        dry_run: false,
        field_manager: Some(String::from(CONTROLLER_NAME)),
    });

/// CONTROLLER_NAME is the name the controller uses whenever it needs a
/// human-readable name, including as the field manager on creates and
/// replaces.
pub const CONTROLLER_NAME: &str = "replicator";
