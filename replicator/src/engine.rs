//! Engine holds the generic replicator driving one object kind.
//!
//! One [`Replicator`] instance runs per activated kind. Everything
//! kind-specific lives behind the [`Replicate`] adapter trait; the engine
//! itself only knows about annotations, namespaces and the dependency index.

use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::jiff::Timestamp;
use kube::runtime::WatchStreamExt;
use kube::runtime::reflector::{reflector, store::Writer};
use tokio::sync::broadcast;

use crate::adapters::{Replicate, remove_op};
use crate::annotations::{
    self, KEEP_OWNER_REFERENCES, REPLICATE_FROM, REPLICATE_TO, REPLICATE_TO_MATCHING,
    REPLICATED_AT, REPLICATED_FROM_VERSION, REPLICATED_KEYS, REPLICATION_ALLOWED,
    REPLICATION_ALLOWED_NAMESPACES, STRIP_LABELS,
};
use crate::index::DependencyIndex;
use crate::liveness::SyncProbe;
use crate::metrics::{self, Operation};
use crate::namespaces::NamespaceEvent;
use crate::patterns::{LabelSelector, NamespaceFilter};
use crate::prelude::*;

/// Replicator watches one kind and converges the cluster on its replication
/// annotations.
///
/// All state — the informer cache, the dependency index, the push-source set
/// — is touched only from the single event-loop task in [`run`], so none of
/// it is locked.
///
/// [`run`]: Replicator::run
pub struct Replicator<K: Replicate> {
    ctx: Arc<Context>,
    cancel: CancellationToken,
    store: Store<K>,
    writer: Option<Writer<K>>,
    ns_store: Store<Namespace>,
    ns_events: Option<broadcast::Receiver<NamespaceEvent>>,
    probe: Option<SyncProbe>,
    deps: DependencyIndex,
    synced: bool,
}

impl<K: Replicate> Replicator<K> {
    /// New wires a replicator up to the shared namespace watcher and the
    /// liveness aggregate. Nothing runs until [`run`].
    ///
    /// [`run`]: Replicator::run
    pub fn new(
        ctx: Arc<Context>,
        ns_store: Store<Namespace>,
        ns_events: broadcast::Receiver<NamespaceEvent>,
        probe: SyncProbe,
        cancel: CancellationToken,
    ) -> Replicator<K> {
        let (store, writer) = reflector::store();
        Replicator {
            ctx,
            cancel,
            store,
            writer: Some(writer),
            ns_store,
            ns_events: Some(ns_events),
            probe: Some(probe),
            deps: DependencyIndex::default(),
            synced: false,
        }
    }

    /// Run drives the informer until cancellation. The returned error is
    /// fatal; everything recoverable is logged and swallowed here.
    pub async fn run(mut self) -> Result<()> {
        let kind = K::kind(&()).to_string();
        let api: Api<K> = Api::all(self.ctx.client.clone());
        let writer = self.writer.take().expect("run is called once");
        let mut ns_events = self.ns_events.take().expect("run is called once");
        let mut probe = self.probe.take().expect("run is called once");
        let cancel = self.cancel.clone();

        let stream = watcher(api, watcher::Config::default()).default_backoff();
        let mut events = reflector(writer, stream).boxed();
        let mut resync = tokio::time::interval(self.ctx.resync);
        // The interval fires immediately; the initial list stands in for
        // that first resync.
        resync.tick().await;

        info!(kind, "starting replicator");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(reply) = probe.recv() => {
                    let _ = reply.send(self.synced);
                }
                _ = resync.tick() => {
                    debug!(kind, "resync");
                    self.replay_cache().await;
                }
                ns = ns_events.recv() => match ns {
                    Ok(NamespaceEvent::Added(name)) => self.on_namespace_added(&name).await,
                    Ok(NamespaceEvent::Updated(_)) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(kind, missed, "namespace events lagged, waiting for resync");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!(kind, "namespace watcher went away");
                        break;
                    }
                },
                ev = events.next() => match ev {
                    Some(Ok(event)) => self.handle(event).await,
                    Some(Err(err)) => warn!(kind, error = %err, "watch error"),
                    None => break,
                },
            }
        }
        debug!(kind, "replicator finished");
        Ok(())
    }

    async fn handle(&mut self, event: watcher::Event<K>) {
        match event {
            watcher::Event::Init => {}
            // The reflector swaps the relisted world into the store at
            // InitDone; handlers then run against the complete cache instead
            // of a half-filled buffer.
            watcher::Event::InitApply(_) => {}
            watcher::Event::InitDone => {
                self.synced = true;
                self.replay_cache().await;
            }
            watcher::Event::Apply(obj) => self.on_applied(&obj).await,
            watcher::Event::Delete(obj) => self.on_deleted(&obj).await,
        }
    }

    async fn replay_cache(&mut self) {
        for obj in self.store.state() {
            self.on_applied(obj.as_ref()).await;
        }
    }

    /// On_applied handles adds and updates; an update is treated as an add of
    /// the new object.
    #[instrument(skip_all, fields(kind = %K::kind(&()), key = %object_key(obj)))]
    async fn on_applied(&mut self, obj: &K) {
        let key = object_key(obj);
        let namespace = obj.namespace().unwrap_or_default();

        // Keep pull followers of this object fresh.
        if let Some(followers) = self.deps.followers_of(&key).cloned() {
            for follower in followers {
                let Some(dep) = self.lookup(&follower) else {
                    continue;
                };
                if let Err(err) = self.replicate_data_from(obj, dep.as_ref()).await {
                    log_outcome(&err, &key, &follower, "refresh");
                }
            }
        }

        // This object pulls from somewhere.
        if let Some(value) = annotations::get(obj, &REPLICATE_FROM) {
            match annotations::parse_source_ref(value, &namespace) {
                Err(err) => warn!(error = %err, "unusable replicate-from annotation"),
                Ok((source_ns, source_name)) if format!("{source_ns}/{source_name}") == key => {
                    // Every write bumps the resourceVersion, so a
                    // self-reference would chase its own tail forever.
                    warn!("object names itself as its source, ignoring");
                    self.deps.clear_pull(&key);
                }
                Ok((source_ns, source_name)) => {
                    let source_key = format!("{source_ns}/{source_name}");
                    self.deps.record_pull(&key, &source_key);
                    match self.lookup(&source_key) {
                        // The source may appear later; the dependents refresh
                        // covers this object at that moment.
                        None => debug!(source = source_key, "pull source not in cache"),
                        Some(source) => {
                            if let Err(err) =
                                self.replicate_data_from(source.as_ref(), obj).await
                            {
                                log_outcome(&err, &source_key, &key, "pull");
                            }
                        }
                    }
                }
            }
        } else {
            self.deps.clear_pull(&key);
        }

        // This object pushes somewhere. Pull and push roles are independent,
        // so an object can do both.
        let to = annotations::get(obj, &REPLICATE_TO).map(String::from);
        let matching = annotations::get(obj, &REPLICATE_TO_MATCHING).map(String::from);
        if to.is_some() || matching.is_some() {
            self.deps.mark_push_source(&key);
            self.push_everywhere(obj, to.as_deref(), matching.as_deref())
                .await;
        } else {
            self.deps.unmark_push_source(&key);
        }
    }

    /// On_deleted cascades a deletion into the object's replicas.
    #[instrument(skip_all, fields(kind = %K::kind(&()), key = %object_key(obj)))]
    async fn on_deleted(&mut self, obj: &K) {
        let key = object_key(obj);

        // Detach pull followers: blank the payload, keep the shell.
        for follower in self.deps.remove_source(&key) {
            let Some(dep) = self.lookup(&follower) else {
                continue;
            };
            if let Err(err) = self.patch_delete_dependent(dep.as_ref()).await {
                log_outcome(&err, &key, &follower, "detach");
            }
        }
        // The deleted object may itself have been a follower.
        self.deps.clear_pull(&key);

        // Tear down push replicas.
        if self.deps.unmark_push_source(&key) {
            let to = annotations::get(obj, &REPLICATE_TO).map(String::from);
            let matching = annotations::get(obj, &REPLICATE_TO_MATCHING).map(String::from);
            self.teardown_replicas(obj, to.as_deref(), matching.as_deref())
                .await;
        }
    }

    /// On_namespace_added replays every known push source against a namespace
    /// this process has not seen before.
    #[instrument(skip_all, fields(kind = %K::kind(&()), namespace = ns_name))]
    async fn on_namespace_added(&mut self, ns_name: &str) {
        if !self.deps.has_push_sources() {
            return;
        }
        let Some(ns) = self.ns_store.get(&ObjectRef::new(ns_name)) else {
            return;
        };
        let sources: Vec<String> = self.deps.push_sources().cloned().collect();
        for key in sources {
            let Some(source) = self.lookup(&key) else {
                continue;
            };
            let source = source.as_ref();
            if source.namespace().unwrap_or_default() == ns_name {
                continue;
            }
            // Re-read the annotations; the source may have shed its push role
            // since it was indexed.
            let to = annotations::get(source, &REPLICATE_TO);
            let matching = annotations::get(source, &REPLICATE_TO_MATCHING);
            let matched = to
                .map(NamespaceFilter::compile)
                .is_some_and(|f| f.matches(ns_name))
                || matching
                    .and_then(|m| LabelSelector::parse(m).ok())
                    .is_some_and(|s| s.matches(ns.labels()));
            if !matched {
                continue;
            }
            if let Err(err) = self.replicate_object_to(source, ns_name).await {
                log_outcome(
                    &err,
                    &key,
                    &format!("{ns_name}/{}", source.name_any()),
                    "push",
                );
            }
        }
    }

    /// Push_everywhere replicates `obj` into every namespace its push
    /// annotations match. Failures are logged per namespace; the loop never
    /// aborts early.
    async fn push_everywhere(&self, obj: &K, to: Option<&str>, matching: Option<&str>) {
        let key = object_key(obj);
        let own_ns = obj.namespace().unwrap_or_default();
        let filter = to.map(NamespaceFilter::compile);
        let selector = match matching.map(LabelSelector::parse).transpose() {
            Ok(sel) => sel,
            Err(err) => {
                warn!(error = %err, "unusable replicate-to-matching annotation");
                None
            }
        };
        if filter.is_none() && selector.is_none() {
            return;
        }

        let namespaces = match self.list_namespaces().await {
            Ok(list) => list,
            Err(err) => {
                warn!(error = %err, "cannot list namespaces");
                return;
            }
        };
        for ns in &namespaces {
            let ns_name = ns.name_any();
            if ns_name == own_ns {
                continue;
            }
            let matched = filter.as_ref().is_some_and(|f| f.matches(&ns_name))
                || selector.as_ref().is_some_and(|s| s.matches(ns.labels()));
            if !matched {
                continue;
            }
            if let Err(err) = self.replicate_object_to(obj, &ns_name).await {
                log_outcome(&err, &key, &format!("{ns_name}/{}", obj.name_any()), "push");
            }
        }
    }

    /// Teardown_replicas recomputes the match set a deleted source last
    /// produced and removes the replica in each matched namespace.
    async fn teardown_replicas(&self, obj: &K, to: Option<&str>, matching: Option<&str>) {
        let key = object_key(obj);
        let own_ns = obj.namespace().unwrap_or_default();
        let name = obj.name_any();
        let filter = to.map(NamespaceFilter::compile);
        let selector = matching.and_then(|m| LabelSelector::parse(m).ok());
        if filter.is_none() && selector.is_none() {
            return;
        }
        let namespaces = match self.list_namespaces().await {
            Ok(list) => list,
            Err(err) => {
                warn!(error = %err, "cannot list namespaces");
                return;
            }
        };
        for ns in &namespaces {
            let ns_name = ns.name_any();
            if ns_name == own_ns {
                continue;
            }
            let matched = filter.as_ref().is_some_and(|f| f.matches(&ns_name))
                || selector.as_ref().is_some_and(|s| s.matches(ns.labels()));
            if !matched {
                continue;
            }
            let Some(child) = self.lookup(&format!("{ns_name}/{name}")) else {
                continue;
            };
            if let Err(err) = self.delete_replicated_resource(child.as_ref()).await {
                log_outcome(&err, &key, &format!("{ns_name}/{name}"), "teardown");
            }
        }
    }

    /// Replicate_data_from overwrites `target`'s payload from `source` after
    /// the permission and idempotence checks pass.
    async fn replicate_data_from(&self, source: &K, target: &K) -> Result<()> {
        let namespace = target.namespace().unwrap_or_default();
        self.check_permitted(source, &namespace)?;
        let source_version = source.resource_version().unwrap_or_default();
        if annotations::get(target, &REPLICATED_FROM_VERSION) == Some(source_version.as_str()) {
            trace!(target = %object_key(target), "target is current");
            return Ok(());
        }
        let name = target.name_any();
        let mut updated = target.clone();
        let keys = K::copy_payload(source, &mut updated, &self.ctx);
        stamp(updated.meta_mut(), &source_version, keys);
        let api: Api<K> = Api::namespaced(self.ctx.client.clone(), &namespace);
        api.replace(&name, &CREATE_PARAMS, &updated).await?;
        metrics::record(&K::kind(&()), &namespace, &name, Operation::Update);
        info!(source = %object_key(source), target = %object_key(target), "replicated data");
        Ok(())
    }

    /// Replicate_object_to creates or refreshes the replica of `source` in
    /// `namespace`.
    async fn replicate_object_to(&self, source: &K, namespace: &str) -> Result<()> {
        let name = source.name_any();
        let source_version = source.resource_version().unwrap_or_default();
        let api: Api<K> = Api::namespaced(self.ctx.client.clone(), namespace);
        let existing = api.get_opt(&name).await?;
        if let Some(cur) = &existing {
            if annotations::get(cur, &REPLICATED_FROM_VERSION) == Some(source_version.as_str()) {
                trace!(namespace, name, "replica is current");
                return Ok(());
            }
        }
        let is_create = existing.is_none();
        if is_create {
            K::before_push(source, &self.ctx, namespace).await?;
        }
        let mut child = existing.unwrap_or_default();
        {
            let meta = child.meta_mut();
            meta.name = Some(name.clone());
            meta.namespace = Some(namespace.to_string());
            meta.labels = if annotations::truthy(annotations::get(source, &STRIP_LABELS)) {
                None
            } else {
                let labels = source.labels();
                (!labels.is_empty()).then(|| labels.clone())
            };
            meta.owner_references =
                if annotations::truthy(annotations::get(source, &KEEP_OWNER_REFERENCES)) {
                    let orefs = source.owner_references();
                    (!orefs.is_empty()).then(|| orefs.to_vec())
                } else {
                    None
                };
        }
        let keys = K::copy_payload(source, &mut child, &self.ctx);
        stamp(child.meta_mut(), &source_version, keys);
        if is_create {
            child.meta_mut().resource_version = None;
            api.create(&CREATE_PARAMS, &child).await?;
            metrics::record(&K::kind(&()), namespace, &name, Operation::Create);
            info!(source = %object_key(source), namespace, name, "created replica");
        } else {
            api.replace(&name, &CREATE_PARAMS, &child).await?;
            metrics::record(&K::kind(&()), namespace, &name, Operation::Update);
            info!(source = %object_key(source), namespace, name, "updated replica");
        }
        Ok(())
    }

    /// Patch_delete_dependent blanks the payload a pull target received from
    /// its now-gone source, leaving the operator's shell in place.
    async fn patch_delete_dependent(&self, target: &K) -> Result<()> {
        let namespace = target.namespace().unwrap_or_default();
        let name = target.name_any();
        let mut ops = K::clear_payload(target);
        for ann in [&*REPLICATED_AT, &*REPLICATED_FROM_VERSION, &*REPLICATED_KEYS] {
            if target.annotations().contains_key(ann.as_str()) {
                ops.push(remove_op(["metadata", "annotations", ann.as_str()]));
            }
        }
        if ops.is_empty() {
            return Ok(());
        }
        let api: Api<K> = Api::namespaced(self.ctx.client.clone(), &namespace);
        api.patch(
            &name,
            &PatchParams::default(),
            &Patch::Json::<()>(json_patch::Patch(ops)),
        )
        .await?;
        metrics::record(&K::kind(&()), &namespace, &name, Operation::Patch);
        info!(target = %object_key(target), "cleared detached target");
        Ok(())
    }

    /// Delete_replicated_resource removes a push replica. A Secret/ConfigMap
    /// replica carrying operator-added keys is patched down to just those
    /// instead of deleted.
    async fn delete_replicated_resource(&self, target: &K) -> Result<()> {
        let namespace = target.namespace().unwrap_or_default();
        let name = target.name_any();
        let api: Api<K> = Api::namespaced(self.ctx.client.clone(), &namespace);

        let listed = annotations::get(target, &REPLICATED_KEYS).map(annotations::replicated_key_set);
        if let (Some(current), Some(listed)) = (K::key_set(target), listed) {
            if current != listed {
                let keys: Vec<String> = listed.into_iter().collect();
                let mut ops = K::remove_keys(target, &keys).unwrap_or_default();
                ops.push(remove_op([
                    "metadata",
                    "annotations",
                    REPLICATED_KEYS.as_str(),
                ]));
                api.patch(
                    &name,
                    &PatchParams::default(),
                    &Patch::Json::<()>(json_patch::Patch(ops)),
                )
                .await?;
                metrics::record(&K::kind(&()), &namespace, &name, Operation::Patch);
                info!(target = %object_key(target), "removed replicated keys");
                return Ok(());
            }
        }
        match api.delete(&name, &DeleteParams::default()).await {
            Ok(_) => {
                metrics::record(&K::kind(&()), &namespace, &name, Operation::Delete);
                info!(target = %object_key(target), "deleted replica");
            }
            Err(err) => {
                let err = Error::from(err);
                if !err.is_not_found() {
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Check_permitted enforces the pull permission annotations.
    fn check_permitted(&self, source: &K, target_namespace: &str) -> Result<()> {
        if self.ctx.allow_all {
            return Ok(());
        }
        let key = object_key(source);
        if !annotations::truthy(annotations::get(source, &REPLICATION_ALLOWED)) {
            return Err(Error::NotPermitted(format!(
                "source {key} does not allow replication"
            )));
        }
        let Some(allowed) = annotations::get(source, &REPLICATION_ALLOWED_NAMESPACES) else {
            return Err(Error::NotPermitted(format!(
                "source {key} names no allowed namespaces"
            )));
        };
        if !NamespaceFilter::compile(allowed).matches(target_namespace) {
            return Err(Error::NotPermitted(format!(
                "source {key} does not allow namespace {target_namespace:?}"
            )));
        }
        Ok(())
    }

    async fn list_namespaces(&self) -> Result<Vec<Namespace>> {
        let api: Api<Namespace> = Api::all(self.ctx.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    fn lookup(&self, key: &str) -> Option<Arc<K>> {
        let (ns, name) = key.split_once('/')?;
        self.store.get(&ObjectRef::new(name).within(ns))
    }
}

/// Object_key renders the `"namespace/name"` key of an object.
fn object_key<K: ResourceExt>(obj: &K) -> String {
    format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any())
}

/// Stamp writes the standard annotations onto a replica.
fn stamp(meta: &mut ObjectMeta, source_version: &str, keys: Option<Vec<String>>) {
    let ann = meta.annotations.get_or_insert_default();
    ann.insert(REPLICATED_AT.clone(), Timestamp::now().to_string());
    ann.insert(REPLICATED_FROM_VERSION.clone(), source_version.to_string());
    if let Some(keys) = keys {
        ann.insert(REPLICATED_KEYS.clone(), keys.join(","));
    }
}

/// Log_outcome maps the error taxonomy onto log levels at the event-handler
/// boundary; nothing here is retried beyond what the informer does naturally.
fn log_outcome(err: &Error, source: &str, target: &str, what: &str) {
    match err {
        Error::NotPermitted(_) => info!(source, target, %err, "skipped {what}"),
        Error::Parse(_) => warn!(source, target, %err, "skipped {what}"),
        _ if err.is_conflict() => {
            debug!(source, target, %err, "conflict during {what}, the next event retries")
        }
        _ if err.is_not_found() => debug!(source, target, %err, "object vanished during {what}"),
        _ => warn!(source, target, %err, "{what} failed"),
    }
}

#[cfg(test)]
impl<K: Replicate> Replicator<K> {
    /// Seed swaps `objs` into the informer cache, as a completed relist
    /// would.
    pub(crate) fn seed(&mut self, objs: Vec<K>) {
        let writer = self.writer.as_mut().expect("not running");
        writer.apply_watcher_event(&watcher::Event::Init);
        for obj in objs {
            writer.apply_watcher_event(&watcher::Event::InitApply(obj));
        }
        writer.apply_watcher_event(&watcher::Event::InitDone);
        self.synced = true;
    }
}
