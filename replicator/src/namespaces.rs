//! Namespaces holds the process-wide namespace watcher.
//!
//! Every per-kind replicator needs the namespace set; a single shared watch
//! avoids N informers on the same resource. The first subscription starts the
//! watch task, later subscriptions only attach.

use std::collections::HashSet;
use std::sync::{Mutex, Once};

use k8s_openapi::api::core::v1::Namespace;
use kube::runtime::WatchStreamExt;
use kube::runtime::reflector::{reflector, store::Writer};
use tokio::sync::broadcast;

use crate::prelude::*;

/// NamespaceEvent is fanned out to subscribers.
///
/// Added fires once per namespace name first observed by this process,
/// including everything seen in the initial list. Updated fires for every
/// later change to an already-known namespace.
#[derive(Clone, Debug)]
pub enum NamespaceEvent {
    /// A namespace name was observed for the first time.
    Added(String),
    /// A known namespace changed (labels, usually).
    Updated(String),
}

/// NamespaceWatcher is the shared namespace informer.
pub struct NamespaceWatcher {
    client: kube::Client,
    cancel: CancellationToken,
    store: Store<Namespace>,
    writer: Mutex<Option<Writer<Namespace>>>,
    tx: broadcast::Sender<NamespaceEvent>,
    init: Once,
}

impl NamespaceWatcher {
    /// New prepares the watcher. Nothing runs until the first [`subscribe`].
    ///
    /// [`subscribe`]: NamespaceWatcher::subscribe
    pub fn new(client: kube::Client, cancel: CancellationToken) -> Arc<NamespaceWatcher> {
        let (store, writer) = reflector::store();
        let (tx, _) = broadcast::channel(256);
        Arc::new(NamespaceWatcher {
            client,
            cancel,
            store,
            writer: Mutex::new(Some(writer)),
            tx,
            init: Once::new(),
        })
    }

    /// Subscribe returns the shared namespace cache and a stream of
    /// [`NamespaceEvent`]s, starting the underlying watch on first use.
    ///
    /// Must be called from within the runtime. The broadcast never blocks on
    /// a slow subscriber: laggards observe a `Lagged` error and are expected
    /// to rely on their own resync for anything they missed.
    pub fn subscribe(&self) -> (Store<Namespace>, broadcast::Receiver<NamespaceEvent>) {
        // Receiver first, so the subscriber cannot miss events from the
        // initial list.
        let rx = self.tx.subscribe();
        self.init.call_once(|| {
            let writer = self
                .writer
                .lock()
                .expect("namespace watcher lock poisoned")
                .take()
                .expect("first init holds the writer");
            let client = self.client.clone();
            let cancel = self.cancel.clone();
            let tx = self.tx.clone();
            tokio::spawn(run(client, writer, tx, cancel));
        });
        (self.store.clone(), rx)
    }
}

async fn run(
    client: kube::Client,
    writer: Writer<Namespace>,
    tx: broadcast::Sender<NamespaceEvent>,
    cancel: CancellationToken,
) {
    let api: Api<Namespace> = Api::all(client);
    let stream = watcher(api, watcher::Config::default()).default_backoff();
    let mut events = reflector(writer, stream).boxed();
    let mut known: HashSet<String> = HashSet::new();

    info!("starting namespace watcher");
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            ev = events.next() => match ev {
                Some(Ok(ev)) => ev,
                Some(Err(err)) => {
                    warn!(error = %err, "namespace watch error");
                    continue;
                }
                None => break,
            },
        };
        match event {
            watcher::Event::Apply(ns) | watcher::Event::InitApply(ns) => {
                let name = ns.name_any();
                let ev = if known.insert(name.clone()) {
                    NamespaceEvent::Added(name)
                } else {
                    NamespaceEvent::Updated(name)
                };
                // Err just means nobody is listening right now.
                let _ = tx.send(ev);
            }
            watcher::Event::Delete(ns) => {
                known.remove(&ns.name_any());
            }
            watcher::Event::Init | watcher::Event::InitDone => {}
        }
    }
    debug!("namespace watcher finished");
}
