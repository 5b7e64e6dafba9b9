use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use kube::{
    api::{Api, ApiResource, DynamicObject},
    Client, Resource,
};
use kube_runtime::{watcher, WatchStreamExt};
use multitenancy_apis::GroupVersionResource;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{CollectionCore, CollectionRef, Fanout, Keyed, RegisterMsg};

/// Item stored by dynamic informers. Wraps the raw object to give it a key
/// and content-based equality, which `DynamicObject` itself does not
/// provide.
#[derive(Clone, Debug)]
pub(crate) struct Unstructured(Arc<DynamicObject>);

impl Unstructured {
    pub fn new(obj: DynamicObject) -> Self {
        Self(Arc::new(obj))
    }

    pub fn object(&self) -> &DynamicObject {
        &self.0
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.0
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(key))
            .map(String::as_str)
    }
}

impl std::ops::Deref for Unstructured {
    type Target = DynamicObject;

    fn deref(&self) -> &DynamicObject {
        &self.0
    }
}

impl PartialEq for Unstructured {
    fn eq(&self, other: &Self) -> bool {
        self.0.metadata == other.0.metadata && self.0.data == other.0.data
    }
}

impl Keyed for Unstructured {
    fn key(&self) -> String {
        let name = self.0.metadata.name.as_deref().unwrap_or_default();
        match self.0.metadata.namespace.as_deref() {
            Some(namespace) => format!("{}/{}", namespace, name),
            None => name.to_string(),
        }
    }
}

/// Wraps a watch on a cluster-scoped resource type into a collection. The
/// watcher performs an initial list and follows with incremental events;
/// on watch errors it re-lists with backoff, and the re-listed state is
/// diffed against the index so only actual differences are emitted.
pub(crate) fn informer<K>(client: &Client, stop: CancellationToken) -> CollectionRef<Arc<K>>
where
    K: Resource<DynamicType = ()>
        + Keyed
        + Clone
        + DeserializeOwned
        + Debug
        + PartialEq
        + Send
        + Sync
        + 'static,
{
    let (core, reg_rx) = CollectionCore::new(stop.clone());
    let api: Api<K> = Api::all(client.clone());
    let stream = watcher(api, watcher::Config::default()).default_backoff();
    tokio::spawn(run_informer(
        core.clone(),
        reg_rx,
        stream,
        stop,
        |obj: K| Arc::new(obj),
        |_: &Arc<K>| true,
    ));
    core
}

/// Starts an informer over an arbitrary GroupVersionResource, restricted to
/// objects carrying `label`. The label restriction is applied server-side
/// as an existence selector and re-checked client-side after re-lists.
pub(crate) fn dynamic_informer(
    client: &Client,
    gvr: &GroupVersionResource,
    label: &str,
    stop: CancellationToken,
) -> CollectionRef<Unstructured> {
    let ar = api_resource(gvr);
    let api: Api<DynamicObject> = Api::all_with(client.clone(), &ar);
    let config = watcher::Config::default().labels(label);
    let stream = watcher(api, config).default_backoff();
    let (core, reg_rx) = CollectionCore::new(stop.clone());
    let label = label.to_string();
    tokio::spawn(run_informer(
        core.clone(),
        reg_rx,
        stream,
        stop,
        Unstructured::new,
        move |item: &Unstructured| item.label(&label).is_some(),
    ));
    core
}

/// Builds an ApiResource from a GVR alone. Request paths only need the
/// plural; the kind cannot be recovered without discovery, so the plural
/// stands in for it.
pub(crate) fn api_resource(gvr: &GroupVersionResource) -> ApiResource {
    ApiResource {
        group: gvr.group.clone(),
        version: gvr.version.clone(),
        api_version: gvr.api_version(),
        kind: gvr.resource.clone(),
        plural: gvr.resource.clone(),
    }
}

async fn run_informer<K, T, S, W, A>(
    core: Arc<CollectionCore<T>>,
    mut reg_rx: mpsc::UnboundedReceiver<RegisterMsg<T>>,
    stream: S,
    stop: CancellationToken,
    wrap: W,
    accept: A,
) where
    K: Send + 'static,
    T: Keyed + Clone + PartialEq + Send + Sync + 'static,
    S: Stream<Item = Result<watcher::Event<K>, watcher::Error>> + Send + 'static,
    W: Fn(K) -> T + Send + 'static,
    A: Fn(&T) -> bool + Send + 'static,
{
    let mut stream = Box::pin(stream);
    let mut fanout = Fanout::new();
    // Buffer of the list in progress; Some between Init and InitDone.
    let mut relist: Option<HashMap<String, T>> = None;

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            Some(msg) = reg_rx.recv() => {
                let snapshot = core.snapshot();
                fanout.subscribe(msg, snapshot).await;
            }
            item = stream.next() => match item {
                Some(Ok(event)) => match event {
                    watcher::Event::Init => {
                        relist = Some(HashMap::new());
                    }
                    watcher::Event::InitApply(obj) => {
                        let item = wrap(obj);
                        if accept(&item) {
                            if let Some(buffer) = relist.as_mut() {
                                buffer.insert(item.key(), item);
                            }
                        }
                    }
                    watcher::Event::InitDone => {
                        if let Some(buffer) = relist.take() {
                            let mut events = Vec::new();
                            for existing in core.snapshot() {
                                let key = existing.key();
                                if !buffer.contains_key(&key) {
                                    if let Some(ev) = core.apply(&key, None) {
                                        events.push(ev);
                                    }
                                }
                            }
                            for (key, item) in buffer {
                                if let Some(ev) = core.apply(&key, Some(item)) {
                                    events.push(ev);
                                }
                            }
                            for ev in events {
                                fanout.deliver(ev).await;
                            }
                            core.mark_synced();
                        }
                    }
                    watcher::Event::Apply(obj) => {
                        let item = wrap(obj);
                        let key = item.key();
                        let ev = if accept(&item) {
                            core.apply(&key, Some(item))
                        } else {
                            core.apply(&key, None)
                        };
                        if let Some(ev) = ev {
                            fanout.deliver(ev).await;
                        }
                    }
                    watcher::Event::Delete(obj) => {
                        let item = wrap(obj);
                        if let Some(ev) = core.apply(&item.key(), None) {
                            fanout.deliver(ev).await;
                        }
                    }
                },
                Some(Err(err)) => {
                    // The watcher re-lists internally with backoff; the next
                    // Init restarts the buffer.
                    warn!("watch error: {}", err);
                }
                None => break,
            },
        }
    }
}
