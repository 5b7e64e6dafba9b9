//! Reactive keyed collections.
//!
//! A [`Collection`] is an observable set of items indexed by a stable key.
//! Root collections mirror cluster state through informers; derived
//! collections are produced by [`map`], [`flat_map`] and [`join`] and are
//! recomputed whenever their inputs change. Transformers declare reads of
//! other collections through [`fetch`], which records a dependency so the
//! transformer is re-invoked when the fetched items change.
//!
//! Every collection owns a worker task which serializes index mutation and
//! event fan-out, so handlers registered on a collection never observe
//! overlapping invocations. Workers shut down when their
//! [`CancellationToken`] fires; tokens created with `child_token` give a
//! tree of lifetimes along which shutdown cascades.

mod informer;
mod join;
mod static_collection;
mod transform;

pub(crate) use informer::{api_resource, dynamic_informer, informer, Unstructured};
pub(crate) use join::{join, JoinKind, Joined};
pub(crate) use static_collection::StaticCollection;
pub(crate) use transform::{fetch, flat_map, map, Context, Filter};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

/// Items stored in a collection are identified by a stable key, unique
/// within the collection. The key of an item never changes across updates.
pub(crate) trait Keyed {
    fn key(&self) -> String;
}

impl<T: Keyed> Keyed for Arc<T> {
    fn key(&self) -> String {
        self.as_ref().key()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum EventType {
    Add,
    Update,
    Delete,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventType::Add => write!(f, "add"),
            EventType::Update => write!(f, "update"),
            EventType::Delete => write!(f, "delete"),
        }
    }
}

/// A change notification delivered to handlers registered on a collection.
///
/// Add events carry only `new`, Delete events only `old`, Update events
/// carry both sides. Updates are only delivered when the new value differs
/// from the stored one; re-emitting an identical value is suppressed.
#[derive(Clone, Debug)]
pub(crate) struct Event<T> {
    pub event_type: EventType,
    pub old: Option<T>,
    pub new: Option<T>,
}

impl<T> Event<T> {
    /// The most recent value carried by this event: `new`, or `old` for
    /// Delete events.
    pub fn latest(&self) -> &T {
        self.new
            .as_ref()
            .or(self.old.as_ref())
            .expect("events carry at least one value")
    }
}

/// Handlers receive events one at a time; invocations on behalf of a single
/// collection never overlap. Handlers may perform I/O, at the cost of
/// throughput for the collection which invokes them.
pub(crate) type EventHandler<T> = Arc<dyn Fn(Event<T>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Handle returned by [`Collection::register`].
pub(crate) struct Registration {
    replayed: oneshot::Receiver<()>,
    synced: Synced,
}

impl Registration {
    /// Resolves once the collection has replayed its current contents to
    /// the newly registered handler. Resolves immediately when the
    /// collection has already stopped.
    pub async fn replayed(self) {
        let _ = self.replayed.await;
    }

    #[allow(dead_code)]
    pub fn synced(&self) -> Synced {
        self.synced.clone()
    }
}

/// Sync barrier of a collection. A collection is synced once its sources
/// have completed their initial pass and the derivations queued by that
/// pass have drained.
#[derive(Clone)]
pub(crate) struct Synced {
    rx: watch::Receiver<bool>,
}

impl Synced {
    pub fn is_synced(&self) -> bool {
        *self.rx.borrow()
    }

    /// Blocks until the collection is synced or `stop` fires; returns
    /// whether the initial pass completed.
    pub async fn wait(mut self, stop: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            _ = stop.cancelled() => false,
            res = self.rx.wait_for(|synced| *synced) => res.is_ok(),
        }
    }
}

/// A queryable, observable set of items indexed by key.
pub(crate) trait Collection<T>: Send + Sync
where
    T: Keyed + Clone + Send + Sync + 'static,
{
    /// Identity of this collection, used for dependency tracking.
    fn id(&self) -> u64;

    fn get(&self, key: &str) -> Option<T>;

    fn list(&self) -> Vec<T>;

    /// Registers `handler` with this collection. The current contents are
    /// replayed to the handler as Add events before any live events are
    /// delivered to it.
    fn register(&self, handler: EventHandler<T>) -> Registration;

    fn synced(&self) -> Synced;

    #[allow(dead_code)]
    fn stop_token(&self) -> CancellationToken;
}

pub(crate) type CollectionRef<T> = Arc<dyn Collection<T>>;

static NEXT_COLLECTION_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) struct RegisterMsg<T> {
    handler: EventHandler<T>,
    replayed: oneshot::Sender<()>,
}

/// State shared between a collection's worker task and its handles: the
/// key index, the sync barrier and the registration channel. Workers apply
/// changes through [`CollectionCore::apply`] and fan the returned events
/// out to handlers.
pub(crate) struct CollectionCore<T> {
    id: u64,
    items: RwLock<HashMap<String, T>>,
    synced_tx: watch::Sender<bool>,
    stop: CancellationToken,
    reg_tx: mpsc::UnboundedSender<RegisterMsg<T>>,
}

impl<T> CollectionCore<T>
where
    T: Keyed + Clone + PartialEq + Send + Sync + 'static,
{
    pub fn new(stop: CancellationToken) -> (Arc<Self>, mpsc::UnboundedReceiver<RegisterMsg<T>>) {
        let (reg_tx, reg_rx) = mpsc::unbounded_channel();
        let (synced_tx, _) = watch::channel(false);
        let core = Arc::new(Self {
            id: NEXT_COLLECTION_ID.fetch_add(1, Ordering::Relaxed),
            items: RwLock::new(HashMap::new()),
            synced_tx,
            stop,
            reg_tx,
        });
        (core, reg_rx)
    }

    pub fn mark_synced(&self) {
        self.synced_tx.send_replace(true);
    }

    /// Stores `value` under `key` (or removes the entry when `value` is
    /// None) and returns the event to fan out. Returns None when the change
    /// is a no-op: the value equals the stored one, or the key is already
    /// absent.
    pub fn apply(&self, key: &str, value: Option<T>) -> Option<Event<T>> {
        let mut items = self.items.write().unwrap();
        match value {
            Some(new) => match items.insert(key.to_string(), new.clone()) {
                None => Some(Event {
                    event_type: EventType::Add,
                    old: None,
                    new: Some(new),
                }),
                Some(old) if old == new => None,
                Some(old) => Some(Event {
                    event_type: EventType::Update,
                    old: Some(old),
                    new: Some(new),
                }),
            },
            None => items.remove(key).map(|old| Event {
                event_type: EventType::Delete,
                old: Some(old),
                new: None,
            }),
        }
    }

    /// Current contents, ordered by key.
    pub fn snapshot(&self) -> Vec<T> {
        let mut items: Vec<T> = self.items.read().unwrap().values().cloned().collect();
        items.sort_by_key(|item| item.key());
        items
    }
}

impl<T> Collection<T> for CollectionCore<T>
where
    T: Keyed + Clone + PartialEq + Send + Sync + 'static,
{
    fn id(&self) -> u64 {
        self.id
    }

    fn get(&self, key: &str) -> Option<T> {
        self.items.read().unwrap().get(key).cloned()
    }

    fn list(&self) -> Vec<T> {
        self.snapshot()
    }

    fn register(&self, handler: EventHandler<T>) -> Registration {
        let (tx, rx) = oneshot::channel();
        // When the worker is gone the handler is dropped and the
        // registration reports replayed immediately through channel closure.
        let _ = self.reg_tx.send(RegisterMsg {
            handler,
            replayed: tx,
        });
        Registration {
            replayed: rx,
            synced: self.synced(),
        }
    }

    fn synced(&self) -> Synced {
        Synced {
            rx: self.synced_tx.subscribe(),
        }
    }

    fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }
}

/// Worker-local handler list. Only the owning worker touches it, which
/// serializes every delivery made on behalf of the collection.
pub(crate) struct Fanout<T> {
    handlers: Vec<EventHandler<T>>,
}

impl<T: Clone> Fanout<T> {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Replays `snapshot` to the new handler, then adds it to the list.
    pub async fn subscribe(&mut self, msg: RegisterMsg<T>, snapshot: Vec<T>) {
        for item in snapshot {
            (msg.handler)(Event {
                event_type: EventType::Add,
                old: None,
                new: Some(item),
            })
            .await;
        }
        self.handlers.push(msg.handler);
        let _ = msg.replayed.send(());
    }

    pub async fn deliver(&self, ev: Event<T>) {
        for handler in &self.handlers {
            handler(ev.clone()).await;
        }
    }
}
