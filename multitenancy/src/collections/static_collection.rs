use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{
    Collection, CollectionCore, Event, EventHandler, Fanout, Keyed, RegisterMsg, Registration,
    Synced,
};

/// A collection fed imperatively through [`StaticCollection::update`] and
/// [`StaticCollection::delete`] rather than derived from other collections.
/// Used as a sink when a producer owns side-effectful resources, such as
/// the set of running dynamic informers.
///
/// Mutations are applied to the index synchronously, so a `get` immediately
/// after `update` observes the new value from any task; event delivery
/// happens on the collection's worker.
pub(crate) struct StaticCollection<T> {
    core: Arc<CollectionCore<T>>,
    events: mpsc::UnboundedSender<Event<T>>,
    write_order: Mutex<()>,
}

impl<T> StaticCollection<T>
where
    T: Keyed + Clone + PartialEq + Send + Sync + 'static,
{
    pub fn new(stop: CancellationToken) -> Arc<Self> {
        let (core, reg_rx) = CollectionCore::new(stop.clone());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(run(core.clone(), reg_rx, events_rx, stop));
        Arc::new(Self {
            core,
            events: events_tx,
            write_order: Mutex::new(()),
        })
    }

    /// Inserts or replaces `item`. Replacing an item with an equal value is
    /// a no-op.
    pub fn update(&self, item: T) {
        let _guard = self.write_order.lock().unwrap();
        if let Some(ev) = self.core.apply(&item.key(), Some(item)) {
            let _ = self.events.send(ev);
        }
    }

    /// Removes the item stored under `key`, if any.
    pub fn delete(&self, key: &str) {
        let _guard = self.write_order.lock().unwrap();
        if let Some(ev) = self.core.apply(key, None) {
            let _ = self.events.send(ev);
        }
    }
}

async fn run<T>(
    core: Arc<CollectionCore<T>>,
    mut reg_rx: mpsc::UnboundedReceiver<RegisterMsg<T>>,
    mut events_rx: mpsc::UnboundedReceiver<Event<T>>,
    stop: CancellationToken,
) where
    T: Keyed + Clone + PartialEq + Send + Sync + 'static,
{
    // Contents are imperative; there is no initial pass to wait for.
    core.mark_synced();
    let mut fanout = Fanout::new();
    // Replay for new handlers comes from the state as of the events
    // delivered so far, not the live index; mutations applied ahead of the
    // queue would otherwise reach a new handler twice.
    let mut delivered: HashMap<String, T> = HashMap::new();
    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            Some(ev) = events_rx.recv() => {
                match (&ev.new, &ev.old) {
                    (Some(new), _) => {
                        delivered.insert(new.key(), new.clone());
                    }
                    (None, Some(old)) => {
                        delivered.remove(&old.key());
                    }
                    (None, None) => {}
                }
                fanout.deliver(ev).await;
            }
            Some(msg) = reg_rx.recv() => {
                let mut snapshot: Vec<T> = delivered.values().cloned().collect();
                snapshot.sort_by_key(|item| item.key());
                fanout.subscribe(msg, snapshot).await;
            }
        }
    }
}

impl<T> Collection<T> for StaticCollection<T>
where
    T: Keyed + Clone + PartialEq + Send + Sync + 'static,
{
    fn id(&self) -> u64 {
        self.core.id()
    }

    fn get(&self, key: &str) -> Option<T> {
        self.core.get(key)
    }

    fn list(&self) -> Vec<T> {
        self.core.list()
    }

    fn register(&self, handler: EventHandler<T>) -> Registration {
        self.core.register(handler)
    }

    fn synced(&self) -> Synced {
        self.core.synced()
    }

    fn stop_token(&self) -> CancellationToken {
        self.core.stop_token()
    }
}
