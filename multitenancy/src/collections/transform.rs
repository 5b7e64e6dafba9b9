use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{
    Collection, CollectionCore, CollectionRef, Event, EventType, Fanout, Keyed, RegisterMsg,
};

/// A filter restricts the result set of a [`fetch`]. Filters are decidable
/// from an item's key alone, which lets the dependency index decide which
/// inputs to re-run when an upstream item changes.
#[derive(Clone, Debug)]
pub(crate) struct Filter {
    names: BTreeSet<String>,
}

impl Filter {
    /// Matches items whose key is one of `names`.
    pub fn match_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    fn matches_key(&self, key: &str) -> bool {
        self.names.contains(key)
    }
}

/// Scratch state handed to transformers; the sole means by which a
/// transformer may read from other collections.
pub(crate) struct Context {
    requests: Vec<DepRequest>,
}

impl Context {
    fn new() -> Self {
        Self {
            requests: Vec::new(),
        }
    }
}

struct DepRequest {
    collection_id: u64,
    filter: Filter,
    subscribe: Box<dyn FnOnce(mpsc::UnboundedSender<DepTrigger>) + Send>,
}

struct DepTrigger {
    collection_id: u64,
    key: String,
}

/// Queries `collection` from inside a transformer and records a dependency
/// edge: whenever an item matching `filter` changes, the transformer is
/// re-invoked for the input which performed this fetch. Results are ordered
/// by key.
pub(crate) fn fetch<T>(ctx: &mut Context, collection: &CollectionRef<T>, filter: Filter) -> Vec<T>
where
    T: Keyed + Clone + Send + Sync + 'static,
{
    let mut items: Vec<T> = collection
        .list()
        .into_iter()
        .filter(|item| filter.matches_key(&item.key()))
        .collect();
    items.sort_by_key(|item| item.key());

    let id = collection.id();
    let coll = collection.clone();
    ctx.requests.push(DepRequest {
        collection_id: id,
        filter,
        subscribe: Box::new(move |tx| {
            coll.register(Arc::new(move |ev: Event<T>| {
                let _ = tx.send(DepTrigger {
                    collection_id: id,
                    key: ev.latest().key(),
                });
                futures::future::ready(()).boxed()
            }));
        }),
    });
    items
}

/// Derives a collection by applying `f` to every item of `source`,
/// one-to-optional. Items for which `f` returns None are omitted.
pub(crate) fn map<I, O, F>(
    source: CollectionRef<I>,
    f: F,
    stop: CancellationToken,
) -> CollectionRef<O>
where
    I: Keyed + Clone + Send + Sync + 'static,
    O: Keyed + Clone + PartialEq + Send + Sync + 'static,
    F: Fn(&mut Context, &I) -> Option<O> + Send + Sync + 'static,
{
    flat_map(
        source,
        move |ctx, item| f(ctx, item).into_iter().collect(),
        stop,
    )
}

/// Derives a collection by applying `f` to every item of `source`,
/// one-to-many. When an upstream event arrives the transformer is re-run
/// for the affected inputs and its output is diffed against the previous
/// output for the same input, producing the minimal set of downstream
/// events.
pub(crate) fn flat_map<I, O, F>(
    source: CollectionRef<I>,
    f: F,
    stop: CancellationToken,
) -> CollectionRef<O>
where
    I: Keyed + Clone + Send + Sync + 'static,
    O: Keyed + Clone + PartialEq + Send + Sync + 'static,
    F: Fn(&mut Context, &I) -> Vec<O> + Send + Sync + 'static,
{
    let (core, reg_rx) = CollectionCore::new(stop.clone());
    let (dep_tx, dep_rx) = mpsc::unbounded_channel();
    let worker = TransformWorker {
        core: core.clone(),
        source,
        transform: Box::new(f),
        fanout: Fanout::new(),
        outputs: HashMap::new(),
        owners: HashMap::new(),
        deps: HashMap::new(),
        registered: HashSet::new(),
        dep_tx,
    };
    tokio::spawn(worker.run(reg_rx, dep_rx, stop));
    core
}

struct TransformWorker<I, O> {
    core: Arc<CollectionCore<O>>,
    source: CollectionRef<I>,
    transform: Box<dyn Fn(&mut Context, &I) -> Vec<O> + Send + Sync>,
    fanout: Fanout<O>,
    /// Output keys previously emitted per input key; drives removal of
    /// outputs which a re-run no longer produces.
    outputs: HashMap<String, HashSet<String>>,
    /// Input keys contributing each output key. Distinct inputs may emit
    /// the same output (several tenant namespaces referencing one GVR); an
    /// output is removed only when its last contributor stops emitting it.
    owners: HashMap<String, HashSet<String>>,
    /// Dependencies recorded by the latest run per input key.
    deps: HashMap<String, Vec<(u64, Filter)>>,
    /// Collections we already subscribed to for dependency triggers.
    registered: HashSet<u64>,
    dep_tx: mpsc::UnboundedSender<DepTrigger>,
}

impl<I, O> TransformWorker<I, O>
where
    I: Keyed + Clone + Send + Sync + 'static,
    O: Keyed + Clone + PartialEq + Send + Sync + 'static,
{
    async fn run(
        mut self,
        mut reg_rx: mpsc::UnboundedReceiver<RegisterMsg<O>>,
        mut dep_rx: mpsc::UnboundedReceiver<DepTrigger>,
        stop: CancellationToken,
    ) {
        let (src_tx, mut src_rx) = mpsc::unbounded_channel::<Event<I>>();
        let registration = self.source.register(Arc::new(move |ev| {
            let _ = src_tx.send(ev);
            futures::future::ready(()).boxed()
        }));
        tokio::select! {
            biased;
            _ = stop.cancelled() => return,
            _ = registration.replayed() => {}
        }
        if !self.source.synced().wait(&stop).await {
            return;
        }
        // The source completed its initial pass; everything it produced is
        // queued by now. Drain it, then declare this collection synced.
        while let Ok(ev) = src_rx.try_recv() {
            self.on_source(ev).await;
        }
        self.core.mark_synced();

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                Some(ev) = src_rx.recv() => self.on_source(ev).await,
                Some(trigger) = dep_rx.recv() => self.on_trigger(trigger).await,
                Some(msg) = reg_rx.recv() => {
                    let snapshot = self.core.snapshot();
                    self.fanout.subscribe(msg, snapshot).await;
                }
            }
        }
    }

    async fn on_source(&mut self, ev: Event<I>) {
        let input_key = ev.latest().key();
        match ev.event_type {
            EventType::Delete => self.clear_input(&input_key).await,
            EventType::Add | EventType::Update => {
                if let Some(input) = &ev.new {
                    self.run_input(&input_key, input).await;
                }
            }
        }
    }

    /// Runs the transformer for one input and emits the difference against
    /// the previously emitted outputs of the same input.
    async fn run_input(&mut self, input_key: &str, input: &I) {
        let mut ctx = Context::new();
        let outs = (self.transform)(&mut ctx, input);

        let mut dep_list = Vec::with_capacity(ctx.requests.len());
        for req in ctx.requests {
            dep_list.push((req.collection_id, req.filter));
            if self.registered.insert(req.collection_id) {
                (req.subscribe)(self.dep_tx.clone());
            }
        }
        self.deps.insert(input_key.to_string(), dep_list);

        let mut new_keys = HashSet::with_capacity(outs.len());
        let mut events = Vec::new();
        for out in outs {
            let key = out.key();
            new_keys.insert(key.clone());
            self.owners
                .entry(key.clone())
                .or_default()
                .insert(input_key.to_string());
            if let Some(ev) = self.core.apply(&key, Some(out)) {
                events.push(ev);
            }
        }
        if let Some(old_keys) = self.outputs.insert(input_key.to_string(), new_keys.clone()) {
            for stale in old_keys.difference(&new_keys) {
                if let Some(ev) = self.release(input_key, stale) {
                    events.push(ev);
                }
            }
        }
        for ev in events {
            self.fanout.deliver(ev).await;
        }
    }

    async fn clear_input(&mut self, input_key: &str) {
        self.deps.remove(input_key);
        if let Some(old_keys) = self.outputs.remove(input_key) {
            for key in old_keys {
                if let Some(ev) = self.release(input_key, &key) {
                    self.fanout.deliver(ev).await;
                }
            }
        }
    }

    /// Drops `input_key`'s claim on an output, removing the output only
    /// when no other input still emits it.
    fn release(&mut self, input_key: &str, output_key: &str) -> Option<Event<O>> {
        if let Some(owners) = self.owners.get_mut(output_key) {
            owners.remove(input_key);
            if !owners.is_empty() {
                return None;
            }
            self.owners.remove(output_key);
        }
        self.core.apply(output_key, None)
    }

    /// An item matching a recorded dependency changed; re-run the
    /// transformer for every input which fetched it.
    async fn on_trigger(&mut self, trigger: DepTrigger) {
        let affected: Vec<String> = self
            .deps
            .iter()
            .filter(|(_, deps)| {
                deps.iter()
                    .any(|(id, f)| *id == trigger.collection_id && f.matches_key(&trigger.key))
            })
            .map(|(input_key, _)| input_key.clone())
            .collect();
        for input_key in affected {
            if let Some(input) = self.source.get(&input_key) {
                self.run_input(&input_key, &input).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{eventually, item, recording, Item};
    use super::super::StaticCollection;
    use super::*;

    #[tokio::test]
    async fn flat_map_follows_source() {
        let stop = CancellationToken::new();
        let source = StaticCollection::<Item>::new(stop.child_token());
        let derived = flat_map(
            source.clone() as CollectionRef<Item>,
            |_ctx, item: &Item| {
                vec![Item {
                    name: format!("{}-out", item.name),
                    value: item.value * 2,
                }]
            },
            stop.child_token(),
        );

        source.update(item("a", 1));
        eventually("derived add", || {
            derived.get("a-out") == Some(item("a-out", 2))
        })
        .await;

        source.update(item("a", 3));
        eventually("derived update", || {
            derived.get("a-out") == Some(item("a-out", 6))
        })
        .await;

        source.delete("a");
        eventually("derived delete", || derived.get("a-out").is_none()).await;
        stop.cancel();
    }

    #[tokio::test]
    async fn flat_map_emits_minimal_diff() {
        let stop = CancellationToken::new();
        let source = StaticCollection::<Item>::new(stop.child_token());
        source.update(item("a", 1));
        let derived = flat_map(
            source.clone() as CollectionRef<Item>,
            |_ctx, item: &Item| {
                // value encodes how many outputs to produce.
                (0..item.value)
                    .map(|i| Item {
                        name: format!("{}-{}", item.name, i),
                        value: i,
                    })
                    .collect()
            },
            stop.child_token(),
        );
        let (handler, events) = recording();
        derived.register(handler);

        eventually("initial output", || derived.get("a-0").is_some()).await;

        // Growing the output emits one Add; the existing output is not
        // re-announced because its value did not change.
        source.update(item("a", 2));
        eventually("second output", || derived.get("a-1").is_some()).await;

        // Shrinking the output deletes only the stale key.
        source.update(item("a", 1));
        eventually("stale output removed", || derived.get("a-1").is_none()).await;

        let events = events.lock().unwrap();
        let for_a0: Vec<EventType> = events
            .iter()
            .filter(|ev| ev.latest().name == "a-0")
            .map(|ev| ev.event_type)
            .collect();
        assert_eq!(vec![EventType::Add], for_a0);
        let for_a1: Vec<EventType> = events
            .iter()
            .filter(|ev| ev.latest().name == "a-1")
            .map(|ev| ev.event_type)
            .collect();
        assert_eq!(vec![EventType::Add, EventType::Delete], for_a1);
        stop.cancel();
    }

    #[tokio::test]
    async fn fetch_establishes_dependency() {
        let stop = CancellationToken::new();
        let source = StaticCollection::<Item>::new(stop.child_token());
        let looked_up = StaticCollection::<Item>::new(stop.child_token());
        let looked_up_ref: CollectionRef<Item> = looked_up.clone();

        // Output copies the value of the fetched item named after the input.
        let derived = flat_map(
            source.clone() as CollectionRef<Item>,
            move |ctx, input: &Item| {
                let hits = fetch(
                    ctx,
                    &looked_up_ref,
                    Filter::match_names([input.name.as_str()]),
                );
                vec![Item {
                    name: format!("{}-joined", input.name),
                    value: hits.first().map(|h| h.value).unwrap_or(-1),
                }]
            },
            stop.child_token(),
        );

        source.update(item("a", 0));
        eventually("miss produces placeholder", || {
            derived.get("a-joined") == Some(item("a-joined", -1))
        })
        .await;

        // A change to the fetched collection re-runs the transformer even
        // though the input itself did not change.
        looked_up.update(item("a", 42));
        eventually("dependency change propagates", || {
            derived.get("a-joined") == Some(item("a-joined", 42))
        })
        .await;

        looked_up.delete("a");
        eventually("dependency removal propagates", || {
            derived.get("a-joined") == Some(item("a-joined", -1))
        })
        .await;

        // Unrelated keys in the fetched collection do not disturb outputs.
        looked_up.update(item("b", 7));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(derived.get("a-joined"), Some(item("a-joined", -1)));
        stop.cancel();
    }

    #[tokio::test]
    async fn map_is_one_to_optional() {
        let stop = CancellationToken::new();
        let source = StaticCollection::<Item>::new(stop.child_token());
        let derived = map(
            source.clone() as CollectionRef<Item>,
            |_ctx, item: &Item| (item.value > 0).then(|| item.clone()),
            stop.child_token(),
        );

        source.update(item("pos", 1));
        source.update(item("neg", -1));
        eventually("positive mapped", || derived.get("pos").is_some()).await;
        assert!(derived.get("neg").is_none());

        // Flipping the predicate removes the output.
        source.update(item("pos", -5));
        eventually("output retracted", || derived.get("pos").is_none()).await;
        stop.cancel();
    }

    #[tokio::test]
    async fn shared_outputs_survive_losing_one_contributor() {
        let stop = CancellationToken::new();
        let source = StaticCollection::<Item>::new(stop.child_token());
        // Every input emits the same output key.
        let derived = flat_map(
            source.clone() as CollectionRef<Item>,
            |_ctx, _item: &Item| vec![item("shared", 0)],
            stop.child_token(),
        );

        source.update(item("a", 1));
        source.update(item("b", 1));
        eventually("shared output present", || derived.get("shared").is_some()).await;

        // One contributor disappears; the output is still claimed by the
        // other.
        source.delete("a");
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(derived.get("shared").is_some());

        source.delete("b");
        eventually("last contributor removes output", || {
            derived.get("shared").is_none()
        })
        .await;
        stop.cancel();
    }

    #[tokio::test]
    async fn derived_collection_syncs_after_source() {
        let stop = CancellationToken::new();
        let source = StaticCollection::<Item>::new(stop.child_token());
        source.update(item("a", 1));
        source.update(item("b", 2));
        let derived = flat_map(
            source.clone() as CollectionRef<Item>,
            |_ctx, item: &Item| vec![item.clone()],
            stop.child_token(),
        );
        assert!(derived.synced().wait(&stop).await);
        assert_eq!(2, derived.list().len());
        stop.cancel();
    }

    #[tokio::test]
    async fn stopped_collection_reports_unsynced() {
        let stop = CancellationToken::new();
        let source = StaticCollection::<Item>::new(stop.child_token());
        stop.cancel();
        let derived = flat_map(
            source.clone() as CollectionRef<Item>,
            |_ctx, item: &Item| vec![item.clone()],
            stop.child_token(),
        );
        assert!(!derived.synced().wait(&stop).await);
    }
}
