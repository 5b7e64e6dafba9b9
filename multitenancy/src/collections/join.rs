use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{Collection, CollectionCore, CollectionRef, Event, Fanout, Keyed, RegisterMsg};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum JoinKind {
    /// Emit a pair only when both sides hold the key.
    Inner,
    /// Emit a pair for every left item, with its optional right match.
    Left,
}

/// Joined pairs a left item with the right item sharing its key.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Joined<L, R> {
    pub left: L,
    pub right: Option<R>,
}

impl<L: Keyed, R> Keyed for Joined<L, R> {
    fn key(&self) -> String {
        self.left.key()
    }
}

/// Derives a collection pairing items of `left` and `right` whose keys
/// match. Events on either side recompute the pair for the affected key.
pub(crate) fn join<L, R>(
    left: CollectionRef<L>,
    right: CollectionRef<R>,
    kind: JoinKind,
    stop: CancellationToken,
) -> CollectionRef<Joined<L, R>>
where
    L: Keyed + Clone + PartialEq + Send + Sync + 'static,
    R: Keyed + Clone + PartialEq + Send + Sync + 'static,
{
    let (core, reg_rx) = CollectionCore::new(stop.clone());
    let worker = JoinWorker {
        core: core.clone(),
        left,
        right,
        kind,
        fanout: Fanout::new(),
    };
    tokio::spawn(worker.run(reg_rx, stop));
    core
}

enum JoinMsg<L, R> {
    Left(Event<L>),
    Right(Event<R>),
}

struct JoinWorker<L, R> {
    core: Arc<CollectionCore<Joined<L, R>>>,
    left: CollectionRef<L>,
    right: CollectionRef<R>,
    kind: JoinKind,
    fanout: Fanout<Joined<L, R>>,
}

impl<L, R> JoinWorker<L, R>
where
    L: Keyed + Clone + PartialEq + Send + Sync + 'static,
    R: Keyed + Clone + PartialEq + Send + Sync + 'static,
{
    async fn run(
        mut self,
        mut reg_rx: mpsc::UnboundedReceiver<RegisterMsg<Joined<L, R>>>,
        stop: CancellationToken,
    ) {
        let (tx, mut rx) = mpsc::unbounded_channel::<JoinMsg<L, R>>();
        let left_tx = tx.clone();
        let left_reg = self.left.register(Arc::new(move |ev| {
            let _ = left_tx.send(JoinMsg::Left(ev));
            futures::future::ready(()).boxed()
        }));
        let right_reg = self.right.register(Arc::new(move |ev| {
            let _ = tx.send(JoinMsg::Right(ev));
            futures::future::ready(()).boxed()
        }));
        tokio::select! {
            biased;
            _ = stop.cancelled() => return,
            _ = async { left_reg.replayed().await; right_reg.replayed().await } => {}
        }
        if !self.left.synced().wait(&stop).await {
            return;
        }
        if !self.right.synced().wait(&stop).await {
            return;
        }
        while let Ok(msg) = rx.try_recv() {
            self.on_msg(msg).await;
        }
        self.core.mark_synced();

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                Some(msg) = rx.recv() => self.on_msg(msg).await,
                Some(msg) = reg_rx.recv() => {
                    let snapshot = self.core.snapshot();
                    self.fanout.subscribe(msg, snapshot).await;
                }
            }
        }
    }

    async fn on_msg(&mut self, msg: JoinMsg<L, R>) {
        let key = match &msg {
            JoinMsg::Left(ev) => ev.latest().key(),
            JoinMsg::Right(ev) => ev.latest().key(),
        };
        self.recompute(&key).await;
    }

    /// Recomputes the pair stored under `key` from the current state of
    /// both sides.
    async fn recompute(&mut self, key: &str) {
        let left = self.left.get(key);
        let right = self.right.get(key);
        let pair = match (self.kind, left, right) {
            (JoinKind::Left, Some(left), right) => Some(Joined { left, right }),
            (JoinKind::Inner, Some(left), Some(right)) => Some(Joined {
                left,
                right: Some(right),
            }),
            _ => None,
        };
        if let Some(ev) = self.core.apply(key, pair) {
            self.fanout.deliver(ev).await;
        }
    }
}
