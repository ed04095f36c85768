// src/live.rs
//! Live result fan-out.
//!
//! The [`Registry`] owns one mailbox per connected subscriber, grouped by
//! poll. Broadcasts copy the current subscriber list out of the map, deliver
//! without holding any lock, then evict the peers that turned out to be gone.
//! The [`Broadcaster`] builds snapshots from the store and takes a per-poll
//! turn around every read-and-deliver, so every subscriber sees snapshots in
//! the order they were produced and none is left behind the store.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use dashmap::DashMap;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::snapshot::{self, Snapshot};
use crate::store::VoteStore;

/// A discrete message pushed to a subscriber.
#[derive(Debug, Clone)]
pub enum Notice {
    Snapshot(Arc<Snapshot>),
    Timeout,
    Error(String),
    Shutdown,
}

impl Notice {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Notice::Snapshot(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// The receiving side is gone; the subscriber must be evicted.
    Gone,
    /// The queue is full. The notice waits in the overflow slot, replacing
    /// any older snapshot parked there.
    Lagging,
}

type Overflow = Arc<StdMutex<Option<Notice>>>;

fn lock(overflow: &Overflow) -> MutexGuard<'_, Option<Notice>> {
    overflow.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Sending half of one subscriber: a bounded queue plus a single overflow
/// slot that always holds the newest notice the queue had no room for.
#[derive(Clone)]
struct Mailbox {
    tx: mpsc::Sender<Notice>,
    overflow: Overflow,
}

impl Mailbox {
    fn new(buffer: usize) -> (Self, mpsc::Receiver<Notice>, Overflow) {
        let (tx, rx) = mpsc::channel(buffer);
        let overflow = Overflow::default();
        let mailbox = Self {
            tx,
            overflow: overflow.clone(),
        };
        (mailbox, rx, overflow)
    }

    fn post(&self, notice: Notice) -> Result<(), DeliveryError> {
        let mut overflow = lock(&self.overflow);
        match self.tx.try_send(notice) {
            Ok(()) => {
                // A parked snapshot is older than the one just queued.
                if matches!(*overflow, Some(Notice::Snapshot(_))) {
                    *overflow = None;
                }
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(DeliveryError::Gone),
            Err(TrySendError::Full(notice)) => {
                // A parked terminal notice is never replaced.
                if !overflow.as_ref().is_some_and(Notice::is_terminal) {
                    *overflow = Some(notice);
                }
                Err(DeliveryError::Lagging)
            }
        }
    }
}

struct Subscriber {
    id: Uuid,
    mailbox: Mailbox,
    timer: AbortHandle,
}

impl Subscriber {
    fn close(self, notice: Notice) {
        self.timer.abort();
        let _ = self.mailbox.post(notice);
    }
}

/// Exclusive turn on one poll's live state. Released when dropped.
struct Turn {
    registry: Arc<Registry>,
    poll_id: i64,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for Turn {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.registry.release_gate(self.poll_id);
    }
}

pub struct Registry {
    polls: DashMap<i64, Vec<Subscriber>>,
    gates: DashMap<i64, Arc<Mutex<()>>>,
    idle_timeout: Duration,
    buffer: usize,
    closed: AtomicBool,
}

impl Registry {
    pub fn new(idle_timeout: Duration, buffer: usize) -> Arc<Self> {
        Arc::new(Self {
            polls: DashMap::new(),
            gates: DashMap::new(),
            idle_timeout,
            // Room for the initial snapshot plus a terminal notice.
            buffer: buffer.max(2),
            closed: AtomicBool::new(false),
        })
    }

    /// Registers a subscriber whose first message is `initial`, and starts its
    /// idle timer.
    pub fn register(self: &Arc<Self>, poll_id: i64, initial: Arc<Snapshot>) -> Subscription {
        let (mailbox, rx, overflow) = Mailbox::new(self.buffer);
        let id = Uuid::new_v4();
        let _ = mailbox.post(Notice::Snapshot(initial));

        let subscription = Subscription {
            id,
            poll_id,
            rx,
            overflow,
            finished: false,
            registry: Arc::downgrade(self),
        };

        let mut subscribers = self.polls.entry(poll_id).or_default();
        if self.closed.load(Ordering::SeqCst) {
            drop(subscribers);
            self.polls.remove_if(&poll_id, |_, subs| subs.is_empty());
            let _ = mailbox.post(Notice::Shutdown);
            return subscription;
        }

        // Spawned under the entry lock so the timer can never fire before the
        // subscriber is in the map.
        let timer = self.start_timer(poll_id, id);
        subscribers.push(Subscriber { id, mailbox, timer });
        let count = subscribers.len();
        drop(subscribers);

        debug!(poll_id, subscription = %id, subscribers = count, "subscriber registered");
        subscription
    }

    fn start_timer(self: &Arc<Self>, poll_id: i64, id: Uuid) -> AbortHandle {
        let registry = Arc::downgrade(self);
        let idle_timeout = self.idle_timeout;

        tokio::spawn(async move {
            tokio::time::sleep(idle_timeout).await;
            if let Some(registry) = registry.upgrade() {
                registry.expire(poll_id, id);
            }
        })
        .abort_handle()
    }

    fn expire(&self, poll_id: i64, id: Uuid) {
        if let Some(subscriber) = self.take(poll_id, id) {
            debug!(poll_id, subscription = %id, "subscriber idle, closing");
            let _ = subscriber.mailbox.post(Notice::Timeout);
        }
    }

    fn take(&self, poll_id: i64, id: Uuid) -> Option<Subscriber> {
        let removed = {
            let mut subscribers = self.polls.get_mut(&poll_id)?;
            let pos = subscribers.iter().position(|s| s.id == id)?;
            subscribers.remove(pos)
        };
        self.forget_if_empty(poll_id);
        Some(removed)
    }

    fn forget_if_empty(&self, poll_id: i64) {
        self.polls.remove_if(&poll_id, |_, subs| subs.is_empty());
        self.release_gate(poll_id);
    }

    /// Removes a subscriber. Returns false if it was already gone.
    pub fn unsubscribe(&self, poll_id: i64, id: Uuid) -> bool {
        match self.take(poll_id, id) {
            Some(subscriber) => {
                subscriber.timer.abort();
                true
            }
            None => false,
        }
    }

    /// Delivers `snapshot` to every current subscriber of the poll and evicts
    /// the ones whose connection is gone. Returns the number of subscribers
    /// that will see it.
    pub fn broadcast(&self, poll_id: i64, snapshot: Arc<Snapshot>) -> usize {
        let targets: Vec<(Uuid, Mailbox)> = match self.polls.get(&poll_id) {
            Some(subscribers) => subscribers
                .iter()
                .map(|s| (s.id, s.mailbox.clone()))
                .collect(),
            None => return 0,
        };

        let mut delivered = 0;
        let mut gone = Vec::new();
        for (id, mailbox) in targets {
            match mailbox.post(Notice::Snapshot(snapshot.clone())) {
                Ok(()) => delivered += 1,
                Err(DeliveryError::Lagging) => {
                    debug!(poll_id, subscription = %id, "subscriber lagging, snapshot parked");
                    delivered += 1;
                }
                Err(DeliveryError::Gone) => gone.push(id),
            }
        }

        if !gone.is_empty() {
            self.evict(poll_id, &gone);
        }

        delivered
    }

    fn evict(&self, poll_id: i64, ids: &[Uuid]) {
        let evicted: Vec<Subscriber> = {
            let Some(mut subscribers) = self.polls.get_mut(&poll_id) else {
                return;
            };
            let (evicted, kept) = std::mem::take(&mut *subscribers)
                .into_iter()
                .partition(|s| ids.contains(&s.id));
            *subscribers = kept;
            evicted
        };
        self.forget_if_empty(poll_id);

        for subscriber in evicted {
            subscriber.timer.abort();
            debug!(poll_id, subscription = %subscriber.id, "evicted broken subscriber");
        }
    }

    /// Sends `notice` to every subscriber of the poll and closes them all.
    pub fn close_poll(&self, poll_id: i64, notice: Notice) -> usize {
        let Some((_, subscribers)) = self.polls.remove(&poll_id) else {
            return 0;
        };
        self.release_gate(poll_id);

        let count = subscribers.len();
        for subscriber in subscribers {
            subscriber.close(notice.clone());
        }
        count
    }

    pub fn subscriber_count(&self, poll_id: i64) -> usize {
        self.polls.get(&poll_id).map(|s| s.len()).unwrap_or(0)
    }

    pub fn total_subscribers(&self) -> usize {
        self.polls.iter().map(|entry| entry.value().len()).sum()
    }

    /// Releases every subscription and cancels their timers. Later
    /// registrations are closed right after their initial snapshot.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);

        let mut released = 0;
        self.polls.retain(|_, subscribers| {
            for subscriber in subscribers.drain(..) {
                subscriber.close(Notice::Shutdown);
                released += 1;
            }
            false
        });
        self.gates.retain(|_, gate| Arc::strong_count(gate) > 1);

        info!(released, "live registry shut down");
    }

    /// Waits for exclusive access to the poll's live state.
    async fn turn(self: &Arc<Self>, poll_id: i64) -> Turn {
        let gate = self.gates.entry(poll_id).or_default().value().clone();
        let guard = gate.lock_owned().await;

        Turn {
            registry: self.clone(),
            poll_id,
            guard: Some(guard),
        }
    }

    /// Drops the poll's gate once nobody holds or waits on it and the poll
    /// has no subscribers left.
    fn release_gate(&self, poll_id: i64) {
        if self.polls.contains_key(&poll_id) {
            return;
        }
        self.gates
            .remove_if(&poll_id, |_, gate| Arc::strong_count(gate) == 1);
    }

    #[cfg(test)]
    fn gate_count(&self) -> usize {
        self.gates.len()
    }
}

/// Receiving end of one live connection. Dropping it unsubscribes.
pub struct Subscription {
    id: Uuid,
    poll_id: i64,
    rx: mpsc::Receiver<Notice>,
    overflow: Overflow,
    finished: bool,
    registry: Weak<Registry>,
}

impl Subscription {
    /// A subscription that was never registered: it yields `notice` and ends.
    pub fn closed_with(poll_id: i64, notice: Notice) -> Self {
        let (mailbox, rx, overflow) = Mailbox::new(1);
        let _ = mailbox.post(notice);

        Self {
            id: Uuid::new_v4(),
            poll_id,
            rx,
            overflow,
            finished: false,
            registry: Weak::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn poll_id(&self) -> i64 {
        self.poll_id
    }

    pub async fn recv(&mut self) -> Option<Notice> {
        self.next().await
    }
}

impl Stream for Subscription {
    type Item = Notice;

    /// Queued notices come first; the overflow slot is only read once the
    /// queue is drained. The stream ends after the first terminal notice.
    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Notice>> {
        if self.finished {
            return Poll::Ready(None);
        }

        let (next, disconnected) = match self.rx.poll_recv(cx) {
            Poll::Ready(Some(notice)) => (Some(notice), false),
            Poll::Ready(None) => (lock(&self.overflow).take(), true),
            Poll::Pending => (lock(&self.overflow).take(), false),
        };

        match next {
            Some(notice) => {
                if notice.is_terminal() {
                    self.finished = true;
                }
                Poll::Ready(Some(notice))
            }
            None if disconnected => {
                self.finished = true;
                Poll::Ready(None)
            }
            None => Poll::Pending,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            if registry.unsubscribe(self.poll_id, self.id) {
                debug!(poll_id = self.poll_id, subscription = %self.id, "subscriber disconnected");
            }
        }
    }
}

/// Connects the store to the registry.
#[derive(Clone)]
pub struct Broadcaster {
    store: Arc<dyn VoteStore>,
    registry: Arc<Registry>,
}

impl Broadcaster {
    pub fn new(store: Arc<dyn VoteStore>, registry: Arc<Registry>) -> Self {
        Self { store, registry }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Validates the poll, computes the initial snapshot and registers a
    /// subscriber with it as the first message.
    pub async fn subscribe(&self, poll_id: i64) -> AppResult<Subscription> {
        let _turn = self.registry.turn(poll_id).await;
        let snapshot = snapshot::build(self.store.as_ref(), poll_id).await?;
        Ok(self.registry.register(poll_id, Arc::new(snapshot)))
    }

    /// Like [`subscribe`](Self::subscribe), but failures become a closed
    /// subscription carrying an error notice.
    pub async fn connect(&self, poll_id: i64) -> Subscription {
        match self.subscribe(poll_id).await {
            Ok(subscription) => subscription,
            Err(e) => {
                if !matches!(e, AppError::NotFound { .. }) {
                    warn!(poll_id, error = %e, "live subscription failed");
                }
                Subscription::closed_with(poll_id, Notice::Error(notice_text(&e)))
            }
        }
    }

    /// Builds a fresh snapshot and broadcasts it, if anyone is listening.
    ///
    /// The subscriber check runs inside the turn: a subscribe that already
    /// read an older state is either registered by now or still holds the
    /// turn, and this publish waits for it.
    pub async fn publish(&self, poll_id: i64) -> AppResult<usize> {
        let _turn = self.registry.turn(poll_id).await;
        if self.registry.subscriber_count(poll_id) == 0 {
            return Ok(0);
        }

        match snapshot::build(self.store.as_ref(), poll_id).await {
            Ok(snapshot) => Ok(self.registry.broadcast(poll_id, Arc::new(snapshot))),
            Err(e @ AppError::NotFound { .. }) => {
                self.registry.close_poll(poll_id, Notice::Error(e.to_string()));
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }

    /// Publishes in the background so the caller never waits on delivery.
    pub fn spawn_publish(&self, poll_id: i64) {
        let this = self.clone();
        tokio::spawn(async move {
            match this.publish(poll_id).await {
                Ok(delivered) => debug!(poll_id, delivered, "snapshot published"),
                Err(e) => warn!(poll_id, error = %e, "snapshot publish failed"),
            }
        });
    }

    /// Closes every subscriber of a deleted poll with an error notice.
    pub async fn close_poll(&self, poll_id: i64) -> usize {
        let _turn = self.registry.turn(poll_id).await;
        let notice = Notice::Error(AppError::poll_not_found(poll_id).to_string());
        self.registry.close_poll(poll_id, notice)
    }

    pub fn shutdown(&self) {
        self.registry.shutdown();
    }
}

fn notice_text(e: &AppError) -> String {
    match e {
        AppError::NotFound { .. } => e.to_string(),
        _ => "Live updates are unavailable.".to_string(),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::VoterIdentity;
    use crate::models::NewPoll;
    use crate::snapshot::VoterCount;
    use crate::models::{Poll, PollAggregate, PollUpdate, Vote};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use chrono::Utc;
    use tokio::sync::Notify;

    fn snapshot(total: i64) -> Arc<Snapshot> {
        Arc::new(Snapshot {
            id: 1,
            name: "Lunch?".into(),
            description: String::new(),
            enforce_unique: false,
            created: Utc::now(),
            modified: None,
            options: Vec::new(),
            total_votes: total,
            voters: VoterCount::Unlimited,
            latest_vote: None,
        })
    }

    fn total(notice: Option<Notice>) -> i64 {
        match notice {
            Some(Notice::Snapshot(s)) => s.total_votes,
            other => panic!("expected a snapshot, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn first_message_is_the_initial_snapshot() {
        let registry = Registry::new(Duration::from_secs(500), 16);
        let mut sub = registry.register(1, snapshot(7));

        assert_eq!(total(sub.recv().await), 7);
        assert_eq!(registry.subscriber_count(1), 1);
    }

    #[tokio::test]
    async fn broadcast_without_subscribers_is_a_noop() {
        let registry = Registry::new(Duration::from_secs(500), 16);
        assert_eq!(registry.broadcast(42, snapshot(1)), 0);
        assert_eq!(registry.total_subscribers(), 0);
    }

    #[tokio::test]
    async fn broken_subscriber_is_evicted_without_hurting_others() {
        let registry = Registry::new(Duration::from_secs(500), 16);
        let mut healthy = registry.register(1, snapshot(0));
        let mut broken = registry.register(1, snapshot(0));
        assert_eq!(total(healthy.recv().await), 0);

        // The peer vanished without the subscription being dropped.
        broken.rx.close();

        assert_eq!(registry.broadcast(1, snapshot(1)), 1);
        assert_eq!(registry.subscriber_count(1), 1);
        assert_eq!(total(healthy.recv().await), 1);

        assert_eq!(registry.broadcast(1, snapshot(2)), 1);
        assert_eq!(total(healthy.recv().await), 2);
    }

    #[tokio::test]
    async fn lagging_subscriber_always_gets_the_latest_snapshot() {
        let registry = Registry::new(Duration::from_secs(500), 2);
        let mut slow = registry.register(1, snapshot(0));

        assert_eq!(registry.broadcast(1, snapshot(1)), 1);
        // The queue is full; 2 is parked and then replaced by 3.
        assert_eq!(registry.broadcast(1, snapshot(2)), 1);
        assert_eq!(registry.broadcast(1, snapshot(3)), 1);
        assert_eq!(registry.subscriber_count(1), 1);

        assert_eq!(total(slow.recv().await), 0);
        assert_eq!(total(slow.recv().await), 1);
        assert_eq!(total(slow.recv().await), 3);

        assert_eq!(registry.broadcast(1, snapshot(4)), 1);
        assert_eq!(total(slow.recv().await), 4);
    }

    #[tokio::test]
    async fn queued_snapshot_supersedes_a_parked_one() {
        let registry = Registry::new(Duration::from_secs(500), 2);
        let mut slow = registry.register(1, snapshot(0));
        registry.broadcast(1, snapshot(1));
        registry.broadcast(1, snapshot(2));

        assert_eq!(total(slow.recv().await), 0);
        // Room again: 3 is queued and the parked 2 is stale.
        registry.broadcast(1, snapshot(3));

        assert_eq!(total(slow.recv().await), 1);
        assert_eq!(total(slow.recv().await), 3);
        assert_eq!(registry.broadcast(1, snapshot(4)), 1);
        assert_eq!(total(slow.recv().await), 4);
    }

    #[tokio::test]
    async fn close_reaches_a_lagging_subscriber() {
        let registry = Registry::new(Duration::from_secs(500), 2);
        let slow = registry.register(1, snapshot(0));
        registry.broadcast(1, snapshot(1));
        registry.broadcast(1, snapshot(2));

        registry.close_poll(1, Notice::Error("gone".into()));
        let notices: Vec<Notice> = slow.collect().await;
        assert_eq!(notices.len(), 3);
        assert!(matches!(notices[2], Notice::Error(_)));
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent_and_drop_unsubscribes() {
        let registry = Registry::new(Duration::from_secs(500), 16);
        let sub = registry.register(3, snapshot(0));
        let (poll_id, id) = (sub.poll_id(), sub.id());

        assert!(registry.unsubscribe(poll_id, id));
        assert!(!registry.unsubscribe(poll_id, id));
        assert_eq!(registry.subscriber_count(3), 0);
        drop(sub);

        let other = registry.register(3, snapshot(0));
        assert_eq!(registry.subscriber_count(3), 1);
        drop(other);
        assert_eq!(registry.subscriber_count(3), 0);
        assert_eq!(registry.total_subscribers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_subscriber_gets_one_timeout_and_is_removed() {
        let registry = Registry::new(Duration::from_secs(500), 16);
        let mut sub = registry.register(1, snapshot(0));
        assert_eq!(total(sub.recv().await), 0);

        tokio::time::advance(Duration::from_secs(250)).await;
        let _fresh = registry.register(1, snapshot(0));
        assert_eq!(registry.subscriber_count(1), 2);

        // Time auto-advances while waiting for the timer.
        assert!(matches!(sub.recv().await, Some(Notice::Timeout)));
        assert!(sub.recv().await.is_none());
        assert_eq!(registry.subscriber_count(1), 1);

        assert_eq!(registry.broadcast(1, snapshot(1)), 1);
    }

    #[tokio::test]
    async fn close_poll_sends_error_and_ends_streams() {
        let registry = Registry::new(Duration::from_secs(500), 16);
        let sub = registry.register(9, snapshot(0));

        assert_eq!(registry.close_poll(9, Notice::Error("gone".into())), 1);
        let notices: Vec<Notice> = sub.collect().await;
        assert_eq!(notices.len(), 2);
        assert!(matches!(notices[1], Notice::Error(ref m) if m == "gone"));
        assert_eq!(registry.subscriber_count(9), 0);
    }

    #[tokio::test]
    async fn shutdown_releases_everyone_and_refuses_new_subscribers() {
        let registry = Registry::new(Duration::from_secs(500), 16);
        let a = registry.register(1, snapshot(0));
        let b = registry.register(2, snapshot(0));

        registry.shutdown();
        assert_eq!(registry.total_subscribers(), 0);

        for sub in [a, b] {
            let notices: Vec<Notice> = sub.collect().await;
            assert!(matches!(notices.last(), Some(Notice::Shutdown)));
        }

        let late = registry.register(1, snapshot(5));
        assert_eq!(registry.total_subscribers(), 0);
        let notices: Vec<Notice> = late.collect().await;
        assert_eq!(notices.len(), 2);
        assert!(notices[1].is_terminal());
    }

    async fn broadcaster_with_poll(enforce_unique: bool) -> (Broadcaster, Arc<MemoryStore>, i64) {
        let store = Arc::new(MemoryStore::new());
        let poll = store
            .create_poll(NewPoll {
                name: "Lunch?".into(),
                description: String::new(),
                options: vec!["Pizza".into(), "Salad".into()],
                enforce_unique,
                owner_id: None,
            })
            .await
            .unwrap();
        let registry = Registry::new(Duration::from_secs(500), 16);
        (Broadcaster::new(store.clone(), registry), store, poll.id)
    }

    fn anon(hash: &str) -> VoterIdentity {
        VoterIdentity {
            user_id: None,
            address_hash: hash.into(),
        }
    }

    #[tokio::test]
    async fn subscribe_reflects_store_state() {
        let (live, store, poll_id) = broadcaster_with_poll(true).await;
        store.cast_vote(poll_id, "Pizza", &anon("h1")).await.unwrap();
        store.cast_vote(poll_id, "Salad", &anon("h2")).await.unwrap();

        let mut sub = live.subscribe(poll_id).await.unwrap();
        match sub.recv().await {
            Some(Notice::Snapshot(s)) => {
                assert_eq!(s.total_votes, 2);
                assert_eq!(s.voters, VoterCount::Counted(2));
            }
            other => panic!("expected snapshot, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn subscribe_to_missing_poll_is_not_found() {
        let (live, _store, _) = broadcaster_with_poll(false).await;

        assert!(matches!(
            live.subscribe(404).await,
            Err(AppError::NotFound { .. })
        ));
        assert_eq!(live.registry().total_subscribers(), 0);

        let notices: Vec<Notice> = live.connect(404).await.collect().await;
        assert_eq!(notices.len(), 1);
        assert!(matches!(&notices[0], Notice::Error(m) if m.contains("404")));
    }

    #[tokio::test]
    async fn publish_sends_a_fresh_snapshot() {
        let (live, store, poll_id) = broadcaster_with_poll(false).await;
        assert_eq!(live.publish(poll_id).await.unwrap(), 0);

        let mut sub = live.subscribe(poll_id).await.unwrap();
        assert_eq!(total(sub.recv().await), 0);

        store.cast_vote(poll_id, "Pizza", &anon("h1")).await.unwrap();
        assert_eq!(live.publish(poll_id).await.unwrap(), 1);
        assert_eq!(total(sub.recv().await), 1);
    }

    #[tokio::test]
    async fn publish_after_deletion_closes_subscribers() {
        let (live, store, poll_id) = broadcaster_with_poll(false).await;
        let sub = live.subscribe(poll_id).await.unwrap();

        store.delete_poll(poll_id).await.unwrap();
        assert_eq!(live.publish(poll_id).await.unwrap(), 0);

        let notices: Vec<Notice> = sub.collect().await;
        assert!(matches!(notices.last(), Some(Notice::Error(_))));
        assert_eq!(live.registry().subscriber_count(poll_id), 0);
    }

    #[tokio::test]
    async fn gates_do_not_outlive_their_subscribers() {
        let (live, store, _) = broadcaster_with_poll(false).await;
        let mut ids = Vec::new();
        for _ in 0..50 {
            let poll = store
                .create_poll(NewPoll {
                    name: "Again?".into(),
                    description: String::new(),
                    options: vec!["Yes".into(), "No".into()],
                    enforce_unique: false,
                    owner_id: None,
                })
                .await
                .unwrap();
            ids.push(poll.id);
        }

        for &poll_id in &ids {
            let sub = live.subscribe(poll_id).await.unwrap();
            assert_eq!(live.registry().gate_count(), 1);
            drop(sub);
            assert_eq!(live.publish(poll_id).await.unwrap(), 0);
        }

        assert_eq!(live.registry().total_subscribers(), 0);
        assert_eq!(live.registry().gate_count(), 0);
    }

    /// Memory store whose next aggregate read stalls after reading, until
    /// released.
    #[derive(Default)]
    struct StallingStore {
        inner: MemoryStore,
        stall_next: AtomicBool,
        stalled: Notify,
        resume: Notify,
    }

    #[async_trait]
    impl VoteStore for StallingStore {
        async fn create_poll(&self, poll: NewPoll) -> AppResult<Poll> {
            self.inner.create_poll(poll).await
        }

        async fn update_poll(&self, poll_id: i64, update: PollUpdate) -> AppResult<()> {
            self.inner.update_poll(poll_id, update).await
        }

        async fn delete_poll(&self, poll_id: i64) -> AppResult<()> {
            self.inner.delete_poll(poll_id).await
        }

        async fn cast_vote(
            &self,
            poll_id: i64,
            option: &str,
            identity: &VoterIdentity,
        ) -> AppResult<Vote> {
            self.inner.cast_vote(poll_id, option, identity).await
        }

        async fn load_aggregate(&self, poll_id: i64) -> AppResult<Option<PollAggregate>> {
            let aggregate = self.inner.load_aggregate(poll_id).await;
            if self.stall_next.swap(false, Ordering::SeqCst) {
                self.stalled.notify_one();
                self.resume.notified().await;
            }
            aggregate
        }
    }

    async fn stalling_broadcaster() -> (Broadcaster, Arc<StallingStore>, i64) {
        let store = Arc::new(StallingStore::default());
        let poll = store
            .create_poll(NewPoll {
                name: "Lunch?".into(),
                description: String::new(),
                options: vec!["Pizza".into(), "Salad".into()],
                enforce_unique: false,
                owner_id: None,
            })
            .await
            .unwrap();
        let registry = Registry::new(Duration::from_secs(500), 16);
        (Broadcaster::new(store.clone(), registry), store, poll.id)
    }

    #[tokio::test]
    async fn vote_during_subscribe_still_reaches_the_new_subscriber() {
        let (live, store, poll_id) = stalling_broadcaster().await;
        store.stall_next.store(true, Ordering::SeqCst);

        let subscribing = tokio::spawn({
            let live = live.clone();
            async move { live.subscribe(poll_id).await }
        });
        // The subscriber has read a state with no votes but is not registered.
        store.stalled.notified().await;

        store.cast_vote(poll_id, "Pizza", &anon("h1")).await.unwrap();
        let publishing = tokio::spawn({
            let live = live.clone();
            async move { live.publish(poll_id).await }
        });
        tokio::task::yield_now().await;
        store.resume.notify_one();

        let mut sub = subscribing.await.unwrap().unwrap();
        assert_eq!(publishing.await.unwrap().unwrap(), 1);
        assert_eq!(total(sub.recv().await), 0);
        assert_eq!(total(sub.recv().await), 1);
    }

    #[tokio::test]
    async fn delete_during_subscribe_closes_the_new_subscriber() {
        let (live, store, poll_id) = stalling_broadcaster().await;
        store.stall_next.store(true, Ordering::SeqCst);

        let subscribing = tokio::spawn({
            let live = live.clone();
            async move { live.subscribe(poll_id).await }
        });
        store.stalled.notified().await;

        store.delete_poll(poll_id).await.unwrap();
        let closing = tokio::spawn({
            let live = live.clone();
            async move { live.close_poll(poll_id).await }
        });
        tokio::task::yield_now().await;
        store.resume.notify_one();

        let sub = subscribing.await.unwrap().unwrap();
        assert_eq!(closing.await.unwrap(), 1);

        let notices: Vec<Notice> = sub.collect().await;
        assert_eq!(notices.len(), 2);
        assert!(matches!(&notices[1], Notice::Error(m) if m.contains("not found")));
        assert_eq!(live.registry().total_subscribers(), 0);
        assert_eq!(live.registry().gate_count(), 0);
    }
}
