use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use crate::collection::api::{ObserverId, Snapshot, SnapshotObserver, SnapshotState};
use crate::collection::error::CollectionError;
use crate::collection::local::cache::SnapshotCache;
use crate::collection::local::overlay::{
    Confirmation, MutationFailed, MutationId, OptimisticOverlay,
};
use crate::collection::local::pump::{Control, Pump};
use crate::collection::model::{CollectionKey, Document};
use crate::collection::remote::RemoteCollectionSourceArc;
use crate::platform::runtime;
use crate::util::backoff::BackoffSettings;

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_millis(300);

#[derive(Clone, Debug, PartialEq)]
pub struct MultiplexerSettings {
    /// How long an unreferenced key keeps its upstream subscription open.
    pub grace_period: Duration,
    pub backoff: BackoffSettings,
}

impl Default for MultiplexerSettings {
    fn default() -> Self {
        Self {
            grace_period: DEFAULT_GRACE_PERIOD,
            backoff: BackoffSettings::default(),
        }
    }
}

impl MultiplexerSettings {
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffSettings) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Shares one upstream subscription per collection key among any number of
/// subscribers.
///
/// The first [`attach`](Self::attach) for a key creates its snapshot cache and
/// starts a pump task that owns the upstream stream. The pump is the only
/// place callbacks run, so every observer of a key sees versions in upstream
/// order. When the last subscriber goes away the key lingers for the grace
/// period, then the upstream subscription is closed and the cache discarded.
#[derive(Clone)]
pub struct SubscriptionMultiplexer {
    inner: Arc<MultiplexerInner>,
}

pub(crate) struct MultiplexerInner {
    source: RemoteCollectionSourceArc,
    settings: MultiplexerSettings,
    state: Mutex<MultiplexerState>,
}

#[derive(Default)]
struct MultiplexerState {
    entries: BTreeMap<CollectionKey, KeyEntry>,
    next_subscriber: u64,
    next_generation: u64,
    next_ticket: u64,
}

struct KeyEntry {
    /// Distinguishes this entry's pump from one left over by an earlier teardown.
    generation: u64,
    cache: SnapshotCache,
    last_error: Option<CollectionError>,
    upstream_open: bool,
    subscribers: BTreeMap<u64, SubscriberSlot>,
    control: async_channel::Sender<Control>,
    close_ticket: Option<u64>,
}

struct SubscriberSlot {
    overlay: Option<OptimisticOverlay>,
    observers: BTreeMap<u64, SnapshotObserver>,
    next_observer: u64,
    outbox: VecDeque<Notice>,
}

/// A callback owed to specific observers, queued until the pump flushes.
struct Notice {
    recipients: Vec<u64>,
    delivery: Delivery,
}

#[derive(Clone)]
enum Delivery {
    Snapshot(Snapshot),
    Error(CollectionError),
    MutationFailed(MutationFailed),
}

impl SubscriptionMultiplexer {
    pub fn new(source: RemoteCollectionSourceArc) -> Self {
        Self::with_settings(source, MultiplexerSettings::default())
    }

    pub fn with_settings(source: RemoteCollectionSourceArc, settings: MultiplexerSettings) -> Self {
        Self {
            inner: Arc::new(MultiplexerInner {
                source,
                settings,
                state: Mutex::new(MultiplexerState::default()),
            }),
        }
    }

    pub fn settings(&self) -> &MultiplexerSettings {
        &self.inner.settings
    }

    /// Registers interest in `key` without an optimistic overlay.
    ///
    /// Returns immediately; the first snapshot arrives through the pump.
    pub fn attach(&self, key: CollectionKey) -> Subscriber {
        self.inner.attach(key, false)
    }

    /// Registers interest in `key` with a per-subscriber optimistic overlay.
    pub fn attach_with_overlay(&self, key: CollectionKey) -> Subscriber {
        self.inner.attach(key, true)
    }

    /// Releases `subscriber`. Equivalent to dropping it.
    pub fn detach(&self, subscriber: Subscriber) {
        drop(subscriber);
    }

    /// Latest authoritative state of `key`, without any optimistic overlay.
    pub fn current_snapshot(&self, key: &CollectionKey) -> SnapshotState {
        self.inner
            .lock()
            .entries
            .get(key)
            .map(|entry| entry.cache.state())
            .unwrap_or(SnapshotState::NotYetLoaded)
    }

    /// Registers `observer` on `subscriber`; it lives as long as the subscriber.
    pub fn on_update(&self, subscriber: &Subscriber, observer: SnapshotObserver) -> ObserverId {
        subscriber.on_update(observer)
    }

    /// Number of live subscribers for `key`.
    pub fn ref_count(&self, key: &CollectionKey) -> usize {
        self.inner
            .lock()
            .entries
            .get(key)
            .map(|entry| entry.subscribers.len())
            .unwrap_or(0)
    }

    pub fn is_upstream_open(&self, key: &CollectionKey) -> bool {
        self.inner
            .lock()
            .entries
            .get(key)
            .map(|entry| entry.upstream_open)
            .unwrap_or(false)
    }

    /// Keys that currently hold a cache, including ones inside their grace period.
    pub fn active_keys(&self) -> Vec<CollectionKey> {
        self.inner.lock().entries.keys().cloned().collect()
    }

    pub fn last_error(&self, key: &CollectionKey) -> Option<CollectionError> {
        self.inner
            .lock()
            .entries
            .get(key)
            .and_then(|entry| entry.last_error.clone())
    }
}

impl fmt::Debug for SubscriptionMultiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionMultiplexer")
            .field("settings", &self.inner.settings)
            .field("active_keys", &self.active_keys())
            .finish()
    }
}

impl MultiplexerInner {
    fn lock(&self) -> MutexGuard<'_, MultiplexerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn attach(self: &Arc<Self>, key: CollectionKey, optimistic: bool) -> Subscriber {
        let mut state = self.lock();
        state.next_subscriber += 1;
        let id = state.next_subscriber;

        let mut started = None;
        if !state.entries.contains_key(&key) {
            state.next_generation += 1;
            let generation = state.next_generation;
            let (control, receiver) = async_channel::unbounded();
            state.entries.insert(
                key.clone(),
                KeyEntry {
                    generation,
                    cache: SnapshotCache::new(key.clone()),
                    last_error: None,
                    upstream_open: false,
                    subscribers: BTreeMap::new(),
                    control,
                    close_ticket: None,
                },
            );
            started = Some((generation, receiver));
        }

        if let Some(entry) = state.entries.get_mut(&key) {
            if entry.close_ticket.take().is_some() {
                log::debug!("reusing upstream subscription for {key} within grace period");
            }
            entry.subscribers.insert(id, SubscriberSlot::new(optimistic));
        }
        drop(state);

        if let Some((generation, receiver)) = started {
            log::debug!("starting upstream subscription for {key}");
            let pump = Pump::new(
                Arc::downgrade(self),
                Arc::clone(&self.source),
                self.settings.backoff.clone(),
                key.clone(),
                generation,
                receiver,
            );
            runtime::spawn_detached(pump.run());
        }

        Subscriber {
            inner: Arc::clone(self),
            key,
            id,
        }
    }

    fn detach(self: &Arc<Self>, key: &CollectionKey, id: u64) {
        let mut state = self.lock();
        let Some(entry) = state.entries.get_mut(key) else {
            return;
        };
        let Some(slot) = entry.subscribers.remove(&id) else {
            return;
        };

        let mut closed = None;
        let mut ticket = None;
        if entry.subscribers.is_empty() {
            if self.settings.grace_period.is_zero() {
                closed = Self::close_entry(&mut state, key);
            } else {
                state.next_ticket += 1;
                let next = state.next_ticket;
                if let Some(entry) = state.entries.get_mut(key) {
                    entry.close_ticket = Some(next);
                }
                ticket = Some(next);
            }
        }
        // Observers may own other subscribers; drop them with the lock released.
        drop(state);
        drop(slot);
        drop(closed);

        if let Some(ticket) = ticket {
            let inner = Arc::downgrade(self);
            let key = key.clone();
            let grace_period = self.settings.grace_period;
            runtime::spawn_detached(async move {
                runtime::sleep(grace_period).await;
                if let Some(inner) = inner.upgrade() {
                    inner.close_if_idle(&key, ticket);
                }
            });
        }
    }

    fn close_if_idle(&self, key: &CollectionKey, ticket: u64) {
        let mut state = self.lock();
        let idle = state
            .entries
            .get(key)
            .map(|entry| entry.close_ticket == Some(ticket) && entry.subscribers.is_empty())
            .unwrap_or(false);
        let closed = if idle {
            Self::close_entry(&mut state, key)
        } else {
            None
        };
        drop(state);
        drop(closed);
    }

    fn close_entry(state: &mut MultiplexerState, key: &CollectionKey) -> Option<KeyEntry> {
        let entry = state.entries.remove(key)?;
        log::debug!(
            "closing upstream subscription for {key} at version {}",
            entry.cache.version()
        );
        let _ = entry.control.try_send(Control::Stop);
        Some(entry)
    }

    /// Runs `f` on the entry for `key` if it still belongs to `generation`.
    fn with_entry<R>(
        &self,
        key: &CollectionKey,
        generation: u64,
        f: impl FnOnce(&mut KeyEntry) -> R,
    ) -> Option<R> {
        let mut state = self.lock();
        state
            .entries
            .get_mut(key)
            .filter(|entry| entry.generation == generation)
            .map(f)
    }

    pub(crate) fn upstream_opened(&self, key: &CollectionKey, generation: u64) -> bool {
        self.with_entry(key, generation, |entry| entry.upstream_open = true)
            .is_some()
    }

    pub(crate) fn apply_upstream(
        &self,
        key: &CollectionKey,
        generation: u64,
        documents: Vec<Document>,
    ) -> bool {
        self.with_entry(key, generation, |entry| {
            let snapshot = entry.cache.replace(documents);
            log::debug!(
                "received {} documents for {key} at version {}",
                snapshot.len(),
                snapshot.version()
            );
            entry.last_error = None;
            entry.upstream_open = true;
            for slot in entry.subscribers.values_mut() {
                if let Some(overlay) = slot.overlay.as_mut() {
                    overlay.reconcile(&snapshot);
                }
                let view = slot.view_of(&snapshot);
                slot.notify_all(Delivery::Snapshot(view));
            }
        })
        .is_some()
    }

    pub(crate) fn fail_upstream(
        &self,
        key: &CollectionKey,
        generation: u64,
        error: CollectionError,
    ) -> bool {
        self.with_entry(key, generation, |entry| {
            log::warn!("upstream subscription for {key} failed: {error}");
            entry.cache.mark_stale();
            entry.upstream_open = false;
            entry.last_error = Some(error.clone());
            for slot in entry.subscribers.values_mut() {
                slot.notify_all(Delivery::Error(error.clone()));
            }
        })
        .is_some()
    }

    /// Delivers every queued notice for `key`. Must only be called by the pump.
    pub(crate) fn flush(&self, key: &CollectionKey, generation: u64) -> bool {
        let deliveries = self.with_entry(key, generation, |entry| {
            let mut deliveries = Vec::new();
            for slot in entry.subscribers.values_mut() {
                while let Some(notice) = slot.outbox.pop_front() {
                    for recipient in &notice.recipients {
                        if let Some(observer) = slot.observers.get(recipient) {
                            deliveries.push((observer.clone(), notice.delivery.clone()));
                        }
                    }
                }
            }
            deliveries
        });
        let Some(deliveries) = deliveries else {
            return false;
        };
        for (observer, delivery) in deliveries {
            match &delivery {
                Delivery::Snapshot(snapshot) => observer.notify_next(snapshot),
                Delivery::Error(error) => observer.notify_error(error),
                Delivery::MutationFailed(event) => observer.notify_mutation_failed(event),
            }
        }
        true
    }

    /// Runs `f` on a subscriber's slot and wakes the pump if notices were queued.
    fn with_slot<R>(
        &self,
        key: &CollectionKey,
        id: u64,
        f: impl FnOnce(&mut SubscriberSlot, &SnapshotCache) -> R,
    ) -> Option<R> {
        let mut state = self.lock();
        let entry = state.entries.get_mut(key)?;
        let slot = entry.subscribers.get_mut(&id)?;
        let result = f(slot, &entry.cache);
        if !slot.outbox.is_empty() {
            let _ = entry.control.try_send(Control::Flush);
        }
        Some(result)
    }
}

impl SubscriberSlot {
    fn new(optimistic: bool) -> Self {
        Self {
            overlay: optimistic.then(OptimisticOverlay::new),
            observers: BTreeMap::new(),
            next_observer: 0,
            outbox: VecDeque::new(),
        }
    }

    /// `snapshot` as this subscriber sees it, pending writes folded in.
    fn view_of(&self, snapshot: &Snapshot) -> Snapshot {
        match self.overlay.as_ref() {
            Some(overlay) if !overlay.is_empty() => {
                snapshot.with_documents(overlay.apply(snapshot), true)
            }
            _ => snapshot.clone(),
        }
    }

    fn notify_all(&mut self, delivery: Delivery) {
        if self.observers.is_empty() {
            return;
        }
        self.outbox.push_back(Notice {
            recipients: self.observers.keys().copied().collect(),
            delivery,
        });
    }

    fn notify_view(&mut self, cache: &SnapshotCache) {
        if let Some(snapshot) = cache.current() {
            let view = self.view_of(snapshot);
            self.notify_all(Delivery::Snapshot(view));
        }
    }
}

/// One consumer's interest in a collection key.
///
/// Released exactly once: on [`detach`](Self::detach) or when dropped.
pub struct Subscriber {
    inner: Arc<MultiplexerInner>,
    key: CollectionKey,
    id: u64,
}

impl Subscriber {
    pub fn key(&self) -> &CollectionKey {
        &self.key
    }

    pub fn has_overlay(&self) -> bool {
        self.inner
            .with_slot(&self.key, self.id, |slot, _| slot.overlay.is_some())
            .unwrap_or(false)
    }

    /// Latest authoritative state of this subscriber's key.
    pub fn current_snapshot(&self) -> SnapshotState {
        self.inner
            .with_slot(&self.key, self.id, |_, cache| cache.state())
            .unwrap_or(SnapshotState::NotYetLoaded)
    }

    /// Latest state with this subscriber's pending writes applied.
    pub fn view(&self) -> SnapshotState {
        self.inner
            .with_slot(&self.key, self.id, |slot, cache| {
                SnapshotState::from(cache.current().map(|snapshot| slot.view_of(snapshot)))
            })
            .unwrap_or(SnapshotState::NotYetLoaded)
    }

    pub fn last_error(&self) -> Option<CollectionError> {
        let state = self.inner.lock();
        state
            .entries
            .get(&self.key)
            .and_then(|entry| entry.last_error.clone())
    }

    pub fn pending_mutations(&self) -> usize {
        self.inner
            .with_slot(&self.key, self.id, |slot, _| {
                slot.overlay.as_ref().map(OptimisticOverlay::len).unwrap_or(0)
            })
            .unwrap_or(0)
    }

    /// Registers `observer` for every following version of this key.
    ///
    /// If a snapshot is already loaded the observer first receives the current
    /// view, followed by the outstanding upstream error if there is one.
    pub fn on_update(&self, observer: SnapshotObserver) -> ObserverId {
        let mut state = self.inner.lock();
        let Some(entry) = state.entries.get_mut(&self.key) else {
            return ObserverId(0);
        };
        let Some(slot) = entry.subscribers.get_mut(&self.id) else {
            return ObserverId(0);
        };
        slot.next_observer += 1;
        let id = slot.next_observer;
        slot.observers.insert(id, observer);

        if let Some(snapshot) = entry.cache.current() {
            let view = slot.view_of(snapshot);
            slot.outbox.push_back(Notice {
                recipients: vec![id],
                delivery: Delivery::Snapshot(view),
            });
        }
        if let Some(error) = entry.last_error.clone() {
            slot.outbox.push_back(Notice {
                recipients: vec![id],
                delivery: Delivery::Error(error),
            });
        }
        if !slot.outbox.is_empty() {
            let _ = entry.control.try_send(Control::Flush);
        }
        ObserverId(id)
    }

    pub fn remove_observer(&self, observer: ObserverId) -> bool {
        self.inner
            .with_slot(&self.key, self.id, |slot, _| {
                slot.observers.remove(&observer.0).is_some()
            })
            .unwrap_or(false)
    }

    /// Releases this subscriber now.
    pub fn detach(self) {
        drop(self);
    }

    /// Stages a pending write. `None` when this subscriber has no overlay.
    pub(crate) fn stage<F>(&self, stage: F) -> Option<MutationId>
    where
        F: FnOnce(&mut OptimisticOverlay, Option<&Snapshot>) -> MutationId,
    {
        self.inner
            .with_slot(&self.key, self.id, |slot, cache| {
                let overlay = slot.overlay.as_mut()?;
                let mutation = stage(overlay, cache.current());
                slot.notify_view(cache);
                Some(mutation)
            })
            .flatten()
    }

    pub(crate) fn acknowledge(&self, mutation: MutationId, confirmation: Confirmation) {
        self.inner.with_slot(&self.key, self.id, |slot, cache| {
            if let Some(overlay) = slot.overlay.as_mut() {
                overlay.acknowledge(mutation, confirmation, cache.current());
                slot.notify_view(cache);
            }
        });
    }

    /// Rolls back `mutation` and emits [`MutationFailed`] to this subscriber's observers.
    pub(crate) fn reject(&self, mutation: MutationId, error: CollectionError) {
        self.inner.with_slot(&self.key, self.id, |slot, cache| {
            let Some(pending) = slot.overlay.as_mut().and_then(|o| o.reject(mutation)) else {
                return;
            };
            slot.notify_view(cache);
            let target = (!pending.target().is_placeholder()).then(|| pending.target().clone());
            slot.notify_all(Delivery::MutationFailed(MutationFailed {
                kind: pending.kind(),
                target,
                payload: pending.payload().cloned(),
                error,
            }));
        });
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.inner.detach(&self.key, self.id);
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("key", &self.key)
            .field("id", &self.id)
            .finish()
    }
}

/// Weak handle the pump uses to reach shared state without keeping it alive.
pub(crate) type MultiplexerRef = Weak<MultiplexerInner>;
