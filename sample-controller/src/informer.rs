//! Informer style notifications on top of a watcher and a reflector store
//!
//! A [`watcher`] only tells us that an object was applied or deleted. The event handlers of a
//! controller want to know more: whether an applied object is new or replaces an older version,
//! and which objects disappeared while the watch was being re-listed. [`Informer`] derives that
//! from the [`Store`] it keeps up to date, and periodically replays every cached object so
//! that level-triggered handlers get a chance to converge.
use std::{collections::HashSet, fmt::Debug, hash::Hash, sync::Arc, time::Duration};

use futures::StreamExt;
use kube::{
    runtime::{
        reflector::{store::Writer, ObjectRef, Store},
        watcher, WatchStreamExt,
    },
    Api, Resource,
};
use serde::de::DeserializeOwned;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How often every cached object is replayed as an update
pub const RESYNC_PERIOD: Duration = Duration::from_secs(30);

/// A change to the cache as seen by an event handler
#[derive(Debug)]
pub enum Notification<K> {
    /// The object was not cached before
    Added(Arc<K>),
    /// The object replaced a cached version, `old` and `new` are identical on resync
    Updated {
        /// Version that was cached before
        old: Arc<K>,
        /// Version now in the cache
        new: Arc<K>,
    },
    /// The object left the cache
    Deleted(DeletedObject<K>),
}

/// The last known state of a deleted object
#[derive(Debug)]
pub enum DeletedObject<K> {
    /// Final state, as delivered by a delete event
    Live(Arc<K>),
    /// The deletion was only noticed on a re-list, so the object may have changed
    /// before it was deleted
    Tombstone(Arc<K>),
}

impl<K> DeletedObject<K> {
    /// The last known object, whether final or not
    pub fn into_inner(self) -> Arc<K> {
        match self {
            DeletedObject::Live(obj) | DeletedObject::Tombstone(obj) => obj,
        }
    }
}

impl<K> Notification<K> {
    /// The most recent object carried by the notification
    pub fn into_latest(self) -> Arc<K> {
        match self {
            Notification::Added(obj) | Notification::Updated { new: obj, .. } => obj,
            Notification::Deleted(deleted) => deleted.into_inner(),
        }
    }
}

/// A reflector that reports informer notifications for every event it applies
pub struct Informer<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    writer: Writer<K>,
    store: Store<K>,
    relist: Option<Relist<K>>,
    resync_period: Duration,
}

/// Progress of a re-list the writer is still buffering
struct Relist<K>
where
    K: Resource,
    K::DynamicType: Eq + Hash,
{
    seen: HashSet<ObjectRef<K>>,
    pending: Vec<Notification<K>>,
}

impl<K> Default for Relist<K>
where
    K: Resource,
    K::DynamicType: Eq + Hash,
{
    fn default() -> Self {
        Self {
            seen: HashSet::new(),
            pending: Vec::new(),
        }
    }
}

impl<K> Default for Informer<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new(RESYNC_PERIOD)
    }
}

impl<K> Informer<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    /// Create an informer with an empty cache
    pub fn new(resync_period: Duration) -> Self {
        let writer = Writer::default();
        let store = writer.as_reader();
        Self {
            writer,
            store,
            relist: None,
            resync_period,
        }
    }

    /// A read handle to the cache, ready once the first list has completed
    pub fn store(&self) -> Store<K> {
        self.store.clone()
    }

    /// Apply a watcher event to the cache and describe what changed
    ///
    /// The returned notifications are only valid once the store reflects them, so objects
    /// of a re-list are reported together when the re-list completes.
    pub fn apply(&mut self, event: watcher::Event<K>) -> Vec<Notification<K>> {
        let mut notifications = Vec::new();
        match &event {
            watcher::Event::Apply(obj) => notifications.push(self.observe(obj)),
            watcher::Event::Delete(obj) => {
                notifications.push(Notification::Deleted(DeletedObject::Live(Arc::new(obj.clone()))));
            }
            watcher::Event::Init => self.relist = Some(Relist::default()),
            watcher::Event::InitApply(obj) => {
                // the writer buffers a re-list, so the store still shows the previous state
                let notification = self.observe(obj);
                let relist = self.relist.get_or_insert_with(Relist::default);
                relist.seen.insert(ObjectRef::from_obj(obj));
                relist.pending.push(notification);
            }
            watcher::Event::InitDone => {
                let Relist { seen, pending } = self.relist.take().unwrap_or_default();
                notifications = pending;
                notifications.extend(
                    self.store
                        .state()
                        .into_iter()
                        .filter(|obj| !seen.contains(&ObjectRef::from_obj(obj.as_ref())))
                        .map(|obj| Notification::Deleted(DeletedObject::Tombstone(obj))),
                );
            }
        }
        self.writer.apply_watcher_event(&event);
        notifications
    }

    /// Replay every cached object as an update to itself
    pub fn resync(&self) -> Vec<Notification<K>> {
        self.store
            .state()
            .into_iter()
            .map(|obj| Notification::Updated {
                old: obj.clone(),
                new: obj,
            })
            .collect()
    }

    fn observe(&self, obj: &K) -> Notification<K> {
        let new = Arc::new(obj.clone());
        match self.store.get(&ObjectRef::from_obj(obj)) {
            Some(old) => Notification::Updated { old, new },
            None => Notification::Added(new),
        }
    }
}

impl<K> Informer<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone + Send + Sync,
{
    /// Watch `api` and feed notifications to `handler` until `shutdown` is cancelled
    ///
    /// Watch failures are retried with the default backoff of the kube runtime.
    pub async fn run<F>(mut self, api: Api<K>, config: watcher::Config, shutdown: CancellationToken, mut handler: F)
    where
        F: FnMut(Notification<K>) + Send,
    {
        let kind = K::kind(&Default::default()).to_string();
        let mut events = watcher(api, config).default_backoff().boxed();
        let mut resync = time::interval_at(Instant::now() + self.resync_period, self.resync_period);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                event = events.next() => match event {
                    Some(Ok(event)) => self.apply(event).into_iter().for_each(&mut handler),
                    Some(Err(error)) => warn!(%error, %kind, "watch failed, retrying"),
                    None => break,
                },
                _ = resync.tick() => {
                    debug!(%kind, "resyncing cache");
                    self.resync().into_iter().for_each(&mut handler);
                }
            }
        }
        debug!(%kind, "informer stopped");
    }
}
