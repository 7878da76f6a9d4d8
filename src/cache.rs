use std::fmt::{self, Debug, Formatter};
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::entry::{Completer, Status, SubscriptionId, TransformResult};
use crate::error::TransformError;

/// The outcome of [`MemoCache::lookup_or_create`].
pub enum Lookup<K, Out: Clone> {
    /// The key was not present. The caller now owns the computation for it
    /// and must settle the entry through the completer.
    Created(Completer<K, Out>),
    /// The key was present. The entry may still be pending.
    Existing(Arc<TransformResult<K, Out>>),
}

impl<K, Out: Clone> Lookup<K, Out> {
    /// Whether this call created the entry.
    pub fn is_new(&self) -> bool {
        matches!(self, Self::Created(_))
    }

    /// The entry, regardless of who created it.
    pub fn entry(&self) -> &Arc<TransformResult<K, Out>> {
        match self {
            Self::Created(completer) => completer.entry(),
            Self::Existing(entry) => entry,
        }
    }
}

impl<K: Debug, Out: Clone> Debug for Lookup<K, Out> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Created(completer) => f.debug_tuple("Created").field(completer).finish(),
            Self::Existing(entry) => f.debug_tuple("Existing").field(entry).finish(),
        }
    }
}

/// Deduplicates transformation work by key.
///
/// Every key maps to exactly one [`TransformResult`] for as long as the entry
/// lives in the cache. The first caller for a key receives the completer and
/// thereby the sole right to compute; everybody else attaches to the entry.
pub struct MemoCache<K, Out> {
    map: Mutex<FxHashMap<K, Arc<TransformResult<K, Out>>>>,
}

impl<K, Out> MemoCache<K, Out> {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self { map: Mutex::new(FxHashMap::default()) }
    }

    /// The number of entries, pending ones included.
    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }

    /// Evict terminal entries whose age is larger than `max_age`.
    ///
    /// The age of an entry grows by one during each eviction and is reset to
    /// zero when a lookup finds it. Set `max_age` to zero to drop every
    /// terminal entry that was not looked up since the last eviction. Pending
    /// entries are never evicted: their computation still owns them, and
    /// evicting them would let a second computation for the same key start.
    pub fn evict(&self, max_age: usize) {
        let mut map = self.map.lock();
        let before = map.len();
        map.retain(|_, entry| {
            if !entry.status().is_terminal() {
                return true;
            }
            entry.grow_older() <= max_age
        });
        tracing::debug!(max_age, evicted = before - map.len(), "evicted memo cache");
    }
}

impl<K, Out> MemoCache<K, Out>
where
    K: Hash + Eq + Clone,
    Out: Clone,
{
    /// Return the entry for `key`, creating a pending one if there is none.
    ///
    /// The check and the insertion happen in one critical section, so among
    /// any number of concurrent callers with the same key exactly one observes
    /// [`Lookup::Created`].
    pub fn lookup_or_create(&self, key: K, raw: &str) -> Lookup<K, Out> {
        let mut map = self.map.lock();
        if let Some(entry) = map.get(&key) {
            entry.touch();

            #[cfg(feature = "testing")]
            crate::testing::register(if entry.status() == Status::Pending {
                crate::testing::Outcome::Attached
            } else {
                crate::testing::Outcome::Hit
            });

            return Lookup::Existing(entry.clone());
        }

        let entry = Arc::new(TransformResult::new(key.clone(), raw.to_owned()));
        map.insert(key, entry.clone());
        drop(map);

        #[cfg(feature = "testing")]
        crate::testing::register(crate::testing::Outcome::Miss);

        Lookup::Created(Completer::new(entry))
    }

    /// Create an entry that is never stored in the cache.
    ///
    /// Used when memoization is disabled: the caller computes as usual, but no
    /// later lookup will find the result.
    pub fn detached(&self, key: K, raw: &str) -> Completer<K, Out> {
        #[cfg(feature = "testing")]
        crate::testing::register(crate::testing::Outcome::Miss);

        Completer::new(Arc::new(TransformResult::new(key, raw.to_owned())))
    }

    /// Register callbacks for when `entry` settles.
    ///
    /// See [`TransformResult::subscribe`].
    pub fn subscribe<R, F>(
        &self,
        entry: &TransformResult<K, Out>,
        on_ready: R,
        on_failed: F,
    ) -> Option<SubscriptionId>
    where
        R: FnOnce(&Out) + Send + 'static,
        F: FnOnce(&TransformError) + Send + 'static,
    {
        entry.subscribe(on_ready, on_failed)
    }

    /// The entry for `key`, if there is one. Does not count as a use.
    pub fn peek(&self, key: &K) -> Option<Arc<TransformResult<K, Out>>> {
        self.map.lock().get(key).cloned()
    }

    /// The status of the entry for `key`, if there is one.
    pub fn status(&self, key: &K) -> Option<Status> {
        self.peek(key).map(|entry| entry.status())
    }
}

impl<K, Out> Default for MemoCache<K, Out> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, Out> Debug for MemoCache<K, Out> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("MemoCache").field("len", &self.len()).finish()
    }
}
