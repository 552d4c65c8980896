use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::trace;

/// An operation whose completion waits on some condition or a deadline.
///
/// `force_complete` is at-most-once: the atomic completed flag decides a
/// single winner among concurrent condition triggers and the expiration
/// sweep, and only the winner runs `on_complete`.
pub trait DelayedOperation: Send + Sync {
    /// The operation's completion flag; stored by the implementor so the
    /// default methods below can guard it.
    fn completed_flag(&self) -> &AtomicBool;

    /// Check the completion condition; when satisfied, the implementation
    /// must call `force_complete` and return its result.
    fn try_complete(&self) -> bool;

    /// Runs exactly once, from whichever caller wins `force_complete`.
    fn on_complete(&self);

    /// Extra bookkeeping when completion happened via the deadline.
    fn on_expiration(&self) {}

    fn is_completed(&self) -> bool {
        self.completed_flag().load(Ordering::SeqCst)
    }

    fn force_complete(&self) -> bool {
        if self
            .completed_flag()
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.on_complete();
            true
        } else {
            false
        }
    }
}

struct ExpiryEntry {
    deadline_ms: i64,
    seq: u64,
    operation: Arc<dyn DelayedOperation>,
}

impl PartialEq for ExpiryEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline_ms == other.deadline_ms && self.seq == other.seq
    }
}

impl Eq for ExpiryEntry {}

impl PartialOrd for ExpiryEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for ExpiryEntry {
    // Reversed so the binary heap pops the nearest deadline first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline_ms
            .cmp(&self.deadline_ms)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Holds delayed operations until their condition fires or their deadline
/// passes: a time-ordered heap for expiration plus per-key watcher lists
/// that interested events poke through `check_and_complete`.
///
/// The expiration sweep is pulled, not pushed: an external timer calls
/// `poll_expired` with the current time.
pub struct Purgatory<K> {
    watchers: Mutex<HashMap<K, Vec<Arc<dyn DelayedOperation>>>>,
    expiry: Mutex<BinaryHeap<ExpiryEntry>>,
    seq: AtomicU64,
}

impl<K> Default for Purgatory<K> {
    fn default() -> Self {
        Self {
            watchers: Mutex::new(HashMap::new()),
            expiry: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
        }
    }
}

impl<K: Clone + Eq + Hash> Purgatory<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to complete the operation now; if it cannot, watch it under each
    /// key and schedule its deadline. Returns whether it completed here.
    pub fn try_complete_else_watch(
        &self,
        operation: Arc<dyn DelayedOperation>,
        deadline_ms: i64,
        watch_keys: &[K],
    ) -> bool {
        if operation.try_complete() {
            return true;
        }

        {
            let mut watchers = self.lock_watchers();
            for key in watch_keys {
                watchers
                    .entry(key.clone())
                    .or_default()
                    .push(Arc::clone(&operation));
            }
        }

        // The condition may have fired between the first check and the
        // watcher registration; without this re-check the operation could
        // hang until its deadline.
        if operation.try_complete() {
            return true;
        }

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.expiry
            .lock()
            .expect("purgatory expiry lock poisoned")
            .push(ExpiryEntry {
                deadline_ms,
                seq,
                operation,
            });
        false
    }

    /// An event happened on `key`: re-check every operation watching it.
    /// Returns the number completed by this call.
    pub fn check_and_complete(&self, key: &K) -> usize {
        let watched: Vec<Arc<dyn DelayedOperation>> = self
            .lock_watchers()
            .get(key)
            .cloned()
            .unwrap_or_default();

        let mut completed = 0;
        for operation in watched {
            if !operation.is_completed() && operation.try_complete() {
                completed += 1;
            }
        }

        self.purge_completed(key);
        completed
    }

    /// Force-complete every operation whose deadline has passed. Returns
    /// the number that expired here.
    pub fn poll_expired(&self, now_ms: i64) -> usize {
        let mut due = Vec::new();
        {
            let mut expiry = self.expiry.lock().expect("purgatory expiry lock poisoned");
            while let Some(top) = expiry.peek() {
                if top.deadline_ms > now_ms {
                    break;
                }
                due.push(expiry.pop().expect("peeked entry exists"));
            }
        }

        let mut expired = 0;
        for entry in due {
            if entry.operation.force_complete() {
                entry.operation.on_expiration();
                expired += 1;
                trace!(deadline_ms = entry.deadline_ms, "delayed operation expired");
            }
        }
        expired
    }

    /// Total operations still registered in watcher lists (completed ones
    /// included until the next purge touches their key).
    pub fn watched(&self) -> usize {
        self.lock_watchers().values().map(Vec::len).sum()
    }

    /// Operations still holding a scheduled deadline.
    pub fn delayed(&self) -> usize {
        self.expiry
            .lock()
            .expect("purgatory expiry lock poisoned")
            .len()
    }

    fn purge_completed(&self, key: &K) {
        let mut watchers = self.lock_watchers();
        if let Some(list) = watchers.get_mut(key) {
            list.retain(|operation| !operation.is_completed());
            if list.is_empty() {
                watchers.remove(key);
            }
        }
    }

    fn lock_watchers(&self) -> MutexGuard<'_, HashMap<K, Vec<Arc<dyn DelayedOperation>>>> {
        self.watchers.lock().expect("purgatory watchers lock poisoned")
    }
}
