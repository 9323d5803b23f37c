use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crossbeam_channel::Sender;

use crate::core::candidate::Candidate;

/// Change notifications, delivered after the membership lock is released.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    NewStructureAdded(Arc<Structure>),
    StructureCountChanged(usize),
}

/// A candidate plus its own readers-writer lock. The store's lock guards
/// membership only; field access always goes through this lock.
///
/// Callers acquiring several candidate locks take them in ascending
/// `index` order.
#[derive(Debug)]
pub struct Structure {
    data: RwLock<Candidate>,
}

impl Structure {
    pub fn new(candidate: Candidate) -> Arc<Self> {
        Arc::new(Self { data: RwLock::new(candidate) })
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Candidate> {
        self.data.read().unwrap()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Candidate> {
        self.data.write().unwrap()
    }
}

/// The authoritative registry of every candidate in the session.
pub struct Tracker {
    list: RwLock<Vec<Arc<Structure>>>,
    next_index: AtomicUsize,
    events: Sender<StoreEvent>,
}

impl Tracker {
    pub fn new(events: Sender<StoreEvent>) -> Self {
        Self {
            list: RwLock::new(Vec::new()),
            next_index: AtomicUsize::new(0),
            events,
        }
    }

    /// Publishes a new candidate, assigning its insertion ordinal.
    /// Returns false when the exact structure is already present.
    pub fn append(&self, s: Arc<Structure>) -> bool {
        let guard = s.write();
        self.append_and_unlock(&s, guard)
    }

    /// Variant taking the candidate's held write guard, releasing it
    /// atomically with insertion. Safe against the lock-order rule because
    /// an unpublished candidate is reachable only by the appending thread.
    pub fn append_and_unlock(
        &self,
        s: &Arc<Structure>,
        mut guard: RwLockWriteGuard<'_, Candidate>,
    ) -> bool {
        let count;
        {
            let mut list = self.list.write().unwrap();
            if list.iter().any(|e| Arc::ptr_eq(e, s)) {
                return false;
            }
            guard.index = self.next_index.fetch_add(1, Ordering::SeqCst);
            list.push(Arc::clone(s));
            count = list.len();
        }
        drop(guard);
        let _ = self.events.send(StoreEvent::NewStructureAdded(Arc::clone(s)));
        let _ = self.events.send(StoreEvent::StructureCountChanged(count));
        true
    }

    /// Dequeues the oldest still-present candidate.
    pub fn pop_first(&self) -> Option<Arc<Structure>> {
        let (s, count) = {
            let mut list = self.list.write().unwrap();
            if list.is_empty() {
                return None;
            }
            (list.remove(0), list.len())
        };
        let _ = self.events.send(StoreEvent::StructureCountChanged(count));
        Some(s)
    }

    pub fn remove(&self, s: &Arc<Structure>) -> bool {
        let removed;
        let count;
        {
            let mut list = self.list.write().unwrap();
            let before = list.len();
            list.retain(|e| !Arc::ptr_eq(e, s));
            removed = list.len() != before;
            count = list.len();
        }
        if removed {
            let _ = self.events.send(StoreEvent::StructureCountChanged(count));
        }
        removed
    }

    pub fn contains(&self, s: &Arc<Structure>) -> bool {
        self.list.read().unwrap().iter().any(|e| Arc::ptr_eq(e, s))
    }

    pub fn size(&self) -> usize {
        self.list.read().unwrap().len()
    }

    pub fn at(&self, i: usize) -> Option<Arc<Structure>> {
        self.list.read().unwrap().get(i).cloned()
    }

    /// Snapshot of the membership in insertion order.
    pub fn list(&self) -> Vec<Arc<Structure>> {
        self.list.read().unwrap().clone()
    }

    /// The store's own coarse lock, for callers that need a consistent
    /// view across several operations. Dropping the guard unlocks.
    pub fn lock_for_read(&self) -> RwLockReadGuard<'_, Vec<Arc<Structure>>> {
        self.list.read().unwrap()
    }

    pub fn lock_for_write(&self) -> RwLockWriteGuard<'_, Vec<Arc<Structure>>> {
        self.list.write().unwrap()
    }

    /// Empties the membership list. Callers holding Arcs keep their
    /// candidates alive; the index counter restarts at zero.
    pub fn reset(&self) {
        {
            let mut list = self.list.write().unwrap();
            list.clear();
        }
        self.next_index.store(0, Ordering::SeqCst);
        let _ = self.events.send(StoreEvent::StructureCountChanged(0));
    }

    /// Disowns and destroys every candidate the store still owns.
    pub fn delete_all_structures(&self) {
        self.reset();
    }
}
