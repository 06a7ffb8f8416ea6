//! Per-item advisory locks.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

#[derive(Debug)]
struct LockEntry {
    mutex: Arc<Mutex<()>>,
    holder: Option<Uuid>,
}

impl LockEntry {
    fn new() -> Self {
        Self {
            mutex: Arc::new(Mutex::new(())),
            holder: None,
        }
    }
}

/// Serializes read-modify-write of a single item's records.
///
/// Cross-item work takes no shared lock; each item id maps to its own
/// async mutex, created on first use and dropped with its last guard.
/// Clones share one table. A view made with [`ItemLocks::scoped`] tags
/// the guards it hands out with an owner, so one execution can give up
/// its locks without touching those of another.
#[derive(Debug, Clone, Default)]
pub struct ItemLocks {
    table: Arc<DashMap<String, LockEntry>>,
    owner: Option<Uuid>,
}

impl ItemLocks {
    /// Creates an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A view over the same table whose guards belong to `owner`.
    #[must_use]
    pub fn scoped(&self, owner: Uuid) -> Self {
        Self {
            table: Arc::clone(&self.table),
            owner: Some(owner),
        }
    }

    /// Owner of the guards this view hands out.
    #[must_use]
    pub fn owner(&self) -> Option<Uuid> {
        self.owner
    }

    /// Waits for and takes the lock for `item_id`.
    pub async fn acquire(&self, item_id: &str) -> ItemGuard {
        loop {
            let mutex = Arc::clone(
                &self
                    .table
                    .entry(item_id.to_string())
                    .or_insert_with(LockEntry::new)
                    .mutex,
            );
            let guard = Arc::clone(&mutex).lock_owned().await;

            // A release may have retired this mutex while we waited.
            if let Some(mut entry) = self.table.get_mut(item_id) {
                if Arc::ptr_eq(&entry.mutex, &mutex) {
                    entry.holder = self.owner;
                    drop(entry);
                    return ItemGuard {
                        table: Arc::clone(&self.table),
                        item_id: item_id.to_string(),
                        mutex,
                        guard: Some(guard),
                    };
                }
            }
        }
    }

    /// Number of locks currently held.
    #[must_use]
    pub fn held(&self) -> usize {
        self.table
            .iter()
            .filter(|entry| entry.value().mutex.try_lock().is_err())
            .count()
    }

    /// Number of item ids with a live lock entry.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Returns true when no item has a live lock entry.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Retires the locks this view holds, returning how many.
    ///
    /// A scoped view retires only its owner's locks; an unscoped view
    /// retires every held lock. Guards already handed out stay valid, but
    /// later acquirers get a fresh mutex, so a cancelled holder can never
    /// wedge an item.
    pub fn release_all(&self) -> usize {
        let mut released = 0;
        self.table.retain(|_, entry| {
            let retire = match self.owner {
                Some(owner) => entry.holder == Some(owner),
                None => entry.mutex.try_lock().is_err(),
            };
            if retire {
                released += 1;
            }
            !retire
        });
        released
    }
}

/// Holds one item's lock; the table entry goes away with the last user.
#[derive(Debug)]
pub struct ItemGuard {
    table: Arc<DashMap<String, LockEntry>>,
    item_id: String,
    mutex: Arc<Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ItemGuard {
    fn drop(&mut self) {
        self.guard.take();
        if let Some(mut entry) = self.table.get_mut(&self.item_id) {
            if Arc::ptr_eq(&entry.mutex, &self.mutex) {
                entry.holder = None;
            }
        }
        // The table and this guard are the only references left.
        self.table.remove_if(&self.item_id, |_, entry| {
            Arc::ptr_eq(&entry.mutex, &self.mutex) && Arc::strong_count(&self.mutex) == 2
        });
    }
}
