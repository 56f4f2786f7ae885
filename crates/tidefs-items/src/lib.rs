#![forbid(unsafe_code)]
//! Transactional keyed metadata item store.
//!
//! Stands in for the mapping B-tree: fixed-size values addressed by
//! [`ItemKey`], with the same transactional visibility the rest of the core
//! relies on. Uncommitted changes live in a dirty overlay (values and
//! delete tombstones) above the stable map; commit folds the overlay down,
//! discard throws it away.
//!
//! Writers go through [`WriteCursor`], which is update-or-insert: an existing
//! value is copied into the overlay for in-place mutation, a missing one is
//! created zeroed and flagged `inserted` so error paths can take it back out
//! with [`WriteCursor::cancel_insert`]. The cursor holds the store lock, so a
//! read-modify-write of one item is atomic against other writers.

use parking_lot::{Mutex, MutexGuard};
use std::collections::BTreeMap;
use tidefs_error::{Result, TideError};
use tidefs_types::ItemKey;
use tracing::trace;

#[derive(Debug, Clone)]
enum DirtyItem {
    Present(Vec<u8>),
    Deleted,
}

#[derive(Debug, Default)]
struct StoreInner {
    stable: BTreeMap<ItemKey, Vec<u8>>,
    dirty: BTreeMap<ItemKey, DirtyItem>,
}

impl StoreInner {
    fn visible(&self, key: &ItemKey) -> Option<&[u8]> {
        match self.dirty.get(key) {
            Some(DirtyItem::Present(val)) => Some(val),
            Some(DirtyItem::Deleted) => None,
            None => self.stable.get(key).map(Vec::as_slice),
        }
    }
}

/// Keyed item store with dirty-overlay transaction semantics.
#[derive(Default)]
pub struct ItemStore {
    inner: Mutex<StoreInner>,
}

impl ItemStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the item visible to the current transaction.
    #[must_use]
    pub fn lookup(&self, key: &ItemKey) -> Option<Vec<u8>> {
        self.inner.lock().visible(key).map(<[u8]>::to_vec)
    }

    /// Open a writable cursor at `key`, creating a zeroed item of `len` bytes
    /// if none is visible. The cursor keeps the store locked until dropped.
    pub fn write(&self, key: ItemKey, len: usize) -> Result<WriteCursor<'_>> {
        let mut guard = self.inner.lock();

        let tombstoned = matches!(guard.dirty.get(&key), Some(DirtyItem::Deleted));
        let (inserted, value) = match guard.dirty.get(&key) {
            Some(DirtyItem::Present(val)) => {
                if val.len() != len {
                    return Err(TideError::Invalid("item length mismatch"));
                }
                (false, None)
            }
            Some(DirtyItem::Deleted) | None => {
                let existing = if tombstoned {
                    None
                } else {
                    guard.stable.get(&key).cloned()
                };
                match existing {
                    Some(val) => {
                        if val.len() != len {
                            return Err(TideError::Invalid("item length mismatch"));
                        }
                        (false, Some(val))
                    }
                    None => {
                        trace!(?key, len, "item_inserted");
                        (true, Some(vec![0u8; len]))
                    }
                }
            }
        };
        if let Some(val) = value {
            guard.dirty.insert(key, DirtyItem::Present(val));
        }

        Ok(WriteCursor {
            guard,
            key,
            inserted,
            tombstoned,
        })
    }

    /// Delete the item at `key` in the current transaction. Deleting an
    /// absent item is a no-op.
    pub fn delete(&self, key: &ItemKey) {
        let mut guard = self.inner.lock();
        if guard.stable.contains_key(key) {
            guard.dirty.insert(*key, DirtyItem::Deleted);
        } else {
            guard.dirty.remove(key);
        }
    }

    /// Fold the dirty overlay into the stable map.
    pub fn commit(&self) {
        let mut guard = self.inner.lock();
        let dirty = std::mem::take(&mut guard.dirty);
        for (key, item) in dirty {
            match item {
                DirtyItem::Present(val) => {
                    guard.stable.insert(key, val);
                }
                DirtyItem::Deleted => {
                    guard.stable.remove(&key);
                }
            }
        }
    }

    /// Throw the dirty overlay away (transaction abort).
    pub fn discard(&self) {
        self.inner.lock().dirty.clear();
    }

    /// Number of staged (uncommitted) entries.
    #[must_use]
    pub fn dirty_len(&self) -> usize {
        self.inner.lock().dirty.len()
    }
}

/// Writable view of one item; holds the store lock.
pub struct WriteCursor<'a> {
    guard: MutexGuard<'a, StoreInner>,
    key: ItemKey,
    inserted: bool,
    tombstoned: bool,
}

impl WriteCursor<'_> {
    /// Whether this cursor created the item.
    #[must_use]
    pub fn inserted(&self) -> bool {
        self.inserted
    }

    #[must_use]
    pub fn value(&self) -> &[u8] {
        match self.guard.dirty.get(&self.key) {
            Some(DirtyItem::Present(val)) => val,
            // The cursor placed a Present entry at construction and is the
            // only writer while it holds the lock.
            _ => unreachable!("cursor item vanished"),
        }
    }

    pub fn value_mut(&mut self) -> &mut [u8] {
        match self.guard.dirty.get_mut(&self.key) {
            Some(DirtyItem::Present(val)) => val,
            _ => unreachable!("cursor item vanished"),
        }
    }

    /// Remove the item this cursor inserted; the error-path counterpart of a
    /// successful update. Must not be called for a pre-existing item. A
    /// delete staged earlier in the transaction stays staged.
    pub fn cancel_insert(mut self) {
        assert!(self.inserted, "cancel_insert of a pre-existing item");
        if self.tombstoned {
            self.guard.dirty.insert(self.key, DirtyItem::Deleted);
        } else {
            self.guard.dirty.remove(&self.key);
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tidefs_types::{InodeNumber, ItemKey};

    fn key(offset: u64) -> ItemKey {
        ItemKey::bmap(InodeNumber(5), offset << 4)
    }

    #[test]
    fn lookup_missing_is_none() {
        let store = ItemStore::new();
        assert_eq!(store.lookup(&key(0)), None);
    }

    #[test]
    fn write_inserts_zeroed_item() {
        let store = ItemStore::new();
        let curs = store.write(key(0), 16).unwrap();
        assert!(curs.inserted());
        assert_eq!(curs.value(), &[0u8; 16]);
        drop(curs);

        assert_eq!(store.lookup(&key(0)), Some(vec![0u8; 16]));
    }

    #[test]
    fn write_updates_existing_item() {
        let store = ItemStore::new();
        let mut curs = store.write(key(0), 4).unwrap();
        curs.value_mut()[0] = 9;
        drop(curs);
        store.commit();

        let curs = store.write(key(0), 4).unwrap();
        assert!(!curs.inserted());
        assert_eq!(curs.value()[0], 9);
    }

    #[test]
    fn cancel_insert_removes_item() {
        let store = ItemStore::new();
        let curs = store.write(key(0), 8).unwrap();
        assert!(curs.inserted());
        curs.cancel_insert();
        assert_eq!(store.lookup(&key(0)), None);
        assert_eq!(store.dirty_len(), 0);
    }

    #[test]
    fn update_of_committed_item_is_not_inserted() {
        let store = ItemStore::new();
        drop(store.write(key(0), 8).unwrap());
        store.commit();

        let curs = store.write(key(0), 8).unwrap();
        assert!(!curs.inserted());
    }

    #[test]
    fn discard_reverts_to_stable() {
        let store = ItemStore::new();
        let mut curs = store.write(key(0), 4).unwrap();
        curs.value_mut()[0] = 1;
        drop(curs);
        store.commit();

        let mut curs = store.write(key(0), 4).unwrap();
        curs.value_mut()[0] = 2;
        drop(curs);
        store.delete(&key(1));
        store.discard();

        assert_eq!(store.lookup(&key(0)), Some(vec![1, 0, 0, 0]));
    }

    #[test]
    fn delete_tombstones_stable_item() {
        let store = ItemStore::new();
        drop(store.write(key(0), 4).unwrap());
        store.commit();

        store.delete(&key(0));
        assert_eq!(store.lookup(&key(0)), None);
        store.commit();
        assert_eq!(store.lookup(&key(0)), None);
    }

    #[test]
    fn cancel_insert_after_delete_keeps_the_delete() {
        let store = ItemStore::new();
        drop(store.write(key(0), 4).unwrap());
        store.commit();

        store.delete(&key(0));
        let curs = store.write(key(0), 4).unwrap();
        assert!(curs.inserted());
        curs.cancel_insert();

        // The staged delete survives the aborted insert.
        assert_eq!(store.lookup(&key(0)), None);
        store.commit();
        assert_eq!(store.lookup(&key(0)), None);
    }

    #[test]
    fn length_mismatch_is_invalid() {
        let store = ItemStore::new();
        drop(store.write(key(0), 8).unwrap());
        assert!(store.write(key(0), 16).is_err());
    }
}
