//! Fiber-local storage: keys, key tables and the key table pool
//!
//! A `FiberKey` names one slot in every `KeyTable`. Keys carry a version
//! so that a deleted key's leftover values are never returned for a key
//! created later in the same slot. The destructor registered with a key
//! runs over each populated slot when the owning fiber exits, before its
//! table goes back to a `KeytablePool` for the next fiber.

use crate::error::{FiberError, FiberResult};
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Maximum number of live keys
pub const KEYS_MAX: usize = 992;

/// Destructor invoked with the value left in a slot on fiber exit
pub type KeyDestructor = Arc<dyn Fn(Box<dyn Any + Send>) + Send + Sync>;

/// Handle to one fiber-local slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiberKey {
    index: u32,
    version: u32,
}

impl FiberKey {
    #[inline]
    pub fn index(&self) -> usize {
        self.index as usize
    }

    #[inline]
    pub fn version(&self) -> u32 {
        self.version
    }
}

struct KeyInfo {
    version: u32,
    in_use: bool,
    dtor: Option<KeyDestructor>,
}

struct KeyRegistry {
    infos: Vec<KeyInfo>,
    free: Vec<u32>,
}

static REGISTRY: Mutex<KeyRegistry> = parking_lot::const_mutex(KeyRegistry {
    infos: Vec::new(),
    free: Vec::new(),
});

/// Register a new key. `dtor` is called on fiber exit for every non-empty
/// slot of this key; without one the value is simply dropped.
pub fn key_create(dtor: Option<KeyDestructor>) -> FiberResult<FiberKey> {
    let mut reg = REGISTRY.lock();
    if let Some(index) = reg.free.pop() {
        let info = &mut reg.infos[index as usize];
        info.in_use = true;
        info.dtor = dtor;
        return Ok(FiberKey { index, version: info.version });
    }
    if reg.infos.len() >= KEYS_MAX {
        return Err(FiberError::ResourceExhausted("fiber keys"));
    }
    let index = reg.infos.len() as u32;
    reg.infos.push(KeyInfo { version: 1, in_use: true, dtor });
    Ok(FiberKey { index, version: 1 })
}

/// Retire a key. Values still stored under it are dropped (without the
/// destructor) when their tables are released.
pub fn key_delete(key: FiberKey) -> FiberResult<()> {
    let mut reg = REGISTRY.lock();
    let info = reg
        .infos
        .get_mut(key.index())
        .filter(|i| i.in_use && i.version == key.version)
        .ok_or(FiberError::InvalidArgument("stale or unknown fiber key"))?;
    info.in_use = false;
    info.dtor = None;
    info.version = crate::id::next_version(info.version);
    reg.free.push(key.index);
    Ok(())
}

fn key_is_live(key: FiberKey) -> bool {
    let reg = REGISTRY.lock();
    reg.infos
        .get(key.index())
        .map(|i| i.in_use && i.version == key.version)
        .unwrap_or(false)
}

/// Destructor of a slot if its key is still the one the value was stored under
fn destructor_for(index: usize, version: u32) -> Option<KeyDestructor> {
    let reg = REGISTRY.lock();
    reg.infos
        .get(index)
        .filter(|i| i.in_use && i.version == version)
        .and_then(|i| i.dtor.clone())
}

struct KeySlot {
    version: u32,
    value: Box<dyn Any + Send>,
}

/// Slot array holding one fiber's local values
#[derive(Default)]
pub struct KeyTable {
    slots: Vec<Option<KeySlot>>,
}

impl KeyTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` under `key`, returning the value it replaces.
    pub fn set(
        &mut self,
        key: FiberKey,
        value: Box<dyn Any + Send>,
    ) -> FiberResult<Option<Box<dyn Any + Send>>> {
        if !key_is_live(key) {
            return Err(FiberError::InvalidArgument("stale or unknown fiber key"));
        }
        let index = key.index();
        if index >= self.slots.len() {
            self.slots.resize_with(index + 1, || None);
        }
        let old = self.slots[index].replace(KeySlot { version: key.version, value });
        Ok(old.filter(|s| s.version == key.version).map(|s| s.value))
    }

    pub fn get_mut(&mut self, key: FiberKey) -> Option<&mut (dyn Any + Send)> {
        match self.slots.get_mut(key.index()) {
            Some(Some(slot)) if slot.version == key.version => Some(slot.value.as_mut()),
            _ => None,
        }
    }

    pub fn take(&mut self, key: FiberKey) -> Option<Box<dyn Any + Send>> {
        let slot = self.slots.get_mut(key.index())?;
        if slot.as_ref().is_some_and(|s| s.version == key.version) {
            slot.take().map(|s| s.value)
        } else {
            None
        }
    }

    /// Number of populated slots
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empty every slot, handing each value to its key's destructor.
    pub fn run_destructors_on_release(&mut self) {
        for index in 0..self.slots.len() {
            if let Some(slot) = self.slots[index].take() {
                match destructor_for(index, slot.version) {
                    Some(dtor) => dtor(slot.value),
                    None => drop(slot.value),
                }
            }
        }
    }
}

impl Drop for KeyTable {
    fn drop(&mut self) {
        self.run_destructors_on_release();
    }
}

impl fmt::Debug for KeyTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyTable").field("len", &self.len()).finish()
    }
}

struct PoolInner {
    free: Vec<Box<KeyTable>>,
    destroyed: bool,
}

/// Recycles key tables between fibers of one runtime
pub struct KeytablePool {
    inner: Mutex<PoolInner>,
}

impl KeytablePool {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PoolInner { free: Vec::new(), destroyed: false }),
        }
    }

    /// Take an empty table, allocating one when the pool is dry.
    pub fn borrow_table(&self) -> Box<KeyTable> {
        self.inner
            .lock()
            .free
            .pop()
            .unwrap_or_else(|| Box::new(KeyTable::new()))
    }

    /// Run destructors on `table`, then keep it for reuse.
    pub fn return_keytable(&self, mut table: Box<KeyTable>) {
        table.run_destructors_on_release();
        let mut inner = self.inner.lock();
        if !inner.destroyed {
            inner.free.push(table);
        }
    }

    /// Release cached tables. Tables returned afterwards are freed.
    pub fn destroy(&self) {
        let free = {
            let mut inner = self.inner.lock();
            inner.destroyed = true;
            std::mem::take(&mut inner.free)
        };
        tracing::debug!(tables = free.len(), "keytable pool destroyed");
    }

    /// Number of cached tables
    pub fn free_count(&self) -> usize {
        self.inner.lock().free.len()
    }
}

impl Default for KeytablePool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_set_get_take() {
        let key = key_create(None).unwrap();
        let mut table = KeyTable::new();
        assert!(table.get_mut(key).is_none());

        assert!(table.set(key, Box::new(5u32)).unwrap().is_none());
        let v = table.get_mut(key).unwrap().downcast_mut::<u32>().unwrap();
        *v += 1;

        let old = table.set(key, Box::new(10u32)).unwrap().unwrap();
        assert_eq!(*old.downcast::<u32>().unwrap(), 6);

        let taken = table.take(key).unwrap();
        assert_eq!(*taken.downcast::<u32>().unwrap(), 10);
        assert!(table.is_empty());
        key_delete(key).unwrap();
    }

    #[test]
    fn test_destructor_runs_on_release() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let key = key_create(Some(Arc::new(move |v: Box<dyn Any + Send>| {
            assert_eq!(*v.downcast::<u64>().unwrap(), 99);
            h.fetch_add(1, Ordering::SeqCst);
        })))
        .unwrap();

        let pool = KeytablePool::new();
        let mut table = pool.borrow_table();
        table.set(key, Box::new(99u64)).unwrap();
        pool.return_keytable(table);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(pool.free_count(), 1);

        // The recycled table comes back empty
        let table = pool.borrow_table();
        assert!(table.is_empty());
        assert_eq!(pool.free_count(), 0);
        pool.return_keytable(table);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        key_delete(key).unwrap();
    }

    #[test]
    fn test_deleted_key_is_stale() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let key = key_create(Some(Arc::new(move |_: Box<dyn Any + Send>| {
            h.fetch_add(1, Ordering::SeqCst);
        })))
        .unwrap();

        let mut table = KeyTable::new();
        table.set(key, Box::new(1u8)).unwrap();
        key_delete(key).unwrap();

        assert!(table.set(key, Box::new(2u8)).is_err());
        assert!(key_delete(key).is_err());

        // Value stored under the deleted key is dropped without destructor
        table.run_destructors_on_release();
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        let fresh = key_create(None).unwrap();
        assert!(table.get_mut(fresh).is_none());
        key_delete(fresh).unwrap();
    }

    #[test]
    fn test_destroyed_pool_frees_tables() {
        let pool = KeytablePool::new();
        pool.return_keytable(Box::new(KeyTable::new()));
        assert_eq!(pool.free_count(), 1);
        pool.destroy();
        assert_eq!(pool.free_count(), 0);
        pool.return_keytable(Box::new(KeyTable::new()));
        assert_eq!(pool.free_count(), 0);
    }
}
