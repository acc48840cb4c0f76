//! Fiber-local values
//!
//! Inside a fiber, values live in the fiber's keytable, borrowed on first
//! use from the pool named in its attributes or from the runtime's pool,
//! and handed back (destructors run) when the fiber exits. Elsewhere a
//! per-thread table is used, whose values die with the thread.

use crate::tls;
use fiber_core::error::{FiberError, FiberResult};
use fiber_core::key::{FiberKey, KeyTable};
use std::any::Any;
use std::cell::RefCell;

thread_local! {
    static THREAD_KEYTABLE: RefCell<KeyTable> = RefCell::new(KeyTable::new());
}

/// Run `f` on the calling context's keytable, creating it if needed.
///
/// `f` must not switch fibers or touch fiber-local values itself.
fn with_keytable<R>(f: impl FnOnce(&mut KeyTable) -> R) -> FiberResult<R> {
    match tls::current_fiber() {
        Some((_, meta)) => {
            let slot = unsafe { meta.keytable_mut() };
            if slot.is_none() {
                let pool = unsafe { meta.keytable_pool() }
                    .or_else(|| unsafe { meta.control() }.map(|c| c.keytable_pool().clone()));
                *slot = Some(match pool {
                    Some(pool) => pool.borrow_table(),
                    None => Box::new(KeyTable::new()),
                });
            }
            match slot.as_deref_mut() {
                Some(table) => Ok(f(table)),
                None => Err(FiberError::NotFound),
            }
        }
        None => THREAD_KEYTABLE
            .try_with(|cell| {
                cell.try_borrow_mut()
                    .map(|mut table| f(&mut *table))
                    .map_err(|_| FiberError::InvalidArgument("keytable already borrowed"))
            })
            .map_err(|_| FiberError::InvalidArgument("thread keytable destroyed"))?,
    }
}

/// Store `value` under `key` for the calling fiber (or thread). A value
/// already stored there is dropped.
pub fn set_specific<T: Any + Send>(key: FiberKey, value: T) -> FiberResult<()> {
    let old = with_keytable(|table| table.set(key, Box::new(value)))??;
    // Dropped outside the table borrow: its Drop may use keys too
    drop(old);
    Ok(())
}

/// Call `f` with the value stored under `key`, or `None` when unset or
/// of another type.
///
/// The value is taken out of the table while `f` runs, so `f` may use
/// fiber-local storage (and even switch). A value stored under the same
/// key by `f` wins over the one being visited.
pub fn with_specific<T: Any + Send, R>(key: FiberKey, f: impl FnOnce(Option<&mut T>) -> R) -> R {
    let taken = with_keytable(|table| table.take(key)).ok().flatten();
    let Some(mut value) = taken else {
        return f(None);
    };
    let result = f(value.downcast_mut::<T>());
    let _ = with_keytable(|table| {
        if table.get_mut(key).is_none() {
            // Fails only if the key was deleted meanwhile; the value is dropped
            let _ = table.set(key, value);
        }
    });
    result
}

/// Remove and return the value stored under `key`.
pub fn take_specific<T: Any + Send>(key: FiberKey) -> Option<T> {
    let value = with_keytable(|table| table.take(key)).ok().flatten()?;
    value.downcast::<T>().ok().map(|b| *b)
}
