//! Fiber-local storage

use fiber::{key_create, key_delete, FiberConfig, KeyDestructor, Runtime};
use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[test]
fn test_values_are_per_fiber_and_destroyed_on_exit() {
    let rt = Runtime::new(FiberConfig::new().concurrency(4)).unwrap();
    let destroyed = Arc::new(AtomicUsize::new(0));
    let d = destroyed.clone();
    let dtor: KeyDestructor = Arc::new(move |_value: Box<dyn Any + Send>| {
        d.fetch_add(1, Ordering::SeqCst);
    });
    let key = key_create(Some(dtor)).unwrap();

    let handles: Vec<_> = (0..32u64)
        .map(|i| {
            rt.spawn(move || {
                assert!(fiber::with_specific::<u64, _>(key, |v| v.is_none()));
                fiber::set_specific(key, i).unwrap();
                fiber::yield_now();
                let seen = fiber::with_specific::<u64, _>(key, |v| v.copied());
                assert_eq!(seen, Some(i));
            })
            .unwrap()
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(destroyed.load(Ordering::SeqCst), 32);
    key_delete(key).unwrap();
}

#[test]
fn test_take_leaves_nothing_to_destroy() {
    let rt = Runtime::new(FiberConfig::new().concurrency(2)).unwrap();
    let destroyed = Arc::new(AtomicUsize::new(0));
    let d = destroyed.clone();
    let dtor: KeyDestructor = Arc::new(move |_value: Box<dyn Any + Send>| {
        d.fetch_add(1, Ordering::SeqCst);
    });
    let key = key_create(Some(dtor)).unwrap();

    let taken = rt
        .block_on(move || {
            fiber::set_specific(key, String::from("local")).unwrap();
            fiber::take_specific::<String>(key)
        })
        .unwrap();
    assert_eq!(taken.as_deref(), Some("local"));
    assert_eq!(destroyed.load(Ordering::SeqCst), 0);
    key_delete(key).unwrap();
}

#[test]
fn test_deleted_key_is_rejected_in_fiber() {
    let rt = Runtime::new(FiberConfig::new().concurrency(1)).unwrap();
    let key = key_create(None).unwrap();
    key_delete(key).unwrap();
    let r = rt.block_on(move || fiber::set_specific(key, 1u8)).unwrap();
    assert!(r.is_err());
}
