use crate::common::{obj, FakeFrame, TestHook};
use pystalker::engine::trace::release::ReleaseQueue;
use pystalker::engine::trace::{TraceEvent, TraceState};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

#[test]
fn test_reentrant_drain_releases_each_once() {
    let queue = ReleaseQueue::new();
    for n in 1..=100 {
        queue.push(obj(n));
    }

    let mut released: HashMap<usize, u32> = HashMap::new();
    let mut next = 101;
    // a "destructor" pushes a new object for every released one below 150
    let mut release = |o: *mut std::ffi::c_void, queue: &ReleaseQueue| {
        *released.entry(o as usize).or_default() += 1;
        if next <= 150 {
            queue.push(obj(next));
            next += 1;
        }
    };

    let mut total = 0;
    loop {
        let n = queue.drain(|o| release(o, &queue));
        if n == 0 {
            break;
        }
        total += n;
    }

    assert_eq!(total, 150);
    assert_eq!(released.len(), 150);
    assert!(released.values().all(|count| *count == 1));
    assert!(queue.is_empty());
}

#[test]
fn test_concurrent_push_and_drain() {
    const PUSHERS: usize = 4;
    const PER_PUSHER: usize = 5000;

    let queue = Arc::new(ReleaseQueue::new());
    let released = Arc::new(Mutex::new(HashMap::<usize, u32>::new()));
    let done = Arc::new(AtomicBool::new(false));

    let drainer = {
        let (queue, released, done) = (queue.clone(), released.clone(), done.clone());
        std::thread::spawn(move || loop {
            let finished = done.load(Ordering::SeqCst);
            queue.drain(|o| {
                *released.lock().unwrap().entry(o as usize).or_default() += 1;
            });
            if finished {
                queue.drain(|o| {
                    *released.lock().unwrap().entry(o as usize).or_default() += 1;
                });
                break;
            }
        })
    };

    let pushers: Vec<_> = (0..PUSHERS)
        .map(|p| {
            let queue = queue.clone();
            std::thread::spawn(move || {
                for i in 0..PER_PUSHER {
                    queue.push(obj(1 + p * PER_PUSHER + i));
                }
            })
        })
        .collect();
    for pusher in pushers {
        pusher.join().unwrap();
    }
    done.store(true, Ordering::SeqCst);
    drainer.join().unwrap();

    let released = released.lock().unwrap();
    assert_eq!(released.len(), PUSHERS * PER_PUSHER);
    assert!(released.values().all(|count| *count == 1));
}

#[test]
fn test_dispatch_drains_before_handling_event() {
    let state = TraceState::new();
    state.releases.push(obj(7));
    state.releases.push(obj(8));

    let hook = TestHook::default();
    state.dispatch(1, TraceEvent::Call, &FakeFrame::at("a.py", 1), &hook);

    let mut released = hook.released.borrow().clone();
    released.sort();
    assert_eq!(released, vec![obj(7) as usize, obj(8) as usize]);
    assert!(state.releases.is_empty());
}
