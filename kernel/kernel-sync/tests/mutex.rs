use kernel_sync::{SpinMutex, SyncOnceCell};

#[test]
fn lock_and_raii_unlock() {
    let m = SpinMutex::new(0_u32);

    {
        let mut g = m.lock();
        *g = 41;
    }

    // Locking again must succeed; the previous guard unlocked on drop.
    {
        let mut g = m.lock();
        *g += 1;
        assert_eq!(*g, 42);
    }
}

#[test]
fn try_lock_fails_while_held() {
    let m = SpinMutex::new(7_u8);

    let g1 = m.try_lock();
    assert!(g1.is_some());

    let g2 = m.try_lock();
    assert!(g2.is_none());

    drop(g1);
    assert!(m.try_lock().is_some());
}

#[test]
fn with_lock_releases_afterwards() {
    let m = SpinMutex::new(String::from("a"));
    let len = m.with_lock(|s| {
        s.push('b');
        s.len()
    });
    assert_eq!(len, 2);

    let got = m.with_lock(|s| s.clone());
    assert_eq!(got, "ab");
}

#[test]
fn get_mut_bypasses_locking() {
    let mut m = SpinMutex::new(vec![1, 2, 3]);
    m.get_mut().push(4);
    assert_eq!(m.lock().as_slice(), &[1, 2, 3, 4]);
}

#[test]
fn contended_increments_are_exclusive() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;

    let threads = 8;
    let iters = 5_000;

    let lock = Arc::new(SpinMutex::new(0_usize));
    let in_cs = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(threads));

    let mut handles = Vec::with_capacity(threads);
    for _ in 0..threads {
        let lock = Arc::clone(&lock);
        let in_cs = Arc::clone(&in_cs);
        let start = Arc::clone(&start);
        handles.push(thread::spawn(move || {
            start.wait();
            for _ in 0..iters {
                lock.with_lock(|v| {
                    let prev = in_cs.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(prev, 0, "mutual exclusion violated");
                    *v += 1;
                    in_cs.fetch_sub(1, Ordering::SeqCst);
                });

                // Yield only after releasing the lock to reduce convoying.
                thread::yield_now();
            }
        }));
    }

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(lock.with_lock(|v| *v), threads * iters);
    assert_eq!(in_cs.load(Ordering::SeqCst), 0);
}

#[test]
fn once_cell_initializes_exactly_once() {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    let cell = Arc::new(SyncOnceCell::<usize>::new());
    let calls = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for i in 0..8 {
        let cell = Arc::clone(&cell);
        let calls = Arc::clone(&calls);
        handles.push(thread::spawn(move || {
            *cell.get_or_init(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                i
            })
        }));
    }

    let values: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(calls.load(Ordering::SeqCst), 1, "initializer ran twice");
    assert!(values.windows(2).all(|w| w[0] == w[1]));
}

#[test]
fn once_cell_set_wins_once() {
    let cell = SyncOnceCell::<u32>::new();
    assert!(cell.get().is_none());
    assert!(cell.set(1).is_ok());
    assert_eq!(cell.set(2), Err(2));
    assert_eq!(cell.get(), Some(&1));
}

/// SpinMutex<T> must be Sync for T: Send; spot-check a concrete instantiation.
#[test]
fn mutex_is_sync_for_send_t() {
    fn takes_sync<S: Sync>(_s: &S) {}
    let m = SpinMutex::new(0_u8);
    takes_sync(&m);
}
