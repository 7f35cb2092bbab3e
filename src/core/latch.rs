use super::sync::{Ordering, AtomicI32, AtomicU32, AtomicBool, Mutex, Condvar};

use crossbeam_utils::Backoff;

/// A resettable countdown latch.
///
/// This is the completion primitive of a job: an atomic counter of unfinished slices
/// paired with a manual-reset event. The latch starts signaled. `reset` arms it with
/// a number of pending units, `count_down` retires them and the thread that retires
/// the last one calls `signal`.
///
/// A single thread arms the latch per submission, any number of threads count it down.
///
/// Each `reset` starts a new epoch. Waiting on an epoch returns as soon as that epoch
/// is over, even if the latch was armed again in the mean time.
pub struct Latch {
    // Number of units that haven't been retired yet.
    count: AtomicI32,
    // Incremented by each reset.
    epoch: AtomicU32,
    // The manual-reset event. Written while holding `mutex` so that waiters sleeping
    // on the condition variable can't miss the notification.
    signaled: AtomicBool,
    mutex: Mutex<()>,
    cond: Condvar,
}

impl Latch {
    pub const MAX_COUNT: u32 = std::i32::MAX as u32;

    /// Creates a signaled latch with a count of zero.
    pub fn new() -> Self {
        Latch {
            count: AtomicI32::new(0),
            epoch: AtomicU32::new(0),
            signaled: AtomicBool::new(true),
            mutex: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// Arm the latch with `count` pending units.
    ///
    /// Panics if the previous count wasn't fully retired. A count of zero leaves the
    /// latch signaled.
    pub fn reset(&self, count: u32) {
        assert!(count <= Self::MAX_COUNT);

        let res = self.count.compare_exchange(0, count as i32, Ordering::AcqRel, Ordering::Acquire);
        assert!(
            res.is_ok(),
            "Latch reset while {} units are still pending",
            res.unwrap_err(),
        );
        assert!(self.is_signaled(), "Latch reset before being signaled");

        let _guard = self.mutex.lock().unwrap();
        self.epoch.fetch_add(1, Ordering::AcqRel);
        if count > 0 {
            self.signaled.store(false, Ordering::Release);
        }
    }

    /// Retire `n` units.
    ///
    /// Returns true if this call retired the last pending unit, in which case the
    /// caller is responsible for calling `signal`.
    pub fn count_down(&self, n: u32) -> bool {
        let n = n as i32;
        let count = self.count.fetch_sub(n, Ordering::AcqRel) - n;

        assert!(count >= 0, "Latch counted down below zero ({})", count);

        count == 0
    }

    /// Set the event, waking up all waiting threads.
    pub fn signal(&self) {
        debug_assert_eq!(self.count(), 0);

        {
            let _guard = self.mutex.lock().unwrap();
            self.signaled.store(true, Ordering::Release);
        }

        self.cond.notify_all();
    }

    #[inline]
    pub fn is_signaled(&self) -> bool {
        self.signaled.load(Ordering::Acquire)
    }

    #[inline]
    pub fn count(&self) -> i32 {
        self.count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn epoch(&self) -> u32 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Block the current thread until the latch is signaled.
    pub fn wait(&self) {
        self.wait_epoch(self.epoch());
    }

    /// Block the current thread until the given epoch is over.
    pub fn wait_epoch(&self, epoch: u32) {
        profiling::scope!("latch wait");

        // Most slices are short, so spin a little bit before involving the
        // condition variable.
        let backoff = Backoff::new();
        while !backoff.is_completed() {
            if self.is_epoch_over(epoch) {
                return;
            }

            backoff.snooze();

            #[cfg(loom)]
            loom::thread::yield_now();
        }

        profiling::scope!("wait(condvar)");
        let mut guard = self.mutex.lock().unwrap();
        while !self.is_epoch_over(epoch) {
            guard = self.cond.wait(guard).unwrap();
        }
    }

    // A new epoch only starts after the previous one was signaled.
    #[inline]
    fn is_epoch_over(&self, epoch: u32) -> bool {
        self.is_signaled() || self.epoch() != epoch
    }
}

impl Default for Latch {
    fn default() -> Self {
        Latch::new()
    }
}

#[cfg(not(loom))]
#[test]
fn test_latch_starts_signaled() {
    let latch = Latch::new();
    assert!(latch.is_signaled());
    assert_eq!(latch.count(), 0);

    // Waiting on a fresh latch must not block.
    latch.wait();

    latch.reset(0);
    assert!(latch.is_signaled());
}

#[cfg(not(loom))]
#[test]
fn test_latch_count_down() {
    let latch = Latch::new();

    latch.reset(3);
    assert!(!latch.is_signaled());
    assert_eq!(latch.count(), 3);

    assert!(!latch.count_down(2));
    assert!(!latch.is_signaled());
    assert!(latch.count_down(1));
    assert!(!latch.is_signaled());

    latch.signal();
    assert!(latch.is_signaled());
    assert_eq!(latch.count(), 0);

    // Can be armed again once it was fully retired.
    latch.reset(1);
    assert!(latch.count_down(1));
    latch.signal();
    latch.wait();
}

#[cfg(not(loom))]
#[test]
fn test_latch_epochs() {
    let latch = Latch::new();
    let first = latch.epoch();

    latch.reset(1);
    let second = latch.epoch();
    assert_ne!(first, second);
    assert!(latch.count_down(1));
    latch.signal();

    latch.reset(1);
    assert!(!latch.is_signaled());

    // Both previous epochs are over even though the latch is armed again.
    latch.wait_epoch(first);
    latch.wait_epoch(second);

    assert!(latch.count_down(1));
    latch.signal();
    latch.wait();
}

#[cfg(not(loom))]
#[test]
#[should_panic]
fn test_latch_reset_while_pending() {
    let latch = Latch::new();
    latch.reset(2);
    latch.reset(2);
}

#[cfg(not(loom))]
#[test]
#[should_panic]
fn test_latch_negative_count() {
    let latch = Latch::new();
    latch.reset(1);
    latch.count_down(2);
}

#[cfg(not(loom))]
#[test]
fn test_latch_wait_across_threads() {
    use super::sync::{Arc, thread};

    for _ in 0..100 {
        let latch = Arc::new(Latch::new());
        latch.reset(4);

        let mut threads = Vec::new();
        for _ in 0..4 {
            let latch = latch.clone();
            threads.push(thread::spawn(move || {
                if latch.count_down(1) {
                    latch.signal();
                }
            }));
        }

        latch.wait();
        assert_eq!(latch.count(), 0);

        for thread in threads {
            thread.join().unwrap();
        }
    }
}

#[cfg(loom)]
#[test]
fn loom_latch() {
    use super::sync::{Arc, thread};

    loom::model(|| {
        let latch = Arc::new(Latch::new());
        latch.reset(2);

        let l1 = latch.clone();
        let t1 = thread::spawn(move || {
            if l1.count_down(1) {
                l1.signal();
            }
        });

        let l2 = latch.clone();
        let t2 = thread::spawn(move || {
            if l2.count_down(1) {
                l2.signal();
            }
        });

        latch.wait();
        assert_eq!(latch.count(), 0);

        t1.join().unwrap();
        t2.join().unwrap();
    });
}
