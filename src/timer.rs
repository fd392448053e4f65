//! Deadline driver: wakes parked waiters when their deadline passes.
//!
//! The crate is runtime-independent, so it cannot rely on an executor
//! timer. Instead a single lazily-started background thread keeps a
//! min-heap of `(deadline, waker)` entries and wakes each waker once its
//! deadline is due. Waiters re-register on every poll; a stale entry for
//! an already-completed wait produces at most one spurious wake.

use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::Waker;
use std::time::Instant;

#[derive(Debug)]
struct Entry {
    deadline: Instant,
    seq: u64,
    waker: Waker,
}

// BinaryHeap is a max-heap; order entries so the earliest deadline is at
// the top.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

#[derive(Debug)]
struct Driver {
    heap: Mutex<BinaryHeap<Entry>>,
    available: Condvar,
    seq: AtomicU64,
}

static DRIVER: OnceLock<&'static Driver> = OnceLock::new();

fn driver() -> &'static Driver {
    DRIVER.get_or_init(|| {
        let driver: &'static Driver = Box::leak(Box::new(Driver {
            heap: Mutex::new(BinaryHeap::new()),
            available: Condvar::new(),
            seq: AtomicU64::new(0),
        }));
        std::thread::Builder::new()
            .name("keylock-timer".into())
            .spawn(move || run(driver))
            .expect("failed to spawn timer thread");
        driver
    })
}

fn run(driver: &'static Driver) {
    loop {
        let mut due: Vec<Waker> = Vec::new();
        let mut heap = driver.heap.lock();
        let now = Instant::now();
        while heap.peek().is_some_and(|entry| entry.deadline <= now) {
            due.push(heap.pop().expect("peeked entry").waker);
        }
        if due.is_empty() {
            match heap.peek().map(|entry| entry.deadline) {
                Some(next) => {
                    let _ = driver.available.wait_until(&mut heap, next);
                }
                None => driver.available.wait(&mut heap),
            }
        } else {
            // Wake outside the lock so a waker that re-registers does not
            // deadlock against the heap mutex.
            drop(heap);
            for waker in due {
                waker.wake();
            }
        }
    }
}

/// Arranges for `waker` to be woken once `deadline` has passed.
///
/// An already-due deadline wakes inline without touching the driver.
pub(crate) fn wake_at(deadline: Instant, waker: Waker) {
    if Instant::now() >= deadline {
        waker.wake();
        return;
    }
    let driver = driver();
    let became_earliest = {
        let mut heap = driver.heap.lock();
        let earliest = heap.peek().is_none_or(|entry| deadline < entry.deadline);
        heap.push(Entry {
            deadline,
            seq: driver.seq.fetch_add(1, Ordering::Relaxed),
            waker,
        });
        earliest
    };
    if became_earliest {
        driver.available.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::CountingWaker;
    use std::time::Duration;

    #[test]
    fn past_deadline_wakes_inline() {
        let counting = CountingWaker::new();
        wake_at(Instant::now() - Duration::from_millis(1), counting.waker());
        assert_eq!(counting.count(), 1);
    }

    #[test]
    fn future_deadline_wakes_after_expiry() {
        let counting = CountingWaker::new();
        wake_at(Instant::now() + Duration::from_millis(20), counting.waker());
        assert_eq!(counting.count(), 0);

        let start = Instant::now();
        while counting.count() == 0 && start.elapsed() < Duration::from_secs(2) {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(counting.count(), 1);
    }

    #[test]
    fn earlier_entry_overtakes_later_one() {
        let late = CountingWaker::new();
        let early = CountingWaker::new();
        wake_at(Instant::now() + Duration::from_millis(200), late.waker());
        wake_at(Instant::now() + Duration::from_millis(20), early.waker());

        let start = Instant::now();
        while early.count() == 0 && start.elapsed() < Duration::from_secs(2) {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(early.count(), 1);
        assert_eq!(late.count(), 0);
    }
}
