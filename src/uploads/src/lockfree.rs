//! Lock-free step queues and the background-thread wakeup event.

use crossbeam_queue::ArrayQueue;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Fixed-capacity lock-free queue with an unbounded spill list.
///
/// Producers on any thread push with `push` (fails when full) or
/// `push_overflow` (spills to a mutex-guarded list). There is one logical
/// consumer; a step the consumer could not complete goes back via
/// `requeue_front` and is returned first by the next `pop`, preserving
/// order across back-pressure.
pub struct StepQueue<T> {
    ring: ArrayQueue<T>,
    overflow: Mutex<VecDeque<T>>,
    requeued: Mutex<VecDeque<T>>,
}

impl<T> StepQueue<T> {
    /// A queue with the given lock-free capacity.
    pub fn new(capacity: usize) -> Self {
        StepQueue {
            ring: ArrayQueue::new(capacity),
            overflow: Mutex::new(VecDeque::new()),
            requeued: Mutex::new(VecDeque::new()),
        }
    }

    /// Push without blocking; fails when the ring is full.
    pub fn push(&self, item: T) -> Result<(), T> {
        if !self.overflow.lock().is_empty() {
            // keep FIFO order: nothing may overtake spilled items
            return Err(item);
        }
        self.ring.push(item)
    }

    /// Push, spilling to the overflow list when the ring is full.
    pub fn push_overflow(&self, item: T) {
        let mut overflow = self.overflow.lock();
        if !overflow.is_empty() {
            overflow.push_back(item);
            return;
        }
        if let Err(item) = self.ring.push(item) {
            overflow.push_back(item);
        }
    }

    /// Take the next step, oldest first.
    pub fn pop(&self) -> Option<T> {
        if let Some(item) = self.requeued.lock().pop_front() {
            return Some(item);
        }
        if let Some(item) = self.ring.pop() {
            return Some(item);
        }
        self.overflow.lock().pop_front()
    }

    /// Return a step the consumer popped but could not process; it will be
    /// the next one popped.
    pub fn requeue_front(&self, item: T) {
        self.requeued.lock().push_front(item);
    }

    /// Number of queued steps.
    pub fn len(&self) -> usize {
        self.requeued.lock().len() + self.ring.len() + self.overflow.lock().len()
    }

    /// Whether no steps are queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Single-slot semaphore the background thread sleeps on.
///
/// `increment` never blocks the caller for long; `wait` consumes all pending
/// signals at once.
pub struct WakeupEvent {
    lock: Mutex<()>,
    condition: Condvar,
    semaphore_count: AtomicU32,
}

impl WakeupEvent {
    /// A new event with no pending signal.
    pub fn new() -> Self {
        WakeupEvent {
            lock: Mutex::new(()),
            condition: Condvar::new(),
            semaphore_count: AtomicU32::new(0),
        }
    }

    /// Signal the event, waking the waiter if there is one.
    pub fn increment(&self) {
        let _guard = self.lock.lock();
        self.semaphore_count.fetch_add(1, Ordering::SeqCst);
        self.condition.notify_one();
    }

    /// Block until the event has been signalled since the last wait.
    pub fn wait(&self) {
        loop {
            if self.semaphore_count.swap(0, Ordering::SeqCst) != 0 {
                return;
            }
            let mut guard = self.lock.lock();
            if self.semaphore_count.load(Ordering::SeqCst) != 0 {
                continue;
            }
            self.condition.wait(&mut guard);
        }
    }

    /// Like `wait`, but give up after `timeout`. Returns whether a signal was
    /// consumed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.semaphore_count.swap(0, Ordering::SeqCst) != 0 {
            return true;
        }
        let mut guard = self.lock.lock();
        if self.semaphore_count.load(Ordering::SeqCst) != 0 {
            self.semaphore_count.store(0, Ordering::SeqCst);
            return true;
        }
        self.condition.wait_for(&mut guard, timeout);
        self.semaphore_count.swap(0, Ordering::SeqCst) != 0
    }

    /// Whether a signal is pending, without consuming it.
    pub fn peek(&self) -> bool {
        self.semaphore_count.load(Ordering::SeqCst) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn queue_preserves_order_across_overflow() {
        let queue = StepQueue::new(2);
        queue.push_overflow(1u32);
        queue.push_overflow(2);
        queue.push_overflow(3); // spills
        queue.push_overflow(4); // spills behind 3
        assert_eq!(queue.len(), 4);
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(3));
        assert_eq!(queue.pop(), Some(4));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn requeued_step_pops_first() {
        let queue = StepQueue::new(4);
        queue.push_overflow(1u32);
        queue.push_overflow(2);
        let first = queue.pop().unwrap();
        queue.requeue_front(first);
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
    }

    #[test]
    fn plain_push_fails_when_full() {
        let queue = StepQueue::new(1);
        assert!(queue.push(1u32).is_ok());
        assert!(queue.push(2).is_err());
    }

    #[test]
    fn wakeup_event_crosses_threads() {
        let event = Arc::new(WakeupEvent::new());
        let signaller = Arc::clone(&event);
        let handle = std::thread::spawn(move || {
            signaller.increment();
        });
        event.wait();
        handle.join().unwrap();
        assert!(!event.peek());
    }

    #[test]
    fn wait_timeout_expires_without_signal() {
        let event = WakeupEvent::new();
        assert!(!event.wait_timeout(Duration::from_millis(1)));
        event.increment();
        assert!(event.wait_timeout(Duration::from_millis(1)));
    }
}
