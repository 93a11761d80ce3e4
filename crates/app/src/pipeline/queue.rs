//! The bounded queue connecting pipeline stages.
//!
//! Producers never block: a push onto a full queue evicts the front element.
//! Consumers block with a timeout, and `stop` wakes every waiter so shutdown
//! never hangs on an idle stage.

use std::{
    collections::VecDeque,
    sync::{Condvar, Mutex, PoisonError},
    time::Duration,
};

pub struct BoundedQueue<T> {
    cap: usize,
    inner: Mutex<Inner<T>>,
    cv: Condvar,
}

struct Inner<T> {
    items: VecDeque<T>,
    stopped: bool,
}

impl<T> BoundedQueue<T> {
    pub fn new(cap: usize) -> Self {
        debug_assert!(cap > 0, "queue capacity must be positive");
        Self {
            cap,
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(cap),
                stopped: false,
            }),
            cv: Condvar::new(),
        }
    }

    /// Append `v`, evicting the oldest element when full. Inert after `stop`.
    pub fn push_drop_oldest(&self, v: T) {
        {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            if inner.stopped || self.cap == 0 {
                return;
            }
            if inner.items.len() >= self.cap {
                inner.items.pop_front();
            }
            inner.items.push_back(v);
        }
        self.cv.notify_one();
    }

    pub fn try_pop(&self) -> Option<T> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .items
            .pop_front()
    }

    /// Block up to `d` for an element. Returns `None` on timeout or once the
    /// queue is stopped.
    pub fn pop_for(&self, d: Duration) -> Option<T> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut inner, _timeout) = self
            .cv
            .wait_timeout_while(inner, d, |inner| !inner.stopped && inner.items.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        if inner.stopped {
            return None;
        }
        inner.items.pop_front()
    }

    pub fn stop(&self) {
        {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            inner.stopped = true;
        }
        self.cv.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .items
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, time::Instant};

    use super::*;

    #[test]
    fn len_never_exceeds_capacity() {
        let q = BoundedQueue::new(3);
        for i in 0..10 {
            q.push_drop_oldest(i);
            assert!(q.len() <= 3);
        }
        assert_eq!(q.len(), 3);
    }

    #[test]
    fn full_push_drops_the_front_element() {
        let q = BoundedQueue::new(2);
        q.push_drop_oldest(1);
        q.push_drop_oldest(2);
        q.push_drop_oldest(3);
        assert_eq!(q.try_pop(), Some(2));
        assert_eq!(q.try_pop(), Some(3));
        assert_eq!(q.try_pop(), None);
    }

    #[test]
    fn unpopped_sequence_keeps_the_newest_window() {
        // Encoder backlog scenario: capacity 2, frames 0..=4 pushed.
        let q = BoundedQueue::new(2);
        for frame in 0..5 {
            q.push_drop_oldest(frame);
        }
        assert_eq!(q.try_pop(), Some(3));
        assert_eq!(q.try_pop(), Some(4));
        assert_eq!(q.try_pop(), None);
    }

    #[test]
    fn pop_for_times_out_when_empty() {
        let q: BoundedQueue<u32> = BoundedQueue::new(1);
        let start = Instant::now();
        assert_eq!(q.pop_for(Duration::from_millis(30)), None);
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn pop_for_wakes_on_push() {
        let q = Arc::new(BoundedQueue::new(1));
        let consumer = {
            let q = q.clone();
            thread::spawn(move || q.pop_for(Duration::from_secs(2)))
        };
        thread::sleep(Duration::from_millis(20));
        q.push_drop_oldest(7u32);
        assert_eq!(consumer.join().unwrap(), Some(7));
    }

    #[test]
    fn stop_unblocks_waiters_and_disables_pushes() {
        let q: Arc<BoundedQueue<u32>> = Arc::new(BoundedQueue::new(1));
        let waiter = {
            let q = q.clone();
            thread::spawn(move || {
                let start = Instant::now();
                let item = q.pop_for(Duration::from_secs(5));
                (item, start.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(20));
        q.stop();
        let (item, waited) = waiter.join().unwrap();
        assert_eq!(item, None);
        assert!(waited < Duration::from_secs(1));

        q.push_drop_oldest(1);
        assert_eq!(q.len(), 0);
        assert_eq!(q.pop_for(Duration::from_millis(5)), None);
    }
}
