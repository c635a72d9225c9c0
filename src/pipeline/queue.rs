//! Bounded handoff queue between the capture and encode threads

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

use super::HandoffFrame;

/// Default queue capacity
pub const DEFAULT_QUEUE_CAPACITY: usize = 4;

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Bounded FIFO with one producer and one consumer.
///
/// `push` blocks while full, `pop` blocks while empty. After [`close`] pushes
/// fail and hand the item back, while `pop` drains what is left and then
/// returns `None`.
///
/// [`close`]: HandoffQueue::close
pub struct HandoffQueue<T = HandoffFrame> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl<T> HandoffQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity.max(1)),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    /// Append an item, waiting for room. Returns the item if the queue is closed.
    pub fn push(&self, item: T) -> Result<(), T> {
        let mut inner = self.inner.lock();
        while inner.items.len() >= self.capacity && !inner.closed {
            self.not_full.wait(&mut inner);
        }
        if inner.closed {
            return Err(item);
        }
        inner.items.push_back(item);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Take the oldest item, waiting for one. `None` once closed and drained.
    pub fn pop(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(item) = inner.items.pop_front() {
                self.not_full.notify_one();
                return Some(item);
            }
            if inner.closed {
                return None;
            }
            self.not_empty.wait(&mut inner);
        }
    }

    /// Stop accepting items and wake both sides
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_fifo_across_threads() {
        let queue = Arc::new(HandoffQueue::new(4));
        let producer = {
            let queue = queue.clone();
            thread::spawn(move || {
                for i in 0..1000u32 {
                    queue.push(i).unwrap();
                }
                queue.close();
            })
        };

        let mut received = Vec::new();
        while let Some(i) = queue.pop() {
            assert!(queue.len() <= queue.capacity());
            received.push(i);
        }
        producer.join().unwrap();
        assert_eq!(received, (0..1000).collect::<Vec<_>>());
    }

    #[test]
    fn test_push_blocks_while_full() {
        let queue = Arc::new(HandoffQueue::new(1));
        queue.push(1).unwrap();
        let producer = {
            let queue = queue.clone();
            thread::spawn(move || queue.push(2))
        };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop(), Some(1));
        producer.join().unwrap().unwrap();
        assert_eq!(queue.pop(), Some(2));
    }

    #[test]
    fn test_close_drains_then_ends() {
        let queue = HandoffQueue::new(4);
        queue.push("a").unwrap();
        queue.push("b").unwrap();
        queue.close();
        assert_eq!(queue.push("c"), Err("c"));
        assert_eq!(queue.pop(), Some("a"));
        assert_eq!(queue.pop(), Some("b"));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_close_wakes_blocked_producer() {
        let queue = Arc::new(HandoffQueue::new(1));
        queue.push(1).unwrap();
        let producer = {
            let queue = queue.clone();
            thread::spawn(move || queue.push(2))
        };
        thread::sleep(Duration::from_millis(50));
        queue.close();
        assert_eq!(producer.join().unwrap(), Err(2));
    }

    #[test]
    fn test_close_wakes_blocked_consumer() {
        let queue: Arc<HandoffQueue<u32>> = Arc::new(HandoffQueue::new(2));
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.pop())
        };
        thread::sleep(Duration::from_millis(50));
        queue.close();
        assert_eq!(consumer.join().unwrap(), None);
    }
}
