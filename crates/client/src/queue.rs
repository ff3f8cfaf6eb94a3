//! Bounded message queue
//!
//! One queue per subscription, shared by the parser worker (producer) and
//! the drain threads (consumers). The queue is load-bearing for
//! correctness: when full it blocks the producer, pushing backpressure all
//! the way to the socket, because dropping rows would break the
//! monotonic-offset guarantee.
//!
//! Shutdown is a single idempotent sentinel: [`close`](MessageQueue::close)
//! marks the queue closed and wakes every waiter. Consumers drain whatever
//! is left, then observe [`Pop::Closed`] forever.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::message::Message;

/// Outcome of a pop
#[derive(Debug)]
pub enum Pop<T> {
    /// Got data
    Some(T),
    /// Timed out with the queue still open
    Timeout,
    /// Queue closed and fully drained
    Closed,
}

impl<T> Pop<T> {
    /// True when this pop ended the stream
    #[inline]
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

struct Inner {
    buf: VecDeque<Message>,
    closed: bool,
}

/// Bounded FIFO with batch pop and single-sentinel shutdown
pub struct MessageQueue {
    capacity: usize,
    batch_size: usize,
    inner: Mutex<Inner>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl MessageQueue {
    /// Create a queue. Capacity is clamped to at least 1; `batch_size`
    /// bounds how many messages a single batch pop may return.
    pub fn new(capacity: usize, batch_size: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            batch_size: batch_size.max(1),
            inner: Mutex::new(Inner {
                buf: VecDeque::new(),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Messages currently buffered
    pub fn len(&self) -> usize {
        self.inner.lock().buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().buf.is_empty()
    }

    /// Whether the shutdown sentinel has been observed
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Maximum batch size for [`pop_batch`](Self::pop_batch)
    #[inline]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Push a message, blocking while the queue is full.
    ///
    /// Returns `false` if the queue is closed; the message is dropped in
    /// that case, which is fine because closure means teardown.
    pub fn push(&self, msg: Message) -> bool {
        let mut inner = self.inner.lock();
        while inner.buf.len() >= self.capacity && !inner.closed {
            self.not_full.wait(&mut inner);
        }
        if inner.closed {
            return false;
        }
        inner.buf.push_back(msg);
        drop(inner);
        self.not_empty.notify_one();
        true
    }

    /// Close the queue. Idempotent; wakes all producers and consumers.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        drop(inner);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Pop one message, waiting up to `timeout`
    pub fn pop(&self, timeout: Duration) -> Pop<Message> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if let Some(msg) = inner.buf.pop_front() {
                drop(inner);
                self.not_full.notify_one();
                return Pop::Some(msg);
            }
            if inner.closed {
                return Pop::Closed;
            }
            let now = Instant::now();
            if now >= deadline {
                return Pop::Timeout;
            }
            self.not_empty.wait_for(&mut inner, deadline - now);
        }
    }

    /// Pop one message, waiting until data arrives or the queue closes
    pub fn pop_blocking(&self) -> Pop<Message> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(msg) = inner.buf.pop_front() {
                drop(inner);
                self.not_full.notify_one();
                return Pop::Some(msg);
            }
            if inner.closed {
                return Pop::Closed;
            }
            self.not_empty.wait(&mut inner);
        }
    }

    /// Pop up to `batch_size` messages, waiting up to `timeout` for the
    /// first one. Appends to `out` and returns how many arrived.
    pub fn pop_batch(&self, out: &mut Vec<Message>, timeout: Duration) -> Pop<usize> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if !inner.buf.is_empty() {
                let take = self.batch_size.min(inner.buf.len());
                out.extend(inner.buf.drain(..take));
                drop(inner);
                self.not_full.notify_all();
                return Pop::Some(take);
            }
            if inner.closed {
                return Pop::Closed;
            }
            let now = Instant::now();
            if now >= deadline {
                return Pop::Timeout;
            }
            self.not_empty.wait_for(&mut inner, deadline - now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessagePayload;
    use rill_protocol::Vector;
    use std::sync::Arc;
    use std::time::Duration;

    fn msg(offset: i64) -> Message {
        Message {
            offset,
            payload: MessagePayload::Row(Arc::new(Vector::any(vec![]))),
        }
    }

    #[test]
    fn push_pop_fifo() {
        let q = MessageQueue::new(8, 4);
        assert!(q.push(msg(1)));
        assert!(q.push(msg(2)));
        match q.pop(Duration::from_millis(10)) {
            Pop::Some(m) => assert_eq!(m.offset, 1),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn pop_times_out_when_open_and_empty() {
        let q = MessageQueue::new(8, 4);
        assert!(matches!(q.pop(Duration::from_millis(5)), Pop::Timeout));
    }

    #[test]
    fn pop_batch_respects_batch_size() {
        let q = MessageQueue::new(16, 3);
        for i in 0..5 {
            q.push(msg(i));
        }
        let mut out = Vec::new();
        match q.pop_batch(&mut out, Duration::from_millis(5)) {
            Pop::Some(n) => assert_eq!(n, 3),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(out.len(), 3);
        assert_eq!(out[2].offset, 2);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn close_is_idempotent_and_drains() {
        let q = MessageQueue::new(8, 4);
        q.push(msg(1));
        q.close();
        q.close();
        assert!(!q.push(msg(2)));

        // residue drains first, then Closed forever
        assert!(matches!(q.pop(Duration::from_millis(1)), Pop::Some(_)));
        assert!(q.pop(Duration::from_millis(1)).is_closed());
        assert!(q.pop_blocking().is_closed());
        let mut out = Vec::new();
        assert!(q.pop_batch(&mut out, Duration::from_millis(1)).is_closed());
    }

    #[test]
    fn full_queue_blocks_until_consumed() {
        let q = Arc::new(MessageQueue::new(2, 1));
        q.push(msg(1));
        q.push(msg(2));

        let producer = {
            let q = Arc::clone(&q);
            std::thread::spawn(move || q.push(msg(3)))
        };
        // producer is blocked on the full queue
        std::thread::sleep(Duration::from_millis(20));
        assert!(!producer.is_finished());

        assert!(matches!(q.pop(Duration::from_millis(100)), Pop::Some(_)));
        assert!(producer.join().unwrap());
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn close_unblocks_blocked_producer() {
        let q = Arc::new(MessageQueue::new(1, 1));
        q.push(msg(1));
        let producer = {
            let q = Arc::clone(&q);
            std::thread::spawn(move || q.push(msg(2)))
        };
        std::thread::sleep(Duration::from_millis(20));
        q.close();
        assert!(!producer.join().unwrap());
    }

    #[test]
    fn close_wakes_blocked_consumer() {
        let q = Arc::new(MessageQueue::new(4, 1));
        let consumer = {
            let q = Arc::clone(&q);
            std::thread::spawn(move || q.pop_blocking().is_closed())
        };
        std::thread::sleep(Duration::from_millis(20));
        q.close();
        assert!(consumer.join().unwrap());
    }
}
