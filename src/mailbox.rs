use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;

/// Bounded frame mailbox with drop-oldest backpressure.
///
/// `push` never blocks: when the mailbox is full the oldest queued frame is
/// evicted to make room, so a slow consumer always picks up the freshest
/// frame instead of an ever-growing backlog. Intended for a single consumer.
pub struct FrameMailbox<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
    capacity: usize,
}

struct Inner<T> {
    queue: VecDeque<T>,
    closed: bool,
}

impl<T> FrameMailbox<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    /// Stores `item`, evicting the oldest queued frame when full. Returns the
    /// displaced frame, or `item` itself when the mailbox is already closed.
    pub fn push(&self, item: T) -> Option<T> {
        let displaced = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Some(item);
            }
            let evicted = if inner.queue.len() == self.capacity {
                inner.queue.pop_front()
            } else {
                None
            };
            inner.queue.push_back(item);
            evicted
        };
        self.notify.notify_one();
        displaced
    }

    /// Waits for the next frame. Returns `None` once the mailbox is closed;
    /// frames still queued at close time are discarded, never delivered.
    pub async fn pop(&self) -> Option<T> {
        loop {
            {
                let mut inner = self.inner.lock();
                if inner.closed {
                    return None;
                }
                if let Some(item) = inner.queue.pop_front() {
                    return Some(item);
                }
            }
            self.notify.notified().await;
        }
    }

    /// Closes the mailbox, discarding queued frames and waking the consumer.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.queue.clear();
        }
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}
