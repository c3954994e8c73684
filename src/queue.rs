/**
 * queue.rs
 *
 * Single-consumer FIFO used to decouple producers from consumers
 * (socket reads -> data channel sends and back, signalling, metering)
 */

use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::error::{Error, Result};

type HandlerFn<T> = Box<dyn FnMut(T) + Send + 'static>;

/// The consumer currently attached to a queue
enum Handler<T> {
    Idle,
    Every(HandlerFn<T>),
    Next(oneshot::Sender<T>),
}

struct Inner<T> {
    buffer: VecDeque<T>,
    handler: Handler<T>,
    /// Set while `drain` owns delivery; pushes only buffer meanwhile
    delivering: bool,
    /// Bumped on every handler change so an in-flight delivery knows
    /// whether to reinstall the handler it borrowed
    generation: u64,
}

impl<T> Inner<T> {
    fn replace_handler(&mut self, handler: Handler<T>) {
        self.generation = self.generation.wrapping_add(1);
        // Dropping a pending one-shot sender fails its future with `Cancelled`
        self.handler = handler;
    }
}

/// Single-consumer, FIFO queue
///
/// Items pushed while no consumer is attached are buffered. Attaching a
/// consumer drains the buffer in order. A consumer is invoked synchronously
/// from `push`, one item at a time; pushes made while a consumer runs are
/// appended to the buffer and delivered after it returns, never recursively.
pub struct Queue<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Queue")
            .field("buffered", &inner.buffer.len())
            .field("delivering", &inner.delivering)
            .finish()
    }
}

impl<T: Send + 'static> Queue<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                buffer: VecDeque::new(),
                handler: Handler::Idle,
                delivering: false,
                generation: 0,
            })),
        }
    }

    /// Push an item, delivering it immediately if a consumer is attached
    pub fn push(&self, item: T) {
        self.inner.lock().buffer.push_back(item);
        self.drain();
    }

    /// Attach a consumer for every item, draining anything buffered first
    pub fn set_handler<F>(&self, handler: F)
    where
        F: FnMut(T) + Send + 'static,
    {
        self.inner
            .lock()
            .replace_handler(Handler::Every(Box::new(handler)));
        self.drain();
    }

    /// Attach a one-shot consumer
    ///
    /// The returned future resolves with the next item; the queue is
    /// detached after that single delivery. Replacing this consumer before
    /// an item arrives resolves the future with `Error::Cancelled`.
    pub fn set_next_handler(&self) -> impl Future<Output = Result<T>> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().replace_handler(Handler::Next(tx));
        self.drain();
        async move { rx.await.map_err(|_| Error::Cancelled) }
    }

    /// Detach the current consumer; later pushes buffer again
    pub fn stop_handling(&self) {
        self.inner.lock().replace_handler(Handler::Idle);
    }

    /// Drop every buffered item, returning how many were discarded
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let dropped = inner.buffer.len();
        inner.buffer.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.inner.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a consumer is attached (or currently running)
    pub fn is_handling(&self) -> bool {
        let inner = self.inner.lock();
        inner.delivering || !matches!(inner.handler, Handler::Idle)
    }

    fn drain(&self) {
        let mut inner = self.inner.lock();
        if inner.delivering {
            return;
        }
        inner.delivering = true;

        while !inner.buffer.is_empty() {
            match std::mem::replace(&mut inner.handler, Handler::Idle) {
                Handler::Idle => break,
                Handler::Next(tx) => {
                    if let Some(item) = inner.buffer.pop_front() {
                        if let Err(item) = tx.send(item) {
                            // Receiver went away without consuming
                            inner.buffer.push_front(item);
                        }
                    }
                }
                Handler::Every(mut handler) => {
                    let generation = inner.generation;
                    if let Some(item) = inner.buffer.pop_front() {
                        MutexGuard::unlocked(&mut inner, || handler(item));
                    }
                    if inner.generation == generation {
                        inner.handler = Handler::Every(handler);
                    }
                }
            }
        }

        inner.delivering = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_test::{assert_pending, assert_ready, task};

    #[test]
    fn test_buffers_until_handler_attached() {
        let queue = Queue::new();
        queue.push(1);
        queue.push(2);
        assert_eq!(queue.len(), 2);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        queue.set_handler(move |n| sink.lock().push(n));
        queue.push(3);

        assert_eq!(*seen.lock(), vec![1, 2, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_push_from_handler_does_not_recurse() {
        let queue: Queue<u32> = Queue::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let depth = Arc::new(AtomicUsize::new(0));

        let (q, sink, d) = (queue.clone(), Arc::clone(&seen), Arc::clone(&depth));
        queue.set_handler(move |n| {
            assert_eq!(d.fetch_add(1, Ordering::SeqCst), 0);
            sink.lock().push(n);
            if n < 3 {
                q.push(n + 10);
                q.push(n + 1);
            }
            d.fetch_sub(1, Ordering::SeqCst);
        });
        queue.push(1);

        assert_eq!(*seen.lock(), vec![1, 11, 2, 12, 3]);
    }

    #[test]
    fn test_next_handler_takes_exactly_one() {
        let queue = Queue::new();
        let mut next = task::spawn(queue.set_next_handler());
        assert_pending!(next.poll());

        queue.push("first");
        queue.push("second");

        assert_eq!(assert_ready!(next.poll()).unwrap(), "first");
        assert_eq!(queue.len(), 1);
        assert!(!queue.is_handling());
    }

    #[test]
    fn test_next_handler_takes_buffered_item() {
        let queue = Queue::new();
        queue.push(7u8);
        let mut next = task::spawn(queue.set_next_handler());
        assert_eq!(assert_ready!(next.poll()).unwrap(), 7);
    }

    #[test]
    fn test_replacing_next_handler_cancels_it() {
        let queue: Queue<u8> = Queue::new();
        let mut first = task::spawn(queue.set_next_handler());
        let mut second = task::spawn(queue.set_next_handler());

        assert!(matches!(assert_ready!(first.poll()), Err(Error::Cancelled)));
        assert_pending!(second.poll());

        queue.push(9);
        assert_eq!(assert_ready!(second.poll()).unwrap(), 9);
    }

    #[test]
    fn test_set_handler_cancels_pending_next() {
        let queue: Queue<u8> = Queue::new();
        let mut next = task::spawn(queue.set_next_handler());
        queue.set_handler(|_| {});
        assert!(matches!(assert_ready!(next.poll()), Err(Error::Cancelled)));
    }

    #[test]
    fn test_dropped_next_future_keeps_item() {
        let queue: Queue<u8> = Queue::new();
        drop(queue.set_next_handler());
        queue.push(4);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_stop_handling_buffers_again() {
        let queue = Queue::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        queue.set_handler(move |_: u8| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        queue.push(1);
        queue.stop_handling();
        queue.push(2);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.clear(), 1);
    }

    #[test]
    fn test_handler_swapped_inside_delivery() {
        let queue: Queue<u8> = Queue::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let (q, sink) = (queue.clone(), Arc::clone(&seen));
        queue.set_handler(move |n| {
            sink.lock().push(("first", n));
            let inner_sink = Arc::clone(&sink);
            q.set_handler(move |n| inner_sink.lock().push(("second", n)));
        });
        queue.push(1);
        queue.push(2);

        assert_eq!(*seen.lock(), vec![("first", 1), ("second", 2)]);
    }
}
