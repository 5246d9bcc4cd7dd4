//! `FilterStore<T>`: like [`crate::queue::Store`], but each waiting
//! consumer supplies a predicate and receives the first item that
//! satisfies it. Used to demultiplex downstream replies by `user_id`.

use std::{
    collections::VecDeque,
    sync::Arc,
};

use futures::channel::oneshot;
use parking_lot::Mutex;

type Predicate<T> = Box<dyn Fn(&T) -> bool + Send>;

struct FilterWaiter<T> {
    pred: Predicate<T>,
    tx: oneshot::Sender<T>,
}

struct FilterStoreInner<T> {
    items: VecDeque<T>,
    waiters: VecDeque<FilterWaiter<T>>,
}

pub struct FilterStore<T> {
    inner: Arc<Mutex<FilterStoreInner<T>>>,
}

impl<T> Clone for FilterStore<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for FilterStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FilterStore<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(FilterStoreInner {
                items: VecDeque::new(),
                waiters: VecDeque::new(),
            })),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Offers `item` to waiters in FIFO order; the first whose predicate
    /// accepts it consumes it. If none accept, `item` is appended to the
    /// buffer for a future `get` to find.
    pub fn put(&self, mut item: T) {
        let mut inner = self.inner.lock();
        let accepting = inner.waiters.iter().position(|w| (w.pred)(&item));
        if let Some(idx) = accepting {
            let waiter = inner
                .waiters
                .remove(idx)
                .expect("index came from this deque");
            match waiter.tx.send(item) {
                Ok(()) => return,
                Err(returned) => item = returned, // waiter's future was dropped after all
            }
        }
        inner.items.push_back(item);
    }

    /// Returns the first buffered item matching `pred` (searched in
    /// insertion order); if none exists yet, suspends with `pred`
    /// registered until a matching `put` arrives.
    pub async fn get(&self, pred: impl Fn(&T) -> bool + Send + 'static) -> T {
        let rx = {
            let mut inner = self.inner.lock();
            let found = inner.items.iter().position(|x| pred(x));
            if let Some(idx) = found {
                return inner.items.remove(idx).expect("index came from this deque");
            }
            let (tx, rx) = oneshot::channel();
            inner.waiters.push_back(FilterWaiter {
                pred: Box::new(pred),
                tx,
            });
            rx
        };
        rx.await
            .expect("FilterStore sender dropped while a waiter was pending")
    }
}
