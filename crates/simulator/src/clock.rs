//! The virtual-time scheduler: a monotonic clock plus a single-threaded
//! cooperative task executor, adapted from this codebase's deterministic
//! test runtime (`common::runtime::testing`) with the real-thread plumbing
//! (`spawn_thread`, the OS-level `ThreadNotify` condvar) stripped out. This
//! simulator has exactly one virtual timeline and never wakes itself from
//! another OS thread.

use std::{
    cmp::Ordering,
    collections::{
        BTreeMap,
        BinaryHeap,
    },
    mem,
    pin::Pin,
    sync::Arc,
    task::{
        Context,
        Wake,
        Waker,
    },
};

use futures::{
    channel::oneshot,
    Future,
    FutureExt,
};
use parking_lot::Mutex;
use rand::SeedableRng;
use rand_chacha::ChaCha12Rng;

/// One pending `timeout()`, ordered so the earliest-scheduled, lowest-id
/// entry sorts to the top of the (max-heap) `BinaryHeap`.
struct TimerEntry {
    time: f64,
    id: u64,
    tx: oneshot::Sender<()>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.id == other.id
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so `BinaryHeap` (a max-heap) behaves as a min-heap on
        // (time, id), firing the earliest-registered event first.
        other
            .time
            .partial_cmp(&self.time)
            .expect("virtual time must be finite and comparable")
            .then_with(|| other.id.cmp(&self.id))
    }
}

struct FutureSetWaker {
    id: usize,
    wake_set: Arc<Mutex<std::collections::BTreeSet<usize>>>,
}

impl Wake for FutureSetWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref()
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.wake_set.lock().insert(self.id);
    }
}

/// Holds every long-lived task spawned onto an [`Environment`] and drives
/// them forward one readiness pass at a time.
struct FutureSet {
    next_id: usize,
    futures: BTreeMap<usize, Pin<Box<dyn Future<Output = ()> + Send>>>,
    wake_set: Arc<Mutex<std::collections::BTreeSet<usize>>>,
}

impl FutureSet {
    fn new() -> Self {
        Self {
            next_id: 0,
            futures: BTreeMap::new(),
            wake_set: Arc::new(Mutex::new(std::collections::BTreeSet::new())),
        }
    }

    fn insert(&mut self, f: impl Future<Output = ()> + Send + 'static) {
        let id = self.next_id;
        self.next_id += 1;
        self.futures.insert(id, f.boxed());
        self.wake_set.lock().insert(id);
    }

    /// Polls every task woken since the last call. Returns `true` if any
    /// task was polled, so callers can loop until a virtual instant is
    /// truly quiescent (a poll can wake other tasks in the same instant).
    fn poll_once(&mut self) -> bool {
        let ready = mem::take(&mut *self.wake_set.lock());
        if ready.is_empty() {
            return false;
        }
        for id in ready {
            let Some(future) = self.futures.get_mut(&id) else {
                continue; // spurious wakeup for an already-completed task
            };
            let waker = Waker::from(Arc::new(FutureSetWaker {
                id,
                wake_set: self.wake_set.clone(),
            }));
            let mut cx = Context::from_waker(&waker);
            if future.as_mut().poll(&mut cx).is_ready() {
                self.futures.remove(&id);
            }
        }
        true
    }
}

struct EnvInner {
    now: f64,
    next_timer_id: u64,
    timers: BinaryHeap<TimerEntry>,
    futures: FutureSet,
    rng: ChaCha12Rng,
}

/// Virtual-time scheduler handle. Cloning shares the same clock, task set,
/// and RNG. Every `Server`/`LoadGenerator` in one topology holds a clone of
/// the same `Environment`; there is no process-global RNG.
#[derive(Clone)]
pub struct Environment {
    inner: Arc<Mutex<EnvInner>>,
}

impl Environment {
    pub fn new(seed: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(EnvInner {
                now: 0.0,
                next_timer_id: 0,
                timers: BinaryHeap::new(),
                futures: FutureSet::new(),
                rng: ChaCha12Rng::seed_from_u64(seed),
            })),
        }
    }

    pub fn now(&self) -> f64 {
        self.inner.lock().now
    }

    /// Registers a cooperative task; it starts running the next time the
    /// environment makes progress (immediately, if called from within
    /// `run`).
    pub fn spawn(&self, task: impl Future<Output = ()> + Send + 'static) {
        self.inner.lock().futures.insert(task);
    }

    /// Suspends the calling task until `now() + duration`. `duration` must
    /// be non-negative; a negative duration is a protocol violation and
    /// aborts the simulation immediately rather than producing a
    /// time-traveling wakeup.
    pub async fn timeout(&self, duration: f64) {
        assert!(
            duration >= 0.0,
            "Environment::timeout requires a non-negative duration, got {duration}"
        );
        let rx = {
            let mut inner = self.inner.lock();
            let fire_at = inner.now + duration;
            let id = inner.next_timer_id;
            inner.next_timer_id += 1;
            let (tx, rx) = oneshot::channel();
            inner.timers.push(TimerEntry { time: fire_at, id, tx });
            rx
        };
        rx.await
            .expect("Environment dropped before a pending timer fired");
    }

    /// Advances the clock by processing events in non-decreasing time
    /// order until no event with time `<= until` remains or no task is
    /// runnable. A call with `until < now()` is a no-op: the clock never
    /// regresses.
    pub fn run(&self, until: f64) {
        loop {
            if until < self.now() {
                return;
            }
            // Drain every task that's ready *without* advancing time: a
            // `put()` or timer firing inside this pass can make more tasks
            // ready in the same virtual instant, so keep polling until a
            // pass makes no progress.
            while self.inner.lock().futures.poll_once() {}

            let next_time = {
                let inner = self.inner.lock();
                inner.timers.peek().map(|e| e.time)
            };
            match next_time {
                Some(t) if t <= until => {
                    self.inner.lock().fire_earliest();
                },
                _ => return,
            }
        }
    }

    pub fn with_rng<R>(&self, f: impl FnOnce(&mut ChaCha12Rng) -> R) -> R {
        f(&mut self.inner.lock().rng)
    }
}

impl EnvInner {
    /// Satisfies the earliest still-live timer, advancing `now` to its
    /// deadline. Timers whose waiter already dropped (an abandoned task)
    /// are skipped over, still advancing the clock past them, mirroring
    /// `StepTimer::step`'s "if send fails, step ahead to the next one".
    fn fire_earliest(&mut self) {
        while let Some(entry) = self.timers.pop() {
            assert!(
                entry.time >= self.now,
                "virtual clock would regress: {} < {}",
                entry.time,
                self.now
            );
            self.now = entry.time;
            if entry.tx.send(()).is_ok() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{
        AtomicUsize,
        Ordering as AtomicOrdering,
    };

    use super::*;

    #[test]
    fn run_advances_clock_and_fires_in_order() {
        let env = Environment::new(0);
        let order = Arc::new(Mutex::new(Vec::new()));

        for (label, delay) in [("b", 5.0), ("a", 1.0), ("c", 10.0)] {
            let env2 = env.clone();
            let order2 = order.clone();
            env.spawn(async move {
                env2.timeout(delay).await;
                order2.lock().push(label);
            });
        }

        env.run(100.0);
        assert_eq!(*order.lock(), vec!["a", "b", "c"]);
        assert_eq!(env.now(), 10.0);
    }

    #[test]
    fn run_is_a_noop_when_until_is_before_now() {
        let env = Environment::new(0);
        env.run(5.0);
        assert_eq!(env.now(), 0.0);
        env.run(2.0);
        assert_eq!(env.now(), 0.0, "clock must never regress");
    }

    #[test]
    fn run_stops_at_the_boundary_leaving_later_events_pending() {
        let env = Environment::new(0);
        let fired = Arc::new(AtomicUsize::new(0));
        let env2 = env.clone();
        let fired2 = fired.clone();
        env.spawn(async move {
            env2.timeout(10.0).await;
            fired2.fetch_add(1, AtomicOrdering::SeqCst);
        });

        env.run(5.0);
        assert_eq!(fired.load(AtomicOrdering::SeqCst), 0);
        assert_eq!(env.now(), 5.0);

        env.run(10.0);
        assert_eq!(fired.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(env.now(), 10.0);
    }

    #[test]
    #[should_panic(expected = "non-negative duration")]
    fn negative_timeout_panics() {
        let env = Environment::new(0);
        let env2 = env.clone();
        env.spawn(async move {
            env2.timeout(-1.0).await;
        });
        env.run(1.0);
    }

    #[test]
    fn resumptions_within_one_instant_follow_fifo_registration_order() {
        let env = Environment::new(0);
        let order = Arc::new(Mutex::new(Vec::new()));
        for label in 0..4 {
            let env2 = env.clone();
            let order2 = order.clone();
            env.spawn(async move {
                env2.timeout(1.0).await;
                order2.lock().push(label);
            });
        }
        env.run(1.0);
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }
}
