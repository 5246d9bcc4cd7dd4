//! A server: an admission kernel plus N cooperating cores sharing one
//! ready queue, round-robin time-sliced, with a task graph of downstream
//! collaborators invoked in order after local processing.

use std::sync::{
    Arc,
    OnceLock,
};

use parking_lot::Mutex;
use tracing::{
    debug,
    error,
};

use crate::{
    clock::Environment,
    dist::ServiceTimeDist,
    error::ConfigError,
    filter_store::FilterStore,
    queue::Store,
    request::{
        RecordState,
        Request,
    },
};

/// Backoff applied by the admission kernel when the pool is full, and by
/// a core worker polling an `OnHold` request with no context-switch
/// overhead to charge instead. Keeps a degenerate zero-time loop from
/// starving the event queue.
const POLL_BACKOFF: f64 = 0.1;

pub struct Server {
    pub name: String,
    env: Environment,
    input_queue: Store<Request>,
    ready_queue: Store<Request>,
    response_queue: FilterStore<Request>,
    /// Where this server hands off a departing request. Set exactly once
    /// during wiring (`connect`), before `run` begins; `OnceLock` makes
    /// that "write-once, then read-only" contract a compile-time property
    /// instead of a convention.
    out_pipe: OnceLock<FilterStore<Request>>,
    downstream: Mutex<Vec<Arc<Server>>>,
    thread_count: Mutex<usize>,
    avg_service_time: f64,
    cores: usize,
    max_pool_size: usize,
    time_slice: f64,
    cs_overhead: f64,
    service_dist: ServiceTimeDist,
}

impl Server {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        env: &Environment,
        name: impl Into<String>,
        avg_service_time: f64,
        cores: usize,
        max_pool_size: usize,
        time_slice: f64,
        cs_overhead: f64,
        service_dist: ServiceTimeDist,
    ) -> Result<Arc<Self>, ConfigError> {
        if avg_service_time <= 0.0 {
            return Err(ConfigError::NonPositiveServiceTime(avg_service_time));
        }
        if cores == 0 {
            return Err(ConfigError::ZeroCores(cores));
        }
        if max_pool_size == 0 {
            return Err(ConfigError::ZeroPoolSize(max_pool_size));
        }
        if time_slice <= 0.0 {
            return Err(ConfigError::NonPositiveTimeSlice(time_slice));
        }
        if cs_overhead < 0.0 {
            return Err(ConfigError::NegativeOverhead(cs_overhead));
        }
        Ok(Arc::new(Self {
            name: name.into(),
            env: env.clone(),
            input_queue: Store::new(),
            ready_queue: Store::new(),
            response_queue: FilterStore::new(),
            out_pipe: OnceLock::new(),
            downstream: Mutex::new(Vec::new()),
            thread_count: Mutex::new(0),
            avg_service_time,
            cores,
            max_pool_size,
            time_slice,
            cs_overhead,
            service_dist,
        }))
    }

    pub fn input_queue(&self) -> &Store<Request> {
        &self.input_queue
    }

    /// Wired as this server's `out_pipe` by its callers; never drained by
    /// this server itself. Completion of a downstream dispatch is detected
    /// by polling the shared request's own per-service state (see
    /// `step_onhold`), not by reading this queue back.
    pub fn response_queue(&self) -> &FilterStore<Request> {
        &self.response_queue
    }

    pub fn thread_count(&self) -> usize {
        *self.thread_count.lock()
    }

    /// Appends `downstream` to this server's task graph and wires its
    /// `out_pipe` back to this server's `response_queue`.
    pub fn connect(self: &Arc<Self>, downstream: Arc<Server>) {
        downstream.set_out_pipe(self.response_queue.clone());
        self.downstream.lock().push(downstream);
    }

    pub(crate) fn set_out_pipe(&self, pipe: FilterStore<Request>) {
        self.out_pipe
            .set(pipe)
            .unwrap_or_else(|_| panic!("server {} already has an out_pipe wired", self.name));
    }

    fn out_pipe(&self) -> &FilterStore<Request> {
        self.out_pipe.get().unwrap_or_else(|| {
            panic!(
                "server {} has no out_pipe; connect it to a caller before starting the simulation",
                self.name
            )
        })
    }

    fn snapshot_queue_length(&self) -> usize {
        self.input_queue.len() + *self.thread_count.lock() + self.input_queue.pending_put_count() + 1
    }

    pub fn sample_service_time(&self) -> f64 {
        self.env
            .with_rng(|rng| self.service_dist.sample(rng, self.avg_service_time))
    }

    /// Spawns the admission kernel and `cores` core workers.
    pub fn start(self: &Arc<Self>) {
        let kernel = self.clone();
        self.env.spawn(async move { kernel.kernel_loop().await });
        for _ in 0..self.cores {
            let core = self.clone();
            self.env.spawn(async move { core.core_loop().await });
        }
    }

    async fn kernel_loop(self: Arc<Self>) {
        loop {
            if *self.thread_count.lock() < self.max_pool_size {
                let request = self.input_queue.get().await;
                let now = self.env.now();
                // Snapshot queue length (and thread_count) *before*
                // admitting this request, matching the source model's
                // step order: arrival is timestamped, then the thread is
                // acquired.
                let queue_length = self.snapshot_queue_length();
                let service_time = self.sample_service_time();
                request.mark_arrived(&self.name, now, service_time, queue_length);
                *self.thread_count.lock() += 1;
                self.ready_queue.put(request);
            } else {
                debug!(server = %self.name, "pool at capacity, backing off");
                self.env.timeout(POLL_BACKOFF).await;
            }
        }
    }

    async fn core_loop(self: Arc<Self>) {
        loop {
            let request = self.ready_queue.get().await;
            let subtask_index = request.subtask_index(&self.name);
            match request.state(&self.name) {
                RecordState::Processing => self.step_processing(&request, subtask_index).await,
                RecordState::OnHold => self.step_onhold(&request, subtask_index).await,
                other => {
                    error!(
                        server = %self.name,
                        user_id = request.user_id(),
                        ?other,
                        "protocol violation: request observed outside {{Processing, OnHold}} on the ready queue"
                    );
                    panic!(
                        "server {} observed request (user {}) in state {other:?} on its ready queue",
                        self.name,
                        request.user_id()
                    );
                },
            }
            if self.cs_overhead > 0.0 {
                self.env.timeout(self.cs_overhead).await;
            }
        }
    }

    async fn step_processing(self: &Arc<Self>, request: &Request, subtask_index: usize) {
        if subtask_index == 0 {
            let consumed = request.consume_slice(&self.name, self.time_slice);
            if consumed == self.time_slice {
                self.env.timeout(self.time_slice).await;
            } else {
                if consumed > 0.0 {
                    self.env.timeout(consumed).await;
                }
                request.advance_subtask(&self.name);
            }
            self.ready_queue.put(request.clone());
            return;
        }

        let downstream_len = self.downstream.lock().len();
        if subtask_index <= downstream_len {
            let next = self.downstream.lock()[subtask_index - 1].clone();
            request.set_onhold(&self.name);
            request.mark_sent(&next.name, self.env.now());
            next.input_queue.put(request.clone());
            // Do not await the downstream reply inline. Re-enqueuing here
            // lets other cores progress; `step_onhold` polls for
            // completion on subsequent visits instead.
            self.ready_queue.put(request.clone());
        } else {
            *self.thread_count.lock() -= 1;
            request.mark_departed(&self.name);
            self.out_pipe().put(request.clone());
        }
    }

    async fn step_onhold(self: &Arc<Self>, request: &Request, subtask_index: usize) {
        let next = self.downstream.lock()[subtask_index - 1].clone();
        if request.state(&next.name) == RecordState::Completed {
            request.mark_received(&next.name, self.env.now());
            request.advance_subtask(&self.name);
            request.release_onhold(&self.name);
        } else if self.cs_overhead <= 0.0 {
            self.env.timeout(POLL_BACKOFF).await;
        }
        self.ready_queue.put(request.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dist::DurationDist;

    #[test]
    fn construction_rejects_bad_configuration() {
        let env = Environment::new(0);
        assert_eq!(
            Server::new(&env, "s", 0.0, 1, 1, 1.0, 0.0, DurationDist::default()).unwrap_err(),
            ConfigError::NonPositiveServiceTime(0.0)
        );
        assert_eq!(
            Server::new(&env, "s", 1.0, 0, 1, 1.0, 0.0, DurationDist::default()).unwrap_err(),
            ConfigError::ZeroCores(0)
        );
        assert_eq!(
            Server::new(&env, "s", 1.0, 1, 0, 1.0, 0.0, DurationDist::default()).unwrap_err(),
            ConfigError::ZeroPoolSize(0)
        );
        assert_eq!(
            Server::new(&env, "s", 1.0, 1, 1, 0.0, 0.0, DurationDist::default()).unwrap_err(),
            ConfigError::NonPositiveTimeSlice(0.0)
        );
        assert_eq!(
            Server::new(&env, "s", 1.0, 1, 1, 1.0, -1.0, DurationDist::default()).unwrap_err(),
            ConfigError::NegativeOverhead(-1.0)
        );
    }

    #[test]
    #[should_panic(expected = "has no out_pipe")]
    fn departing_without_a_wired_out_pipe_panics() {
        let env = Environment::new(0);
        let server = Server::new(&env, "s", 10.0, 1, 1, 10.0, 0.0, DurationDist::Constant(10.0)).unwrap();
        server.start();
        server.input_queue.put(Request::new(1));
        env.run(1000.0);
    }
}
