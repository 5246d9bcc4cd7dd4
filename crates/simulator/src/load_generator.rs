//! A closed-loop load generator: a fixed population of users, each
//! cycling think -> dispatch -> await response forever.

use std::sync::{
    Arc,
    OnceLock,
};

use parking_lot::Mutex;
use tracing::warn;

use crate::{
    clock::Environment,
    dist::ThinkTimeDist,
    error::ConfigError,
    filter_store::FilterStore,
    request::Request,
    server::Server,
};

pub struct LoadGenerator {
    pub name: String,
    env: Environment,
    avg_think_time: f64,
    no_of_users: u64,
    think_dist: ThinkTimeDist,
    connected: OnceLock<Arc<Server>>,
    response_store: FilterStore<Request>,
    served_requests: Mutex<Vec<Request>>,
}

impl LoadGenerator {
    pub fn new(
        env: &Environment,
        name: impl Into<String>,
        avg_think_time: f64,
        no_of_users: u64,
        think_dist: ThinkTimeDist,
    ) -> Result<Arc<Self>, ConfigError> {
        if avg_think_time < 0.0 {
            return Err(ConfigError::NegativeThinkTime(avg_think_time));
        }
        if no_of_users == 0 {
            return Err(ConfigError::ZeroUsers(no_of_users));
        }
        Ok(Arc::new(Self {
            name: name.into(),
            env: env.clone(),
            avg_think_time,
            no_of_users,
            think_dist,
            connected: OnceLock::new(),
            response_store: FilterStore::new(),
            served_requests: Mutex::new(Vec::new()),
        }))
    }

    /// Wires this generator to the server it dispatches into. The
    /// server's own `out_pipe` becomes this generator's private response
    /// store, so a departing request lands directly where `user_loop` is
    /// waiting for it, keyed by `user_id`.
    pub fn connect(self: &Arc<Self>, server: Arc<Server>) {
        server.set_out_pipe(self.response_store.clone());
        self.connected
            .set(server)
            .unwrap_or_else(|_| panic!("load generator {} is already connected", self.name));
    }

    fn connected_server(&self) -> &Arc<Server> {
        self.connected.get().unwrap_or_else(|| {
            panic!(
                "load generator {} has no connected server; call connect() before start()",
                self.name
            )
        })
    }

    pub fn start(self: &Arc<Self>) {
        for user_id in 0..self.no_of_users {
            let me = self.clone();
            self.env.spawn(async move { me.user_loop(user_id).await });
        }
    }

    async fn user_loop(self: Arc<Self>, user_id: u64) {
        let server = self.connected_server().clone();
        loop {
            if self.avg_think_time > 0.0 {
                let think = self
                    .env
                    .with_rng(|rng| self.think_dist.sample(rng, self.avg_think_time));
                self.env.timeout(think).await;
            }

            let request = Request::new(user_id);
            request.mark_sent(&server.name, self.env.now());
            server.input_queue().put(request.clone());

            let response = self
                .response_store
                .get(move |r: &Request| r.user_id() == user_id)
                .await;
            response.mark_received(&server.name, self.env.now());
            self.served_requests.lock().push(response);
        }
    }

    fn collect<T>(&self, server: &str, extract: impl Fn(&crate::request::ServiceRecord) -> Option<T>) -> Vec<T> {
        let served = self.served_requests.lock();
        served
            .iter()
            .filter_map(|r| {
                let record = r.last_record(server);
                match record {
                    Some(rec) => extract(&rec),
                    None => {
                        warn!(server, user_id = r.user_id(), "no record found for measurement, skipping");
                        None
                    },
                }
            })
            .collect()
    }

    pub fn response_times(&self, server: &str) -> Vec<f64> {
        self.collect(server, |r| r.response_time)
    }

    pub fn start_times(&self, server: &str) -> Vec<f64> {
        self.collect(server, |r| Some(r.start_time))
    }

    pub fn processing_times(&self, server: &str) -> Vec<f64> {
        self.collect(server, |r| Some(r.elapsed_time))
    }

    pub fn queue_lengths(&self, server: &str) -> Vec<usize> {
        self.collect(server, |r| Some(r.queue_length))
    }

    pub fn served_count(&self) -> usize {
        self.served_requests.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construction_rejects_bad_configuration() {
        let env = Environment::new(0);
        assert_eq!(
            LoadGenerator::new(&env, "lg", -1.0, 1, ThinkTimeDist::default()).unwrap_err(),
            ConfigError::NegativeThinkTime(-1.0)
        );
        assert_eq!(
            LoadGenerator::new(&env, "lg", 1.0, 0, ThinkTimeDist::default()).unwrap_err(),
            ConfigError::ZeroUsers(0)
        );
    }

    #[test]
    #[should_panic(expected = "has no connected server")]
    fn starting_without_a_connected_server_panics() {
        let env = Environment::new(0);
        let lg = LoadGenerator::new(&env, "lg", 0.0, 1, ThinkTimeDist::default()).unwrap();
        lg.start();
        env.run(1.0);
    }
}
