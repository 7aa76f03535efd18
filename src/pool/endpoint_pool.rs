use std::{
    pin::Pin,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
    config::Config,
    error::WatcherError,
    pool::health::{EndpointHealth, EndpointStatus},
    rpc::{ClientError, Connector, NodeClient},
};

const POOL_LOCK: &str = "pool state lock poisoned";

/// Floor on cooldown waits, guarding against a busy loop when an endpoint
/// frees up mid-round.
const MIN_COOLDOWN_WAIT: Duration = Duration::from_millis(50);

/// Boxed future returned by a reconnect callback.
pub type ReconnectFuture = Pin<Box<dyn Future<Output = Result<(), WatcherError>> + Send>>;

/// Callback invoked after every successful (re)connection with the fresh
/// client. Callbacks run in registration order; a failing callback is logged
/// and does not abort the connection.
pub type ReconnectCallback<C> = Box<dyn Fn(Arc<C>) -> ReconnectFuture + Send + Sync>;

struct ActiveClient<C> {
    index: usize,
    client: Arc<C>,
}

struct PoolState<C> {
    health: Vec<EndpointHealth>,
    current: Option<ActiveClient<C>>,
    /// Ring cursor: where the next selection walk starts.
    cursor: usize,
    destroyed: bool,
}

/// Failover-aware owner of the single active streaming connection.
///
/// Endpoints form a fixed ring. The pool rotates through it on failure,
/// applies an exponential per-endpoint cooldown, sleeps out rounds in which
/// every endpoint is cooling down, and keeps retrying until destroyed; a
/// transient outage never escapes this type. Background probes re-check
/// non-healthy endpoints so recovered providers rejoin the rotation.
pub struct EndpointPool<C: Connector> {
    connector: C,
    endpoints: Vec<Url>,
    state: Mutex<PoolState<C::Client>>,
    /// Serializes connection attempts; waiters share the winner's client.
    connect_lock: tokio::sync::Mutex<()>,
    callbacks: tokio::sync::Mutex<Vec<ReconnectCallback<C::Client>>>,
    base_delay: Duration,
    max_cooldown: Duration,
    health_check_interval: Duration,
    request_timeout: Duration,
    shutdown: CancellationToken,
}

impl<C: Connector> EndpointPool<C> {
    /// Build the pool and start its background health probes.
    pub fn new(config: &Config, connector: C) -> Arc<Self> {
        let endpoints = config.endpoints().to_vec();
        let health = endpoints.iter().cloned().map(EndpointHealth::new).collect();

        let pool = Arc::new(Self {
            connector,
            endpoints,
            state: Mutex::new(PoolState {
                health,
                current: None,
                cursor: 0,
                destroyed: false,
            }),
            connect_lock: tokio::sync::Mutex::new(()),
            callbacks: tokio::sync::Mutex::new(Vec::new()),
            base_delay: config.base_delay(),
            max_cooldown: config.max_cooldown(),
            health_check_interval: config.health_check_interval(),
            request_timeout: config.request_timeout(),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(Arc::clone(&pool).probe_loop());
        pool
    }

    /// The active client, if connected.
    #[must_use]
    pub fn current(&self) -> Option<Arc<C::Client>> {
        let state = self.state.lock().expect(POOL_LOCK);
        state.current.as_ref().map(|active| Arc::clone(&active.client))
    }

    /// URL of the endpoint serving the active client.
    #[must_use]
    pub fn current_endpoint(&self) -> Option<Url> {
        let state = self.state.lock().expect(POOL_LOCK);
        state.current.as_ref().map(|active| self.endpoints[active.index].clone())
    }

    /// Health snapshot of every endpoint, in ring order.
    #[must_use]
    pub fn status(&self) -> Vec<EndpointHealth> {
        self.state.lock().expect(POOL_LOCK).health.clone()
    }

    /// Register a reconnect callback. See [`ReconnectCallback`].
    pub async fn on_reconnect(
        &self,
        callback: impl Fn(Arc<C::Client>) -> ReconnectFuture + Send + Sync + 'static,
    ) {
        self.callbacks.lock().await.push(Box::new(callback));
    }

    /// Obtain a connected client, rotating and waiting out cooldowns as
    /// needed.
    ///
    /// Concurrent callers share a single attempt. The only error is
    /// [`WatcherError::PoolDestroyed`].
    pub async fn connect(&self) -> Result<Arc<C::Client>, WatcherError> {
        loop {
            if let Some(client) = self.current() {
                return Ok(client);
            }
            if self.is_destroyed() {
                return Err(WatcherError::PoolDestroyed);
            }

            let _attempt = tokio::select! {
                guard = self.connect_lock.lock() => guard,
                () = self.shutdown.cancelled() => return Err(WatcherError::PoolDestroyed),
            };
            // another caller may have finished while we waited on the lock
            if let Some(client) = self.current() {
                return Ok(client);
            }
            if self.is_destroyed() {
                return Err(WatcherError::PoolDestroyed);
            }

            if let Some(client) = self.connect_round().await {
                return Ok(client);
            }

            let wait = self.shortest_cooldown();
            info!(
                "ws_manager: all endpoints cooling down, retrying in {}s",
                wait.as_secs().max(1)
            );
            tokio::select! {
                () = sleep(wait) => {}
                () = self.shutdown.cancelled() => return Err(WatcherError::PoolDestroyed),
            }
        }
    }

    /// Report that the active client failed.
    ///
    /// Acts only while `failed` is still the installed client, so late
    /// reports against an already-rotated connection are ignored. The
    /// replacement connection is established before this returns.
    pub async fn report_failure(&self, failed: &Arc<C::Client>, error: &ClientError) {
        let rotated = {
            let mut state = self.state.lock().expect(POOL_LOCK);
            match &state.current {
                Some(active) if Arc::ptr_eq(&active.client, failed) => {
                    let index = active.index;
                    let url = self.endpoints[index].clone();
                    let reason =
                        if error.is_rate_limited() { "rate-limited" } else { "connection lost" };
                    warn!(%url, %error, reason, "ws_manager: endpoint failed, rotating to next endpoint");
                    let now = Instant::now();
                    state.health[index].record_failure(now, self.base_delay, self.max_cooldown);
                    state.current = None;
                    state.cursor = (index + 1) % self.endpoints.len();
                    true
                }
                _ => false,
            }
        };
        if rotated {
            // the reconnection runs to completion before the new client is
            // exposed to anyone
            let _ = self.connect().await;
        }
    }

    /// Tear the pool down: cancels probes and cooldown waits, drops the
    /// client, and fails any in-flight [`connect`](EndpointPool::connect).
    pub fn destroy(&self) {
        {
            let mut state = self.state.lock().expect(POOL_LOCK);
            state.destroyed = true;
            state.current = None;
        }
        self.shutdown.cancel();
        info!("ws_manager: pool destroyed");
    }

    /// One rotation over the ring. Returns the installed client on success,
    /// `None` once every candidate failed or the next one is still cooling
    /// down.
    async fn connect_round(&self) -> Option<Arc<C::Client>> {
        for _ in 0..self.endpoints.len() {
            let (index, ready) = self.select_endpoint();
            if !ready {
                return None;
            }
            let url = self.endpoints[index].clone();
            debug!(%url, "ws_manager: dialing endpoint");
            match self.dial_and_probe(&url).await {
                Ok(client) => {
                    self.install(index, Arc::clone(&client));
                    info!(%url, "ws_manager: connected");
                    self.fire_reconnect_callbacks(&client).await;
                    return Some(client);
                }
                Err(error) => {
                    let reason =
                        if error.is_rate_limited() { "rate-limited" } else { "connect failed" };
                    warn!(%url, %error, reason, "ws_manager: endpoint failed, rotating to next endpoint");
                    self.note_failure(index);
                    self.advance_cursor(index);
                }
            }
        }
        None
    }

    /// Dial `url` and verify the connection answers a `block_number` probe.
    async fn dial_and_probe(&self, url: &Url) -> Result<Arc<C::Client>, ClientError> {
        let client = self.connector.connect(url).await?;
        timeout(self.request_timeout, client.block_number())
            .await
            .map_err(|_| ClientError::Timeout)??;
        Ok(client)
    }

    /// Walk the ring from the cursor and pick the first endpoint that is not
    /// down and out of cooldown. When nothing qualifies, fall back to
    /// whichever endpoint becomes available soonest; `ready` stays false
    /// until that moment arrives.
    fn select_endpoint(&self) -> (usize, bool) {
        let state = self.state.lock().expect(POOL_LOCK);
        let now = Instant::now();
        let count = state.health.len();
        for step in 0..count {
            let index = (state.cursor + step) % count;
            let health = &state.health[index];
            if health.status != EndpointStatus::Down && health.is_available(now) {
                return (index, true);
            }
        }
        let index = state
            .health
            .iter()
            .enumerate()
            .min_by_key(|(_, health)| health.next_available.unwrap_or(now))
            .map(|(index, _)| index)
            .expect("endpoint ring is never empty");
        let ready = state.health[index].is_available(now);
        (index, ready)
    }

    fn install(&self, index: usize, client: Arc<C::Client>) {
        let mut state = self.state.lock().expect(POOL_LOCK);
        state.health[index].record_success(Instant::now());
        state.cursor = index;
        state.current = Some(ActiveClient { index, client });
    }

    fn note_failure(&self, index: usize) {
        let mut state = self.state.lock().expect(POOL_LOCK);
        state.health[index].record_failure(Instant::now(), self.base_delay, self.max_cooldown);
    }

    fn note_probe_success(&self, index: usize) {
        let mut state = self.state.lock().expect(POOL_LOCK);
        state.health[index].record_success(Instant::now());
    }

    fn advance_cursor(&self, failed_index: usize) {
        let mut state = self.state.lock().expect(POOL_LOCK);
        state.cursor = (failed_index + 1) % self.endpoints.len();
    }

    /// Time until the earliest endpoint leaves cooldown.
    fn shortest_cooldown(&self) -> Duration {
        let state = self.state.lock().expect(POOL_LOCK);
        let now = Instant::now();
        state
            .health
            .iter()
            .map(|health| {
                health
                    .next_available
                    .map_or(Duration::ZERO, |at| at.saturating_duration_since(now))
            })
            .min()
            .unwrap_or(Duration::ZERO)
            .max(MIN_COOLDOWN_WAIT)
    }

    fn is_destroyed(&self) -> bool {
        self.state.lock().expect(POOL_LOCK).destroyed
    }

    async fn fire_reconnect_callbacks(&self, client: &Arc<C::Client>) {
        let callbacks = self.callbacks.lock().await;
        for (position, callback) in callbacks.iter().enumerate() {
            if let Err(error) = callback(Arc::clone(client)).await {
                error!(position, %error, "ws_manager: reconnect callback failed");
            }
        }
    }

    /// Periodically re-checks non-healthy endpoints whose cooldown expired.
    async fn probe_loop(self: Arc<Self>) {
        let period = self.health_check_interval;
        let mut ticks = interval_at(Instant::now() + period, period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                _ = ticks.tick() => {}
            }
            self.run_probes().await;
        }
    }

    async fn run_probes(&self) {
        let now = Instant::now();
        let candidates: Vec<(usize, bool)> = {
            let state = self.state.lock().expect(POOL_LOCK);
            let active_index = state.current.as_ref().map(|active| active.index);
            state
                .health
                .iter()
                .enumerate()
                .filter(|(_, health)| {
                    health.status != EndpointStatus::Healthy && health.is_available(now)
                })
                .map(|(index, _)| (index, Some(index) == active_index))
                .collect()
        };

        for (index, is_active) in candidates {
            let url = self.endpoints[index].clone();
            if is_active {
                // the active endpoint can flap into Degraded and then serve
                // flawlessly; revalidate over the live connection instead of
                // opening a second socket next to it
                let Some(client) = self.current() else { continue };
                if matches!(timeout(self.request_timeout, client.block_number()).await, Ok(Ok(_))) {
                    debug!(%url, "ws_manager: active endpoint recovered");
                    self.note_probe_success(index);
                }
                continue;
            }
            match self.dial_and_probe(&url).await {
                Ok(_probe_client) => {
                    debug!(%url, "ws_manager: background probe succeeded, endpoint healthy again");
                    self.note_probe_success(index);
                    // the probe client drops here; the active connection is
                    // untouched
                }
                Err(error) => {
                    debug!(%url, %error, "ws_manager: background probe failed");
                }
            }
        }
    }
}
