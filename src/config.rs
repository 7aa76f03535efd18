//! Immutable runtime configuration and the transfer admission rule.

use std::{
    collections::{HashMap, HashSet},
    str::FromStr,
    time::Duration,
};

use alloy::primitives::{Address, U256, utils::parse_ether};
use url::Url;

use crate::{error::WatcherError, event::WatchedSide};

/// Default base delay of the per-endpoint exponential cooldown.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(5);

/// Default ceiling of the per-endpoint cooldown.
pub const DEFAULT_MAX_COOLDOWN: Duration = Duration::from_secs(300);

/// Default period of the background endpoint health probes.
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Default total timeout applied to every RPC request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Default retention window of the emitted-hash dedup cache.
pub const DEFAULT_DEDUP_RETENTION: Duration = Duration::from_secs(600);

/// Default cap on concurrent mempool transaction lookups.
pub const DEFAULT_PENDING_FETCH_CONCURRENCY: usize = 64;

/// One watch-list entry. Labels may repeat; addresses may not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedWallet {
    pub label: String,
    pub address: Address,
}

/// Immutable watcher configuration.
///
/// Built once with [`Config::builder`] and consumed read-only for the rest of
/// the run.
#[derive(Debug, Clone)]
pub struct Config {
    endpoints: Vec<Url>,
    threshold_wei: U256,
    watched: HashSet<Address>,
    labels: HashMap<Address, String>,
    base_delay: Duration,
    max_cooldown: Duration,
    health_check_interval: Duration,
    request_timeout: Duration,
    dedup_retention: Duration,
    pending_fetch_concurrency: usize,
}

impl Config {
    #[must_use]
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Endpoint ring, in rotation order.
    #[must_use]
    pub fn endpoints(&self) -> &[Url] {
        &self.endpoints
    }

    /// Minimum transfer value that gets emitted, in wei.
    #[must_use]
    pub fn threshold_wei(&self) -> U256 {
        self.threshold_wei
    }

    #[must_use]
    pub fn is_watched(&self, address: &Address) -> bool {
        self.watched.contains(address)
    }

    /// Operator label for `address`, when one was configured.
    #[must_use]
    pub fn label(&self, address: &Address) -> Option<&str> {
        self.labels.get(address).map(String::as_str)
    }

    /// The admission rule shared by both processors.
    ///
    /// A transfer qualifies when it meets the threshold and touches the
    /// watch-list on at least one side. Addresses compare byte-wise, so any
    /// hex casing used at configuration time matches any casing on the wire.
    #[must_use]
    pub fn watched_side(&self, from: Address, to: Address, value: U256) -> Option<WatchedSide> {
        if value < self.threshold_wei {
            return None;
        }
        match (self.watched.contains(&from), self.watched.contains(&to)) {
            (true, true) => Some(WatchedSide::Both),
            (true, false) => Some(WatchedSide::From),
            (false, true) => Some(WatchedSide::To),
            (false, false) => None,
        }
    }

    #[must_use]
    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    #[must_use]
    pub fn max_cooldown(&self) -> Duration {
        self.max_cooldown
    }

    #[must_use]
    pub fn health_check_interval(&self) -> Duration {
        self.health_check_interval
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// How long an emitted hash suppresses re-emission.
    #[must_use]
    pub fn dedup_retention(&self) -> Duration {
        self.dedup_retention
    }

    #[must_use]
    pub fn pending_fetch_concurrency(&self) -> usize {
        self.pending_fetch_concurrency
    }
}

#[derive(Debug, Clone)]
enum Threshold {
    Wei(U256),
    Ether(String),
}

/// Builder for [`Config`] with infallible setters; validation happens in
/// [`build`](ConfigBuilder::build).
#[derive(Debug)]
pub struct ConfigBuilder {
    endpoints: Vec<String>,
    threshold: Threshold,
    wallets: Vec<(String, String)>,
    base_delay: Duration,
    max_cooldown: Duration,
    health_check_interval: Duration,
    request_timeout: Duration,
    dedup_retention: Duration,
    pending_fetch_concurrency: usize,
}

impl ConfigBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            endpoints: Vec::new(),
            threshold: Threshold::Wei(U256::ZERO),
            wallets: Vec::new(),
            base_delay: DEFAULT_BASE_DELAY,
            max_cooldown: DEFAULT_MAX_COOLDOWN,
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            dedup_retention: DEFAULT_DEDUP_RETENTION,
            pending_fetch_concurrency: DEFAULT_PENDING_FETCH_CONCURRENCY,
        }
    }

    /// Append an endpoint. Order is the rotation order; duplicates are
    /// dropped at build time.
    #[must_use]
    pub fn endpoint(mut self, url: impl Into<String>) -> Self {
        self.endpoints.push(url.into());
        self
    }

    /// Append several endpoints in order.
    #[must_use]
    pub fn endpoints<I, T>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.endpoints.extend(urls.into_iter().map(Into::into));
        self
    }

    /// Minimum transfer value, in wei.
    #[must_use]
    pub fn threshold_wei(mut self, value: U256) -> Self {
        self.threshold = Threshold::Wei(value);
        self
    }

    /// Minimum transfer value as a decimal whole-token string, e.g. `"100.25"`.
    ///
    /// Parsed exactly (a decimal shift by 18), never through floating point,
    /// so every representable wei amount round-trips.
    #[must_use]
    pub fn threshold_ether(mut self, value: impl Into<String>) -> Self {
        self.threshold = Threshold::Ether(value.into());
        self
    }

    /// Watch `address` under `label`. The address accepts any hex casing.
    #[must_use]
    pub fn watch(mut self, label: impl Into<String>, address: impl Into<String>) -> Self {
        self.wallets.push((label.into(), address.into()));
        self
    }

    /// Watch an already-parsed wallet.
    #[must_use]
    pub fn wallet(mut self, wallet: WatchedWallet) -> Self {
        self.wallets.push((wallet.label, wallet.address.to_string()));
        self
    }

    #[must_use]
    pub fn base_delay(mut self, value: Duration) -> Self {
        self.base_delay = value;
        self
    }

    #[must_use]
    pub fn max_cooldown(mut self, value: Duration) -> Self {
        self.max_cooldown = value;
        self
    }

    #[must_use]
    pub fn health_check_interval(mut self, value: Duration) -> Self {
        self.health_check_interval = value;
        self
    }

    #[must_use]
    pub fn request_timeout(mut self, value: Duration) -> Self {
        self.request_timeout = value;
        self
    }

    #[must_use]
    pub fn dedup_retention(mut self, value: Duration) -> Self {
        self.dedup_retention = value;
        self
    }

    #[must_use]
    pub fn pending_fetch_concurrency(mut self, value: usize) -> Self {
        self.pending_fetch_concurrency = value;
        self
    }

    /// Validate and freeze the configuration.
    ///
    /// # Errors
    ///
    /// * [`WatcherError::NoEndpoints`] - no endpoint was added.
    /// * [`WatcherError::InvalidEndpoint`] - an endpoint is not a URL.
    /// * [`WatcherError::UnsupportedScheme`] - an endpoint is not `ws`/`wss`.
    /// * [`WatcherError::InvalidThreshold`] - the ether string does not parse.
    /// * [`WatcherError::InvalidAddress`] - a watched address is not 20-byte hex.
    /// * [`WatcherError::DuplicateAddress`] - the same address was added twice
    ///   (in any casing).
    pub fn build(self) -> Result<Config, WatcherError> {
        if self.endpoints.is_empty() {
            return Err(WatcherError::NoEndpoints);
        }

        let mut endpoints: Vec<Url> = Vec::with_capacity(self.endpoints.len());
        for raw in &self.endpoints {
            let url =
                Url::parse(raw).map_err(|_| WatcherError::InvalidEndpoint(raw.clone()))?;
            match url.scheme() {
                "ws" | "wss" => {}
                scheme => {
                    return Err(WatcherError::UnsupportedScheme {
                        scheme: scheme.to_owned(),
                        url,
                    });
                }
            }
            if !endpoints.contains(&url) {
                endpoints.push(url);
            }
        }

        let threshold_wei = match self.threshold {
            Threshold::Wei(value) => value,
            Threshold::Ether(input) => parse_ether(&input)
                .map_err(|source| WatcherError::InvalidThreshold { input, source })?,
        };

        let mut watched = HashSet::with_capacity(self.wallets.len());
        let mut labels = HashMap::with_capacity(self.wallets.len());
        for (label, raw) in self.wallets {
            let address =
                Address::from_str(&raw).map_err(|_| WatcherError::InvalidAddress(raw.clone()))?;
            if !watched.insert(address) {
                return Err(WatcherError::DuplicateAddress(address));
            }
            labels.insert(address, label);
        }

        Ok(Config {
            endpoints,
            threshold_wei,
            watched,
            labels,
            base_delay: self.base_delay,
            max_cooldown: self.max_cooldown,
            health_check_interval: self.health_check_interval,
            request_timeout: self.request_timeout,
            dedup_retention: self.dedup_retention,
            pending_fetch_concurrency: self.pending_fetch_concurrency,
        })
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
