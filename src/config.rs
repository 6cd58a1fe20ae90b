use std::time::Duration;

use crate::{auth::Realm, redirect::Policy};

// ================================
//
// The client configuration.
//
// Every option is read once, when `ClientBuilder::build` freezes it into an
// `Arc<Config>`, and stays immutable for the lifetime of the `Client`.
//
// To add a new option:
//
// 1. add the field here with its default in `Config::default`,
// 2. expose a setter on `ClientBuilder`,
// 3. read it from the pool or the executor through `&Config`.
//
// ================================

#[derive(Clone, Debug)]
pub(crate) struct Config {
    pub(crate) pool: PoolConfig,
    pub(crate) connect_timeout: Option<Duration>,
    pub(crate) read_timeout: Option<Duration>,
    pub(crate) request_timeout: Option<Duration>,
    pub(crate) follow_redirect: bool,
    pub(crate) max_redirects: usize,
    pub(crate) redirect_policy: Option<Policy>,
    pub(crate) strict_302_handling: bool,
    pub(crate) max_request_retry: usize,
    pub(crate) max_auth_retries: usize,
    pub(crate) user_agent: Option<http::HeaderValue>,
    pub(crate) realm: Option<Realm>,
    pub(crate) nodelay: bool,
}

/// Limits and lifetimes applied by the connection pool.
#[derive(Clone, Debug)]
pub(crate) struct PoolConfig {
    pub(crate) max_connections: Option<usize>,
    pub(crate) max_connections_per_host: Option<usize>,
    pub(crate) idle_timeout: Option<Duration>,
    pub(crate) connection_ttl: Option<Duration>,
    pub(crate) cleaner_period: Duration,
    pub(crate) acquire_timeout: Option<Duration>,
    pub(crate) allow_pooling: bool,
    pub(crate) allow_pooling_ssl: bool,
}

impl Default for PoolConfig {
    fn default() -> PoolConfig {
        PoolConfig {
            max_connections: None,
            max_connections_per_host: None,
            idle_timeout: Some(Duration::from_secs(60)),
            connection_ttl: None,
            cleaner_period: Duration::from_secs(1),
            acquire_timeout: None,
            allow_pooling: true,
            allow_pooling_ssl: true,
        }
    }
}

impl Default for Config {
    fn default() -> Config {
        Config {
            pool: PoolConfig::default(),
            connect_timeout: Some(Duration::from_secs(5)),
            read_timeout: Some(Duration::from_secs(60)),
            request_timeout: Some(Duration::from_secs(60)),
            follow_redirect: false,
            max_redirects: 5,
            redirect_policy: None,
            strict_302_handling: false,
            max_request_retry: 5,
            max_auth_retries: 4,
            user_agent: Some(http::HeaderValue::from_static(concat!(
                "courier/",
                env!("CARGO_PKG_VERSION")
            ))),
            realm: None,
            nodelay: true,
        }
    }
}

impl Config {
    /// The redirect policy for a request that did not override it.
    pub(crate) fn redirect_policy(&self) -> Policy {
        match self.redirect_policy {
            Some(ref policy) => policy.clone(),
            None if self.follow_redirect => Policy::limited(self.max_redirects),
            None => Policy::none(),
        }
    }
}
