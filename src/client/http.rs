use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use http::{HeaderValue, Method};

use super::body::{BodyConsumer, Delivery, DeliveryError};
use super::exec;
use super::request::{Request, RequestBuilder};
use super::response::{Response, ResponseHead};
use crate::auth::{ConnectionAuth, Realm};
use crate::config::Config;
use crate::connect::{Connect, Connector, HttpConnection, TcpConnector};
use crate::pool::{Pool, PoolStats};
use crate::{redirect, Error, IntoUrl};

/// An asynchronous `Client` to make Requests with.
///
/// The Client has various configuration values to tweak, but the defaults
/// are set to what is usually the most commonly desired value. To configure a
/// `Client`, use `Client::builder()`.
///
/// The `Client` holds a connection pool internally, so it is advised that
/// you create one and **reuse** it.
///
/// You do **not** have to wrap the `Client` in an [`Rc`] or [`Arc`] to **reuse** it,
/// because it already uses an [`Arc`] internally.
///
/// [`Rc`]: std::rc::Rc
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientRef>,
}

/// A `ClientBuilder` can be used to create a `Client` with custom configuration.
#[must_use]
pub struct ClientBuilder {
    config: Config,
    connector: Option<Arc<dyn Connect>>,
    error: Option<Error>,
}

/// What every request of a `Client` shares.
pub(crate) struct ClientRef {
    pub(crate) config: Config,
    pub(crate) pool: Pool<HttpConnection>,
    pub(crate) connector: Connector,
    pub(crate) auth: Arc<ConnectionAuth>,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientBuilder {
    /// Constructs a new `ClientBuilder`.
    ///
    /// This is the same as `Client::builder()`.
    pub fn new() -> ClientBuilder {
        ClientBuilder {
            config: Config::default(),
            connector: None,
            error: None,
        }
    }

    /// Returns a `Client` that uses this `ClientBuilder` configuration.
    ///
    /// # Errors
    ///
    /// This method fails if a setter received an invalid value, or a pool
    /// limit was set to zero.
    pub fn build(self) -> crate::Result<Client> {
        if let Some(err) = self.error {
            return Err(err);
        }
        let config = self.config;

        if config.pool.max_connections == Some(0) || config.pool.max_connections_per_host == Some(0) {
            return Err(Error::builder("connection limits must be at least 1"));
        }
        if config.pool.cleaner_period.is_zero() {
            return Err(Error::builder("pool cleaner period must not be zero"));
        }

        let auth = Arc::new(ConnectionAuth::default());
        let pool = Pool::new(config.pool.clone());
        {
            let auth = Arc::downgrade(&auth);
            pool.on_close(move |id| {
                if let Some(auth) = auth.upgrade() {
                    auth.remove(id);
                }
            });
        }

        let transport = self
            .connector
            .unwrap_or_else(|| Arc::new(TcpConnector::new(config.nodelay)));
        let connector = Connector::new(transport, config.connect_timeout);

        Ok(Client {
            inner: Arc::new(ClientRef {
                config,
                pool,
                connector,
                auth,
            }),
        })
    }

    /// Sets the `User-Agent` header to be used by this client.
    ///
    /// # Example
    ///
    /// ```rust
    /// # async fn doc() -> Result<(), courier::Error> {
    /// // Name your user agent after your app?
    /// static APP_USER_AGENT: &str = concat!(
    ///     env!("CARGO_PKG_NAME"),
    ///     "/",
    ///     env!("CARGO_PKG_VERSION"),
    /// );
    ///
    /// let client = courier::Client::builder()
    ///     .user_agent(APP_USER_AGENT)
    ///     .build()?;
    /// let res = client.get("http://www.rust-lang.org").send().await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn user_agent<V>(mut self, value: V) -> ClientBuilder
    where
        V: TryInto<HeaderValue>,
        V::Error: Into<http::Error>,
    {
        match value.try_into() {
            Ok(value) => self.config.user_agent = Some(value),
            Err(e) => self.error = Some(Error::builder(e.into())),
        };
        self
    }

    /// Do not send a `User-Agent` header.
    pub fn no_user_agent(mut self) -> ClientBuilder {
        self.config.user_agent = None;
        self
    }

    /// Authenticate every request with `realm`, unless the request sets its
    /// own.
    pub fn realm(mut self, realm: Realm) -> ClientBuilder {
        self.config.realm = Some(realm);
        self
    }

    // Redirect options

    /// Follow redirects, up to `max_redirects`.
    ///
    /// Default is `false`.
    pub fn follow_redirect(mut self, enable: bool) -> ClientBuilder {
        self.config.follow_redirect = enable;
        self
    }

    /// The number of redirects a request may follow.
    ///
    /// Default is 5.
    pub fn max_redirects(mut self, max: usize) -> ClientBuilder {
        self.config.max_redirects = max;
        self
    }

    /// Set a `redirect::Policy` for this client, replacing
    /// `follow_redirect` and `max_redirects`.
    pub fn redirect(mut self, policy: redirect::Policy) -> ClientBuilder {
        self.config.redirect_policy = Some(policy);
        self
    }

    /// Keep the method and body when following a `302 Found`.
    ///
    /// By default a `302` answer to anything but `GET` or `HEAD` is
    /// followed with a `GET` without a body, as browsers do.
    pub fn strict_302_handling(mut self, enable: bool) -> ClientBuilder {
        self.config.strict_302_handling = enable;
        self
    }

    // Retry options

    /// How many times a request that failed before a response arrived may
    /// be sent again.
    ///
    /// Default is 5.
    pub fn max_request_retry(mut self, max: usize) -> ClientBuilder {
        self.config.max_request_retry = max;
        self
    }

    /// How many challenge responses a request may send.
    ///
    /// Default is 4, enough for an NTLM handshake that restarts once.
    pub fn max_auth_retries(mut self, max: usize) -> ClientBuilder {
        self.config.max_auth_retries = max;
        self
    }

    // Timeout options

    /// Enables a request timeout.
    ///
    /// The timeout is applied from when the request starts connecting until the
    /// response body has finished.
    ///
    /// Default is 60 seconds. Pass `None` to disable it.
    pub fn request_timeout<D>(mut self, timeout: D) -> ClientBuilder
    where
        D: Into<Option<Duration>>,
    {
        self.config.request_timeout = timeout.into();
        self
    }

    /// Set a timeout for every read: the response head, and each part of the
    /// body.
    ///
    /// Default is 60 seconds.
    pub fn read_timeout<D>(mut self, timeout: D) -> ClientBuilder
    where
        D: Into<Option<Duration>>,
    {
        self.config.read_timeout = timeout.into();
        self
    }

    /// Set a timeout for only the connect phase of a `Client`.
    ///
    /// Default is 5 seconds.
    ///
    /// # Note
    ///
    /// This **requires** the futures be executed in a tokio runtime with
    /// a tokio timer enabled.
    pub fn connect_timeout<D>(mut self, timeout: D) -> ClientBuilder
    where
        D: Into<Option<Duration>>,
    {
        self.config.connect_timeout = timeout.into();
        self
    }

    // Pool options

    /// The maximum number of open connections, across all hosts.
    ///
    /// Default is unlimited.
    pub fn max_connections(mut self, max: usize) -> ClientBuilder {
        self.config.pool.max_connections = Some(max);
        self
    }

    /// The maximum number of open connections to one host.
    ///
    /// Default is unlimited.
    pub fn max_connections_per_host(mut self, max: usize) -> ClientBuilder {
        self.config.pool.max_connections_per_host = Some(max);
        self
    }

    /// Set an optional timeout for idle sockets being kept-alive.
    ///
    /// Pass `None` to disable timeout.
    ///
    /// Default is 60 seconds.
    pub fn pool_idle_timeout<D>(mut self, val: D) -> ClientBuilder
    where
        D: Into<Option<Duration>>,
    {
        self.config.pool.idle_timeout = val.into();
        self
    }

    /// The maximum age of a pooled connection, whether idle or not.
    ///
    /// Default is unlimited.
    pub fn connection_ttl<D>(mut self, ttl: D) -> ClientBuilder
    where
        D: Into<Option<Duration>>,
    {
        self.config.pool.connection_ttl = ttl.into();
        self
    }

    /// How often expired idle connections of all hosts are swept.
    ///
    /// Default is 1 second.
    pub fn pool_cleaner_period(mut self, period: Duration) -> ClientBuilder {
        self.config.pool.cleaner_period = period;
        self
    }

    /// How long a request waits for a connection when the pool is at
    /// capacity.
    ///
    /// Default is `None`: fail at once.
    pub fn acquire_timeout<D>(mut self, timeout: D) -> ClientBuilder
    where
        D: Into<Option<Duration>>,
    {
        self.config.pool.acquire_timeout = timeout.into();
        self
    }

    /// Keep plain connections open for reuse.
    ///
    /// Default is `true`.
    pub fn allow_pooling(mut self, enable: bool) -> ClientBuilder {
        self.config.pool.allow_pooling = enable;
        self
    }

    /// Keep `https` connections open for reuse.
    ///
    /// Default is `true`.
    pub fn allow_pooling_ssl(mut self, enable: bool) -> ClientBuilder {
        self.config.pool.allow_pooling_ssl = enable;
        self
    }

    // TCP options

    /// Set whether sockets have `TCP_NODELAY` enabled.
    ///
    /// Default is `true`. Has no effect with a custom connector.
    pub fn tcp_nodelay(mut self, enabled: bool) -> ClientBuilder {
        self.config.nodelay = enabled;
        self
    }

    /// Open transport streams with `connector` instead of plain TCP.
    ///
    /// This is how `https` targets are reached: the connector performs the
    /// TLS handshake and returns the encrypted stream.
    pub fn connector<C>(mut self, connector: C) -> ClientBuilder
    where
        C: Connect,
    {
        self.connector = Some(Arc::new(connector));
        self
    }
}

impl fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("config", &self.config)
            .field("custom_connector", &self.connector.is_some())
            .finish()
    }
}

impl Client {
    /// Constructs a new `Client`.
    ///
    /// # Panics
    ///
    /// This method panics if the default configuration cannot be built.
    ///
    /// Use `Client::builder()` if you wish to handle the failure as an `Error`
    /// instead of panicking.
    pub fn new() -> Client {
        ClientBuilder::new().build().expect("Client::new()")
    }

    /// Creates a `ClientBuilder` to configure a `Client`.
    ///
    /// This is the same as `ClientBuilder::new()`.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Convenience method to make a `GET` request to a URL.
    ///
    /// # Errors
    ///
    /// This method fails whenever the supplied `Url` cannot be parsed.
    pub fn get<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::GET, url)
    }

    /// Convenience method to make a `POST` request to a URL.
    ///
    /// # Errors
    ///
    /// This method fails whenever the supplied `Url` cannot be parsed.
    pub fn post<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::POST, url)
    }

    /// Convenience method to make a `PUT` request to a URL.
    ///
    /// # Errors
    ///
    /// This method fails whenever the supplied `Url` cannot be parsed.
    pub fn put<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::PUT, url)
    }

    /// Convenience method to make a `DELETE` request to a URL.
    ///
    /// # Errors
    ///
    /// This method fails whenever the supplied `Url` cannot be parsed.
    pub fn delete<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::DELETE, url)
    }

    /// Convenience method to make a `HEAD` request to a URL.
    ///
    /// # Errors
    ///
    /// This method fails whenever the supplied `Url` cannot be parsed.
    pub fn head<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::HEAD, url)
    }

    /// Start building a `Request` with the `Method` and `Url`.
    ///
    /// Returns a `RequestBuilder`, which will allow setting headers and
    /// the request body before sending.
    ///
    /// # Errors
    ///
    /// This method fails whenever the supplied `Url` cannot be parsed.
    pub fn request<U: IntoUrl>(&self, method: Method, url: U) -> RequestBuilder {
        let req = url.into_url().map(move |url| Request::new(method, url));
        RequestBuilder::new(self.clone(), req)
    }

    /// Executes a `Request`.
    ///
    /// The future resolves once the final response head arrived, after
    /// redirects and authentication challenges were handled. The body is
    /// then read through [`Response::body_mut`] or [`Response::bytes`].
    ///
    /// # Errors
    ///
    /// This method fails if there was an error while sending request,
    /// authentication failed, or the redirect limit was exhausted.
    pub fn execute(&self, request: Request) -> impl Future<Output = Result<Response, Error>> {
        let inner = self.inner.clone();
        async move {
            let (head, body) = exec::execute(&inner, request).await?;
            Ok(Response::new(head, body))
        }
    }

    /// Executes a `Request`, delivering the body to `consumer`.
    ///
    /// The returned [`Delivery`] resolves to the consumer once the body
    /// completed, failed or was canceled, so it can serve the next request.
    ///
    /// # Errors
    ///
    /// If the request fails before a final response head arrived, the
    /// consumer's [`on_error`](BodyConsumer::on_error) is called and the
    /// consumer comes back inside the [`DeliveryError`].
    pub fn execute_with<C>(
        &self,
        request: Request,
        consumer: C,
    ) -> impl Future<Output = Result<(ResponseHead, Delivery<C>), DeliveryError<C>>>
    where
        C: BodyConsumer,
    {
        let inner = self.inner.clone();
        async move {
            match exec::execute(&inner, request).await {
                Ok((head, body)) => Ok((head, Delivery::new(body, consumer))),
                Err(err) => Err(DeliveryError::new(err, consumer)),
            }
        }
    }

    /// Idle, in-use and total connection counts of the pool.
    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }

    pub(super) fn config(&self) -> &Config {
        &self.inner.config
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.inner.config)
            .field("pool", &self.inner.pool.stats())
            .finish()
    }
}
