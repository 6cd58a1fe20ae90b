use std::convert::TryFrom;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use http::{header::AUTHORIZATION, HeaderMap, HeaderName, HeaderValue, Method};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::body::{BodyConsumer, Delivery, DeliveryError};
use super::http::Client;
use super::response::{Response, ResponseHead};
use crate::{auth::Realm, redirect, Error};

/// A request which can be executed with `Client::execute()`.
pub struct Request {
    pub(super) method: Method,
    pub(super) url: Url,
    pub(super) headers: HeaderMap,
    pub(super) body: Option<Bytes>,
    pub(super) realm: Option<Realm>,
    pub(super) timeout: Option<Duration>,
    pub(super) redirect: Option<redirect::Policy>,
    pub(super) max_retries: Option<usize>,
    pub(super) cancel: Option<CancellationToken>,
}

/// A builder to construct the properties of a `Request`.
///
/// To construct a `RequestBuilder`, refer to the `Client` documentation.
#[must_use = "RequestBuilder does nothing until you 'send' it"]
pub struct RequestBuilder {
    client: Client,
    request: crate::Result<Request>,
    follow_redirect: Option<bool>,
    max_redirects: Option<usize>,
}

impl Request {
    /// Constructs a new request.
    #[inline]
    pub fn new(method: Method, url: Url) -> Self {
        Request {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            realm: None,
            timeout: None,
            redirect: None,
            max_retries: None,
            cancel: None,
        }
    }

    /// Get the method.
    #[inline]
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Get a mutable reference to the method.
    #[inline]
    pub fn method_mut(&mut self) -> &mut Method {
        &mut self.method
    }

    /// Get the url.
    #[inline]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Get a mutable reference to the url.
    #[inline]
    pub fn url_mut(&mut self) -> &mut Url {
        &mut self.url
    }

    /// Get the headers.
    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Get a mutable reference to the headers.
    #[inline]
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Get the body.
    #[inline]
    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// Get a mutable reference to the body.
    #[inline]
    pub fn body_mut(&mut self) -> &mut Option<Bytes> {
        &mut self.body
    }

    /// Get the realm, if any.
    #[inline]
    pub fn realm(&self) -> Option<&Realm> {
        self.realm.as_ref()
    }

    /// Get the timeout.
    #[inline]
    pub fn timeout(&self) -> Option<&Duration> {
        self.timeout.as_ref()
    }

    /// Get a mutable reference to the timeout.
    #[inline]
    pub fn timeout_mut(&mut self) -> &mut Option<Duration> {
        &mut self.timeout
    }

    /// Attempt to clone the request.
    ///
    /// The cancellation token is shared with the clone.
    pub fn try_clone(&self) -> Option<Request> {
        Some(Request {
            method: self.method.clone(),
            url: self.url.clone(),
            headers: self.headers.clone(),
            body: self.body.clone(),
            realm: self.realm.clone(),
            timeout: self.timeout,
            redirect: self.redirect.clone(),
            max_retries: self.max_retries,
            cancel: self.cancel.clone(),
        })
    }
}

impl RequestBuilder {
    pub(super) fn new(client: Client, request: crate::Result<Request>) -> RequestBuilder {
        RequestBuilder {
            client,
            request,
            follow_redirect: None,
            max_redirects: None,
        }
    }

    /// Assemble a builder starting from an existing `Client` and a `Request`.
    pub fn from_parts(client: Client, request: Request) -> RequestBuilder {
        RequestBuilder::new(client, Ok(request))
    }

    /// Add a `Header` to this Request.
    ///
    /// If the header is already present, the value will be replaced.
    pub fn header<K, V>(self, key: K, value: V) -> RequestBuilder
    where
        HeaderName: TryFrom<K>,
        <HeaderName as TryFrom<K>>::Error: Into<http::Error>,
        HeaderValue: TryFrom<V>,
        <HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
    {
        self.header_sensitive(key, value, false)
    }

    fn header_sensitive<K, V>(mut self, key: K, value: V, sensitive: bool) -> RequestBuilder
    where
        HeaderName: TryFrom<K>,
        <HeaderName as TryFrom<K>>::Error: Into<http::Error>,
        HeaderValue: TryFrom<V>,
        <HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
    {
        let mut error = None;
        if let Ok(ref mut req) = self.request {
            match <HeaderName as TryFrom<K>>::try_from(key) {
                Ok(key) => match <HeaderValue as TryFrom<V>>::try_from(value) {
                    Ok(mut value) => {
                        // We want to potentially make an unsensitive header
                        // to be sensitive, not the reverse.
                        if sensitive {
                            value.set_sensitive(true);
                        }
                        req.headers_mut().insert(key, value);
                    }
                    Err(e) => error = Some(Error::builder(e.into())),
                },
                Err(e) => error = Some(Error::builder(e.into())),
            };
        }
        if let Some(err) = error {
            self.request = Err(err);
        }
        self
    }

    /// Add a set of Headers to the existing ones on this Request.
    ///
    /// The headers will be merged in to any already set.
    pub fn headers(mut self, headers: HeaderMap) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            crate::util::replace_headers(req.headers_mut(), headers);
        }
        self
    }

    /// Authenticate with `realm`, answering its scheme's challenges.
    ///
    /// Overrides the realm configured on the client.
    pub fn realm(mut self, realm: Realm) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            req.realm = Some(realm);
        }
        self
    }

    /// Enable HTTP basic authentication with a fixed `Authorization` header.
    ///
    /// ```rust
    /// # use courier::Error;
    ///
    /// # async fn run() -> Result<(), Error> {
    /// let client = courier::Client::new();
    /// let resp = client
    ///     .delete("http://httpbin.org/delete")
    ///     .basic_auth("admin", Some("good password"))
    ///     .send()
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn basic_auth<U, P>(self, username: U, password: Option<P>) -> RequestBuilder
    where
        U: fmt::Display,
        P: fmt::Display,
    {
        let header_value = crate::util::basic_auth(username, password);
        self.header_sensitive(AUTHORIZATION, header_value, true)
    }

    /// Enables a request timeout.
    ///
    /// The timeout is applied from when the request starts connecting until the
    /// response body has finished. It affects only this request and overrides
    /// the timeout configured using `ClientBuilder::request_timeout()`.
    pub fn timeout(mut self, timeout: Duration) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            req.timeout = Some(timeout);
        }
        self
    }

    /// Set the request body.
    pub fn body<T: Into<Bytes>>(mut self, body: T) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            req.body = Some(body.into());
        }
        self
    }

    /// Follow redirects for this request, overriding the client setting.
    pub fn follow_redirect(mut self, enable: bool) -> RequestBuilder {
        self.follow_redirect = Some(enable);
        self
    }

    /// The number of redirects this request may follow.
    pub fn max_redirects(mut self, max: usize) -> RequestBuilder {
        self.max_redirects = Some(max);
        self
    }

    /// Set the redirect policy for this request.
    pub fn redirect(mut self, policy: redirect::Policy) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            req.redirect = Some(policy);
        }
        self
    }

    /// The number of times a failed send may be retried.
    pub fn max_retries(mut self, max: usize) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            req.max_retries = Some(max);
        }
        self
    }

    /// Cancel the request, and the delivery of its body, when `token` is
    /// canceled.
    pub fn cancel_token(mut self, token: CancellationToken) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            req.cancel = Some(token);
        }
        self
    }

    /// Build a `Request`, which can be inspected, modified and executed with
    /// `Client::execute()`.
    pub fn build(self) -> crate::Result<Request> {
        self.build_split().1
    }

    /// Build a `Request`, which can be inspected, modified and executed with
    /// `Client::execute()`.
    ///
    /// This is similar to [`RequestBuilder::build()`], but also returns the
    /// embedded `Client`.
    pub fn build_split(self) -> (Client, crate::Result<Request>) {
        let RequestBuilder {
            client,
            request,
            follow_redirect,
            max_redirects,
        } = self;

        let request = request.map(|mut req| {
            if req.redirect.is_none() && (follow_redirect.is_some() || max_redirects.is_some()) {
                let config = client.config();
                let follow = follow_redirect.unwrap_or(config.follow_redirect);
                let max = max_redirects.unwrap_or(config.max_redirects);
                req.redirect = Some(if follow {
                    redirect::Policy::limited(max)
                } else {
                    redirect::Policy::none()
                });
            }
            req
        });
        (client, request)
    }

    /// Constructs the Request and sends it to the target URL, returning a
    /// future Response.
    ///
    /// # Errors
    ///
    /// This method fails if there was an error while sending request,
    /// redirect loop was detected or redirect limit was exhausted.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # use courier::Error;
    /// #
    /// # async fn run() -> Result<(), Error> {
    /// let response = courier::Client::new()
    ///     .get("https://hyper.rs")
    ///     .send()
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn send(self) -> impl Future<Output = crate::Result<Response>> {
        let (client, req) = self.build_split();
        async move { client.execute(req?).await }
    }

    /// Sends the request and delivers the body to `consumer`.
    ///
    /// See [`Client::execute_with`].
    pub fn send_with<C>(
        self,
        consumer: C,
    ) -> impl Future<Output = Result<(ResponseHead, Delivery<C>), DeliveryError<C>>>
    where
        C: BodyConsumer,
    {
        let (client, req) = self.build_split();
        async move {
            match req {
                Ok(req) => client.execute_with(req, consumer).await,
                Err(err) => Err(DeliveryError::new(err, consumer)),
            }
        }
    }

    /// Attempt to clone the RequestBuilder.
    ///
    /// `None` is returned if the RequestBuilder can not be cloned.
    pub fn try_clone(&self) -> Option<RequestBuilder> {
        self.request
            .as_ref()
            .ok()
            .and_then(|req| req.try_clone())
            .map(|req| RequestBuilder {
                client: self.client.clone(),
                request: Ok(req),
                follow_redirect: self.follow_redirect,
                max_redirects: self.max_redirects,
            })
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt_request_fields(&mut f.debug_struct("Request"), self).finish()
    }
}

impl fmt::Debug for RequestBuilder {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut builder = f.debug_struct("RequestBuilder");
        match self.request {
            Ok(ref req) => fmt_request_fields(&mut builder, req).finish(),
            Err(ref err) => builder.field("error", err).finish(),
        }
    }
}

fn fmt_request_fields<'a, 'b>(
    f: &'a mut fmt::DebugStruct<'a, 'b>,
    req: &Request,
) -> &'a mut fmt::DebugStruct<'a, 'b> {
    f.field("method", &req.method)
        .field("url", &req.url.as_str())
        .field("headers", &req.headers)
        .field("realm", &req.realm)
}
