//! Drives one logical request from submission to its final response head.
//!
//! Each pass through the loop is an attempt: pick a connection, send, read
//! the head, then either answer an auth challenge, follow a redirect, retry
//! a transport failure, or hand the body to the streaming channel. Every
//! loop edge spends from a budget, so no request can cycle forever.

use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderValue, ACCEPT, CONNECTION, CONTENT_LENGTH, HOST, LOCATION, USER_AGENT};
use http::{HeaderMap, Method, StatusCode, Uri, Version};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use log::{debug, trace, warn};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::body::{self, BodyStream, Lease, Timeouts};
use super::http::ClientRef;
use super::request::Request;
use super::response::ResponseHead;
use crate::auth::{self, AuthExhausted, AuthRequest, Failure, Negotiator, NextAction, Realm};
use crate::error::{self, Error};
use crate::pool::{Checkout, ConnectionId, Poolable};
use crate::redirect::{self, ActionKind, Policy};
use crate::retry;
use crate::target::Target;

// Challenge bodies larger than this are not worth reading to keep the
// connection; it is closed instead.
const MAX_DRAIN: usize = 64 * 1024;

/// Runs `req` under its cancellation token and overall deadline.
pub(crate) async fn execute(client: &ClientRef, req: Request) -> crate::Result<(ResponseHead, BodyStream)> {
    let cancel = req.cancel.clone().unwrap_or_default();
    let deadline = req
        .timeout
        .or(client.config.request_timeout)
        .map(|t| Instant::now() + t);
    let url = req.url.clone();

    let exec = Exec::new(client, req, cancel.clone(), deadline);
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            debug!("request to {} canceled", url);
            Err(Error::canceled().with_url(url))
        }
        _ = body::sleep_until(deadline) => {
            debug!("request to {} timed out", url);
            Err(Error::timeout().with_url(url))
        }
        res = exec.run() => res,
    }
}

/// A credentials header computed from a challenge, waiting for the next
/// attempt.
struct PendingAuth {
    header: HeaderValue,
    // Set for connection-bound schemes: the header is only valid there.
    conn: Option<ConnectionId>,
}

struct Exec<'a> {
    client: &'a ClientRef,
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Option<Bytes>,
    realm: Option<Realm>,
    policy: Policy,
    history: Vec<Url>,
    retries: retry::Budget,
    auth_retries: retry::Budget,
    negotiator: Negotiator,
    pending_auth: Option<PendingAuth>,
    held: Option<Lease>,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

enum Head {
    /// The response for the caller; its body streams from this lease.
    Final(Incoming, Lease),
    Again,
}

impl<'a> Exec<'a> {
    fn new(
        client: &'a ClientRef,
        req: Request,
        cancel: CancellationToken,
        deadline: Option<Instant>,
    ) -> Exec<'a> {
        let config = &client.config;
        let realm = req.realm.or_else(|| config.realm.clone());
        let negotiator = Negotiator::for_realm(realm.as_ref());
        Exec {
            client,
            method: req.method,
            url: req.url,
            headers: req.headers,
            body: req.body,
            policy: req.redirect.unwrap_or_else(|| config.redirect_policy()),
            realm,
            history: Vec::new(),
            retries: retry::Budget::new(req.max_retries.unwrap_or(config.max_request_retry)),
            auth_retries: retry::Budget::new(config.max_auth_retries),
            negotiator,
            pending_auth: None,
            held: None,
            cancel,
            deadline,
        }
    }

    async fn run(mut self) -> crate::Result<(ResponseHead, BodyStream)> {
        loop {
            let target = Target::from_url(&self.url)?;

            let mut lease = match self.connection(&target).await {
                Ok(lease) => lease,
                Err(err) => {
                    self.retry_or_fail(err, false)?;
                    continue;
                }
            };
            let reused = lease.conn().is_reused();
            self.bind_negotiator(&lease);

            let res = match self.send(&target, &mut lease).await {
                Ok(res) => {
                    // Credentials are resent until an attempt gets a response.
                    self.pending_auth = None;
                    res
                }
                Err(err) => {
                    debug!("connection {} failed: {}", lease.conn().id(), err);
                    lease.discard();
                    self.retry_or_fail(err, reused)?;
                    continue;
                }
            };

            let (parts, incoming) = res.into_parts();
            if wants_close(parts.version, &parts.headers) {
                trace!("connection {} will not be reused", lease.conn().id());
                lease.conn().set_unpoolable();
            }

            match self.on_head(parts.status, &parts.headers, &target, incoming, lease).await? {
                Head::Again => continue,
                Head::Final(incoming, lease) => {
                    let url = self.url.clone();
                    let head = ResponseHead::new(parts.status, parts.version, parts.headers, url.clone());
                    let timeouts = Timeouts {
                        read: self.client.config.read_timeout,
                        deadline: self.deadline,
                    };
                    let stream = body::channel(incoming, lease, timeouts, &self.cancel, url);
                    return Ok((head, stream));
                }
            }
        }
    }

    /// The connection for the next attempt: the one kept by the previous
    /// attempt, an idle pooled one, or a new one.
    async fn connection(&mut self, target: &Target) -> crate::Result<Lease> {
        if let Some(mut held) = self.held.take() {
            if held.conn().target() == target && held.conn().is_open() {
                trace!("reusing connection {} for the next attempt", held.conn().id());
                return Ok(held);
            }
            // The handshake state stays with this request; nothing is parked
            // for the abandoned connection.
            if held.conn().is_open() {
                held.release();
            } else {
                debug!("connection {} closed between attempts", held.conn().id());
                held.discard();
            }
        }

        let pool = &self.client.pool;
        let checkout = pool
            .checkout(target, self.client.config.pool.acquire_timeout)
            .await
            .map_err(|e| {
                debug!("no connection available for {}", target);
                Error::connect(e)
            })?;

        match checkout {
            Checkout::Idle(conn) => {
                debug!("reusing pooled connection {} to {}", conn.id(), target);
                Ok(Lease::new(pool.clone(), conn))
            }
            Checkout::Reserved(reservation) => {
                let conn = self.client.connector.connect(target).await?;
                let conn = reservation.fulfill(conn);
                debug!("opened connection {} to {}", conn.id(), target);
                Ok(Lease::new(pool.clone(), conn))
            }
        }
    }

    /// Picks the negotiator state matching the leased connection.
    fn bind_negotiator(&mut self, lease: &Lease) {
        let realm = match self.realm {
            Some(ref realm) => realm,
            None => return,
        };
        let id = lease.id();
        let stored = self.client.auth.take(id, &realm.key());

        let pending_elsewhere = matches!(
            self.pending_auth,
            Some(PendingAuth { conn: Some(conn), .. }) if conn != id
        );
        if pending_elsewhere {
            debug!("auth handshake moved to connection {}, restarting", id);
            self.pending_auth = None;
            self.negotiator = stored.unwrap_or_else(|| Negotiator::for_realm(Some(realm)));
            return;
        }

        if let Some(stored) = stored {
            if self.negotiator.is_connection_scoped() || self.pending_auth.is_none() {
                self.negotiator = stored;
            }
        } else if self.negotiator.is_connection_scoped() && self.pending_auth.is_none() {
            self.negotiator = Negotiator::for_realm(Some(realm));
        }
    }

    async fn send(
        &mut self,
        target: &Target,
        lease: &mut Lease,
    ) -> crate::Result<http::Response<Incoming>> {
        let path = origin_form(&self.url);
        let mut headers = self.headers.clone();
        self.default_headers(target, &mut headers)?;

        if let Some(realm) = &self.realm {
            let name = realm.target().credentials_header();
            match &self.pending_auth {
                Some(pending) => {
                    headers.insert(name, pending.header.clone());
                }
                None if self.negotiator.should_preempt(realm) => {
                    let req = AuthRequest {
                        method: &self.method,
                        uri: &path,
                        host: target.host(),
                    };
                    match self.negotiator.preemptive_header(realm, &req) {
                        Ok(Some(header)) => {
                            debug!("sending {:?} credentials preemptively", realm.scheme());
                            headers.insert(name, header);
                        }
                        Ok(None) => (),
                        Err(failure) => return Err(auth_error(failure).with_url(self.url.clone())),
                    }
                }
                None => (),
            }
        }

        let uri: Uri = path.parse().map_err(Error::builder)?;
        let mut req = http::Request::builder()
            .method(self.method.clone())
            .uri(uri)
            .version(Version::HTTP_11)
            .body(Full::new(self.body.clone().unwrap_or_default()))
            .map_err(Error::builder)?;
        *req.headers_mut() = headers;

        trace!("{} {} on connection {}", self.method, self.url, lease.conn().id());
        let conn = lease.conn();
        let sending = async {
            conn.ready().await?;
            conn.send(req).await.map_err(send_error)
        };
        let res = match self.client.config.read_timeout {
            Some(to) => match tokio::time::timeout(to, sending).await {
                Ok(res) => res,
                Err(_elapsed) => Err(Error::request(error::TimedOut)),
            },
            None => sending.await,
        };
        res.map_err(|e| e.with_url(self.url.clone()))
    }

    fn default_headers(&self, target: &Target, headers: &mut HeaderMap) -> crate::Result<()> {
        if !headers.contains_key(HOST) {
            let host = HeaderValue::from_str(&target.authority()).map_err(Error::builder)?;
            headers.insert(HOST, host);
        }
        if let Some(ua) = &self.client.config.user_agent {
            if !headers.contains_key(USER_AGENT) {
                headers.insert(USER_AGENT, ua.clone());
            }
        }
        if !headers.contains_key(ACCEPT) {
            headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        }
        if let Some(body) = &self.body {
            headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
        }
        Ok(())
    }

    /// Decides what the response head means for the request.
    async fn on_head(
        &mut self,
        status: StatusCode,
        headers: &HeaderMap,
        target: &Target,
        incoming: Incoming,
        lease: Lease,
    ) -> crate::Result<Head> {
        if let Some(realm) = self.realm.clone() {
            if status == realm.target().challenge_status() {
                return self.on_challenge(status, headers, target, &realm, incoming, lease).await;
            }
            self.negotiator.on_success();
        }

        if redirect::is_redirect_status(status) && self.policy.is_follow() {
            if let Some(location) = headers.get(LOCATION) {
                return self.on_redirect(status, location, incoming, lease).await;
            }
        }

        self.store_negotiator(&lease);
        Ok(Head::Final(incoming, lease))
    }

    async fn on_challenge(
        &mut self,
        status: StatusCode,
        headers: &HeaderMap,
        target: &Target,
        realm: &Realm,
        incoming: Incoming,
        mut lease: Lease,
    ) -> crate::Result<Head> {
        let challenges = auth::parse_challenges(headers.get_all(realm.target().challenge_header()));
        let path = origin_form(&self.url);
        let req = AuthRequest {
            method: &self.method,
            uri: &path,
            host: target.host(),
        };

        match self.negotiator.on_challenge(&challenges, realm, &req) {
            NextAction::Retry {
                header,
                keep_connection,
            } => {
                if !self.auth_retries.withdraw() {
                    debug!("auth retries exhausted for {}", self.url);
                    lease.discard();
                    return Err(Error::auth(AuthExhausted)
                        .with_status(status)
                        .with_url(self.url.clone()));
                }
                let id = lease.conn().id();
                debug!("answering {} challenge on connection {}", status.as_u16(), id);

                let drained = drain(incoming, self.client.config.read_timeout).await;
                let conn = if self.negotiator.is_connection_scoped() {
                    Some(id)
                } else {
                    None
                };
                self.pending_auth = Some(PendingAuth { header, conn });

                if drained && keep_connection && lease.conn().is_poolable() {
                    self.held = Some(lease);
                } else if drained {
                    lease.release();
                } else {
                    lease.conn().set_unpoolable();
                    lease.discard();
                }
                Ok(Head::Again)
            }
            NextAction::Fail(failure) => {
                debug!("authentication failed: {}", failure);
                lease.discard();
                Err(auth_error(failure)
                    .with_status(status)
                    .with_url(self.url.clone()))
            }
            NextAction::Done => {
                self.store_negotiator(&lease);
                Ok(Head::Final(incoming, lease))
            }
        }
    }

    async fn on_redirect(
        &mut self,
        status: StatusCode,
        location: &HeaderValue,
        incoming: Incoming,
        lease: Lease,
    ) -> crate::Result<Head> {
        let next = location
            .to_str()
            .map_err(|e| Error::redirect(e, self.url.clone()))
            .and_then(|loc| {
                self.url
                    .join(loc)
                    .map_err(|e| Error::redirect(e, self.url.clone()))
            });
        let next = match next {
            Ok(next) => next,
            Err(err) => {
                warn!("invalid redirect location from {}", self.url);
                lease.discard();
                return Err(err.with_status(status));
            }
        };
        if next.scheme() != "http" && next.scheme() != "https" {
            lease.discard();
            return Err(Error::redirect(error::BadScheme, next).with_status(status));
        }

        let mut previous = self.history.clone();
        previous.push(self.url.clone());
        match self.policy.check(status, &next, &previous) {
            ActionKind::Follow => {
                debug!("redirecting '{}' to '{}'", self.url, next);
                redirect::rewrite(
                    status,
                    self.client.config.strict_302_handling,
                    &mut self.method,
                    &mut self.headers,
                    &mut self.body,
                );
                self.store_negotiator(&lease);
                if redirect::remove_sensitive_headers(&mut self.headers, &next, &self.url)
                    && self.realm.take().is_some()
                {
                    debug!("dropping credentials for cross-host redirect");
                }

                if drain(incoming, self.client.config.read_timeout).await {
                    lease.release();
                } else {
                    lease.discard();
                }

                self.negotiator = Negotiator::for_realm(self.realm.as_ref());
                self.pending_auth = None;
                self.history = previous;
                self.url = next;
                Ok(Head::Again)
            }
            ActionKind::Stop => {
                self.store_negotiator(&lease);
                Ok(Head::Final(incoming, lease))
            }
            ActionKind::Error(e) => {
                debug!("redirect policy rejected '{}': {}", next, e);
                lease.discard();
                Err(Error::redirect(e, next).with_status(status))
            }
        }
    }

    /// Parks the negotiator with the connection so the next request on it
    /// picks the state up.
    fn store_negotiator(&mut self, lease: &Lease) {
        if let Some(realm) = &self.realm {
            let negotiator = std::mem::replace(&mut self.negotiator, Negotiator::None);
            self.client.auth.put(lease.id(), realm.key(), negotiator);
        }
    }

    fn retry_or_fail(&mut self, err: Error, reused: bool) -> crate::Result<()> {
        let attempt = retry::Attempt {
            method: &self.method,
            reused,
        };
        if retry::classify(attempt, &err) == retry::Action::Retryable && self.retries.withdraw() {
            debug!("retrying {} {} after: {}", self.method, self.url, err);
            return Ok(());
        }
        Err(err.with_url(self.url.clone()))
    }
}

impl Drop for Exec<'_> {
    fn drop(&mut self) {
        if let Some(held) = self.held.take() {
            held.discard();
        }
    }
}

// A response hyper could not parse is a broken peer, not a lost connection.
fn send_error(err: hyper::Error) -> Error {
    if err.is_parse() || err.is_parse_status() {
        Error::protocol(err)
    } else {
        Error::request(err)
    }
}

fn auth_error(failure: Failure) -> Error {
    match failure {
        Failure::Protocol(_) => Error::protocol(failure),
        Failure::Rejected(_) | Failure::Entropy => Error::auth(failure),
    }
}

fn origin_form(url: &Url) -> String {
    let mut path = url.path().to_owned();
    if let Some(query) = url.query() {
        path.push('?');
        path.push_str(query);
    }
    path
}

/// True when the server will not keep the connection open.
fn wants_close(version: Version, headers: &HeaderMap) -> bool {
    let has_token = |token: &str| {
        headers
            .get_all(CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    };
    if version == Version::HTTP_10 {
        !has_token("keep-alive")
    } else {
        has_token("close")
    }
}

/// Reads and drops a small body so the connection can carry the next
/// request. Returns false if the connection should not be reused.
async fn drain(mut body: Incoming, timeout: Option<Duration>) -> bool {
    let reading = async {
        let mut read = 0;
        while let Some(frame) = body.frame().await {
            match frame {
                Ok(frame) => {
                    if let Some(data) = frame.data_ref() {
                        read += data.len();
                        if read > MAX_DRAIN {
                            return false;
                        }
                    }
                }
                Err(_) => return false,
            }
        }
        true
    };
    match timeout {
        Some(to) => tokio::time::timeout(to, reading).await.unwrap_or(false),
        None => reading.await,
    }
}
