//! Response body delivery under consumer demand.
//!
//! Every response body is pumped by a producer task that owns the
//! connection. The producer takes one credit from the consumer's demand
//! before each part it emits, so it never gets ahead of the consumer, and it
//! gives the connection back to the pool once the body is drained.
//!
//! Two consumer styles are offered:
//!
//! - [`BodyStream`], a pull interface (`next_part`, `bytes`, or as a
//!   `futures_core::Stream`),
//! - [`BodyConsumer`], callbacks driven by [`Client::execute_with`].
//!
//! [`Client::execute_with`]: crate::Client::execute_with

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http_body::Body as _;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use log::{debug, trace};
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::connect::HttpConnection;
use crate::error::{self, BoxError, Error};
use crate::pool::{ConnectionId, Pool, Pooled};

/// A chunk of a response body.
#[derive(Clone, PartialEq, Eq)]
pub struct BodyPart {
    bytes: Bytes,
    is_last: bool,
}

impl BodyPart {
    /// The bytes of this part. The last part may be empty.
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }

    /// True for the part that ends the body. Exactly one such part is
    /// delivered for every body that completes.
    pub fn is_last(&self) -> bool {
        self.is_last
    }
}

impl fmt::Debug for BodyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyPart")
            .field("len", &self.bytes.len())
            .field("is_last", &self.is_last)
            .finish()
    }
}

struct Shared {
    credits: Semaphore,
    // Parts requested that have not reached the consumer yet.
    outstanding: AtomicUsize,
    consumer_canceled: AtomicBool,
    // Child of the request's token; canceled by the consumer too.
    cancel: CancellationToken,
}

/// A handle to signal demand for, or lose interest in, a response body.
#[derive(Clone)]
pub struct Demand {
    shared: Arc<Shared>,
}

impl Demand {
    /// Allows `n` more parts to be delivered. `request(0)` does nothing and
    /// `usize::MAX` lifts the limit.
    pub fn request(&self, n: usize) {
        if n == 0 || self.is_canceled() {
            return;
        }
        let room = Semaphore::MAX_PERMITS.saturating_sub(self.shared.credits.available_permits());
        self.shared.credits.add_permits(n.min(room));
        let _ = self
            .shared
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some(v.saturating_add(n))
            });
    }

    /// Stops delivery. Parts already produced are dropped, and the
    /// connection is closed instead of being reused.
    pub fn cancel(&self) {
        if !self.shared.consumer_canceled.swap(true, Ordering::AcqRel) {
            debug!("body canceled by consumer");
        }
        self.shared.cancel.cancel();
        self.shared.credits.close();
    }

    pub fn is_canceled(&self) -> bool {
        self.shared.consumer_canceled.load(Ordering::Acquire)
    }

    fn received(&self) {
        let _ = self
            .shared
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some(v.saturating_sub(1))
            });
    }

    fn outstanding(&self) -> usize {
        self.shared.outstanding.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Demand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Demand")
            .field("outstanding", &self.outstanding())
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

/// The body of a [`Response`](crate::Response).
///
/// Nothing is read from the connection until demand is signalled, either
/// explicitly with [`request`](BodyStream::request) or implicitly by
/// [`next_part`](BodyStream::next_part) when no demand is outstanding.
/// Dropping the stream before the last part cancels it.
pub struct BodyStream {
    rx: mpsc::UnboundedReceiver<crate::Result<BodyPart>>,
    demand: Demand,
    done: bool,
}

impl BodyStream {
    /// Allows `n` more parts to be delivered.
    pub fn request(&self, n: usize) {
        self.demand.request(n);
    }

    /// See [`Demand::cancel`].
    pub fn cancel(&self) {
        self.demand.cancel();
    }

    /// A handle that can signal demand from elsewhere.
    pub fn demand(&self) -> Demand {
        self.demand.clone()
    }

    /// The next part, or `None` once the body ended or was canceled.
    ///
    /// When no demand is outstanding, one part is requested first.
    pub async fn next_part(&mut self) -> Option<crate::Result<BodyPart>> {
        futures_util::future::poll_fn(|cx| self.poll_part(cx, true)).await
    }

    /// Collects the whole remaining body.
    pub async fn bytes(mut self) -> crate::Result<Bytes> {
        self.request(usize::MAX);
        let mut buf = BytesMut::new();
        while let Some(part) = self.next_part().await {
            let part = part?;
            let last = part.is_last();
            buf.extend_from_slice(&part.bytes);
            if last {
                break;
            }
        }
        if self.demand.is_canceled() {
            return Err(Error::canceled());
        }
        Ok(buf.freeze())
    }

    fn poll_part(
        &mut self,
        cx: &mut Context<'_>,
        pull: bool,
    ) -> Poll<Option<crate::Result<BodyPart>>> {
        if self.done || self.demand.is_canceled() {
            return Poll::Ready(None);
        }
        if pull && self.demand.outstanding() == 0 {
            self.demand.request(1);
        }

        let item = ready!(self.rx.poll_recv(cx));
        if self.demand.is_canceled() {
            return Poll::Ready(None);
        }
        Poll::Ready(match item {
            Some(Ok(part)) => {
                self.demand.received();
                self.done = part.is_last;
                Some(Ok(part))
            }
            Some(Err(err)) => {
                self.done = true;
                Some(Err(err))
            }
            None => {
                self.done = true;
                Some(Err(Error::body("body ended before its last part")))
            }
        })
    }
}

impl futures_core::Stream for BodyStream {
    type Item = crate::Result<BodyPart>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().poll_part(cx, true)
    }
}

impl Drop for BodyStream {
    fn drop(&mut self) {
        if !self.done {
            self.demand.cancel();
        }
    }
}

impl fmt::Debug for BodyStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyStream")
            .field("demand", &self.demand)
            .field("done", &self.done)
            .finish()
    }
}

/// Receives a response body through callbacks.
///
/// The consumer is handed a [`Demand`] and must keep requesting parts to
/// receive them; the default `on_subscribe` requests a single one.
///
/// ```
/// use courier::{BodyConsumer, BodyPart, Demand};
///
/// #[derive(Default)]
/// struct Counter {
///     bytes: usize,
/// }
///
/// impl BodyConsumer for Counter {
///     fn on_part(&mut self, part: BodyPart, demand: &Demand) {
///         self.bytes += part.bytes().len();
///         demand.request(1);
///     }
/// }
/// ```
pub trait BodyConsumer: Send + 'static {
    fn on_subscribe(&mut self, demand: &Demand) {
        demand.request(1);
    }

    fn on_part(&mut self, part: BodyPart, demand: &Demand);

    fn on_error(&mut self, err: Error) {
        let _ = err;
    }

    fn on_complete(&mut self) {}
}

/// Delivers a body to a [`BodyConsumer`] and resolves to the consumer once
/// the body completed, failed or was canceled.
#[must_use = "futures do nothing unless polled"]
pub struct Delivery<C> {
    inner: Pin<Box<dyn Future<Output = C> + Send>>,
}

impl<C: BodyConsumer> Delivery<C> {
    pub(crate) fn new(stream: BodyStream, consumer: C) -> Delivery<C> {
        Delivery {
            inner: Box::pin(deliver(stream, consumer)),
        }
    }
}

async fn deliver<C: BodyConsumer>(mut stream: BodyStream, mut consumer: C) -> C {
    let demand = stream.demand();
    consumer.on_subscribe(&demand);
    loop {
        let next = futures_util::future::poll_fn(|cx| stream.poll_part(cx, false)).await;
        match next {
            Some(Ok(part)) => {
                let last = part.is_last();
                consumer.on_part(part, &demand);
                if last {
                    consumer.on_complete();
                    break;
                }
            }
            Some(Err(err)) => {
                consumer.on_error(err);
                break;
            }
            None => break,
        }
    }
    consumer
}

impl<C> Future for Delivery<C> {
    type Output = C;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<C> {
        self.inner.as_mut().poll(cx)
    }
}

impl<C> fmt::Debug for Delivery<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("Delivery")
    }
}

/// A request that failed before its response head arrived.
///
/// The consumer has already seen the error through
/// [`BodyConsumer::on_error`]; it is handed back here so it can serve the
/// next request.
pub struct DeliveryError<C> {
    error: Error,
    consumer: C,
}

impl<C: BodyConsumer> DeliveryError<C> {
    pub(crate) fn new(error: Error, mut consumer: C) -> DeliveryError<C> {
        consumer.on_error(error.clone());
        DeliveryError { error, consumer }
    }
}

impl<C> DeliveryError<C> {
    /// The error that ended the request.
    pub fn error(&self) -> &Error {
        &self.error
    }

    /// Takes back the consumer.
    pub fn into_consumer(self) -> C {
        self.consumer
    }

    pub fn into_parts(self) -> (Error, C) {
        (self.error, self.consumer)
    }
}

impl<C> From<DeliveryError<C>> for Error {
    fn from(err: DeliveryError<C>) -> Error {
        err.error
    }
}

impl<C> fmt::Debug for DeliveryError<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DeliveryError").field(&self.error).finish()
    }
}

impl<C> fmt::Display for DeliveryError<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.error, f)
    }
}

impl<C> std::error::Error for DeliveryError<C> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// A connection checked out of the pool.
pub(crate) struct Lease {
    pool: Pool<HttpConnection>,
    conn: Pooled<HttpConnection>,
}

impl Lease {
    pub(crate) fn new(pool: Pool<HttpConnection>, conn: Pooled<HttpConnection>) -> Lease {
        Lease { pool, conn }
    }

    pub(crate) fn id(&self) -> ConnectionId {
        self.conn.id()
    }

    pub(crate) fn conn(&mut self) -> &mut Pooled<HttpConnection> {
        &mut self.conn
    }

    pub(crate) fn release(self) {
        self.pool.release(self.conn);
    }

    pub(crate) fn discard(mut self) {
        self.conn.set_unpoolable();
        self.pool.remove(self.conn);
    }
}

/// Limits applied while pumping a body.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Timeouts {
    pub(crate) read: Option<Duration>,
    pub(crate) deadline: Option<Instant>,
}

/// Spawns the producer for `body` and returns the consumer half.
pub(crate) fn channel(
    body: Incoming,
    lease: Lease,
    timeouts: Timeouts,
    cancel: &CancellationToken,
    url: Url,
) -> BodyStream {
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        credits: Semaphore::new(0),
        outstanding: AtomicUsize::new(0),
        consumer_canceled: AtomicBool::new(false),
        cancel: cancel.child_token(),
    });

    let producer = Producer {
        body: FrameSource::Incoming(body),
        lease: Some(lease),
        shared: shared.clone(),
        tx,
        timeouts,
        url,
    };
    tokio::spawn(producer.run());

    BodyStream {
        rx,
        demand: Demand { shared },
        done: false,
    }
}

enum FrameSource {
    Incoming(Incoming),
    #[cfg(test)]
    Test(http_body_util::combinators::BoxBody<Bytes, BoxError>),
}

impl FrameSource {
    async fn data(&mut self) -> Option<Result<Bytes, BoxError>> {
        loop {
            let frame: Option<Result<http_body::Frame<Bytes>, BoxError>> = match self {
                FrameSource::Incoming(body) => body.frame().await.map(|r| r.map_err(Into::into)),
                #[cfg(test)]
                FrameSource::Test(body) => body.frame().await,
            };
            match frame? {
                Ok(frame) => match frame.into_data() {
                    Ok(data) if data.is_empty() && !self.is_end_stream() => continue,
                    Ok(data) => return Some(Ok(data)),
                    Err(_trailers) => continue,
                },
                Err(e) => return Some(Err(e)),
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        match self {
            FrameSource::Incoming(body) => body.is_end_stream(),
            #[cfg(test)]
            FrameSource::Test(body) => body.is_end_stream(),
        }
    }
}

struct Producer {
    body: FrameSource,
    lease: Option<Lease>,
    shared: Arc<Shared>,
    tx: mpsc::UnboundedSender<crate::Result<BodyPart>>,
    timeouts: Timeouts,
    url: Url,
}

impl Producer {
    async fn run(mut self) {
        if let Err(err) = self.pump().await {
            if let Some(lease) = self.lease.take() {
                debug!("discarding connection {} after body error", lease.conn.id());
                lease.discard();
            }
            if !self.shared.consumer_canceled.load(Ordering::Acquire) {
                let _ = self.tx.send(Err(err.with_url(self.url.clone())));
            }
        }
    }

    async fn pump(&mut self) -> crate::Result<()> {
        loop {
            self.credit().await?;
            let (bytes, is_last) = match self.read().await? {
                Some(data) => {
                    let last = self.body.is_end_stream();
                    (data, last)
                }
                None => (Bytes::new(), true),
            };
            if is_last {
                if let Some(lease) = self.lease.take() {
                    lease.release();
                }
            }
            trace!("emitting body part of {} bytes, last: {}", bytes.len(), is_last);
            if self.tx.send(Ok(BodyPart { bytes, is_last })).is_err() {
                return Err(Error::canceled());
            }
            if is_last {
                return Ok(());
            }
        }
    }

    async fn credit(&self) -> crate::Result<()> {
        let shared = &self.shared;
        tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => Err(Error::canceled()),
            permit = shared.credits.acquire() => match permit {
                Ok(permit) => {
                    permit.forget();
                    Ok(())
                }
                Err(_closed) => Err(Error::canceled()),
            },
            _ = sleep_until(self.timeouts.deadline) => Err(Error::timeout()),
        }
    }

    async fn read(&mut self) -> crate::Result<Option<Bytes>> {
        let read_timeout = self.timeouts.read;
        let deadline = self.timeouts.deadline;
        let cancel = self.shared.cancel.clone();
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::canceled()),
            _ = sleep_until(deadline) => return Err(Error::timeout()),
            frame = with_read_timeout(self.body.data(), read_timeout) => frame?,
        };
        match frame {
            None => Ok(None),
            Some(Ok(data)) => Ok(Some(data)),
            Some(Err(e)) => Err(Error::body(e)),
        }
    }
}

async fn with_read_timeout<F, T>(f: F, timeout: Option<Duration>) -> crate::Result<T>
where
    F: Future<Output = T>,
{
    match timeout {
        Some(to) => tokio::time::timeout(to, f)
            .await
            .map_err(|_| Error::body(error::TimedOut)),
        None => Ok(f.await),
    }
}

pub(crate) async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => futures_util::future::pending::<()>().await,
    }
}
