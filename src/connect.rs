//! Transport connectors and the HTTP/1 connections built on them.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use log::{debug, trace};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::error::{self, BoxError, Error};
use crate::pool::Poolable;
use crate::target::Target;

/// A byte stream a connection can run over.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// A boxed [`Io`] stream.
pub type BoxIo = Box<dyn Io>;

/// The future returned by [`Connect::connect`].
pub type Connecting = Pin<Box<dyn Future<Output = Result<BoxIo, BoxError>> + Send>>;

/// Opens transport streams to a [`Target`].
///
/// The default connector speaks plain TCP. Supply your own to reach `https`
/// targets through a TLS stream, or to route through a tunnel.
///
/// ```
/// use courier::connect::{BoxIo, Connect, Connecting};
/// use courier::Target;
///
/// struct Loopback;
///
/// impl Connect for Loopback {
///     fn connect(&self, target: &Target) -> Connecting {
///         let port = target.port();
///         Box::pin(async move {
///             let tcp = tokio::net::TcpStream::connect(("127.0.0.1", port)).await?;
///             Ok::<_, Box<dyn std::error::Error + Send + Sync>>(Box::new(tcp) as BoxIo)
///         })
///     }
/// }
/// ```
pub trait Connect: Send + Sync + 'static {
    fn connect(&self, target: &Target) -> Connecting;
}

/// Plain TCP.
#[derive(Clone, Debug)]
pub(crate) struct TcpConnector {
    nodelay: bool,
}

impl TcpConnector {
    pub(crate) fn new(nodelay: bool) -> TcpConnector {
        TcpConnector { nodelay }
    }
}

impl Connect for TcpConnector {
    fn connect(&self, target: &Target) -> Connecting {
        let nodelay = self.nodelay;
        let target = target.clone();
        Box::pin(async move {
            if target.is_secure() {
                return Err(NoTlsConnector.into());
            }
            let tcp = TcpStream::connect((target.host(), target.port())).await?;
            tcp.set_nodelay(nodelay)?;
            Ok::<_, BoxError>(Box::new(tcp) as BoxIo)
        })
    }
}

/// Runs the transport connect and the HTTP/1 handshake.
#[derive(Clone)]
pub(crate) struct Connector {
    inner: Arc<dyn Connect>,
    timeout: Option<Duration>,
}

impl Connector {
    pub(crate) fn new(inner: Arc<dyn Connect>, timeout: Option<Duration>) -> Connector {
        Connector { inner, timeout }
    }

    pub(crate) async fn connect(&self, target: &Target) -> Result<HttpConnection, Error> {
        debug!("connecting to {}", target);
        let io = with_timeout(self.inner.connect(target), self.timeout)
            .await
            .map_err(|e| {
                debug!("connect to {} failed: {}", target, e);
                Error::connect(e)
            })?;

        let (sender, conn) = http1::Builder::new()
            .handshake(TokioIo::new(io))
            .await
            .map_err(Error::connect)?;

        let name = target.to_string();
        tokio::spawn(async move {
            match conn.await {
                Ok(()) => trace!("connection to {} closed", name),
                Err(e) => debug!("connection to {} failed: {}", name, e),
            }
        });

        Ok(HttpConnection { sender })
    }
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("timeout", &self.timeout)
            .finish()
    }
}

async fn with_timeout<T, F>(f: F, timeout: Option<Duration>) -> Result<T, BoxError>
where
    F: Future<Output = Result<T, BoxError>>,
{
    if let Some(to) = timeout {
        match tokio::time::timeout(to, f).await {
            Err(_elapsed) => Err(Box::new(error::TimedOut) as BoxError),
            Ok(Ok(try_res)) => Ok(try_res),
            Ok(Err(e)) => Err(e),
        }
    } else {
        f.await
    }
}

/// An HTTP/1 connection: the request half of a hyper connection whose
/// driver task runs in the background. Dropping it closes the connection.
pub(crate) struct HttpConnection {
    sender: http1::SendRequest<Full<Bytes>>,
}

impl HttpConnection {
    pub(crate) async fn ready(&mut self) -> Result<(), Error> {
        self.sender.ready().await.map_err(Error::request)
    }

    pub(crate) fn send(
        &mut self,
        req: http::Request<Full<Bytes>>,
    ) -> impl Future<Output = hyper::Result<http::Response<hyper::body::Incoming>>> {
        self.sender.send_request(req)
    }
}

impl Poolable for HttpConnection {
    fn is_open(&self) -> bool {
        !self.sender.is_closed()
    }
}

impl fmt::Debug for HttpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpConnection")
            .field("closed", &self.sender.is_closed())
            .finish()
    }
}

#[derive(Debug)]
struct NoTlsConnector;

impl fmt::Display for NoTlsConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("https targets need a TLS connector")
    }
}

impl std::error::Error for NoTlsConnector {}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tcp_refuses_https() {
        let connector = Connector::new(Arc::new(TcpConnector::new(true)), None);
        let target = Target::new("https", "localhost", None).unwrap();
        let err = connector.connect(&target).await.unwrap_err();
        assert!(err.is_connect());
    }

    #[tokio::test]
    async fn connect_timeout_is_timeout() {
        struct Never;

        impl Connect for Never {
            fn connect(&self, _: &Target) -> Connecting {
                Box::pin(futures_util::future::pending::<Result<BoxIo, BoxError>>())
            }
        }

        let connector = Connector::new(Arc::new(Never), Some(Duration::from_millis(20)));
        let target = Target::new("http", "localhost", Some(1)).unwrap();
        let err = connector.connect(&target).await.unwrap_err();
        assert!(err.is_connect());
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn refused_is_connect_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connector = Connector::new(Arc::new(TcpConnector::new(true)), None);
        let target = Target::new("http", "127.0.0.1", Some(port)).unwrap();
        let err = connector.connect(&target).await.unwrap_err();
        assert!(err.is_connect());
        assert!(!err.is_timeout());
    }
}
