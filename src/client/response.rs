use std::fmt;

use bytes::Bytes;
use http::{HeaderMap, StatusCode, Version};
use url::Url;

use super::body::BodyStream;

/// The status line and headers of a final response.
#[derive(Clone)]
pub struct ResponseHead {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    url: Url,
}

impl ResponseHead {
    pub(super) fn new(status: StatusCode, version: Version, headers: HeaderMap, url: Url) -> ResponseHead {
        ResponseHead {
            status,
            version,
            headers,
            url,
        }
    }

    /// Get the `StatusCode` of this `Response`.
    #[inline]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Get the HTTP `Version` of this `Response`.
    #[inline]
    pub fn version(&self) -> Version {
        self.version
    }

    /// Get the `Headers` of this `Response`.
    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Get the final `Url` of this `Response`, after redirects.
    #[inline]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The `Content-Length` header, when present and valid.
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(http::header::CONTENT_LENGTH)?
            .to_str()
            .ok()?
            .parse()
            .ok()
    }
}

impl fmt::Debug for ResponseHead {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ResponseHead")
            .field("url", &self.url.as_str())
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish()
    }
}

/// A Response to a submitted `Request`.
///
/// The connection stays checked out while the body is read; it returns to
/// the pool once the body is drained, and is closed if the body is dropped
/// or canceled first.
pub struct Response {
    head: ResponseHead,
    body: BodyStream,
}

impl Response {
    pub(super) fn new(head: ResponseHead, body: BodyStream) -> Response {
        Response { head, body }
    }

    /// Get the final `Url` of this `Response`.
    #[inline]
    pub fn url(&self) -> &Url {
        self.head.url()
    }

    /// Get the `StatusCode` of this `Response`.
    #[inline]
    pub fn status(&self) -> StatusCode {
        self.head.status()
    }

    /// Get the HTTP `Version` of this `Response`.
    #[inline]
    pub fn version(&self) -> Version {
        self.head.version()
    }

    /// Get the `Headers` of this `Response`.
    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        self.head.headers()
    }

    /// Get the content length of the response, if it is known.
    #[inline]
    pub fn content_length(&self) -> Option<u64> {
        self.head.content_length()
    }

    /// Get the head of this `Response`.
    #[inline]
    pub fn head(&self) -> &ResponseHead {
        &self.head
    }

    /// Get a mutable reference to the body stream, to signal demand or read
    /// parts while keeping the response.
    #[inline]
    pub fn body_mut(&mut self) -> &mut BodyStream {
        &mut self.body
    }

    /// Split into the head and the body stream.
    pub fn into_parts(self) -> (ResponseHead, BodyStream) {
        (self.head, self.body)
    }

    /// Get the full response body as `Bytes`.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
    /// let bytes = courier::Client::new()
    ///     .get("http://httpbin.org/ip")
    ///     .send()
    ///     .await?
    ///     .bytes()
    ///     .await?;
    ///
    /// println!("bytes: {bytes:?}");
    /// # Ok(())
    /// # }
    /// ```
    pub async fn bytes(self) -> crate::Result<Bytes> {
        self.body.bytes().await
    }

    /// Get the full response text, decoded as UTF-8 with malformed sequences
    /// replaced by [`char::REPLACEMENT_CHARACTER`].
    pub async fn text(self) -> crate::Result<String> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Response")
            .field("url", &self.url().as_str())
            .field("status", &self.status())
            .field("headers", self.headers())
            .finish()
    }
}
