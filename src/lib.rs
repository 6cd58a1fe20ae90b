#![deny(missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # courier
//!
//! An asynchronous HTTP/1.1 client engine built on [hyper] and [tokio].
//!
//! - Pooled keep-alive connections, bounded per host and overall, with idle
//!   and lifetime expiry
//! - Transparent authentication: Basic, Digest, NTLM and SPNEGO
//! - Response bodies delivered under consumer demand, with cancellation
//! - Customizable [redirect policy](#redirect-policies) and transport retries
//!
//! ## Making a GET request
//!
//! ```rust
//! # async fn run() -> Result<(), courier::Error> {
//! let client = courier::Client::new();
//! let body = client
//!     .get("http://www.rust-lang.org")
//!     .send()
//!     .await?
//!     .text()
//!     .await?;
//!
//! println!("body = {:?}", body);
//! # Ok(())
//! # }
//! ```
//!
//! **NOTE**: Create one [`Client`] and reuse it, taking advantage of
//! keep-alive connection pooling.
//!
//! ## Authentication
//!
//! A [`Realm`] names the scheme and credentials. Without preemption the
//! first request goes out bare and the realm answers the server's `401`
//! (or `407` for a proxy realm) challenges:
//!
//! ```rust
//! # async fn run() -> Result<(), courier::Error> {
//! let realm = courier::Realm::ntlm("Zaphod", "Beeblebrox")
//!     .ntlm_domain("Ursa-Minor")
//!     .ntlm_host("LightCity");
//!
//! let res = courier::Client::new()
//!     .get("http://intranet.example/")
//!     .realm(realm)
//!     .send()
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! NTLM and SPNEGO authenticate the connection: the handshake stays on one
//! connection, and later requests that reuse it skip the handshake.
//!
//! ## Streaming bodies
//!
//! Nothing is read past the response head until the consumer asks for it:
//!
//! ```rust
//! # async fn run() -> Result<(), courier::Error> {
//! let mut res = courier::Client::new()
//!     .get("http://example.com/large")
//!     .send()
//!     .await?;
//!
//! let body = res.body_mut();
//! body.request(4);
//! while let Some(part) = body.next_part().await {
//!     let part = part?;
//!     println!("{} bytes", part.bytes().len());
//!     if part.is_last() {
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Dropping or canceling the body closes its connection instead of
//! returning it to the pool.
//!
//! ## Redirect Policies
//!
//! By default, a `Client` does not follow redirects. Enable
//! [`ClientBuilder::follow_redirect`] to follow up to
//! [`ClientBuilder::max_redirects`] hops, or install a custom
//! [`redirect::Policy`].
//!
//! ## TLS
//!
//! `courier` speaks plain TCP on its own. `https` targets are reached by
//! supplying a [`connect::Connect`] implementation that returns a TLS
//! stream.
//!
//! [hyper]: https://hyper.rs
//! [tokio]: https://tokio.rs

pub use http::header;
pub use http::Method;
pub use http::{StatusCode, Version};
pub use tokio_util::sync::CancellationToken;
pub use url::Url;

pub use self::auth::{AuthScheme, AuthTarget, Realm, SpnegoProvider};
pub use self::client::{
    BodyConsumer, BodyPart, BodyStream, Client, ClientBuilder, Delivery, DeliveryError, Demand,
    Request, RequestBuilder, Response, ResponseHead,
};
pub use self::error::{Error, Result};
pub use self::into_url::IntoUrl;
pub use self::pool::{ConnectionId, PoolStats};
pub use self::target::Target;

mod auth;
mod client;
mod config;
pub mod connect;
mod error;
mod into_url;
mod pool;
pub mod redirect;
mod retry;
mod sync;
mod target;
mod util;
