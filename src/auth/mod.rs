//! Authentication.
//!
//! A [`Realm`] carries the credentials and the scheme to use. Each request
//! with a realm drives a negotiator that decides, for every challenge
//! response, whether to retry with a new credentials header or give up.
//!
//! - `Basic` sends the credentials, preemptively when asked to.
//! - `Digest` answers the server nonce; the last challenge is cached so
//!   later requests can authenticate preemptively.
//! - `NTLM` runs the three-message handshake on a single connection.
//! - `Negotiate` (SPNEGO/Kerberos) exchanges tokens from a
//!   [`SpnegoProvider`].
//!
//! NTLM and SPNEGO authenticate connections rather than requests, so their
//! state is stored per connection in a [`ConnectionAuth`] arena and dropped
//! when the pool discards the connection.

mod basic;
mod challenge;
mod digest;
mod ntlm;
mod spnego;

use std::{collections::HashMap, fmt, sync::Arc};

use http::{
    header::{HeaderName, AUTHORIZATION, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, WWW_AUTHENTICATE},
    HeaderValue, Method, StatusCode,
};

pub(crate) use self::challenge::Challenge;
pub use self::spnego::SpnegoProvider;

pub(crate) use self::challenge::parse as parse_challenges;

use self::{basic::Basic, digest::Digest, ntlm::NtlmHandshake, spnego::Spnego};
use crate::{pool::ConnectionId, sync::Mutex};

/// An authentication scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthScheme {
    Basic,
    Digest,
    Ntlm,
    /// SPNEGO / Kerberos, the `Negotiate` scheme.
    Spnego,
}

/// Whom the credentials are for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthTarget {
    /// The origin server: `401` / `WWW-Authenticate` / `Authorization`.
    Origin,
    /// A proxy: `407` / `Proxy-Authenticate` / `Proxy-Authorization`.
    Proxy,
}

impl AuthTarget {
    pub(crate) fn challenge_status(self) -> StatusCode {
        match self {
            AuthTarget::Origin => StatusCode::UNAUTHORIZED,
            AuthTarget::Proxy => StatusCode::PROXY_AUTHENTICATION_REQUIRED,
        }
    }

    pub(crate) fn challenge_header(self) -> HeaderName {
        match self {
            AuthTarget::Origin => WWW_AUTHENTICATE,
            AuthTarget::Proxy => PROXY_AUTHENTICATE,
        }
    }

    pub(crate) fn credentials_header(self) -> HeaderName {
        match self {
            AuthTarget::Origin => AUTHORIZATION,
            AuthTarget::Proxy => PROXY_AUTHORIZATION,
        }
    }
}

/// Credentials and the scheme to present them with.
///
/// ```
/// let realm = courier::Realm::ntlm("Zaphod", "Beeblebrox")
///     .ntlm_domain("Ursa-Minor")
///     .ntlm_host("LightCity")
///     .preemptive(true);
/// ```
#[derive(Clone)]
pub struct Realm {
    scheme: AuthScheme,
    principal: String,
    password: String,
    use_preemptive: bool,
    ntlm_domain: Option<String>,
    ntlm_host: Option<String>,
    target: AuthTarget,
    spnego: Option<Arc<dyn SpnegoProvider>>,
}

impl Realm {
    fn new(scheme: AuthScheme, principal: String, password: String) -> Realm {
        Realm {
            scheme,
            principal,
            password,
            use_preemptive: false,
            ntlm_domain: None,
            ntlm_host: None,
            target: AuthTarget::Origin,
            spnego: None,
        }
    }

    pub fn basic(principal: impl Into<String>, password: impl Into<String>) -> Realm {
        Realm::new(AuthScheme::Basic, principal.into(), password.into())
    }

    pub fn digest(principal: impl Into<String>, password: impl Into<String>) -> Realm {
        Realm::new(AuthScheme::Digest, principal.into(), password.into())
    }

    pub fn ntlm(principal: impl Into<String>, password: impl Into<String>) -> Realm {
        Realm::new(AuthScheme::Ntlm, principal.into(), password.into())
    }

    /// A `Negotiate` realm whose tokens come from `provider`.
    pub fn spnego<P>(provider: P) -> Realm
    where
        P: SpnegoProvider + 'static,
    {
        let mut realm = Realm::new(AuthScheme::Spnego, String::new(), String::new());
        realm.spnego = Some(Arc::new(provider));
        realm
    }

    /// Send credentials with the first request instead of waiting for a
    /// challenge. For NTLM this sends the Type 1 message up front; Digest
    /// can only do so once a challenge has been seen.
    pub fn preemptive(mut self, enabled: bool) -> Realm {
        self.use_preemptive = enabled;
        self
    }

    /// The NTLM domain. Anything after the first dot is dropped.
    pub fn ntlm_domain(mut self, domain: impl Into<String>) -> Realm {
        self.ntlm_domain = Some(domain.into());
        self
    }

    /// The NTLM workstation name. Anything after the first dot is dropped.
    pub fn ntlm_host(mut self, host: impl Into<String>) -> Realm {
        self.ntlm_host = Some(host.into());
        self
    }

    /// Authenticate against a proxy (`407`) instead of the origin.
    pub fn for_proxy(mut self) -> Realm {
        self.target = AuthTarget::Proxy;
        self
    }

    pub fn scheme(&self) -> AuthScheme {
        self.scheme
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }

    pub fn target(&self) -> AuthTarget {
        self.target
    }

    pub fn use_preemptive(&self) -> bool {
        self.use_preemptive
    }

    pub(crate) fn password(&self) -> &str {
        &self.password
    }

    pub(crate) fn domain(&self) -> Option<&str> {
        self.ntlm_domain.as_deref()
    }

    pub(crate) fn workstation(&self) -> Option<&str> {
        self.ntlm_host.as_deref()
    }

    pub(crate) fn key(&self) -> RealmKey {
        RealmKey {
            scheme: self.scheme,
            principal: self.principal.clone(),
            target: self.target,
        }
    }
}

impl fmt::Debug for Realm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Realm")
            .field("scheme", &self.scheme)
            .field("principal", &self.principal)
            .field("use_preemptive", &self.use_preemptive)
            .field("ntlm_domain", &self.ntlm_domain)
            .field("ntlm_host", &self.ntlm_host)
            .field("target", &self.target)
            .finish()
    }
}

/// Identifies the realm a stored negotiator was created for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RealmKey {
    scheme: AuthScheme,
    principal: String,
    target: AuthTarget,
}

/// The request being authenticated.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AuthRequest<'a> {
    pub(crate) method: &'a Method,
    /// Path and query, as sent on the request line.
    pub(crate) uri: &'a str,
    pub(crate) host: &'a str,
}

/// Why authentication stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Failure {
    /// The server broke the scheme's rules.
    Protocol(&'static str),
    /// The credentials were refused.
    Rejected(&'static str),
    /// The system random source could not produce a client nonce.
    Entropy,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Protocol(reason) | Failure::Rejected(reason) => f.write_str(reason),
            Failure::Entropy => f.write_str("no entropy for the client nonce"),
        }
    }
}

impl std::error::Error for Failure {}

/// The auth retry budget ran out before the server accepted the credentials.
#[derive(Debug)]
pub(crate) struct AuthExhausted;

impl fmt::Display for AuthExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("too many authentication attempts")
    }
}

impl std::error::Error for AuthExhausted {}

/// What to do after a challenge.
#[derive(Debug)]
pub(crate) enum NextAction {
    Retry {
        header: HeaderValue,
        keep_connection: bool,
    },
    Fail(Failure),
    Done,
}

#[derive(Debug)]
pub(crate) enum Negotiator {
    None,
    Basic(Basic),
    Digest(Digest),
    Ntlm(NtlmHandshake),
    Spnego(Spnego),
}

impl Negotiator {
    pub(crate) fn for_realm(realm: Option<&Realm>) -> Negotiator {
        match realm.map(Realm::scheme) {
            None => Negotiator::None,
            Some(AuthScheme::Basic) => Negotiator::Basic(Basic::default()),
            Some(AuthScheme::Digest) => Negotiator::Digest(Digest::default()),
            Some(AuthScheme::Ntlm) => Negotiator::Ntlm(NtlmHandshake::default()),
            Some(AuthScheme::Spnego) => Negotiator::Spnego(Spnego::default()),
        }
    }

    /// True when the next request should carry credentials up front.
    pub(crate) fn should_preempt(&self, realm: &Realm) -> bool {
        if !realm.use_preemptive {
            return false;
        }
        match self {
            Negotiator::None => false,
            Negotiator::Basic(_) => true,
            Negotiator::Digest(digest) => digest.has_cached_challenge(),
            Negotiator::Ntlm(ntlm) => ntlm.stage() == ntlm::Stage::Init,
            Negotiator::Spnego(spnego) => !spnego.is_established(),
        }
    }

    pub(crate) fn preemptive_header(
        &mut self,
        realm: &Realm,
        req: &AuthRequest<'_>,
    ) -> Result<Option<HeaderValue>, Failure> {
        match self {
            Negotiator::None => Ok(None),
            Negotiator::Basic(basic) => Ok(Some(basic.preemptive_header(realm))),
            Negotiator::Digest(digest) => digest.preemptive_header(realm, req),
            Negotiator::Ntlm(ntlm) => Ok(Some(ntlm.negotiate())),
            Negotiator::Spnego(spnego) => {
                let provider = spnego_provider(realm)?;
                spnego.preemptive_header(provider, req).map(Some)
            }
        }
    }

    pub(crate) fn on_challenge(
        &mut self,
        challenges: &[Challenge],
        realm: &Realm,
        req: &AuthRequest<'_>,
    ) -> NextAction {
        match self {
            Negotiator::None => NextAction::Done,
            Negotiator::Basic(basic) => basic.on_challenge(challenges, realm),
            Negotiator::Digest(digest) => digest.on_challenge(challenges, realm, req),
            Negotiator::Ntlm(ntlm) => ntlm.on_challenge(challenges, realm),
            Negotiator::Spnego(spnego) => match spnego_provider(realm) {
                Ok(provider) => spnego.on_challenge(challenges, provider, req),
                Err(failure) => NextAction::Fail(failure),
            },
        }
    }

    /// A response that was not a challenge was received.
    pub(crate) fn on_success(&mut self) {
        match self {
            Negotiator::None => (),
            Negotiator::Basic(basic) => *basic = Basic::default(),
            Negotiator::Digest(digest) => digest.on_success(),
            Negotiator::Ntlm(ntlm) => ntlm.on_success(),
            Negotiator::Spnego(spnego) => spnego.on_success(),
        }
    }

    /// True when the state belongs to the connection it was negotiated on.
    pub(crate) fn is_connection_scoped(&self) -> bool {
        matches!(self, Negotiator::Ntlm(_) | Negotiator::Spnego(_))
    }
}

fn spnego_provider(realm: &Realm) -> Result<&dyn SpnegoProvider, Failure> {
    realm
        .spnego
        .as_deref()
        .ok_or(Failure::Protocol("no SPNEGO provider configured"))
}

/// Negotiator state keyed by the connection it belongs to.
///
/// A request takes the entry out while it holds the connection and puts it
/// back before releasing it; the pool's close hook removes entries of
/// discarded connections.
#[derive(Default)]
pub(crate) struct ConnectionAuth {
    entries: Mutex<HashMap<ConnectionId, (RealmKey, Negotiator)>>,
}

impl ConnectionAuth {
    /// Takes the state stored for `id`, if it was created for `realm`.
    pub(crate) fn take(&self, id: ConnectionId, realm: &RealmKey) -> Option<Negotiator> {
        let (key, negotiator) = self.entries.lock().remove(&id)?;
        if key == *realm {
            Some(negotiator)
        } else {
            None
        }
    }

    pub(crate) fn put(&self, id: ConnectionId, realm: RealmKey, negotiator: Negotiator) {
        self.entries.lock().insert(id, (realm, negotiator));
    }

    pub(crate) fn remove(&self, id: ConnectionId) {
        if self.entries.lock().remove(&id).is_some() {
            log::trace!("dropped auth state of connection {}", id);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

impl fmt::Debug for ConnectionAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionAuth").finish()
    }
}
