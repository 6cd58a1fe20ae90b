use std::fmt;

use url::Url;

use crate::error::{Error, Result};

/// Destination of a request: the key under which connections are pooled.
///
/// Two requests share a connection only if their targets are equal. The
/// port is always explicit; it defaults from the scheme when the URL leaves
/// it out.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    scheme: Scheme,
    host: Box<str>,
    port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Scheme {
    Http,
    Https,
}

impl Target {
    /// Creates a target, defaulting the port from the scheme.
    pub fn new(scheme: &str, host: &str, port: Option<u16>) -> Result<Target> {
        let scheme = if scheme.eq_ignore_ascii_case("http") {
            Scheme::Http
        } else if scheme.eq_ignore_ascii_case("https") {
            Scheme::Https
        } else {
            return Err(Error::builder(format!("unsupported scheme: {scheme}")));
        };
        if host.is_empty() {
            return Err(Error::builder("target host is empty"));
        }
        let port = port.unwrap_or(match scheme {
            Scheme::Http => 80,
            Scheme::Https => 443,
        });
        Ok(Target {
            scheme,
            host: host.to_ascii_lowercase().into_boxed_str(),
            port,
        })
    }

    pub(crate) fn from_url(url: &Url) -> Result<Target> {
        let host = url
            .host_str()
            .ok_or_else(|| Error::url_bad_scheme(url.clone()))?;
        Target::new(url.scheme(), host, url.port()).map_err(|e| e.with_url(url.clone()))
    }

    /// `http` or `https`.
    pub fn scheme(&self) -> &str {
        match self.scheme {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    /// The host, without brackets for IPv6 literals.
    pub fn host(&self) -> &str {
        self.host.trim_start_matches('[').trim_end_matches(']')
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns true for `https` targets.
    pub fn is_secure(&self) -> bool {
        self.scheme == Scheme::Https
    }

    /// The value of the `Host` header for requests to this target.
    pub(crate) fn authority(&self) -> String {
        let default = match self.scheme {
            Scheme::Http => 80,
            Scheme::Https => 443,
        };
        if self.port == default {
            self.host.to_string()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme(), self.host, self.port)
    }
}
