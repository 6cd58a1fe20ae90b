use http::HeaderValue;
use md5::{Digest as _, Md5};

use super::{challenge::Challenge, AuthRequest, Failure, NextAction, Realm};
use crate::util;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Algorithm {
    Md5,
    Md5Sess,
}

#[derive(Debug, Clone)]
struct Params {
    realm: String,
    nonce: String,
    opaque: Option<String>,
    algorithm: Algorithm,
    qop_auth: bool,
}

/// Digest access authentication, `MD5` and `MD5-sess` with `qop=auth` or
/// the legacy no-qop form.
///
/// The last challenge is kept so later requests through the same
/// negotiator can authenticate preemptively with an incremented `nc`.
#[derive(Debug, Default)]
pub(crate) struct Digest {
    params: Option<Params>,
    nc: u32,
    sent: bool,
    stale_retried: bool,
}

impl Digest {
    pub(crate) fn has_cached_challenge(&self) -> bool {
        self.params.is_some()
    }

    pub(crate) fn preemptive_header(
        &mut self,
        realm: &Realm,
        req: &AuthRequest<'_>,
    ) -> Result<Option<HeaderValue>, Failure> {
        let params = match self.params.as_ref() {
            Some(params) => params,
            None => return Ok(None),
        };
        let cnonce = cnonce()?;
        self.nc += 1;
        self.sent = true;
        Ok(Some(header(params, realm, req, self.nc, &cnonce)))
    }

    pub(crate) fn on_challenge(
        &mut self,
        challenges: &[Challenge],
        realm: &Realm,
        req: &AuthRequest<'_>,
    ) -> NextAction {
        let challenge = match challenges.iter().find(|c| c.is("Digest")) {
            Some(c) => c,
            None => return NextAction::Fail(Failure::Protocol("no Digest challenge offered")),
        };
        let params = match parse_params(challenge) {
            Ok(params) => params,
            Err(failure) => return NextAction::Fail(failure),
        };
        let stale = challenge
            .param("stale")
            .map_or(false, |s| s.eq_ignore_ascii_case("true"));

        if self.sent {
            if stale && !self.stale_retried {
                log::debug!("digest nonce is stale, retrying with the new one");
                self.stale_retried = true;
            } else {
                return NextAction::Fail(Failure::Rejected("Digest credentials rejected"));
            }
        }

        let cnonce = match cnonce() {
            Ok(cnonce) => cnonce,
            Err(failure) => return NextAction::Fail(failure),
        };
        self.nc = 1;
        self.sent = true;
        let header = header(&params, realm, req, self.nc, &cnonce);
        self.params = Some(params);
        NextAction::Retry {
            header,
            keep_connection: true,
        }
    }

    /// A response that was not a challenge starts a new round for the next
    /// request.
    pub(crate) fn on_success(&mut self) {
        self.sent = false;
        self.stale_retried = false;
    }
}

fn cnonce() -> Result<String, Failure> {
    let nonce = util::random_nonce().map_err(|_| Failure::Entropy)?;
    Ok(util::hex(&nonce))
}

fn parse_params(challenge: &Challenge) -> Result<Params, Failure> {
    let nonce = challenge
        .param("nonce")
        .ok_or(Failure::Protocol("Digest challenge without nonce"))?;
    let algorithm = match challenge.param("algorithm") {
        None => Algorithm::Md5,
        Some(a) if a.eq_ignore_ascii_case("MD5") => Algorithm::Md5,
        Some(a) if a.eq_ignore_ascii_case("MD5-sess") => Algorithm::Md5Sess,
        Some(_) => return Err(Failure::Protocol("unsupported Digest algorithm")),
    };
    let qop_auth = match challenge.param("qop") {
        None => false,
        Some(qop) => {
            if qop.split(',').any(|q| q.trim().eq_ignore_ascii_case("auth")) {
                true
            } else {
                return Err(Failure::Protocol("unsupported Digest qop"));
            }
        }
    };

    Ok(Params {
        realm: challenge.param("realm").unwrap_or_default().to_owned(),
        nonce: nonce.to_owned(),
        opaque: challenge.param("opaque").map(ToOwned::to_owned),
        algorithm,
        qop_auth,
    })
}

fn md5_hex(data: &str) -> String {
    util::hex(&Md5::digest(data.as_bytes()))
}

fn response(params: &Params, realm: &Realm, req: &AuthRequest<'_>, nc: &str, cnonce: &str) -> String {
    let mut ha1 = md5_hex(&format!(
        "{}:{}:{}",
        realm.principal(),
        params.realm,
        realm.password()
    ));
    if params.algorithm == Algorithm::Md5Sess {
        ha1 = md5_hex(&format!("{}:{}:{}", ha1, params.nonce, cnonce));
    }
    let ha2 = md5_hex(&format!("{}:{}", req.method.as_str(), req.uri));

    if params.qop_auth {
        md5_hex(&format!(
            "{}:{}:{}:{}:auth:{}",
            ha1, params.nonce, nc, cnonce, ha2
        ))
    } else {
        md5_hex(&format!("{}:{}:{}", ha1, params.nonce, ha2))
    }
}

fn header(params: &Params, realm: &Realm, req: &AuthRequest<'_>, nc: u32, cnonce: &str) -> HeaderValue {
    let nc = format!("{:08x}", nc);
    let response = response(params, realm, req, &nc, cnonce);

    let mut value = format!(
        "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\"",
        quote(realm.principal()),
        quote(&params.realm),
        quote(&params.nonce),
        quote(req.uri),
        response
    );
    value.push_str(match params.algorithm {
        Algorithm::Md5 => ", algorithm=MD5",
        Algorithm::Md5Sess => ", algorithm=MD5-sess",
    });
    if let Some(ref opaque) = params.opaque {
        value.push_str(&format!(", opaque=\"{}\"", quote(opaque)));
    }
    if params.qop_auth {
        value.push_str(&format!(", qop=auth, nc={}, cnonce=\"{}\"", nc, cnonce));
    }

    let mut header = HeaderValue::from_str(&value)
        .unwrap_or_else(|_| HeaderValue::from_static("Digest"));
    header.set_sensitive(true);
    header
}

fn quote(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}
