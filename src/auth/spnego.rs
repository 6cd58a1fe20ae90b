use std::fmt;

use base64::prelude::{Engine as _, BASE64_STANDARD};
use http::HeaderValue;

use super::{challenge::Challenge, AuthRequest, Failure, NextAction};
use crate::{error::BoxError, util};

/// Supplies SPNEGO (`Negotiate`) tokens, typically from a GSSAPI or SSPI
/// security context.
///
/// The provider is asked for an initial token for the target host and then
/// for continuation tokens as the server answers with its own.
pub trait SpnegoProvider: Send + Sync {
    /// The first token sent to `host`.
    fn initial_token(&self, host: &str) -> Result<Vec<u8>, BoxError>;

    /// The answer to a server token; `None` when the context is complete and
    /// nothing more needs to be sent.
    fn next_token(&self, host: &str, server_token: &[u8]) -> Result<Option<Vec<u8>>, BoxError>;
}

impl fmt::Debug for dyn SpnegoProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("SpnegoProvider")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Init,
    TokenSent,
    Established,
    Failed,
}

/// A `Negotiate` exchange. Like NTLM it is bound to one connection.
#[derive(Debug)]
pub(crate) struct Spnego {
    stage: Stage,
}

impl Default for Spnego {
    fn default() -> Spnego {
        Spnego { stage: Stage::Init }
    }
}

impl Spnego {
    pub(crate) fn is_established(&self) -> bool {
        self.stage == Stage::Established
    }

    pub(crate) fn preemptive_header(
        &mut self,
        provider: &dyn SpnegoProvider,
        req: &AuthRequest<'_>,
    ) -> Result<HeaderValue, Failure> {
        let token = provider
            .initial_token(req.host)
            .map_err(|_| self.fail("SPNEGO provider failed to produce a token"))?;
        self.stage = Stage::TokenSent;
        Ok(util::token_header("Negotiate", &token))
    }

    pub(crate) fn on_challenge(
        &mut self,
        challenges: &[Challenge],
        provider: &dyn SpnegoProvider,
        req: &AuthRequest<'_>,
    ) -> NextAction {
        let challenge = match challenges.iter().find(|c| c.is("Negotiate")) {
            Some(c) => c,
            None => {
                return NextAction::Fail(self.fail("no Negotiate challenge offered"));
            }
        };

        match (self.stage, challenge.token()) {
            (Stage::Init, _) | (Stage::Established, None) => {
                match self.preemptive_header(provider, req) {
                    Ok(header) => NextAction::Retry {
                        header,
                        keep_connection: true,
                    },
                    Err(failure) => NextAction::Fail(failure),
                }
            }
            (Stage::TokenSent, Some(token)) => {
                let server_token = match BASE64_STANDARD.decode(token) {
                    Ok(t) => t,
                    Err(_) => return NextAction::Fail(self.fail("malformed Negotiate token")),
                };
                match provider.next_token(req.host, &server_token) {
                    Ok(Some(next)) => NextAction::Retry {
                        header: util::token_header("Negotiate", &next),
                        keep_connection: true,
                    },
                    Ok(None) => {
                        self.stage = Stage::Failed;
                        NextAction::Fail(Failure::Rejected("Negotiate context rejected"))
                    }
                    Err(_) => NextAction::Fail(self.fail("SPNEGO provider rejected server token")),
                }
            }
            (Stage::TokenSent, None) => {
                self.stage = Stage::Failed;
                NextAction::Fail(Failure::Rejected("Negotiate credentials rejected"))
            }
            (Stage::Established, Some(_)) | (Stage::Failed, _) => {
                self.stage = Stage::Failed;
                NextAction::Fail(Failure::Rejected("Negotiate credentials rejected"))
            }
        }
    }

    pub(crate) fn on_success(&mut self) {
        if self.stage == Stage::TokenSent {
            self.stage = Stage::Established;
        }
    }

    fn fail(&mut self, reason: &'static str) -> Failure {
        self.stage = Stage::Failed;
        Failure::Protocol(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::challenge;
    use http::Method;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Tokens {
        steps: AtomicUsize,
    }

    impl SpnegoProvider for Tokens {
        fn initial_token(&self, host: &str) -> Result<Vec<u8>, BoxError> {
            Ok(format!("init:{host}").into_bytes())
        }

        fn next_token(&self, _host: &str, server: &[u8]) -> Result<Option<Vec<u8>>, BoxError> {
            self.steps.fetch_add(1, Ordering::SeqCst);
            if server == b"continue" {
                Ok(Some(b"more".to_vec()))
            } else {
                Ok(None)
            }
        }
    }

    fn req() -> AuthRequest<'static> {
        AuthRequest {
            method: &Method::GET,
            uri: "/",
            host: "example.com",
        }
    }

    fn challenges(value: &str) -> Vec<Challenge> {
        challenge::parse(&[HeaderValue::from_str(value).unwrap()])
    }

    #[test]
    fn initial_then_continuation() {
        let provider = Tokens::default();
        let mut spnego = Spnego::default();

        match spnego.on_challenge(&challenges("Negotiate"), &provider, &req()) {
            NextAction::Retry { header, .. } => {
                let expected = format!("Negotiate {}", BASE64_STANDARD.encode("init:example.com"));
                assert_eq!(header, expected.as_str());
            }
            other => panic!("unexpected {other:?}"),
        }

        let server = format!("Negotiate {}", BASE64_STANDARD.encode("continue"));
        match spnego.on_challenge(&challenges(&server), &provider, &req()) {
            NextAction::Retry { header, .. } => {
                let expected = format!("Negotiate {}", BASE64_STANDARD.encode("more"));
                assert_eq!(header, expected.as_str());
            }
            other => panic!("unexpected {other:?}"),
        }
        spnego.on_success();
        assert!(spnego.is_established());
        assert_eq!(provider.steps.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn bare_challenge_after_token_is_rejection() {
        let provider = Tokens::default();
        let mut spnego = Spnego::default();
        let _ = spnego.on_challenge(&challenges("Negotiate"), &provider, &req());
        assert!(matches!(
            spnego.on_challenge(&challenges("Negotiate"), &provider, &req()),
            NextAction::Fail(Failure::Rejected(_))
        ));
    }
}
