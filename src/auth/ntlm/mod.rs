//! NTLM authentication.
//!
//! The three-message exchange authenticates a connection, not a request:
//! the Type 3 message must travel on the connection that received the
//! Type 2 challenge, and once accepted, later requests on that connection
//! need no further handshake.

mod crypto;
mod message;

use base64::prelude::{Engine as _, BASE64_STANDARD};
use http::HeaderValue;

use super::{challenge::Challenge, Failure, NextAction, Realm};
use crate::util;

/// Where the handshake stands on its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stage {
    Init,
    Type1Sent,
    Type2Received,
    Type3Sent,
    Authenticated,
    Failed,
}

#[derive(Debug)]
pub(crate) struct NtlmHandshake {
    stage: Stage,
    restarted: bool,
}

impl Default for NtlmHandshake {
    fn default() -> NtlmHandshake {
        NtlmHandshake {
            stage: Stage::Init,
            restarted: false,
        }
    }
}

impl NtlmHandshake {
    pub(crate) fn stage(&self) -> Stage {
        self.stage
    }

    /// Sends the Type 1 message.
    pub(crate) fn negotiate(&mut self) -> HeaderValue {
        log::debug!("ntlm: sending negotiate message");
        self.stage = Stage::Type1Sent;
        util::token_header("NTLM", &message::negotiate())
    }

    pub(crate) fn on_challenge(&mut self, challenges: &[Challenge], realm: &Realm) -> NextAction {
        let challenge = match challenges.iter().find(|c| c.is("NTLM")) {
            Some(c) => c,
            None => return self.fail(Failure::Protocol("no NTLM challenge offered")),
        };

        match (self.stage, challenge.token()) {
            (Stage::Init, None) => retry(self.negotiate()),
            (Stage::Init, Some(_)) => {
                self.fail(Failure::Protocol("NTLM challenge before negotiate"))
            }
            (Stage::Type1Sent, Some(token)) => match self.authenticate(token, realm) {
                Ok(header) => retry(header),
                Err(failure) => self.fail(failure),
            },
            (Stage::Type1Sent, None) => {
                self.fail(Failure::Protocol("NTLM challenge without a Type 2 message"))
            }
            (Stage::Authenticated, None) if !self.restarted => {
                log::debug!("ntlm: authenticated connection challenged again, restarting");
                self.restarted = true;
                retry(self.negotiate())
            }
            (Stage::Type2Received | Stage::Type3Sent, _) => {
                self.fail(Failure::Rejected("NTLM credentials rejected"))
            }
            (Stage::Authenticated | Stage::Failed, _) => {
                self.fail(Failure::Rejected("NTLM authentication failed"))
            }
        }
    }

    /// A non-challenge response after the Type 3 completes the handshake.
    /// The connection may then be re-authenticated once more.
    pub(crate) fn on_success(&mut self) {
        if self.stage == Stage::Type3Sent {
            log::debug!("ntlm: connection authenticated");
            self.stage = Stage::Authenticated;
            self.restarted = false;
        }
    }

    fn authenticate(&mut self, token: &str, realm: &Realm) -> Result<HeaderValue, Failure> {
        let bytes = BASE64_STANDARD
            .decode(token)
            .map_err(|_| Failure::Protocol("NTLM Type 2 is not base64"))?;
        let challenge = message::Challenge::decode(&bytes).map_err(|e| {
            log::warn!("ntlm: {}", e);
            Failure::Protocol("malformed NTLM Type 2 message")
        })?;
        self.stage = Stage::Type2Received;

        let creds = message::Credentials {
            domain: realm.domain(),
            workstation: realm.workstation(),
            user: realm.principal(),
            password: realm.password(),
        };
        let client_nonce = util::random_nonce().map_err(|_| Failure::Entropy)?;
        let type3 = message::authenticate(&creds, &challenge, client_nonce, crypto::filetime_now())
            .map_err(|e| {
                log::warn!("ntlm: {}", e);
                Failure::Protocol("NTLM Type 3 message cannot be encoded")
            })?;
        log::debug!("ntlm: sending authenticate message");
        self.stage = Stage::Type3Sent;
        Ok(util::token_header("NTLM", &type3))
    }

    fn fail(&mut self, failure: Failure) -> NextAction {
        self.stage = Stage::Failed;
        NextAction::Fail(failure)
    }
}

fn retry(header: HeaderValue) -> NextAction {
    NextAction::Retry {
        header,
        keep_connection: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::challenge;

    const TYPE1: &str = "NTLM TlRMTVNTUAABAAAAAYIIogAAAAAoAAAAAAAAACgAAAAFASgKAAAADw==";
    const TYPE2: &str = "NTLM TlRMTVNTUAACAAAAAAAAACgAAAABggAAU3J2Tm9uY2UAAAAAAAAAAA==";
    const TYPE3: &str = "NTLM TlRMTVNTUAADAAAAGAAYAEgAAAAYABgAYAAAABQAFAB4AAAADAAMAIwAAAASABIAmAAAAAAAAACqAAAAAYIAAgUBKAoAAAAPrYfKbe/jRoW5xDxHeoxC1gBmfWiS5+iX4OAN4xBKG/IFPwfH3agtPEia6YnhsADTVQBSAFMAQQAtAE0ASQBOAE8AUgBaAGEAcABoAG8AZABMAGkAZwBoAHQAQwBpAHQAeQA=";

    fn realm() -> Realm {
        Realm::ntlm("Zaphod", "Beeblebrox")
            .ntlm_domain("Ursa-Minor")
            .ntlm_host("LightCity")
    }

    fn challenges(value: &'static str) -> Vec<Challenge> {
        challenge::parse(&[HeaderValue::from_static(value)])
    }

    fn retry_header(action: NextAction) -> HeaderValue {
        match action {
            NextAction::Retry {
                header,
                keep_connection,
            } => {
                assert!(keep_connection);
                header
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn full_handshake() {
        let mut ntlm = NtlmHandshake::default();
        let realm = realm();

        let type1 = retry_header(ntlm.on_challenge(&challenges("NTLM"), &realm));
        assert_eq!(type1, TYPE1);
        assert_eq!(ntlm.stage(), Stage::Type1Sent);

        let type3 = retry_header(ntlm.on_challenge(&challenges(TYPE2), &realm));
        assert_eq!(type3, TYPE3);
        assert!(type3.is_sensitive());
        assert_eq!(ntlm.stage(), Stage::Type3Sent);

        ntlm.on_success();
        assert_eq!(ntlm.stage(), Stage::Authenticated);
    }

    #[test]
    fn preemptive_negotiate() {
        let mut ntlm = NtlmHandshake::default();
        assert_eq!(ntlm.negotiate(), TYPE1);
        let type3 = retry_header(ntlm.on_challenge(&challenges(TYPE2), &realm()));
        assert_eq!(type3, TYPE3);
    }

    #[test]
    fn rejected_after_type3_does_not_loop() {
        let mut ntlm = NtlmHandshake::default();
        let realm = realm();
        ntlm.negotiate();
        let _ = ntlm.on_challenge(&challenges(TYPE2), &realm);

        assert!(matches!(
            ntlm.on_challenge(&challenges("NTLM"), &realm),
            NextAction::Fail(Failure::Rejected(_))
        ));
        assert_eq!(ntlm.stage(), Stage::Failed);
        assert!(matches!(
            ntlm.on_challenge(&challenges("NTLM"), &realm),
            NextAction::Fail(_)
        ));
    }

    #[test]
    fn missing_token_is_protocol_error() {
        let mut ntlm = NtlmHandshake::default();
        assert!(matches!(
            ntlm.on_challenge(&challenges("Basic realm=x"), &realm()),
            NextAction::Fail(Failure::Protocol(_))
        ));

        let mut ntlm = NtlmHandshake::default();
        ntlm.negotiate();
        assert!(matches!(
            ntlm.on_challenge(&challenges("NTLM"), &realm()),
            NextAction::Fail(Failure::Protocol(_))
        ));

        let mut ntlm = NtlmHandshake::default();
        ntlm.negotiate();
        assert!(matches!(
            ntlm.on_challenge(&challenges("NTLM Zm9v"), &realm()),
            NextAction::Fail(Failure::Protocol(_))
        ));
    }

    #[test]
    fn authenticated_connection_restarts_after_each_success() {
        let mut ntlm = NtlmHandshake::default();
        let realm = realm();
        ntlm.negotiate();
        let _ = ntlm.on_challenge(&challenges(TYPE2), &realm);
        ntlm.on_success();

        for _ in 0..3 {
            assert_eq!(
                retry_header(ntlm.on_challenge(&challenges("NTLM"), &realm)),
                TYPE1
            );
            let _ = ntlm.on_challenge(&challenges(TYPE2), &realm);
            ntlm.on_success();
            assert_eq!(ntlm.stage(), Stage::Authenticated);
        }
    }

    #[test]
    fn restart_rejected_without_success() {
        let mut ntlm = NtlmHandshake::default();
        let realm = realm();
        ntlm.negotiate();
        let _ = ntlm.on_challenge(&challenges(TYPE2), &realm);
        ntlm.on_success();

        retry_header(ntlm.on_challenge(&challenges("NTLM"), &realm));
        let _ = ntlm.on_challenge(&challenges(TYPE2), &realm);
        assert!(matches!(
            ntlm.on_challenge(&challenges("NTLM"), &realm),
            NextAction::Fail(Failure::Rejected(_))
        ));
    }
}
