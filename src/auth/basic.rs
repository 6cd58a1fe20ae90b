use http::HeaderValue;

use super::{challenge::Challenge, Failure, NextAction, Realm};
use crate::util;

/// `Basic` credentials are sent at most once per logical request: a second
/// challenge means they were rejected.
#[derive(Debug, Default)]
pub(crate) struct Basic {
    sent: bool,
}

impl Basic {
    pub(crate) fn preemptive_header(&mut self, realm: &Realm) -> HeaderValue {
        self.sent = true;
        credentials(realm)
    }

    pub(crate) fn on_challenge(&mut self, challenges: &[Challenge], realm: &Realm) -> NextAction {
        if !challenges.iter().any(|c| c.is("Basic")) {
            return NextAction::Fail(Failure::Protocol("no Basic challenge offered"));
        }
        if self.sent {
            return NextAction::Fail(Failure::Rejected("Basic credentials rejected"));
        }
        self.sent = true;
        NextAction::Retry {
            header: credentials(realm),
            keep_connection: true,
        }
    }
}

fn credentials(realm: &Realm) -> HeaderValue {
    util::basic_auth(realm.principal(), Some(realm.password()))
}
