//! Retry requests
//!
//! A request that fails before any response head arrived may be sent again
//! on a fresh connection. Whether that is safe depends on how it failed:
//!
//! - a connection taken from the pool may have been closed by the server
//!   while idle, so a send failure on it is always replayable;
//! - an idempotent method can be replayed after any transport failure;
//! - a failure to connect never reached the server.
//!
//! Timeouts, cancellations and malformed responses are never retried. Every logical request has a
//! budget of `max_request_retry` extra attempts.

use std::error::Error as StdError;

use http::Method;

use crate::error::{Error, TooManyConnections};

/// The action to take after classifying a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Action {
    /// Give up and surface the error.
    Fail,
    /// Send the request again on another connection.
    Retryable,
}

/// What the executor knew about the attempt when it failed.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Attempt<'a> {
    pub(crate) method: &'a Method,
    pub(crate) reused: bool,
}

pub(crate) fn classify(attempt: Attempt<'_>, err: &Error) -> Action {
    if err.is_timeout() || err.is_canceled() || err.is_protocol() {
        return Action::Fail;
    }

    if err.is_connect() {
        // The pool refusing capacity is not a network failure.
        if has_source::<TooManyConnections>(err) {
            return Action::Fail;
        }
        return Action::Retryable;
    }

    if err.is_request() && (attempt.reused || is_idempotent(attempt.method)) {
        return Action::Retryable;
    }

    Action::Fail
}

fn is_idempotent(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE | Method::PUT | Method::DELETE
    )
}

fn has_source<E: StdError + 'static>(err: &Error) -> bool {
    let mut source = err.source();
    while let Some(err) = source {
        if err.is::<E>() {
            return true;
        }
        source = err.source();
    }
    false
}

/// A per-request retry budget.
#[derive(Debug)]
pub(crate) struct Budget {
    remaining: usize,
}

impl Budget {
    pub(crate) fn new(max: usize) -> Budget {
        Budget { remaining: max }
    }

    /// Spends one retry, returning false once the budget is exhausted.
    pub(crate) fn withdraw(&mut self) -> bool {
        if self.remaining == 0 {
            false
        } else {
            self.remaining -= 1;
            true
        }
    }
}
