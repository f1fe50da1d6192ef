//! Classification of completed exchanges into proceed, fail or defer.
//!
//! Two trigger classes are evaluated in order. A status trigger fires when
//! the HTTP status is on the watch list and a [`StatusHandler`] is set. An
//! envelope trigger fires on a 2xx response when an [`EnvelopeHandler`] is
//! set and the body parses as an envelope. Without a handler the decision is
//! proceed for 2xx and fail for anything else.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;

use http::StatusCode;

use crate::envelope::{EnvelopeFormat, EnvelopeProbe};
use crate::request::RequestDescriptor;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FailReason {
    /// Surface the HTTP status as [`Error::HttpStatus`](crate::Error::HttpStatus).
    HttpStatus,
    Domain {
        code: String,
        message: String,
    },
    Cancelled,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecoveryDecision {
    Proceed,
    Fail(FailReason),
    /// Park the request until credential recovery completes, then replay it.
    Defer,
}

/// What a handler sees about the exchange being classified.
#[derive(Clone, Copy, Debug)]
pub struct RecoveryContext<'a> {
    request: &'a RequestDescriptor,
    deferrals: usize,
}

impl<'a> RecoveryContext<'a> {
    pub(crate) fn new(request: &'a RequestDescriptor, deferrals: usize) -> Self {
        Self { request, deferrals }
    }

    pub fn request(&self) -> &'a RequestDescriptor {
        self.request
    }

    /// How many times this request has already been deferred and replayed.
    pub fn deferrals(&self) -> usize {
        self.deferrals
    }

    pub fn is_replay(&self) -> bool {
        self.deferrals > 0
    }
}

pub trait StatusHandler: Send + Sync {
    fn on_status(
        &self,
        context: &RecoveryContext<'_>,
        status: StatusCode,
        body: &[u8],
    ) -> RecoveryDecision;
}

impl<F> StatusHandler for F
where
    F: Fn(&RecoveryContext<'_>, StatusCode) -> RecoveryDecision + Send + Sync,
{
    fn on_status(
        &self,
        context: &RecoveryContext<'_>,
        status: StatusCode,
        _body: &[u8],
    ) -> RecoveryDecision {
        self(context, status)
    }
}

pub trait EnvelopeHandler: Send + Sync {
    fn on_envelope(&self, context: &RecoveryContext<'_>, probe: &EnvelopeProbe)
    -> RecoveryDecision;
}

impl<F> EnvelopeHandler for F
where
    F: Fn(&RecoveryContext<'_>, &EnvelopeProbe) -> RecoveryDecision + Send + Sync,
{
    fn on_envelope(
        &self,
        context: &RecoveryContext<'_>,
        probe: &EnvelopeProbe,
    ) -> RecoveryDecision {
        self(context, probe)
    }
}

/// Defers every status it is registered for.
#[derive(Clone, Copy, Debug, Default)]
pub struct DeferOnStatus;

impl StatusHandler for DeferOnStatus {
    fn on_status(
        &self,
        _context: &RecoveryContext<'_>,
        _status: StatusCode,
        _body: &[u8],
    ) -> RecoveryDecision {
        RecoveryDecision::Defer
    }
}

/// Defers envelopes whose status is one of the given domain codes; every
/// other envelope proceeds and is judged by the final decode.
#[derive(Clone, Debug, Default)]
pub struct DeferOnCodes {
    codes: HashSet<String>,
}

impl DeferOnCodes {
    pub fn new<I, S>(codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            codes: codes.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, code: &str) -> bool {
        self.codes.contains(code)
    }
}

impl EnvelopeHandler for DeferOnCodes {
    fn on_envelope(
        &self,
        _context: &RecoveryContext<'_>,
        probe: &EnvelopeProbe,
    ) -> RecoveryDecision {
        if !probe.is_success() && self.contains(probe.code()) {
            return RecoveryDecision::Defer;
        }
        RecoveryDecision::Proceed
    }
}

#[derive(Clone, Default)]
pub struct RecoveryMiddleware {
    watched_statuses: BTreeSet<u16>,
    status_handler: Option<Arc<dyn StatusHandler>>,
    envelope_handler: Option<Arc<dyn EnvelopeHandler>>,
}

impl fmt::Debug for RecoveryMiddleware {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("RecoveryMiddleware")
            .field("watched_statuses", &self.watched_statuses)
            .field("status_handler", &self.status_handler.is_some())
            .field("envelope_handler", &self.envelope_handler.is_some())
            .finish()
    }
}

impl RecoveryMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn watch_statuses<I, H>(mut self, statuses: I, handler: H) -> Self
    where
        I: IntoIterator<Item = StatusCode>,
        H: StatusHandler + 'static,
    {
        self.watched_statuses
            .extend(statuses.into_iter().map(|status| status.as_u16()));
        self.status_handler = Some(Arc::new(handler));
        self
    }

    pub fn envelope_handler<H>(mut self, handler: H) -> Self
    where
        H: EnvelopeHandler + 'static,
    {
        self.envelope_handler = Some(Arc::new(handler));
        self
    }

    pub fn watches_status(&self, status: StatusCode) -> bool {
        self.status_handler.is_some() && self.watched_statuses.contains(&status.as_u16())
    }

    pub fn has_envelope_handler(&self) -> bool {
        self.envelope_handler.is_some()
    }

    /// A recovery-exempt request never receives [`RecoveryDecision::Defer`];
    /// a handler's defer becomes the failure the trigger describes.
    pub fn classify(
        &self,
        context: &RecoveryContext<'_>,
        status: StatusCode,
        body: &[u8],
        format: &EnvelopeFormat,
    ) -> RecoveryDecision {
        let exempt = context.request().is_recovery_exempt();

        if self.watched_statuses.contains(&status.as_u16())
            && let Some(handler) = &self.status_handler
        {
            return match handler.on_status(context, status, body) {
                RecoveryDecision::Defer if exempt => {
                    RecoveryDecision::Fail(FailReason::HttpStatus)
                }
                decision => decision,
            };
        }

        if !status.is_success() {
            return RecoveryDecision::Fail(FailReason::HttpStatus);
        }

        let Some(handler) = &self.envelope_handler else {
            return RecoveryDecision::Proceed;
        };
        let Some(probe) = format.probe(body) else {
            return RecoveryDecision::Proceed;
        };
        match handler.on_envelope(context, &probe) {
            RecoveryDecision::Defer if exempt => RecoveryDecision::Fail(FailReason::Domain {
                code: probe.code().to_owned(),
                message: format.failure_message(&probe),
            }),
            decision => decision,
        }
    }
}
