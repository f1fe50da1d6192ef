//! `reqflight` is a client-side request orchestration layer for JSON APIs that
//! wrap every response in a `{status, message, result}` envelope.
//!
//! A [`Dispatcher`] sits between call sites and a [`Transport`]. It rejects a
//! request while an identical one is in flight, decodes the envelope, and
//! when a response says the credentials have expired it parks the request,
//! runs one recovery action for every request that failed the same way, and
//! replays them all. The caller only sees the replayed result.
//!
//! # Quick Start
//!
//! ```no_run
//! use reqflight::prelude::{
//!     BoxError, DeferOnCodes, Dispatcher, DispatcherConfig, RecoveryMiddleware,
//! };
//! use serde::Deserialize;
//!
//! #[derive(Debug, Deserialize)]
//! struct Profile {
//!     nickname: String,
//! }
//!
//! async fn refresh_token() -> Result<(), BoxError> {
//!     // call the token endpoint with `.recovery_exempt()` and store the result
//!     Ok(())
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let dispatcher = Dispatcher::builder()
//!         .config(DispatcherConfig::default().with_base_url("https://api.example.com"))
//!         .middleware(RecoveryMiddleware::new().envelope_handler(DeferOnCodes::new(["E0001"])))
//!         .recovery_action(refresh_token)
//!         .build()?;
//!
//!     let request = dispatcher.get("/v1/profile")?;
//!     let profile: Profile = dispatcher.dispatch_envelope(request).await?;
//!     println!("hello {}", profile.nickname);
//!     Ok(())
//! }
//! ```
//!
//! # Defaults
//!
//! - Duplicate window 300 ms, swept every second while requests are pending.
//! - Success sentinel `C0000`; a missing result maps to domain code `KF1000`.
//! - A request may be deferred and replayed once before it fails with
//!   [`Error::DeferralLimitExceeded`].
//! - Request timeout 30 s unless the request sets its own.

mod cache;
mod cancel;
mod config;
pub mod defaults;
mod dedup;
mod dispatcher;
mod envelope;
mod error;
mod extensions;
mod fingerprint;
mod metrics;
mod observe;
mod recovery;
mod refresh;
mod request;
mod response;
pub mod transport;
mod util;

pub use crate::cache::{MemoryResponseCache, ResponseCache};
pub use crate::cancel::CancellationScope;
pub use crate::config::{
    DEFAULT_DEDUP_WINDOW, DEFAULT_MAX_DEFERRALS, DEFAULT_REQUEST_TIMEOUT, DEFAULT_SWEEP_INTERVAL,
    DispatcherConfig,
};
pub use crate::dispatcher::{Dispatcher, DispatcherBuilder};
pub use crate::envelope::{
    DEFAULT_FAILURE_MESSAGE, DEFAULT_MISSING_RESULT_CODE, DEFAULT_SUCCESS_CODE, Envelope,
    EnvelopeFormat, EnvelopeProbe, NoPayload,
};
pub use crate::error::{BoxError, Error, ErrorCode, TransportErrorKind};
pub use crate::extensions::{Clock, ManualReachability, ReachabilityProbe, SystemClock};
pub use crate::metrics::DispatcherMetricsSnapshot;
pub use crate::observe::Observer;
pub use crate::recovery::{
    DeferOnCodes, DeferOnStatus, EnvelopeHandler, FailReason, RecoveryContext, RecoveryDecision,
    RecoveryMiddleware, StatusHandler,
};
pub use crate::refresh::{RecoveryAction, RecoveryFuture};
pub use crate::request::RequestDescriptor;
pub use crate::response::Response;
#[cfg(feature = "hyper-transport")]
pub use crate::transport::HyperTransport;
pub use crate::transport::{
    Progress, Transport, TransportError, TransportFuture, TransportRequest, TransportResponse,
};

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::defaults::{DefaultEmpty, DefaultFalse, DefaultTrue, DefaultZero, Defaulted};
    pub use crate::{
        BoxError, CancellationScope, DeferOnCodes, DeferOnStatus, Dispatcher, DispatcherConfig,
        DispatcherMetricsSnapshot, Envelope, EnvelopeFormat, Error, ErrorCode, NoPayload,
        RecoveryAction, RecoveryContext, RecoveryDecision, RecoveryMiddleware, RequestDescriptor,
        Response, Transport, TransportErrorKind,
    };
}
