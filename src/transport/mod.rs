use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Uri};
use thiserror::Error;

use crate::error::{BoxError, TransportErrorKind};
use crate::util::lock_unpoisoned;

#[cfg(feature = "hyper-transport")]
mod hyper_client;

#[cfg(feature = "hyper-transport")]
pub use self::hyper_client::{HyperTransport, HyperTransportBuilder};

pub type TransportFuture =
    Pin<Box<dyn Future<Output = Result<TransportResponse, TransportError>> + Send>>;

/// The HTTP client underneath the dispatcher.
///
/// Implementations enforce [`TransportRequest::timeout`] and report
/// [`TransportError::Timeout`] when it elapses.
pub trait Transport: Send + Sync {
    fn send(&self, request: TransportRequest) -> TransportFuture;
}

impl<T> Transport for Arc<T>
where
    T: Transport + ?Sized,
{
    fn send(&self, request: TransportRequest) -> TransportFuture {
        (**self).send(request)
    }
}

#[derive(Clone, Debug)]
pub struct TransportRequest {
    pub(crate) method: Method,
    pub(crate) uri: Uri,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Bytes,
    pub(crate) timeout: Duration,
    pub(crate) progress: Progress,
}

impl TransportRequest {
    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn progress(&self) -> &Progress {
        &self.progress
    }
}

#[derive(Clone, Debug)]
pub struct TransportResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl TransportResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub(crate) fn into_parts(self) -> (StatusCode, HeaderMap, Bytes) {
        (self.status, self.headers, self.body)
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport cancelled the request")]
    Cancelled,
    #[error("network unreachable: {message}")]
    NetworkUnreachable { message: String },
    #[error("transport timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u128 },
    #[error("{kind} transport error: {source}")]
    Other {
        kind: TransportErrorKind,
        #[source]
        source: BoxError,
    },
}

impl TransportError {
    pub fn other(kind: TransportErrorKind, source: impl Into<BoxError>) -> Self {
        Self::Other {
            kind,
            source: source.into(),
        }
    }
}

type ProgressCallback = Arc<dyn Fn(f64) + Send + Sync>;

struct ProgressInner {
    callback: ProgressCallback,
    last: Mutex<Option<f64>>,
}

/// Download progress sink handed to the transport.
///
/// Reported fractions are clamped to `[0, 1]`; a value not greater than the
/// last forwarded one is dropped, so observers see a non-decreasing sequence.
/// Clones share that state, which keeps progress monotonic across replays of
/// the same request.
#[derive(Clone, Default)]
pub struct Progress {
    inner: Option<Arc<ProgressInner>>,
}

impl Progress {
    pub(crate) fn new<F>(callback: F) -> Self
    where
        F: Fn(f64) + Send + Sync + 'static,
    {
        Self {
            inner: Some(Arc::new(ProgressInner {
                callback: Arc::new(callback),
                last: Mutex::new(None),
            })),
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    pub fn report(&self, fraction: f64) {
        let Some(inner) = &self.inner else {
            return;
        };
        if fraction.is_nan() {
            return;
        }
        let fraction = fraction.clamp(0.0, 1.0);
        {
            let mut last = lock_unpoisoned(&inner.last);
            if let Some(previous) = *last
                && fraction <= previous
            {
                return;
            }
            *last = Some(fraction);
        }
        (inner.callback)(fraction);
    }

    pub fn last_reported(&self) -> Option<f64> {
        self.inner
            .as_ref()
            .and_then(|inner| *lock_unpoisoned(&inner.last))
    }
}

impl fmt::Debug for Progress {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Progress")
            .field("enabled", &self.is_enabled())
            .field("last_reported", &self.last_reported())
            .finish()
    }
}
