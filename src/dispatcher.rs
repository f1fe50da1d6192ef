use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http::Method;
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::cache::ResponseCache;
use crate::config::DispatcherConfig;
use crate::dedup::DuplicateSuppressor;
use crate::error::Error;
use crate::extensions::{Clock, ReachabilityProbe, SystemClock};
use crate::metrics::{DispatcherMetrics, DispatcherMetricsSnapshot};
use crate::observe::Observer;
use crate::recovery::{FailReason, RecoveryContext, RecoveryDecision, RecoveryMiddleware};
use crate::refresh::{RecoveryAction, RefreshCoordinator, Waiter};
use crate::request::RequestDescriptor;
use crate::response::Response;
use crate::transport::{Transport, TransportError, TransportRequest};
use crate::util::{resolve_url, truncate_body, validate_base_url};

type DispatchFuture = Pin<Box<dyn Future<Output = crate::Result<Response>> + Send>>;

enum Outcome {
    Settled(crate::Result<Response>),
    Defer,
}

enum Parked {
    Settled(crate::Result<Response>),
    /// The replay has recorded its own outcome.
    Replayed(crate::Result<Response>),
}

pub struct DispatcherBuilder {
    transport: Option<Arc<dyn Transport>>,
    config: DispatcherConfig,
    middleware: RecoveryMiddleware,
    recovery_action: Option<Arc<dyn RecoveryAction>>,
    clock: Arc<dyn Clock>,
    reachability: Option<Arc<dyn ReachabilityProbe>>,
    cache: Option<Arc<dyn ResponseCache>>,
    observer: Option<Arc<dyn Observer>>,
}

impl Default for DispatcherBuilder {
    fn default() -> Self {
        Self {
            transport: None,
            config: DispatcherConfig::default(),
            middleware: RecoveryMiddleware::default(),
            recovery_action: None,
            clock: Arc::new(SystemClock),
            reachability: None,
            cache: None,
            observer: None,
        }
    }
}

impl DispatcherBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport_arc(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn transport<T>(self, transport: T) -> Self
    where
        T: Transport + 'static,
    {
        self.transport_arc(Arc::new(transport))
    }

    pub fn config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.config.base_url = Some(base_url.into());
        self
    }

    pub fn middleware(mut self, middleware: RecoveryMiddleware) -> Self {
        self.middleware = middleware;
        self
    }

    pub fn recovery_action_arc(mut self, action: Arc<dyn RecoveryAction>) -> Self {
        self.recovery_action = Some(action);
        self
    }

    pub fn recovery_action<A>(self, action: A) -> Self
    where
        A: RecoveryAction + 'static,
    {
        self.recovery_action_arc(Arc::new(action))
    }

    /// Time source for the duplicate window.
    pub fn clock_arc(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn clock<C>(self, clock: C) -> Self
    where
        C: Clock + 'static,
    {
        self.clock_arc(Arc::new(clock))
    }

    pub fn reachability_arc(mut self, reachability: Arc<dyn ReachabilityProbe>) -> Self {
        self.reachability = Some(reachability);
        self
    }

    pub fn reachability<R>(self, reachability: R) -> Self
    where
        R: ReachabilityProbe + 'static,
    {
        self.reachability_arc(Arc::new(reachability))
    }

    pub fn cache_arc(mut self, cache: Arc<dyn ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn cache<C>(self, cache: C) -> Self
    where
        C: ResponseCache + 'static,
    {
        self.cache_arc(Arc::new(cache))
    }

    pub fn observer_arc(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn observer<O>(self, observer: O) -> Self
    where
        O: Observer + 'static,
    {
        self.observer_arc(Arc::new(observer))
    }

    pub fn build(self) -> crate::Result<Dispatcher> {
        if let Some(base_url) = &self.config.base_url {
            validate_base_url(base_url)?;
        }
        let transport = match self.transport {
            Some(transport) => transport,
            None => default_transport()?,
        };
        let suppressor = DuplicateSuppressor::new(
            self.config.dedup_window,
            self.config.sweep_interval,
            Arc::clone(&self.clock),
        );

        Ok(Dispatcher {
            inner: Arc::new(DispatcherInner {
                transport,
                config: self.config,
                middleware: self.middleware,
                recovery_action: self.recovery_action,
                reachability: self.reachability,
                cache: self.cache,
                observer: self.observer,
                suppressor,
                coordinator: RefreshCoordinator::default(),
                metrics: DispatcherMetrics::default(),
            }),
        })
    }
}

#[cfg(feature = "tls-rustls-ring")]
fn default_transport() -> crate::Result<Arc<dyn Transport>> {
    Ok(Arc::new(crate::transport::HyperTransport::new()?))
}

#[cfg(all(feature = "hyper-transport", not(feature = "tls-rustls-ring")))]
fn default_transport() -> crate::Result<Arc<dyn Transport>> {
    Ok(Arc::new(crate::transport::HyperTransport::plain()))
}

#[cfg(not(feature = "hyper-transport"))]
fn default_transport() -> crate::Result<Arc<dyn Transport>> {
    Err(Error::TransportInit {
        message: "no transport configured".to_owned(),
    })
}

struct DispatcherInner {
    transport: Arc<dyn Transport>,
    config: DispatcherConfig,
    middleware: RecoveryMiddleware,
    recovery_action: Option<Arc<dyn RecoveryAction>>,
    reachability: Option<Arc<dyn ReachabilityProbe>>,
    cache: Option<Arc<dyn ResponseCache>>,
    observer: Option<Arc<dyn Observer>>,
    suppressor: DuplicateSuppressor,
    coordinator: RefreshCoordinator,
    metrics: DispatcherMetrics,
}

/// Issues requests through the transport with duplicate suppression,
/// envelope-aware classification and single-flight credential recovery.
///
/// Cloning is cheap; clones share all state.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Dispatcher")
            .field("config", &self.inner.config)
            .field("middleware", &self.inner.middleware)
            .field("recovery_action", &self.inner.recovery_action.is_some())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::new()
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    /// Describes a request against the configured base URL. Absolute
    /// `http(s)` URLs are used as given.
    pub fn request(&self, method: Method, path: &str) -> crate::Result<RequestDescriptor> {
        let url = resolve_url(self.inner.config.base_url.as_deref(), path)?;
        Ok(RequestDescriptor::from_url(method, url))
    }

    pub fn get(&self, path: &str) -> crate::Result<RequestDescriptor> {
        self.request(Method::GET, path)
    }

    pub fn post(&self, path: &str) -> crate::Result<RequestDescriptor> {
        self.request(Method::POST, path)
    }

    pub fn put(&self, path: &str) -> crate::Result<RequestDescriptor> {
        self.request(Method::PUT, path)
    }

    pub fn delete(&self, path: &str) -> crate::Result<RequestDescriptor> {
        self.request(Method::DELETE, path)
    }

    /// Sends `request` and resolves once it reaches a terminal outcome. A
    /// deferred request resolves with the result of its replay.
    pub async fn dispatch(&self, request: RequestDescriptor) -> crate::Result<Response> {
        self.execute(request, 0).await
    }

    /// [`dispatch`](Self::dispatch) followed by an envelope decode with the
    /// configured format.
    pub async fn dispatch_envelope<T>(&self, request: RequestDescriptor) -> crate::Result<T>
    where
        T: DeserializeOwned,
    {
        let response = self.dispatch(request).await?;
        self.inner.config.envelope.decode(response.body())
    }

    /// Offers the last cached body for the request's cache key to `on_cached`
    /// before the live dispatch, and stores the live body when it is a
    /// success. The cached body is never returned as the result.
    pub async fn dispatch_with_cache<F>(
        &self,
        request: RequestDescriptor,
        on_cached: F,
    ) -> crate::Result<Response>
    where
        F: FnOnce(Bytes),
    {
        let cache_slot = match (&self.inner.cache, request.configured_cache_key()) {
            (Some(cache), Some(key)) => Some((Arc::clone(cache), key.to_owned())),
            _ => None,
        };
        if let Some((cache, key)) = &cache_slot
            && let Some(body) = cache.read(key)
        {
            debug!(cache_key = %key, "offering cached response body");
            on_cached(body);
        }

        let result = self.dispatch(request).await;
        if let (Some((cache, key)), Ok(response)) = (&cache_slot, &result)
            && self
                .inner
                .config
                .envelope
                .probe(response.body())
                .is_none_or(|probe| probe.is_success())
        {
            cache.save(key, response.body().clone());
        }
        result
    }

    /// Spawns the dispatch and hands its result to `callback`.
    pub fn dispatch_callback<F>(&self, request: RequestDescriptor, callback: F) -> JoinHandle<()>
    where
        F: FnOnce(crate::Result<Response>) + Send + 'static,
    {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            callback(dispatcher.dispatch(request).await);
        })
    }

    pub fn metrics_snapshot(&self) -> DispatcherMetricsSnapshot {
        self.inner.metrics.snapshot(
            self.inner.suppressor.len(),
            self.inner.coordinator.waiting(),
        )
    }

    fn execute(&self, request: RequestDescriptor, deferrals: usize) -> DispatchFuture {
        let dispatcher = self.clone();
        Box::pin(async move {
            let span = info_span!(
                "reqflight.dispatch",
                method = %request.method(),
                uri = %request.redacted_uri(),
                deferrals = deferrals
            );
            dispatcher.attempt(request, deferrals).instrument(span).await
        })
    }

    async fn attempt(&self, request: RequestDescriptor, deferrals: usize) -> crate::Result<Response> {
        let started = Instant::now();
        self.inner.metrics.record_attempt_started(deferrals);
        if let Some(observer) = &self.inner.observer {
            observer.on_dispatch_start(&request, deferrals);
        }

        let result = match self.exchange(&request, deferrals).await {
            Outcome::Settled(result) => result,
            Outcome::Defer => match self.park(request, deferrals).await {
                Parked::Settled(result) => result,
                Parked::Replayed(result) => return result,
            },
        };
        self.inner
            .metrics
            .record_attempt_completed(&result, started.elapsed());
        result
    }

    async fn exchange(&self, request: &RequestDescriptor, deferrals: usize) -> Outcome {
        let inner = &self.inner;
        if request.is_cancelled() {
            debug!("request cancelled before send");
            return Outcome::Settled(Err(cancelled(request)));
        }
        let transport_request = match self.transport_request(request) {
            Ok(transport_request) => transport_request,
            Err(error) => return Outcome::Settled(Err(error)),
        };

        if let Some(reachability) = &inner.reachability
            && !reachability.is_reachable(request.host())
        {
            debug!(host = request.host(), "host unreachable, request not sent");
            return Outcome::Settled(Err(Error::NetworkUnreachable {
                method: request.method().clone(),
                uri: request.redacted_uri(),
                message: format!("host {} is not reachable", request.host()),
            }));
        }

        let admission = if request.is_dedup_skipped() {
            None
        } else {
            match inner.suppressor.try_admit(request.fingerprint(), request) {
                Some(admission) => Some(admission),
                None => {
                    debug!("duplicate request rejected");
                    if let Some(observer) = &inner.observer {
                        observer.on_duplicate_rejected(request);
                    }
                    return Outcome::Settled(Err(Error::DuplicateRequest {
                        method: request.method().clone(),
                        uri: request.redacted_uri(),
                    }));
                }
            }
        };

        let in_flight = inner.metrics.enter_in_flight();
        debug!("sending request");
        let send = inner.transport.send(transport_request);
        let exchange = match request.cancellation() {
            Some(token) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(TransportError::Cancelled),
                    result = send => result,
                }
            }
            None => send.await,
        };
        drop(in_flight);
        drop(admission);

        let response = match exchange {
            Ok(response) => response,
            Err(error) => return Outcome::Settled(Err(map_transport_error(request, error))),
        };
        let (status, headers, body) = response.into_parts();
        debug!(status = status.as_u16(), "exchange completed");

        let context = RecoveryContext::new(request, deferrals);
        match inner
            .middleware
            .classify(&context, status, &body, &inner.config.envelope)
        {
            RecoveryDecision::Proceed => Outcome::Settled(Ok(Response::new(status, headers, body))),
            RecoveryDecision::Fail(FailReason::HttpStatus) => {
                Outcome::Settled(Err(Error::HttpStatus {
                    status: status.as_u16(),
                    method: request.method().clone(),
                    uri: request.redacted_uri(),
                    body: truncate_body(&body),
                }))
            }
            RecoveryDecision::Fail(FailReason::Domain { code, message }) => {
                Outcome::Settled(Err(Error::Domain { code, message }))
            }
            RecoveryDecision::Fail(FailReason::Cancelled) => {
                Outcome::Settled(Err(cancelled(request)))
            }
            RecoveryDecision::Defer => Outcome::Defer,
        }
    }

    /// Hands a deferred request to the coordinator and waits for its replay.
    async fn park(&self, request: RequestDescriptor, deferrals: usize) -> Parked {
        let inner = &self.inner;
        if deferrals >= inner.config.max_deferrals {
            warn!(
                limit = inner.config.max_deferrals,
                "deferral limit exceeded, failing request"
            );
            return Parked::Settled(Err(Error::DeferralLimitExceeded {
                limit: inner.config.max_deferrals,
                method: request.method().clone(),
                uri: request.redacted_uri(),
            }));
        }
        let Some(action) = inner.recovery_action.clone() else {
            warn!("request deferred without a recovery action");
            return Parked::Settled(Err(Error::RecoveryNotConfigured {
                method: request.method().clone(),
                uri: request.redacted_uri(),
            }));
        };

        inner.metrics.record_deferred();
        if let Some(observer) = &inner.observer {
            observer.on_deferred(&request, deferrals);
        }
        debug!("request deferred until credential recovery completes");

        let method = request.method().clone();
        let uri = request.redacted_uri();
        let cancellation = request.cancellation().cloned();
        let (reply, receiver) = oneshot::channel();
        let starts_recovery = inner.coordinator.defer(Waiter {
            request,
            deferrals: deferrals + 1,
            reply,
        });
        if starts_recovery {
            self.spawn_recovery(action);
        }

        let replayed = match cancellation {
            Some(token) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => None,
                    replayed = receiver => Some(replayed),
                }
            }
            None => Some(receiver.await),
        };
        match replayed {
            Some(Ok(result)) => Parked::Replayed(result),
            Some(Err(_)) => Parked::Settled(Err(Error::RecoveryFailed {
                message: "recovery ended without settling the request".to_owned(),
            })),
            None => {
                debug!("deferred request cancelled");
                Parked::Settled(Err(Error::Cancelled { method, uri }))
            }
        }
    }

    fn spawn_recovery(&self, action: Arc<dyn RecoveryAction>) {
        let inner = &self.inner;
        inner.metrics.record_recovery_started();
        if let Some(observer) = &inner.observer {
            observer.on_recovery_started();
        }
        info!("starting credential recovery");

        let dispatcher = self.clone();
        let task = async move {
            let replayer = dispatcher.clone();
            let outcome = dispatcher
                .inner
                .coordinator
                .run(action.as_ref(), move |request, deferrals| {
                    replayer.execute(request, deferrals)
                })
                .await;
            let succeeded = match outcome {
                Ok(()) => {
                    info!("credential recovery finished");
                    true
                }
                Err(message) => {
                    warn!(error = %message, "credential recovery failed");
                    dispatcher.inner.metrics.record_recovery_failed();
                    false
                }
            };
            if let Some(observer) = &dispatcher.inner.observer {
                observer.on_recovery_finished(succeeded);
            }
        };
        tokio::spawn(task.instrument(info_span!("reqflight.recovery")));
    }

    fn transport_request(&self, request: &RequestDescriptor) -> crate::Result<TransportRequest> {
        Ok(TransportRequest {
            method: request.method().clone(),
            uri: request.uri_with_query()?,
            headers: request.headers().clone(),
            body: request.body_bytes().clone(),
            timeout: request
                .configured_timeout()
                .unwrap_or(self.inner.config.default_timeout),
            progress: request.progress().clone(),
        })
    }
}

fn cancelled(request: &RequestDescriptor) -> Error {
    Error::Cancelled {
        method: request.method().clone(),
        uri: request.redacted_uri(),
    }
}

fn map_transport_error(request: &RequestDescriptor, error: TransportError) -> Error {
    let method = request.method().clone();
    let uri = request.redacted_uri();
    match error {
        TransportError::Cancelled => {
            debug!("request cancelled in flight");
            Error::Cancelled { method, uri }
        }
        TransportError::NetworkUnreachable { message } => {
            warn!(error = %message, "network unreachable");
            Error::NetworkUnreachable {
                method,
                uri,
                message,
            }
        }
        TransportError::Timeout { timeout_ms } => {
            warn!(timeout_ms = timeout_ms as u64, "request timed out");
            Error::Timeout {
                timeout_ms,
                method,
                uri,
            }
        }
        TransportError::Other { kind, source } => {
            warn!(kind = %kind, error = %source, "transport error");
            Error::Transport {
                kind,
                method,
                uri,
                source,
            }
        }
    }
}
