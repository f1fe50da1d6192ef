use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use reqflight::{
    BoxError, CancellationScope, Clock, DeferOnCodes, DeferOnStatus, Dispatcher,
    DispatcherConfig, Error, ErrorCode, ManualReachability, MemoryResponseCache, Observer,
    RecoveryFuture, RecoveryMiddleware, Transport, TransportError, TransportFuture,
    TransportRequest, TransportResponse,
};
use serde::Deserialize;
use tokio::sync::{Notify, oneshot};

const OK_EMPTY: &str = r#"{"status":"C0000"}"#;
const OK_PROFILE: &str = r#"{"status":"C0000","result":{"nickname":"kite"}}"#;
const EXPIRED: &str = r#"{"status":"E0001","message":"token expired"}"#;
const BASE_URL: &str = "https://api.example.com";

#[derive(Clone)]
enum Step {
    Reply(u16, &'static str),
    Hold(Arc<Notify>, u16, &'static str),
    Progress(Vec<f64>, u16, &'static str),
    Hang,
}

#[derive(Clone, Default)]
struct ScriptedTransport {
    calls: Arc<Mutex<Vec<String>>>,
    routes: Arc<Mutex<HashMap<String, VecDeque<Step>>>>,
}

impl ScriptedTransport {
    fn script(&self, path: &str, steps: impl IntoIterator<Item = Step>) {
        self.routes
            .lock()
            .expect("routes lock")
            .entry(path.to_owned())
            .or_default()
            .extend(steps);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }

    fn call_count(&self) -> usize {
        self.calls.lock().expect("calls lock").len()
    }
}

fn response(status: u16, body: &'static str) -> TransportResponse {
    TransportResponse::new(
        StatusCode::from_u16(status).expect("valid status"),
        HeaderMap::new(),
        Bytes::from_static(body.as_bytes()),
    )
}

impl Transport for ScriptedTransport {
    fn send(&self, request: TransportRequest) -> TransportFuture {
        let path = request.uri().path().to_owned();
        self.calls.lock().expect("calls lock").push(path.clone());
        let step = self
            .routes
            .lock()
            .expect("routes lock")
            .get_mut(&path)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Step::Reply(200, OK_EMPTY));

        match step {
            Step::Reply(status, body) => {
                Box::pin(async move { Ok::<_, TransportError>(response(status, body)) })
            }
            Step::Hold(gate, status, body) => Box::pin(async move {
                gate.notified().await;
                Ok::<_, TransportError>(response(status, body))
            }),
            Step::Progress(fractions, status, body) => {
                for fraction in fractions {
                    request.progress().report(fraction);
                }
                Box::pin(async move { Ok::<_, TransportError>(response(status, body)) })
            }
            Step::Hang => Box::pin(async {
                std::future::pending::<()>().await;
                Ok::<_, TransportError>(response(200, OK_EMPTY))
            }),
        }
    }
}

#[derive(Debug)]
struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(Instant::now()),
        })
    }

    fn advance(&self, by: Duration) {
        *self.now.lock().expect("clock lock") += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().expect("clock lock")
    }
}

#[derive(Clone)]
struct GatedRecovery {
    gate: Arc<Notify>,
    runs: Arc<AtomicUsize>,
}

impl GatedRecovery {
    fn new() -> Self {
        Self {
            gate: Arc::new(Notify::new()),
            runs: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn open(&self) {
        self.gate.notify_one();
    }

    fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    fn action(
        &self,
        outcome: Result<(), &'static str>,
    ) -> impl Fn() -> RecoveryFuture + Send + Sync + 'static {
        let gate = Arc::clone(&self.gate);
        let runs = Arc::clone(&self.runs);
        move || -> RecoveryFuture {
            let gate = Arc::clone(&gate);
            let runs = Arc::clone(&runs);
            Box::pin(async move {
                runs.fetch_add(1, Ordering::SeqCst);
                gate.notified().await;
                outcome.map_err(BoxError::from)
            })
        }
    }
}

fn expired_middleware() -> RecoveryMiddleware {
    RecoveryMiddleware::new().envelope_handler(DeferOnCodes::new(["E0001"]))
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition reached in time");
}

#[derive(Debug, Deserialize, PartialEq)]
struct Profile {
    nickname: String,
}

#[tokio::test]
async fn duplicate_inside_window_is_rejected_and_later_dispatch_is_sent() {
    let transport = ScriptedTransport::default();
    let gate = Arc::new(Notify::new());
    transport.script("/v1/orders", [Step::Hold(Arc::clone(&gate), 200, OK_EMPTY)]);
    let clock = ManualClock::new();
    let dispatcher = Dispatcher::builder()
        .transport(transport.clone())
        .base_url(BASE_URL)
        .clock_arc(clock.clone())
        .build()
        .expect("dispatcher");

    let first = {
        let dispatcher = dispatcher.clone();
        let request = dispatcher.get("/v1/orders").expect("descriptor");
        tokio::spawn(async move { dispatcher.dispatch(request).await })
    };
    wait_until(|| transport.call_count() == 1).await;

    clock.advance(Duration::from_millis(100));
    let duplicate = dispatcher
        .dispatch(dispatcher.get("/v1/orders").expect("descriptor"))
        .await
        .expect_err("duplicate inside the window");
    assert_eq!(duplicate.code(), ErrorCode::DuplicateRequest);
    assert_eq!(transport.call_count(), 1);

    gate.notify_one();
    first.await.expect("join").expect("first completes");

    clock.advance(Duration::from_millis(400));
    dispatcher
        .dispatch(dispatcher.get("/v1/orders").expect("descriptor"))
        .await
        .expect("sent after the window");
    assert_eq!(transport.call_count(), 2);
    assert_eq!(dispatcher.metrics_snapshot().duplicates_rejected, 1);
}

#[tokio::test]
async fn identical_request_after_window_is_sent_even_while_first_hangs() {
    let transport = ScriptedTransport::default();
    transport.script("/v1/poll", [Step::Hang, Step::Reply(200, OK_EMPTY)]);
    let clock = ManualClock::new();
    let dispatcher = Dispatcher::builder()
        .transport(transport.clone())
        .base_url(BASE_URL)
        .clock_arc(clock.clone())
        .build()
        .expect("dispatcher");

    let hung = {
        let dispatcher = dispatcher.clone();
        let request = dispatcher.get("/v1/poll").expect("descriptor");
        tokio::spawn(async move { dispatcher.dispatch(request).await })
    };
    wait_until(|| transport.call_count() == 1).await;

    clock.advance(Duration::from_millis(301));
    dispatcher
        .dispatch(dispatcher.get("/v1/poll").expect("descriptor"))
        .await
        .expect("window elapsed");
    assert_eq!(transport.call_count(), 2);
    hung.abort();
}

#[tokio::test]
async fn skip_dedup_lets_identical_requests_through() {
    let transport = ScriptedTransport::default();
    let gate = Arc::new(Notify::new());
    transport.script("/v1/ticks", [Step::Hold(Arc::clone(&gate), 200, OK_EMPTY)]);
    let dispatcher = Dispatcher::builder()
        .transport(transport.clone())
        .base_url(BASE_URL)
        .clock_arc(ManualClock::new())
        .build()
        .expect("dispatcher");

    let first = {
        let dispatcher = dispatcher.clone();
        let request = dispatcher.get("/v1/ticks").expect("descriptor").skip_dedup();
        tokio::spawn(async move { dispatcher.dispatch(request).await })
    };
    wait_until(|| transport.call_count() == 1).await;

    let request = dispatcher.get("/v1/ticks").expect("descriptor").skip_dedup();
    dispatcher.dispatch(request).await.expect("not suppressed");
    gate.notify_one();
    first.await.expect("join").expect("first completes");
    assert_eq!(transport.call_count(), 2);
}

#[tokio::test]
async fn unclaimed_error_status_fails_immediately() {
    let transport = ScriptedTransport::default();
    transport.script("/v1/missing", [Step::Reply(404, "not found")]);
    let recovery = GatedRecovery::new();
    let dispatcher = Dispatcher::builder()
        .transport(transport.clone())
        .base_url(BASE_URL)
        .middleware(expired_middleware())
        .recovery_action(recovery.action(Ok(())))
        .build()
        .expect("dispatcher");

    let error = dispatcher
        .dispatch(dispatcher.get("/v1/missing").expect("descriptor"))
        .await
        .expect_err("404");
    match error {
        Error::HttpStatus { status, body, .. } => {
            assert_eq!(status, 404);
            assert_eq!(body, "not found");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(transport.call_count(), 1);
    assert_eq!(recovery.runs(), 0);
    assert_eq!(dispatcher.metrics_snapshot().deferred, 0);
}

#[tokio::test]
async fn expired_token_is_recovered_once_and_both_callers_see_success() {
    let transport = ScriptedTransport::default();
    transport.script(
        "/v1/profile",
        [Step::Reply(200, EXPIRED), Step::Reply(200, OK_PROFILE)],
    );
    transport.script(
        "/v1/orders",
        [Step::Reply(200, EXPIRED), Step::Reply(200, OK_EMPTY)],
    );
    let recovery = GatedRecovery::new();
    let dispatcher = Dispatcher::builder()
        .transport(transport.clone())
        .base_url(BASE_URL)
        .middleware(expired_middleware())
        .recovery_action(recovery.action(Ok(())))
        .build()
        .expect("dispatcher");

    let profile = {
        let dispatcher = dispatcher.clone();
        let request = dispatcher.get("/v1/profile").expect("descriptor");
        tokio::spawn(async move { dispatcher.dispatch_envelope::<Profile>(request).await })
    };
    wait_until(|| dispatcher.metrics_snapshot().deferred == 1).await;
    let orders = {
        let dispatcher = dispatcher.clone();
        let request = dispatcher.get("/v1/orders").expect("descriptor");
        tokio::spawn(async move { dispatcher.dispatch(request).await })
    };
    wait_until(|| dispatcher.metrics_snapshot().deferred == 2).await;

    assert_eq!(recovery.runs(), 1);
    assert!(!profile.is_finished());
    assert!(!orders.is_finished());
    assert_eq!(dispatcher.metrics_snapshot().waiting_for_recovery, 2);

    recovery.open();
    let profile = profile.await.expect("join").expect("replayed profile");
    assert_eq!(
        profile,
        Profile {
            nickname: "kite".to_owned()
        }
    );
    let orders = orders.await.expect("join").expect("replayed orders");
    assert_eq!(orders.status(), StatusCode::OK);

    let snapshot = dispatcher.metrics_snapshot();
    assert_eq!(recovery.runs(), 1);
    assert_eq!(snapshot.recoveries_started, 1);
    assert_eq!(snapshot.replays, 2);
    assert_eq!(snapshot.requests_succeeded, 2);
    assert_eq!(snapshot.requests_failed, 0);
    assert_eq!(snapshot.pending_requests, 0);
    assert_eq!(transport.call_count(), 4);
}

#[tokio::test]
async fn deferred_requests_are_replayed_in_enqueue_order() {
    let transport = ScriptedTransport::default();
    for path in ["/w1", "/w2", "/w3"] {
        transport.script(path, [Step::Reply(200, EXPIRED), Step::Reply(200, OK_EMPTY)]);
    }
    let recovery = GatedRecovery::new();
    let dispatcher = Dispatcher::builder()
        .transport(transport.clone())
        .base_url(BASE_URL)
        .middleware(expired_middleware())
        .recovery_action(recovery.action(Ok(())))
        .build()
        .expect("dispatcher");

    let mut handles = Vec::new();
    for (index, path) in ["/w1", "/w2", "/w3"].into_iter().enumerate() {
        let dispatcher_for_task = dispatcher.clone();
        let request = dispatcher.get(path).expect("descriptor");
        handles.push(tokio::spawn(async move {
            dispatcher_for_task.dispatch(request).await
        }));
        wait_until(|| dispatcher.metrics_snapshot().deferred == index as u64 + 1).await;
    }

    recovery.open();
    for handle in handles {
        handle.await.expect("join").expect("replayed");
    }
    assert_eq!(
        transport.calls(),
        ["/w1", "/w2", "/w3", "/w1", "/w2", "/w3"]
    );
    assert_eq!(recovery.runs(), 1);
}

#[tokio::test]
async fn failed_recovery_reaches_every_waiter_without_replay() {
    let transport = ScriptedTransport::default();
    transport.script("/v1/a", [Step::Reply(200, EXPIRED)]);
    transport.script("/v1/b", [Step::Reply(200, EXPIRED)]);
    let recovery = GatedRecovery::new();
    let dispatcher = Dispatcher::builder()
        .transport(transport.clone())
        .base_url(BASE_URL)
        .middleware(expired_middleware())
        .recovery_action(recovery.action(Err("refresh token revoked")))
        .build()
        .expect("dispatcher");

    let mut handles = Vec::new();
    for (index, path) in ["/v1/a", "/v1/b"].into_iter().enumerate() {
        let dispatcher_for_task = dispatcher.clone();
        let request = dispatcher.get(path).expect("descriptor");
        handles.push(tokio::spawn(async move {
            dispatcher_for_task.dispatch(request).await
        }));
        wait_until(|| dispatcher.metrics_snapshot().deferred == index as u64 + 1).await;
    }

    recovery.open();
    for handle in handles {
        match handle.await.expect("join") {
            Err(Error::RecoveryFailed { message }) => {
                assert_eq!(message, "refresh token revoked");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
    assert_eq!(transport.call_count(), 2);
    wait_until(|| dispatcher.metrics_snapshot().recoveries_failed == 1).await;
}

#[tokio::test]
async fn replay_that_defers_again_hits_the_deferral_limit() {
    let transport = ScriptedTransport::default();
    transport.script(
        "/v1/profile",
        [Step::Reply(200, EXPIRED), Step::Reply(200, EXPIRED)],
    );
    let recovery = GatedRecovery::new();
    recovery.open();
    let dispatcher = Dispatcher::builder()
        .transport(transport.clone())
        .base_url(BASE_URL)
        .middleware(expired_middleware())
        .recovery_action(recovery.action(Ok(())))
        .build()
        .expect("dispatcher");

    let error = dispatcher
        .dispatch(dispatcher.get("/v1/profile").expect("descriptor"))
        .await
        .expect_err("still expired after recovery");
    assert_eq!(error.code(), ErrorCode::DeferralLimitExceeded);
    assert_eq!(recovery.runs(), 1);
    assert_eq!(transport.call_count(), 2);
}

#[tokio::test]
async fn higher_deferral_limit_allows_a_second_recovery() {
    let transport = ScriptedTransport::default();
    transport.script(
        "/v1/profile",
        [
            Step::Reply(200, EXPIRED),
            Step::Reply(200, EXPIRED),
            Step::Reply(200, OK_PROFILE),
        ],
    );
    let recovery = GatedRecovery::new();
    let dispatcher = Dispatcher::builder()
        .transport(transport.clone())
        .config(
            DispatcherConfig::default()
                .with_base_url(BASE_URL)
                .with_max_deferrals(2),
        )
        .middleware(expired_middleware())
        .recovery_action(recovery.action(Ok(())))
        .build()
        .expect("dispatcher");

    let handle = {
        let dispatcher = dispatcher.clone();
        let request = dispatcher.get("/v1/profile").expect("descriptor");
        tokio::spawn(async move { dispatcher.dispatch_envelope::<Profile>(request).await })
    };
    wait_until(|| recovery.runs() == 1).await;
    recovery.open();
    wait_until(|| recovery.runs() == 2).await;
    recovery.open();

    let profile = handle.await.expect("join").expect("third attempt succeeds");
    assert_eq!(profile.nickname, "kite");
    assert_eq!(transport.call_count(), 3);
}

#[tokio::test]
async fn recovery_exempt_request_surfaces_the_domain_error() {
    let transport = ScriptedTransport::default();
    transport.script("/v1/token/refresh", [Step::Reply(200, EXPIRED)]);
    let recovery = GatedRecovery::new();
    let dispatcher = Dispatcher::builder()
        .transport(transport.clone())
        .base_url(BASE_URL)
        .middleware(expired_middleware())
        .recovery_action(recovery.action(Ok(())))
        .build()
        .expect("dispatcher");

    let request = dispatcher
        .post("/v1/token/refresh")
        .expect("descriptor")
        .recovery_exempt();
    let error = dispatcher.dispatch(request).await.expect_err("not deferred");
    assert_eq!(error.domain_code(), Some("E0001"));
    assert_eq!(error.to_string(), "domain error E0001: token expired");
    assert_eq!(recovery.runs(), 0);
}

#[tokio::test]
async fn deferral_without_recovery_action_is_an_error() {
    let transport = ScriptedTransport::default();
    transport.script("/v1/me", [Step::Reply(401, "")]);
    let dispatcher = Dispatcher::builder()
        .transport(transport.clone())
        .base_url(BASE_URL)
        .middleware(
            RecoveryMiddleware::new().watch_statuses([StatusCode::UNAUTHORIZED], DeferOnStatus),
        )
        .build()
        .expect("dispatcher");

    let error = dispatcher
        .dispatch(dispatcher.get("/v1/me").expect("descriptor"))
        .await
        .expect_err("no recovery action");
    assert_eq!(error.code(), ErrorCode::RecoveryNotConfigured);
}

#[tokio::test]
async fn cancelling_in_flight_request_releases_its_entry() {
    let transport = ScriptedTransport::default();
    transport.script("/v1/feed", [Step::Hang, Step::Reply(200, OK_EMPTY)]);
    let dispatcher = Dispatcher::builder()
        .transport(transport.clone())
        .base_url(BASE_URL)
        .clock_arc(ManualClock::new())
        .build()
        .expect("dispatcher");

    let scope = CancellationScope::new();
    let handle = {
        let dispatcher = dispatcher.clone();
        let request = dispatcher.get("/v1/feed").expect("descriptor").cancel_with(&scope);
        tokio::spawn(async move { dispatcher.dispatch(request).await })
    };
    wait_until(|| transport.call_count() == 1).await;
    scope.cancel();

    let error = handle.await.expect("join").expect_err("cancelled");
    assert_eq!(error.code(), ErrorCode::Cancelled);
    assert_eq!(dispatcher.metrics_snapshot().pending_requests, 0);

    dispatcher
        .dispatch(dispatcher.get("/v1/feed").expect("descriptor"))
        .await
        .expect("fresh admission after cancel");
    assert_eq!(dispatcher.metrics_snapshot().cancelled, 1);
}

#[tokio::test]
async fn already_cancelled_request_never_reaches_transport() {
    let transport = ScriptedTransport::default();
    let dispatcher = Dispatcher::builder()
        .transport(transport.clone())
        .base_url(BASE_URL)
        .build()
        .expect("dispatcher");

    let scope = CancellationScope::new();
    scope.cancel();
    let request = dispatcher.get("/v1/feed").expect("descriptor").cancel_with(&scope);
    let error = dispatcher.dispatch(request).await.expect_err("cancelled");
    assert_eq!(error.code(), ErrorCode::Cancelled);
    assert_eq!(transport.call_count(), 0);
}

#[tokio::test]
async fn cancelling_a_deferred_request_skips_its_replay() {
    let transport = ScriptedTransport::default();
    transport.script("/v1/profile", [Step::Reply(200, EXPIRED)]);
    let recovery = GatedRecovery::new();
    let dispatcher = Dispatcher::builder()
        .transport(transport.clone())
        .base_url(BASE_URL)
        .middleware(expired_middleware())
        .recovery_action(recovery.action(Ok(())))
        .build()
        .expect("dispatcher");

    let scope = CancellationScope::new();
    let handle = {
        let dispatcher = dispatcher.clone();
        let request = dispatcher
            .get("/v1/profile")
            .expect("descriptor")
            .cancel_with(&scope);
        tokio::spawn(async move { dispatcher.dispatch(request).await })
    };
    wait_until(|| dispatcher.metrics_snapshot().deferred == 1).await;
    scope.cancel();

    let error = handle.await.expect("join").expect_err("cancelled while deferred");
    assert_eq!(error.code(), ErrorCode::Cancelled);

    recovery.open();
    wait_until(|| dispatcher.metrics_snapshot().waiting_for_recovery == 0).await;
    tokio::task::yield_now().await;
    assert_eq!(transport.call_count(), 1);
}

#[tokio::test]
async fn unreachable_host_short_circuits_before_transport() {
    let transport = ScriptedTransport::default();
    let reachability = Arc::new(ManualReachability::new());
    reachability.set_host_reachable("api.example.com", false);
    let dispatcher = Dispatcher::builder()
        .transport(transport.clone())
        .base_url(BASE_URL)
        .reachability_arc(reachability.clone())
        .build()
        .expect("dispatcher");

    let error = dispatcher
        .dispatch(dispatcher.get("/v1/feed").expect("descriptor"))
        .await
        .expect_err("unreachable");
    assert_eq!(error.code(), ErrorCode::NetworkUnreachable);
    assert_eq!(transport.call_count(), 0);

    reachability.set_host_reachable("api.example.com", true);
    dispatcher
        .dispatch(dispatcher.get("/v1/feed").expect("descriptor"))
        .await
        .expect("reachable again");
}

#[tokio::test]
async fn unreachable_host_wins_over_an_identical_request_in_flight() {
    let transport = ScriptedTransport::default();
    let gate = Arc::new(Notify::new());
    transport.script("/v1/feed", [Step::Hold(Arc::clone(&gate), 200, OK_EMPTY)]);
    let reachability = Arc::new(ManualReachability::new());
    let dispatcher = Dispatcher::builder()
        .transport(transport.clone())
        .base_url(BASE_URL)
        .clock_arc(ManualClock::new())
        .reachability_arc(reachability.clone())
        .build()
        .expect("dispatcher");

    let first = {
        let dispatcher = dispatcher.clone();
        let request = dispatcher.get("/v1/feed").expect("descriptor");
        tokio::spawn(async move { dispatcher.dispatch(request).await })
    };
    wait_until(|| transport.call_count() == 1).await;

    reachability.set_online(false);
    let error = dispatcher
        .dispatch(dispatcher.get("/v1/feed").expect("descriptor"))
        .await
        .expect_err("offline");
    assert_eq!(error.code(), ErrorCode::NetworkUnreachable);
    assert_eq!(dispatcher.metrics_snapshot().duplicates_rejected, 0);
    assert_eq!(dispatcher.metrics_snapshot().pending_requests, 1);

    gate.notify_one();
    first.await.expect("join").expect("first completes");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_identical_dispatches_send_once() {
    const CALLERS: usize = 12;
    let transport = ScriptedTransport::default();
    let gate = Arc::new(Notify::new());
    transport.script("/v1/orders", [Step::Hold(Arc::clone(&gate), 200, OK_EMPTY)]);
    let dispatcher = Dispatcher::builder()
        .transport(transport.clone())
        .base_url(BASE_URL)
        .clock_arc(ManualClock::new())
        .build()
        .expect("dispatcher");

    let start = Arc::new(tokio::sync::Barrier::new(CALLERS));
    let handles: Vec<_> = (0..CALLERS)
        .map(|_| {
            let dispatcher = dispatcher.clone();
            let start = Arc::clone(&start);
            let request = dispatcher.get("/v1/orders").expect("descriptor");
            tokio::spawn(async move {
                start.wait().await;
                dispatcher.dispatch(request).await
            })
        })
        .collect();

    let expected_rejections = CALLERS as u64 - 1;
    wait_until(|| dispatcher.metrics_snapshot().duplicates_rejected == expected_rejections).await;
    assert_eq!(transport.call_count(), 1);
    assert_eq!(dispatcher.metrics_snapshot().pending_requests, 1);
    gate.notify_one();

    let mut sent = 0;
    let mut rejected = 0;
    for handle in handles {
        match handle.await.expect("join") {
            Ok(_) => sent += 1,
            Err(error) => {
                assert_eq!(error.code(), ErrorCode::DuplicateRequest);
                rejected += 1;
            }
        }
    }
    assert_eq!((sent, rejected), (1, CALLERS - 1));
}

#[tokio::test]
async fn panicking_recovery_fails_the_waiter_and_later_recoveries_still_run() {
    let transport = ScriptedTransport::default();
    transport.script(
        "/v1/profile",
        [
            Step::Reply(200, EXPIRED),
            Step::Reply(200, EXPIRED),
            Step::Reply(200, OK_PROFILE),
        ],
    );
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);
    let dispatcher = Dispatcher::builder()
        .transport(transport.clone())
        .base_url(BASE_URL)
        .middleware(expired_middleware())
        .recovery_action(move || -> RecoveryFuture {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if attempt == 0 {
                    panic!("keychain locked");
                }
                Ok::<(), BoxError>(())
            })
        })
        .build()
        .expect("dispatcher");

    let first = tokio::time::timeout(
        Duration::from_secs(5),
        dispatcher.dispatch(dispatcher.get("/v1/profile").expect("descriptor")),
    )
    .await
    .expect("first caller settles");
    match first {
        Err(Error::RecoveryFailed { message }) => assert!(message.contains("keychain locked")),
        other => panic!("unexpected outcome: {other:?}"),
    }

    let request = dispatcher.get("/v1/profile").expect("descriptor");
    let second = tokio::time::timeout(
        Duration::from_secs(5),
        dispatcher.dispatch_envelope::<Profile>(request),
    )
    .await
    .expect("second caller settles")
    .expect("recovered on the second attempt");
    assert_eq!(second.nickname, "kite");
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    wait_until(|| dispatcher.metrics_snapshot().recoveries_failed == 1).await;
}

#[tokio::test]
async fn cached_body_is_offered_before_the_live_response() {
    const FIRST: &str = r#"{"status":"C0000","result":{"nickname":"first"}}"#;
    const SECOND: &str = r#"{"status":"C0000","result":{"nickname":"second"}}"#;
    let transport = ScriptedTransport::default();
    transport.script(
        "/v1/profile",
        [Step::Reply(200, FIRST), Step::Reply(200, SECOND)],
    );
    let dispatcher = Dispatcher::builder()
        .transport(transport.clone())
        .base_url(BASE_URL)
        .cache(MemoryResponseCache::new(8))
        .build()
        .expect("dispatcher");

    let offered = Arc::new(Mutex::new(Vec::new()));
    for expected in [FIRST, SECOND] {
        let sink = Arc::clone(&offered);
        let request = dispatcher
            .get("/v1/profile")
            .expect("descriptor")
            .cache_key("profile");
        let response = dispatcher
            .dispatch_with_cache(request, move |body| {
                sink.lock().expect("offered lock").push(body);
            })
            .await
            .expect("live response");
        assert_eq!(response.body().as_ref(), expected.as_bytes());
    }

    let offered = offered.lock().expect("offered lock").clone();
    assert_eq!(offered, vec![Bytes::from_static(FIRST.as_bytes())]);
}

#[tokio::test]
async fn progress_stays_monotonic_across_a_replay() {
    let transport = ScriptedTransport::default();
    transport.script(
        "/v1/export",
        [
            Step::Progress(vec![0.2, 0.6], 200, EXPIRED),
            Step::Progress(vec![0.1, 0.5, 0.9, 1.0], 200, OK_EMPTY),
        ],
    );
    let recovery = GatedRecovery::new();
    recovery.open();
    let dispatcher = Dispatcher::builder()
        .transport(transport.clone())
        .base_url(BASE_URL)
        .middleware(expired_middleware())
        .recovery_action(recovery.action(Ok(())))
        .build()
        .expect("dispatcher");

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let request = dispatcher
        .get("/v1/export")
        .expect("descriptor")
        .on_progress(move |fraction| sink.lock().expect("progress lock").push(fraction));
    dispatcher.dispatch(request).await.expect("replayed");

    assert_eq!(
        seen.lock().expect("progress lock").as_slice(),
        [0.2, 0.6, 0.9, 1.0]
    );
}

#[tokio::test]
async fn dispatch_envelope_surfaces_unwatched_domain_failures() {
    let transport = ScriptedTransport::default();
    transport.script(
        "/v1/orders",
        [Step::Reply(200, r#"{"status":"B2001","message":"order closed"}"#)],
    );
    transport.script("/v1/ping", [Step::Reply(200, OK_EMPTY)]);
    let dispatcher = Dispatcher::builder()
        .transport(transport.clone())
        .base_url(BASE_URL)
        .middleware(expired_middleware())
        .build()
        .expect("dispatcher");

    let error = dispatcher
        .dispatch_envelope::<Profile>(dispatcher.get("/v1/orders").expect("descriptor"))
        .await
        .expect_err("domain failure");
    assert_eq!(error.domain_code(), Some("B2001"));

    let missing = dispatcher
        .dispatch_envelope::<Profile>(dispatcher.get("/v1/ping").expect("descriptor"))
        .await
        .expect_err("missing result");
    assert_eq!(missing.domain_code(), Some("KF1000"));
}

#[derive(Default)]
struct CountingObserver {
    started: AtomicUsize,
    deferred: AtomicUsize,
    recoveries: AtomicUsize,
    finished_ok: AtomicUsize,
}

impl Observer for CountingObserver {
    fn on_dispatch_start(&self, _request: &reqflight::RequestDescriptor, _deferrals: usize) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn on_deferred(&self, _request: &reqflight::RequestDescriptor, _deferrals: usize) {
        self.deferred.fetch_add(1, Ordering::SeqCst);
    }

    fn on_recovery_started(&self) {
        self.recoveries.fetch_add(1, Ordering::SeqCst);
    }

    fn on_recovery_finished(&self, succeeded: bool) {
        if succeeded {
            self.finished_ok.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[tokio::test]
async fn observer_and_callback_adapter_see_the_lifecycle() {
    let transport = ScriptedTransport::default();
    transport.script(
        "/v1/profile",
        [Step::Reply(200, EXPIRED), Step::Reply(200, OK_PROFILE)],
    );
    let recovery = GatedRecovery::new();
    recovery.open();
    let observer = Arc::new(CountingObserver::default());
    let dispatcher = Dispatcher::builder()
        .transport(transport.clone())
        .base_url(BASE_URL)
        .middleware(expired_middleware())
        .recovery_action(recovery.action(Ok(())))
        .observer_arc(observer.clone())
        .build()
        .expect("dispatcher");

    let (sender, receiver) = oneshot::channel();
    let handle = dispatcher.dispatch_callback(
        dispatcher.get("/v1/profile").expect("descriptor"),
        move |result| {
            let _ = sender.send(result);
        },
    );
    let response = receiver.await.expect("callback").expect("replayed");
    handle.await.expect("callback task");
    assert_eq!(response.text_lossy(), OK_PROFILE);

    wait_until(|| observer.finished_ok.load(Ordering::SeqCst) == 1).await;
    assert_eq!(observer.started.load(Ordering::SeqCst), 2);
    assert_eq!(observer.deferred.load(Ordering::SeqCst), 1);
    assert_eq!(observer.recoveries.load(Ordering::SeqCst), 1);
}
