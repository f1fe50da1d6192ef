use std::any::Any;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Mutex;

use futures_util::FutureExt;
use futures_util::future::join_all;
use tokio::sync::oneshot;

use crate::error::{BoxError, Error};
use crate::request::RequestDescriptor;
use crate::response::Response;
use crate::util::lock_unpoisoned;

pub type RecoveryFuture = Pin<Box<dyn Future<Output = Result<(), BoxError>> + Send>>;

/// The asynchronous action that restores credentials, for example a token
/// refresh call. It runs at most once per batch of deferred requests.
pub trait RecoveryAction: Send + Sync {
    fn recover(&self) -> RecoveryFuture;
}

impl<F, Fut> RecoveryAction for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    fn recover(&self) -> RecoveryFuture {
        Box::pin(self())
    }
}

pub(crate) type Reply = oneshot::Sender<crate::Result<Response>>;

/// A deferred request parked until recovery resolves.
#[derive(Debug)]
pub(crate) struct Waiter {
    pub(crate) request: RequestDescriptor,
    pub(crate) deferrals: usize,
    pub(crate) reply: Reply,
}

#[derive(Debug, Default)]
struct RefreshState {
    refreshing: bool,
    waiters: VecDeque<Waiter>,
}

/// Single-flight coordinator: any number of deferrals while a recovery is
/// running join that recovery instead of starting another.
#[derive(Debug, Default)]
pub(crate) struct RefreshCoordinator {
    state: Mutex<RefreshState>,
}

impl RefreshCoordinator {
    /// Enqueues `waiter`. Returns `true` when this call moved the coordinator
    /// from idle to refreshing, in which case the caller must start [`run`].
    ///
    /// [`run`]: RefreshCoordinator::run
    pub(crate) fn defer(&self, waiter: Waiter) -> bool {
        let mut state = lock_unpoisoned(&self.state);
        state.waiters.push_back(waiter);
        if state.refreshing {
            return false;
        }
        state.refreshing = true;
        true
    }

    pub(crate) fn waiting(&self) -> usize {
        lock_unpoisoned(&self.state).waiters.len()
    }

    /// Runs `action`, then flips back to idle and settles every waiter queued
    /// so far. Replays are started in enqueue order and driven concurrently.
    /// Returns the recovery failure text, if any. A panicking action counts as
    /// a failed recovery.
    pub(crate) async fn run<R, Fut>(
        &self,
        action: &dyn RecoveryAction,
        replay: R,
    ) -> Result<(), String>
    where
        R: Fn(RequestDescriptor, usize) -> Fut,
        Fut: Future<Output = crate::Result<Response>>,
    {
        let outcome = match AssertUnwindSafe(async { action.recover().await })
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome.map_err(|source| source.to_string()),
            Err(panic) => Err(panic_message(panic.as_ref())),
        };
        let waiters: Vec<Waiter> = {
            let mut state = lock_unpoisoned(&self.state);
            state.refreshing = false;
            state.waiters.drain(..).collect()
        };

        match outcome {
            Ok(()) => {
                let replay = &replay;
                join_all(waiters.into_iter().map(|waiter| async move {
                    let Waiter {
                        request,
                        deferrals,
                        reply,
                    } = waiter;
                    let result = if request.is_cancelled() {
                        Err(Error::Cancelled {
                            method: request.method().clone(),
                            uri: request.redacted_uri(),
                        })
                    } else {
                        replay(request, deferrals).await
                    };
                    let _ = reply.send(result);
                }))
                .await;
                Ok(())
            }
            Err(message) => {
                for waiter in waiters {
                    let _ = waiter.reply.send(Err(Error::RecoveryFailed {
                        message: message.clone(),
                    }));
                }
                Err(message)
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|text| (*text).to_owned())
        .or_else(|| panic.downcast_ref::<String>().cloned());
    match detail {
        Some(detail) => format!("recovery action panicked: {detail}"),
        None => "recovery action panicked".to_owned(),
    }
}
