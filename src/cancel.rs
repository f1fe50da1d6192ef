use tokio_util::sync::CancellationToken;

/// Cancellation handle shared by a batch of requests.
///
/// Requests join a scope with [`RequestDescriptor::cancel_with`]. Dropping the
/// scope does not cancel anything; the owner calls [`CancellationScope::cancel`]
/// at its lifecycle boundary.
///
/// [`RequestDescriptor::cancel_with`]: crate::RequestDescriptor::cancel_with
#[derive(Clone, Debug, Default)]
pub struct CancellationScope {
    token: CancellationToken,
}

impl CancellationScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// A scope cancelled together with this one, but cancellable on its own.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub(crate) fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}
