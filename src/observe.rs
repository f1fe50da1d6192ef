use crate::request::RequestDescriptor;

/// Lifecycle hooks. Called synchronously on the dispatching task, so
/// implementations should return quickly.
pub trait Observer: Send + Sync {
    fn on_dispatch_start(&self, _request: &RequestDescriptor, _deferrals: usize) {}

    fn on_duplicate_rejected(&self, _request: &RequestDescriptor) {}

    fn on_deferred(&self, _request: &RequestDescriptor, _deferrals: usize) {}

    fn on_recovery_started(&self) {}

    fn on_recovery_finished(&self, _succeeded: bool) {}
}
