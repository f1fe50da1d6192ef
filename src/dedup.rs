use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use http::Method;
use tokio::runtime::Handle;
use tracing::debug;

use crate::extensions::Clock;
use crate::fingerprint::RequestFingerprint;
use crate::request::RequestDescriptor;
use crate::util::lock_unpoisoned;

#[derive(Debug)]
struct PendingEntry {
    inserted_at: Instant,
    generation: u64,
    method: Method,
    uri: String,
}

#[derive(Debug, Default)]
struct SuppressorState {
    entries: HashMap<RequestFingerprint, PendingEntry>,
    next_generation: u64,
    sweeping: bool,
}

struct SuppressorInner {
    window: Duration,
    sweep_interval: Duration,
    clock: Arc<dyn Clock>,
    state: Mutex<SuppressorState>,
}

/// Rejects a request while an identical one is outstanding and younger than
/// the window.
///
/// Entries leave the set when their [`Admission`] is dropped, or when the
/// background sweep finds them older than the window. The sweep task is
/// started on the first admission made inside a tokio runtime and exits as
/// soon as the set is empty.
#[derive(Clone)]
pub(crate) struct DuplicateSuppressor {
    inner: Arc<SuppressorInner>,
}

impl DuplicateSuppressor {
    pub(crate) fn new(window: Duration, sweep_interval: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(SuppressorInner {
                window,
                sweep_interval: sweep_interval.max(Duration::from_millis(1)),
                clock,
                state: Mutex::new(SuppressorState::default()),
            }),
        }
    }

    pub(crate) fn try_admit(
        &self,
        fingerprint: RequestFingerprint,
        request: &RequestDescriptor,
    ) -> Option<Admission> {
        let now = self.inner.clock.now();
        let runtime = Handle::try_current().ok();
        let mut state = lock_unpoisoned(&self.inner.state);
        if let Some(entry) = state.entries.get(&fingerprint)
            && now.saturating_duration_since(entry.inserted_at) <= self.inner.window
        {
            return None;
        }

        let generation = state.next_generation;
        state.next_generation = state.next_generation.wrapping_add(1);
        state.entries.insert(
            fingerprint,
            PendingEntry {
                inserted_at: now,
                generation,
                method: request.method().clone(),
                uri: request.redacted_uri(),
            },
        );

        let sweeper = match runtime {
            Some(runtime) if !state.sweeping => {
                state.sweeping = true;
                Some(runtime)
            }
            _ => None,
        };
        drop(state);

        if let Some(runtime) = sweeper {
            spawn_sweeper(&runtime, Arc::downgrade(&self.inner), self.inner.sweep_interval);
        }

        Some(Admission {
            suppressor: Arc::clone(&self.inner),
            fingerprint,
            generation,
        })
    }

    /// Number of outstanding requests.
    pub(crate) fn len(&self) -> usize {
        lock_unpoisoned(&self.inner.state).entries.len()
    }

    #[cfg(test)]
    fn sweep(&self) -> usize {
        self.inner.sweep()
    }

    #[cfg(test)]
    fn is_sweeping(&self) -> bool {
        lock_unpoisoned(&self.inner.state).sweeping
    }
}

impl SuppressorInner {
    /// Removes the entry only if it still belongs to `generation`.
    fn release(&self, fingerprint: RequestFingerprint, generation: u64) {
        let mut state = lock_unpoisoned(&self.state);
        if state
            .entries
            .get(&fingerprint)
            .is_some_and(|entry| entry.generation == generation)
        {
            state.entries.remove(&fingerprint);
        }
    }

    /// Drops entries older than the window; returns how many remain.
    fn sweep(&self) -> usize {
        let now = self.clock.now();
        let window = self.window;
        let mut state = lock_unpoisoned(&self.state);
        state.entries.retain(|fingerprint, entry| {
            let keep = now.saturating_duration_since(entry.inserted_at) <= window;
            if !keep {
                debug!(
                    fingerprint = ?fingerprint,
                    method = %entry.method,
                    uri = %entry.uri,
                    "expired pending request entry"
                );
            }
            keep
        });
        state.entries.len()
    }

    fn sweep_or_stop(&self) -> bool {
        self.sweep();
        let mut state = lock_unpoisoned(&self.state);
        if state.entries.is_empty() {
            state.sweeping = false;
            return false;
        }
        true
    }
}

fn spawn_sweeper(runtime: &Handle, suppressor: Weak<SuppressorInner>, interval: Duration) {
    runtime.spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            let Some(suppressor) = suppressor.upgrade() else {
                return;
            };
            if !suppressor.sweep_or_stop() {
                return;
            }
        }
    });
}

/// Proof of admission. Dropping it releases the pending entry.
pub(crate) struct Admission {
    suppressor: Arc<SuppressorInner>,
    fingerprint: RequestFingerprint,
    generation: u64,
}

impl std::fmt::Debug for Admission {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Admission")
            .field("fingerprint", &self.fingerprint)
            .field("generation", &self.generation)
            .finish()
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        self.suppressor.release(self.fingerprint, self.generation);
    }
}
