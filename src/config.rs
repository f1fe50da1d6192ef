use std::time::Duration;

use crate::envelope::EnvelopeFormat;

pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_millis(300);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_DEFERRALS: usize = 1;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    /// Joined with relative paths given to [`Dispatcher::request`](crate::Dispatcher::request).
    pub base_url: Option<String>,
    pub envelope: EnvelopeFormat,
    pub dedup_window: Duration,
    pub sweep_interval: Duration,
    /// How many times one request may be deferred and replayed.
    pub max_deferrals: usize,
    /// Used when the request carries no timeout of its own.
    pub default_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            envelope: EnvelopeFormat::standard(),
            dedup_window: DEFAULT_DEDUP_WINDOW,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            max_deferrals: DEFAULT_MAX_DEFERRALS,
            default_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl DispatcherConfig {
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_envelope(mut self, envelope: EnvelopeFormat) -> Self {
        self.envelope = envelope;
        self
    }

    pub fn with_dedup_window(mut self, dedup_window: Duration) -> Self {
        self.dedup_window = dedup_window;
        self
    }

    pub fn with_sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.sweep_interval = sweep_interval.max(Duration::from_millis(1));
        self
    }

    pub fn with_max_deferrals(mut self, max_deferrals: usize) -> Self {
        self.max_deferrals = max_deferrals;
        self
    }

    pub fn with_default_timeout(mut self, default_timeout: Duration) -> Self {
        self.default_timeout = default_timeout.max(Duration::from_millis(1));
        self
    }
}
