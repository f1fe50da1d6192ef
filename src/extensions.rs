use std::collections::BTreeSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use crate::util::lock_unpoisoned;

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Connectivity check consulted before a request touches the transport.
pub trait ReachabilityProbe: Send + Sync {
    fn is_reachable(&self, host: &str) -> bool;
}

/// Reachability state pushed by the host application, e.g. from OS network
/// change notifications.
#[derive(Debug)]
pub struct ManualReachability {
    online: AtomicBool,
    unreachable_hosts: Mutex<BTreeSet<String>>,
}

impl ManualReachability {
    pub fn new() -> Self {
        Self {
            online: AtomicBool::new(true),
            unreachable_hosts: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn set_host_reachable(&self, host: &str, reachable: bool) {
        let host = host.to_ascii_lowercase();
        let mut hosts = lock_unpoisoned(&self.unreachable_hosts);
        if reachable {
            hosts.remove(&host);
        } else {
            hosts.insert(host);
        }
    }
}

impl Default for ManualReachability {
    fn default() -> Self {
        Self::new()
    }
}

impl ReachabilityProbe for ManualReachability {
    fn is_reachable(&self, host: &str) -> bool {
        if !self.online.load(Ordering::SeqCst) {
            return false;
        }
        !lock_unpoisoned(&self.unreachable_hosts).contains(&host.to_ascii_lowercase())
    }
}
