//! Liveness monitor: periodic reachability probing of session peers.
//!
//! Transports without native destination probing can drive the session
//! registry from a [`LivenessMonitor`]. Each check pings every registered
//! destination through a [`Pinger`]. A destination turns reachable on the
//! first successful ping and unreachable after `miss_threshold` consecutive
//! misses; only those transitions are reported to the [`ProbeListener`].

use crate::session::SessionRegistry;
use chrono::{DateTime, Utc};
use ddbus_types::{DdError, DdResult, PeerId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Reachability check for one destination.
pub trait Pinger: Send + Sync {
    fn ping(&self, peer: &PeerId) -> bool;
}

impl<F> Pinger for F
where
    F: Fn(&PeerId) -> bool + Send + Sync,
{
    fn ping(&self, peer: &PeerId) -> bool {
        self(peer)
    }
}

/// Receiver of reachability transitions.
pub trait ProbeListener: Send + Sync {
    fn destination_found(&self, peer: &PeerId);
    fn destination_lost(&self, peer: &PeerId);
}

impl ProbeListener for SessionRegistry {
    fn destination_found(&self, peer: &PeerId) {
        self.on_destination_found(peer);
    }

    fn destination_lost(&self, peer: &PeerId) {
        self.on_destination_lost(peer);
    }
}

/// Result of probing one destination.
#[derive(Debug, Clone)]
pub struct ProbeStatus {
    /// Probed peer.
    pub peer: PeerId,
    /// Whether the peer is currently considered reachable.
    pub reachable: bool,
    /// Consecutive failed pings.
    pub consecutive_misses: u32,
    /// Time of the last successful ping.
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Destination {
    reachable: bool,
    misses: u32,
    last_seen: Option<DateTime<Utc>>,
}

enum Transition {
    Found(PeerId),
    Lost(PeerId),
}

/// Ping-driven reachability tracker.
pub struct LivenessMonitor {
    pinger: Arc<dyn Pinger>,
    listener: Weak<dyn ProbeListener>,
    miss_threshold: u32,
    destinations: Mutex<HashMap<PeerId, Destination>>,
}

impl LivenessMonitor {
    /// Create a monitor. `miss_threshold` is clamped to at least one.
    pub fn new(pinger: Arc<dyn Pinger>, listener: Weak<dyn ProbeListener>, miss_threshold: u32) -> Self {
        Self {
            pinger,
            listener,
            miss_threshold: miss_threshold.max(1),
            destinations: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PeerId, Destination>> {
        self.destinations.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start probing `peer`. Returns false if it was already probed.
    pub fn add_destination(&self, peer: &PeerId) -> bool {
        let mut destinations = self.lock();
        if destinations.contains_key(peer) {
            return false;
        }
        destinations.insert(peer.clone(), Destination::default());
        debug!(peer = %peer, "Probe destination added");
        true
    }

    /// Stop probing `peer`.
    pub fn remove_destination(&self, peer: &PeerId) -> bool {
        self.lock().remove(peer).is_some()
    }

    /// Number of probed destinations.
    pub fn destination_count(&self) -> usize {
        self.lock().len()
    }

    /// Ping every destination once and report transitions.
    pub fn check_once(&self) -> Vec<ProbeStatus> {
        let peers: Vec<PeerId> = self.lock().keys().cloned().collect();
        let results: Vec<(PeerId, bool)> = peers
            .into_iter()
            .map(|peer| {
                let ok = self.pinger.ping(&peer);
                (peer, ok)
            })
            .collect();

        let now = Utc::now();
        let mut statuses = Vec::with_capacity(results.len());
        let mut transitions = Vec::new();
        {
            let mut destinations = self.lock();
            for (peer, ok) in results {
                // Removed while pinging.
                let Some(dest) = destinations.get_mut(&peer) else {
                    continue;
                };
                if ok {
                    dest.misses = 0;
                    dest.last_seen = Some(now);
                    if !dest.reachable {
                        dest.reachable = true;
                        transitions.push(Transition::Found(peer.clone()));
                    }
                } else {
                    dest.misses = dest.misses.saturating_add(1);
                    if dest.reachable && dest.misses >= self.miss_threshold {
                        dest.reachable = false;
                        transitions.push(Transition::Lost(peer.clone()));
                    }
                }
                statuses.push(ProbeStatus {
                    peer,
                    reachable: dest.reachable,
                    consecutive_misses: dest.misses,
                    last_seen: dest.last_seen,
                });
            }
        }

        if let Some(listener) = self.listener.upgrade() {
            for transition in transitions {
                match transition {
                    Transition::Found(peer) => {
                        info!(peer = %peer, "Destination reachable");
                        listener.destination_found(&peer);
                    }
                    Transition::Lost(peer) => {
                        warn!(peer = %peer, misses = self.miss_threshold, "Destination unreachable");
                        listener.destination_lost(&peer);
                    }
                }
            }
        }
        statuses
    }

    /// Run [`check_once`](Self::check_once) every `interval` on the current
    /// tokio runtime. The task ends when the monitor is dropped.
    pub fn start(self: &Arc<Self>, interval: Duration) -> DdResult<tokio::task::JoinHandle<()>> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| DdError::InitFailed(format!("no tokio runtime: {e}")))?;
        let monitor = Arc::downgrade(self);
        Ok(handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(monitor) = monitor.upgrade() else {
                    debug!("Liveness monitor dropped, stopping");
                    break;
                };
                let statuses = monitor.check_once();
                let summary = summarize(&statuses);
                debug!(
                    checked = summary.total_checked,
                    unreachable = summary.unreachable,
                    "Liveness check complete"
                );
            }
        }))
    }
}

/// Aggregate liveness summary.
#[derive(Debug, Clone, Default)]
pub struct LivenessSummary {
    /// Total destinations checked.
    pub total_checked: usize,
    /// Number of reachable destinations.
    pub reachable: usize,
    /// Number of unreachable destinations.
    pub unreachable: usize,
    /// Details of unreachable destinations.
    pub unreachable_peers: Vec<ProbeStatus>,
}

/// Produce a summary from probe statuses.
pub fn summarize(statuses: &[ProbeStatus]) -> LivenessSummary {
    let unreachable_peers: Vec<ProbeStatus> = statuses
        .iter()
        .filter(|s| !s.reachable)
        .cloned()
        .collect();

    LivenessSummary {
        total_checked: statuses.len(),
        reachable: statuses.len() - unreachable_peers.len(),
        unreachable: unreachable_peers.len(),
        unreachable_peers,
    }
}
