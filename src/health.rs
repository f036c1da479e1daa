//! Liveness indicator fed by broadcast probe events.
//!
//! A probe loop can wedge in ways that never show up as a failed cycle,
//! for example when no cycles complete at all. The monitor keeps a short
//! per-protocol window of recent cycle durations and answers whether the
//! loop is still making progress within its SLA. Transport (HTTP endpoint,
//! systemd watchdog, ...) is out of scope; `is_live` is the seam.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::{ProbeEvent, Protocol};

struct ProtocolWindow {
    /// `true` per cycle that finished within the SLA
    recent: VecDeque<bool>,
    last_event: DateTime<Utc>,
}

/// Tracks per-protocol probe liveness over a sliding window.
pub struct HealthMonitor {
    /// How many cycles the verdict looks back over
    window: usize,

    /// Per-cycle duration budget in milliseconds
    sla_ms: u64,

    inner: Mutex<HashMap<Protocol, ProtocolWindow>>,
}

impl HealthMonitor {
    pub fn new(window: usize, sla_ms: u64) -> Self {
        Self {
            window: window.max(1),
            sla_ms,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Feed one finished cycle into the window.
    pub fn observe(&self, event: &ProbeEvent) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        let state = inner
            .entry(event.protocol)
            .or_insert_with(|| ProtocolWindow {
                recent: VecDeque::with_capacity(self.window),
                last_event: event.timestamp,
            });

        if state.recent.len() == self.window {
            state.recent.pop_front();
        }
        state.recent.push_back(event.elapsed_ms <= self.sla_ms);
        state.last_event = event.timestamp;
    }

    /// Whether the protocol's probe loop is making progress.
    ///
    /// Live means every cycle in the current window finished within the SLA.
    /// A protocol with no events yet is considered live; it may simply not
    /// have completed its first interval.
    pub fn is_live(&self, protocol: Protocol) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        match inner.get(&protocol) {
            None => true,
            Some(state) => state.recent.iter().all(|within_sla| *within_sla),
        }
    }

    /// Age of the most recent cycle, if any completed.
    pub fn last_seen(&self, protocol: Protocol) -> Option<DateTime<Utc>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.get(&protocol).map(|state| state.last_event)
    }

    /// Drain probe events from the broadcast channel into the monitor.
    ///
    /// Runs until every sender is dropped. Lagging behind the channel only
    /// costs old observations, so it is logged and skipped.
    pub async fn run(&self, mut event_rx: broadcast::Receiver<ProbeEvent>) {
        loop {
            match event_rx.recv().await {
                Ok(event) => self.observe(&event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("health monitor lagged, dropped {missed} probe events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("probe event channel closed");
                    break;
                }
            }
        }
    }
}
