//! Network reachability monitoring.
//!
//! ```text
//! ┌──────────────────────┐  current() + subscribe()  ┌──────────────────────┐
//! │ ReachabilityProvider │ ────────────────────────▶ │ ConnectivityMonitor  │
//! └──────────────────────┘                           │  watch: state        │
//!        LatencyProbe  ─── optional quality ───────▶ │  broadcast: events   │
//!   ConnectivityProbe  ─── verify_connectivity() ──▶ │                      │
//!                                                    └──────────────────────┘
//! ```
//!
//! The monitor is the single owner of the process-wide [`ConnectionState`].
//! Other components observe it through [`ConnectivityMonitor::state_receiver`]
//! and react to [`ConnectivityEvent`]s from [`ConnectivityMonitor::subscribe`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{LatencyThresholds, SyncConfig};
use crate::error::{SyncError, SyncResult};
use crate::types::{ConnectionQuality, ConnectionState, ConnectionType};

/// Raw platform reachability reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reachability {
    pub is_reachable: bool,
    pub interface: ConnectionType,
    /// Metered/constrained link (e.g. cellular data plan)
    pub is_metered: bool,
}

impl Reachability {
    pub fn offline() -> Self {
        Self {
            is_reachable: false,
            interface: ConnectionType::Other,
            is_metered: false,
        }
    }

    pub fn wifi() -> Self {
        Self {
            is_reachable: true,
            interface: ConnectionType::Wifi,
            is_metered: false,
        }
    }

    pub fn wired() -> Self {
        Self {
            is_reachable: true,
            interface: ConnectionType::Wired,
            is_metered: false,
        }
    }

    pub fn cellular(is_metered: bool) -> Self {
        Self {
            is_reachable: true,
            interface: ConnectionType::Cellular,
            is_metered,
        }
    }
}

/// The platform's network-reachability facility.
pub trait ReachabilityProvider: Send + Sync {
    /// Synchronous read of the current value.
    fn current(&self) -> Reachability;

    /// Change notifications.
    fn subscribe(&self) -> watch::Receiver<Reachability>;
}

/// Reachability provider driven by hand (tests, CLI simulations).
pub struct ManualReachability {
    tx: watch::Sender<Reachability>,
}

impl ManualReachability {
    pub fn new(initial: Reachability) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    pub fn set(&self, reachability: Reachability) {
        self.tx.send_replace(reachability);
    }
}

impl ReachabilityProvider for ManualReachability {
    fn current(&self) -> Reachability {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<Reachability> {
        self.tx.subscribe()
    }
}

/// Active round-trip measurement used to refine quality.
#[async_trait]
pub trait LatencyProbe: Send + Sync {
    async fn round_trip(&self) -> SyncResult<Duration>;
}

/// Out-of-band reachability check (e.g. a request to a known endpoint).
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn is_reachable(&self) -> SyncResult<bool>;
}

/// Notifications broadcast by the monitor
#[derive(Debug, Clone)]
pub enum ConnectivityEvent {
    /// Any change of state
    Transition {
        state: ConnectionState,
        elapsed_in_previous: Duration,
    },
    /// Disconnected → Connected. Sent after the matching `Transition`.
    ConnectionRestored { offline_for: Duration },
    /// Connected → Disconnected. Sent after the matching `Transition`.
    ConnectionLost { online_for: Duration },
}

/// Quality guess from the interface alone.
pub fn quality_from_interface(reachability: &Reachability) -> ConnectionQuality {
    if !reachability.is_reachable {
        return ConnectionQuality::Unknown;
    }
    match reachability.interface {
        ConnectionType::Wifi | ConnectionType::Wired => ConnectionQuality::Excellent,
        ConnectionType::Cellular if reachability.is_metered => ConnectionQuality::Fair,
        ConnectionType::Cellular => ConnectionQuality::Good,
        ConnectionType::Other => ConnectionQuality::Unknown,
    }
}

pub fn quality_from_latency(rtt: Duration, thresholds: &LatencyThresholds) -> ConnectionQuality {
    let ms = rtt.as_millis();
    if ms < u128::from(thresholds.excellent_ms) {
        ConnectionQuality::Excellent
    } else if ms < u128::from(thresholds.good_ms) {
        ConnectionQuality::Good
    } else if ms < u128::from(thresholds.fair_ms) {
        ConnectionQuality::Fair
    } else {
        ConnectionQuality::Poor
    }
}

fn derive_state(reachability: &Reachability, quality: ConnectionQuality) -> ConnectionState {
    if reachability.is_reachable {
        ConnectionState::connected(reachability.interface, quality)
    } else {
        ConnectionState::disconnected()
    }
}

fn same_state(a: &ConnectionState, b: &ConnectionState) -> bool {
    a.is_connected == b.is_connected
        && a.connection_type == b.connection_type
        && a.quality == b.quality
}

/// Serialized transition bookkeeping, guarded by the monitor's lock
struct MonitorState {
    reachability: Reachability,
    entered_at: Instant,
}

struct MonitorInner {
    owner: Mutex<MonitorState>,
    state_tx: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ConnectivityEvent>,
    latency_probe: Option<Arc<dyn LatencyProbe>>,
    connectivity_probe: Option<Arc<dyn ConnectivityProbe>>,
    thresholds: LatencyThresholds,
    probe_timeout: Duration,
}

impl MonitorInner {
    /// The single entry point for state changes.
    fn apply(&self, reachability: Reachability, quality: Option<ConnectionQuality>) {
        let mut owner = self.owner.lock();
        let current = self.state_tx.borrow().clone();
        let quality = quality.unwrap_or_else(|| {
            if reachability.is_reachable
                && current.is_connected
                && current.connection_type == reachability.interface
                && owner.reachability.is_metered == reachability.is_metered
            {
                // Same link: keep whatever quality the probe last measured.
                current.quality
            } else {
                quality_from_interface(&reachability)
            }
        });
        owner.reachability = reachability;

        let next = derive_state(&reachability, quality);
        if same_state(&current, &next) {
            return;
        }

        let now = Instant::now();
        let elapsed = now.duration_since(owner.entered_at);
        owner.entered_at = now;

        // Publish before releasing the owner lock.
        info!(from = %current, to = %next, elapsed_ms = elapsed.as_millis() as u64, "Connectivity transition");
        self.state_tx.send_replace(next.clone());
        let _ = self.events.send(ConnectivityEvent::Transition {
            state: next.clone(),
            elapsed_in_previous: elapsed,
        });
        match (current.is_connected, next.is_connected) {
            (false, true) => {
                info!(offline_ms = elapsed.as_millis() as u64, "Connection restored");
                let _ = self
                    .events
                    .send(ConnectivityEvent::ConnectionRestored { offline_for: elapsed });
            }
            (true, false) => {
                warn!(online_ms = elapsed.as_millis() as u64, "Connection lost");
                let _ = self
                    .events
                    .send(ConnectivityEvent::ConnectionLost { online_for: elapsed });
            }
            _ => {}
        }
    }

    async fn refresh_quality(&self) {
        let Some(probe) = &self.latency_probe else {
            return;
        };
        if !self.state_tx.borrow().is_connected {
            return;
        }
        match tokio::time::timeout(self.probe_timeout, probe.round_trip()).await {
            Ok(Ok(rtt)) => {
                let quality = quality_from_latency(rtt, &self.thresholds);
                debug!(rtt_ms = rtt.as_millis() as u64, %quality, "Latency probe");
                let reachability = self.owner.lock().reachability;
                if reachability.is_reachable {
                    self.apply(reachability, Some(quality));
                }
            }
            Ok(Err(e)) => debug!(error = %e, "Latency probe failed, keeping heuristic quality"),
            Err(_) => debug!("Latency probe timed out, keeping heuristic quality"),
        }
    }
}

/// Builder for [`ConnectivityMonitor`].
pub struct MonitorBuilder {
    provider: Arc<dyn ReachabilityProvider>,
    latency_probe: Option<Arc<dyn LatencyProbe>>,
    connectivity_probe: Option<Arc<dyn ConnectivityProbe>>,
    config: SyncConfig,
}

impl MonitorBuilder {
    pub fn latency_probe(mut self, probe: Arc<dyn LatencyProbe>) -> Self {
        self.latency_probe = Some(probe);
        self
    }

    pub fn connectivity_probe(mut self, probe: Arc<dyn ConnectivityProbe>) -> Self {
        self.connectivity_probe = Some(probe);
        self
    }

    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Read the current reachability, then start watching for changes.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(self) -> ConnectivityMonitor {
        // Synchronous read first so the initial state is never a spurious
        // "disconnected" waiting for the first callback.
        let initial = self.provider.current();
        let state = derive_state(&initial, quality_from_interface(&initial));
        info!(state = %state, "Connectivity monitor starting");

        let (state_tx, _) = watch::channel(state);
        let (events, _) = broadcast::channel(self.config.event_capacity);
        let inner = Arc::new(MonitorInner {
            owner: Mutex::new(MonitorState {
                reachability: initial,
                entered_at: Instant::now(),
            }),
            state_tx,
            events,
            latency_probe: self.latency_probe,
            connectivity_probe: self.connectivity_probe,
            thresholds: self.config.latency.clone(),
            probe_timeout: self.config.probe_timeout(),
        });

        let mut changes = self.provider.subscribe();
        // Catch a change that landed between the read and the subscription.
        let latest = *changes.borrow_and_update();
        if latest != initial {
            inner.apply(latest, None);
        }

        let task_inner = inner.clone();
        let task = tokio::spawn(async move {
            task_inner.refresh_quality().await;
            while changes.changed().await.is_ok() {
                let reachability = *changes.borrow_and_update();
                let was_connected = task_inner.state_tx.borrow().is_connected;
                task_inner.apply(reachability, None);
                if !was_connected && reachability.is_reachable {
                    task_inner.refresh_quality().await;
                }
            }
            debug!("Reachability provider closed, monitor task exiting");
        });

        ConnectivityMonitor {
            inner,
            task: Mutex::new(Some(task)),
        }
    }
}

/// Single owner of the process-wide connection state.
pub struct ConnectivityMonitor {
    inner: Arc<MonitorInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectivityMonitor {
    pub fn builder(provider: Arc<dyn ReachabilityProvider>) -> MonitorBuilder {
        MonitorBuilder {
            provider,
            latency_probe: None,
            connectivity_probe: None,
            config: SyncConfig::default(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state_tx.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state_tx.borrow().is_connected
    }

    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.inner.events.subscribe()
    }

    /// Re-run the latency probe against the current link.
    pub async fn refresh_quality(&self) {
        self.inner.refresh_quality().await;
    }

    /// Out-of-band reachability probe.
    ///
    /// The probe result wins over the passive monitor when they disagree;
    /// a probe that fails or times out counts as unreachable. Without a
    /// probe the passive state is returned.
    pub async fn verify_connectivity(&self) -> bool {
        let Some(probe) = &self.inner.connectivity_probe else {
            return self.is_connected();
        };
        let reachable = match tokio::time::timeout(self.inner.probe_timeout, probe.is_reachable()).await
        {
            Ok(Ok(reachable)) => reachable,
            Ok(Err(e)) => {
                debug!(error = %e, "Connectivity probe failed");
                false
            }
            Err(_) => {
                debug!("Connectivity probe timed out");
                false
            }
        };

        if reachable != self.is_connected() {
            warn!(
                passive = self.is_connected(),
                probe = reachable,
                "Passive monitor disagrees with probe, using probe"
            );
            let mut reachability = self.inner.owner.lock().reachability;
            reachability.is_reachable = reachable;
            self.inner.apply(reachability, None);
        }
        reachable
    }

    /// Wait until connected, failing with [`SyncError::Timeout`].
    pub async fn wait_for_connection(&self, timeout: Duration) -> SyncResult<()> {
        let mut rx = self.state_receiver();
        let result = match tokio::time::timeout(timeout, rx.wait_for(|s| s.is_connected)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(SyncError::TransientNetwork(
                "connectivity monitor stopped".to_string(),
            )),
            Err(_) => Err(SyncError::timeout("network connection", timeout)),
        };
        result
    }

    /// Stop watching the provider. State stays at its last value.
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for ConnectivityMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
