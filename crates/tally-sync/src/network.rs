//! # Network Monitor
//!
//! Tracks connectivity and answers "may we sync on this connection?".
//!
//! ## State Propagation
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        NetworkMonitor                                   │
//! │                                                                         │
//! │  ConnectivityProbe ──refresh()──┐                                      │
//! │  (TcpProbe / StaticProbe)       │                                      │
//! │                                 ▼                                      │
//! │  platform event ──set_state()──► watch::Sender<NetworkState>           │
//! │                                 │                                      │
//! │                   notify only when is_online, connection_type          │
//! │                   or is_metered changed; signal strength is            │
//! │                   stored silently                                      │
//! │                                 │                                      │
//! │            ┌────────────────────┼────────────────────┐                 │
//! │            ▼                    ▼                    ▼                 │
//! │     subscribe()        wait_for_connection()   SyncEngine watcher      │
//! │     (sees last state   (timeout, receiver       (tears down / re-arms  │
//! │      immediately)       dropped on both paths)   the sync timer)       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use tally_core::{ConnectionType, NetworkState};

// =============================================================================
// Connectivity Probes
// =============================================================================

/// Source of connectivity information (the platform network API).
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    /// Reports the current connectivity. An error means the platform could
    /// not be queried; the monitor then assumes offline.
    async fn probe(&self) -> SyncResult<NetworkState>;
}

/// Production probe: a TCP connect with timeout to a well-known host.
///
/// A TCP connect cannot tell Wi-Fi from Ethernet or see metering, so a
/// reachable host reports `Unknown` and unmetered.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    host: String,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(host: impl Into<String>, timeout: Duration) -> Self {
        TcpProbe {
            host: host.into(),
            timeout,
        }
    }
}

#[async_trait]
impl ConnectivityProbe for TcpProbe {
    async fn probe(&self) -> SyncResult<NetworkState> {
        match tokio::time::timeout(self.timeout, TcpStream::connect(&self.host)).await {
            Ok(Ok(_stream)) => Ok(NetworkState::online(ConnectionType::Unknown, false)),
            Ok(Err(e)) => {
                debug!(host = %self.host, %e, "Connectivity probe failed");
                Ok(NetworkState::offline())
            }
            Err(_) => {
                debug!(host = %self.host, "Connectivity probe timed out");
                Ok(NetworkState::offline())
            }
        }
    }
}

/// Probe returning a preset answer. Used by tests and headless setups
/// that push state through [`NetworkMonitor::set_state`].
#[derive(Debug, Default)]
pub struct StaticProbe {
    answer: RwLock<Option<NetworkState>>,
}

impl StaticProbe {
    pub fn new(state: NetworkState) -> Self {
        StaticProbe {
            answer: RwLock::new(Some(state)),
        }
    }

    /// A probe whose platform query always fails.
    pub fn failing() -> Self {
        StaticProbe {
            answer: RwLock::new(None),
        }
    }

    pub async fn set(&self, state: NetworkState) {
        *self.answer.write().await = Some(state);
    }

    pub async fn fail(&self) {
        *self.answer.write().await = None;
    }
}

#[async_trait]
impl ConnectivityProbe for StaticProbe {
    async fn probe(&self) -> SyncResult<NetworkState> {
        (*self.answer.read().await)
            .ok_or_else(|| SyncError::Internal("platform network query failed".into()))
    }
}

#[async_trait]
impl<P: ConnectivityProbe + ?Sized> ConnectivityProbe for Arc<P> {
    async fn probe(&self) -> SyncResult<NetworkState> {
        (**self).probe().await
    }
}

// =============================================================================
// Network Monitor
// =============================================================================

/// Last known connectivity plus change notifications.
pub struct NetworkMonitor {
    probe: Box<dyn ConnectivityProbe>,
    state_tx: watch::Sender<NetworkState>,
}

impl NetworkMonitor {
    /// Creates a monitor that starts offline until the first refresh.
    pub fn new(probe: impl ConnectivityProbe + 'static) -> Self {
        Self::with_initial_state(probe, NetworkState::offline())
    }

    pub fn with_initial_state(probe: impl ConnectivityProbe + 'static, initial: NetworkState) -> Self {
        let (state_tx, _) = watch::channel(initial);
        NetworkMonitor {
            probe: Box::new(probe),
            state_tx,
        }
    }

    /// Last known state.
    pub fn current_state(&self) -> NetworkState {
        *self.state_tx.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.state_tx.borrow().is_online
    }

    /// Subscribes to material state changes.
    ///
    /// `borrow()` on the returned receiver yields the last known state right
    /// away; `changed()` resolves on the next material change.
    pub fn subscribe(&self) -> watch::Receiver<NetworkState> {
        self.state_tx.subscribe()
    }

    /// Stores a new state, notifying subscribers only on material change.
    /// Returns whether subscribers were notified.
    pub fn set_state(&self, state: NetworkState) -> bool {
        let notified = self.state_tx.send_if_modified(|current| {
            let material = state.differs_materially(current);
            *current = state;
            material
        });

        if notified {
            info!(
                online = state.is_online,
                connection = ?state.connection_type,
                metered = state.is_metered,
                "Network state changed"
            );
        }
        notified
    }

    /// Queries the probe and stores the result. A failing probe yields the
    /// conservative offline state.
    pub async fn refresh(&self) -> NetworkState {
        let state = match self.probe.probe().await {
            Ok(state) => state,
            Err(e) => {
                warn!(?e, "Network query failed, assuming offline");
                NetworkState::offline()
            }
        };
        self.set_state(state);
        state
    }

    /// Sync policy for the current connection.
    pub fn should_sync_on_current_connection(&self, respect_metered: bool) -> bool {
        let state = self.current_state();
        if !state.is_online {
            return false;
        }
        !(respect_metered && state.is_metered)
    }

    /// Waits until the device is online, up to `timeout`.
    ///
    /// The receiver is owned by this call and dropped on return, whether the
    /// wait succeeded or timed out.
    pub async fn wait_for_connection(&self, timeout: Duration) -> bool {
        let mut rx = self.subscribe();
        let connected = tokio::time::timeout(timeout, async {
            rx.wait_for(|state| state.is_online).await.is_ok()
        })
        .await;

        matches!(connected, Ok(true))
    }

    /// Refreshes connectivity every `interval` until the handle is stopped.
    pub fn spawn_polling(self: &Arc<Self>, interval: Duration) -> PollingHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let monitor = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        monitor.refresh().await;
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("Network polling stopped");
                        break;
                    }
                }
            }
        });

        PollingHandle { shutdown_tx }
    }
}

/// Stops a polling loop started by [`NetworkMonitor::spawn_polling`].
#[derive(Clone)]
pub struct PollingHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl PollingHandle {
    /// Idempotent; a stopped loop ignores further calls.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wifi() -> NetworkState {
        NetworkState::online(ConnectionType::Wifi, false)
    }

    #[tokio::test]
    async fn test_subscriber_sees_last_state() {
        let monitor = NetworkMonitor::with_initial_state(StaticProbe::new(wifi()), wifi());
        let rx = monitor.subscribe();
        assert!(rx.borrow().is_online);
    }

    #[tokio::test]
    async fn test_signal_strength_change_is_silent() {
        let monitor = NetworkMonitor::with_initial_state(StaticProbe::new(wifi()), wifi());
        let mut rx = monitor.subscribe();

        let mut weaker = wifi();
        weaker.signal_strength = Some(20);
        assert!(!monitor.set_state(weaker));
        assert!(!rx.has_changed().unwrap());
        assert_eq!(monitor.current_state().signal_strength, Some(20));

        let metered = NetworkState::online(ConnectionType::Cellular, true);
        assert!(monitor.set_state(metered));
        assert!(rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_metered_policy() {
        let monitor = NetworkMonitor::with_initial_state(
            StaticProbe::new(wifi()),
            NetworkState::online(ConnectionType::Cellular, true),
        );
        assert!(!monitor.should_sync_on_current_connection(true));
        assert!(monitor.should_sync_on_current_connection(false));

        monitor.set_state(NetworkState::offline());
        assert!(!monitor.should_sync_on_current_connection(false));
    }

    #[tokio::test]
    async fn test_failing_probe_falls_back_to_offline() {
        let monitor = NetworkMonitor::with_initial_state(StaticProbe::failing(), wifi());
        let state = monitor.refresh().await;
        assert!(!state.is_online);
        assert!(!monitor.is_online());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_connection_times_out() {
        let monitor = NetworkMonitor::new(StaticProbe::new(NetworkState::offline()));
        assert!(!monitor.wait_for_connection(Duration::from_secs(5)).await);
        assert_eq!(monitor.state_tx.receiver_count(), 0);
    }

    #[tokio::test]
    async fn test_wait_for_connection_resolves_on_connect() {
        let monitor = Arc::new(NetworkMonitor::new(StaticProbe::new(NetworkState::offline())));

        let waiter = {
            let monitor = Arc::clone(&monitor);
            tokio::spawn(async move { monitor.wait_for_connection(Duration::from_secs(30)).await })
        };
        tokio::task::yield_now().await;
        monitor.set_state(wifi());

        assert!(waiter.await.unwrap());
        assert_eq!(monitor.state_tx.receiver_count(), 0);
    }

    #[tokio::test]
    async fn test_refresh_uses_probe() {
        let probe = Arc::new(StaticProbe::new(NetworkState::offline()));
        let monitor = NetworkMonitor::new(Arc::clone(&probe));

        probe.set(wifi()).await;
        assert!(monitor.refresh().await.is_online);
        assert_eq!(monitor.current_state().connection_type, ConnectionType::Wifi);
    }
}
