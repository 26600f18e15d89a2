//! Connection State Tracker
//!
//! Merges the raw OS tunnel status with the configuration phase the core
//! sets while it applies or removes a config. Raw statuses are debounced
//! and the reported state is deduplicated; everything readers see comes
//! from one `watch` channel, so snapshot queries and subscribers agree.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// Reported connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Invalid,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self, ConnectionState::Connecting)
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Invalid)
    }
}

/// OS statuses use the same five values
pub type RawStatus = ConnectionState;

/// What the core is doing to the tunnel configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfigurationPhase {
    #[default]
    Initial,
    Configuring,
    Disabling,
    Testing,
}

/// Overlay the configuration phase on a raw status
pub fn effective_state(raw: RawStatus, phase: ConfigurationPhase) -> ConnectionState {
    match phase {
        ConfigurationPhase::Configuring => ConnectionState::Connecting,
        ConfigurationPhase::Disabling => ConnectionState::Disconnecting,
        ConfigurationPhase::Initial | ConfigurationPhase::Testing => raw,
    }
}

struct Overlay {
    phase: ConfigurationPhase,
    settled_raw: RawStatus,
}

struct Shared {
    overlay: Mutex<Overlay>,
    status: watch::Sender<ConnectionState>,
}

impl Shared {
    fn update(&self, f: impl FnOnce(&mut Overlay)) {
        let mut overlay = self.overlay.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut overlay);

        let next = effective_state(overlay.settled_raw, overlay.phase);
        let changed = self.status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            debug!("Connection state -> {:?} (phase {:?})", next, overlay.phase);
        }
    }
}

/// Debounced, deduplicated view of the tunnel state
pub struct ConnectionStateTracker {
    raw: watch::Sender<RawStatus>,
    shared: Arc<Shared>,
}

impl ConnectionStateTracker {
    /// Create the tracker and spawn its debounce task.
    ///
    /// Must be called inside a Tokio runtime. The task exits when the
    /// tracker is dropped.
    pub fn new(debounce: Duration) -> Self {
        let (raw, raw_rx) = watch::channel(RawStatus::Disconnected);
        let (status, _) = watch::channel(ConnectionState::Disconnected);
        let shared = Arc::new(Shared {
            overlay: Mutex::new(Overlay {
                phase: ConfigurationPhase::Initial,
                settled_raw: RawStatus::Disconnected,
            }),
            status,
        });

        tokio::spawn(debounce_raw(raw_rx, shared.clone(), debounce));

        Self { raw, shared }
    }

    /// Feed one raw OS status. Safe to call from any thread.
    pub fn observe(&self, raw: RawStatus) {
        self.raw.send_replace(raw);
    }

    /// Set the phase and re-evaluate against the last settled raw status
    pub fn set_configuration_state(&self, phase: ConfigurationPhase) {
        self.shared.update(|overlay| overlay.phase = phase);
    }

    pub fn configuration_state(&self) -> ConfigurationPhase {
        self.shared
            .overlay
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .phase
    }

    pub fn current(&self) -> ConnectionState {
        *self.shared.status.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.current().is_connected()
    }

    pub fn is_connecting(&self) -> bool {
        self.current().is_connecting()
    }

    pub fn is_disconnected(&self) -> bool {
        self.current().is_disconnected()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.shared.status.subscribe()
    }
}

/// Settle a raw status once it has been quiet for `window`
async fn debounce_raw(mut raw: watch::Receiver<RawStatus>, shared: Arc<Shared>, window: Duration) {
    while raw.changed().await.is_ok() {
        loop {
            match tokio::time::timeout(window, raw.changed()).await {
                Ok(Ok(())) => continue,
                // sender gone, or quiet for a full window
                Ok(Err(_)) | Err(_) => break,
            }
        }

        let settled = *raw.borrow_and_update();
        shared.update(|overlay| overlay.settled_raw = settled);
    }
    debug!("State tracker stopped");
}
