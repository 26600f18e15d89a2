//! Protocol Selector
//!
//! Owns the ordered list of (protocol, port) candidates for the current
//! network and a cursor into it. Each failure moves the cursor forward;
//! running off the end is reported as [`SelectorError::Exhausted`] and
//! never papered over with a default candidate.
//!
//! ```text
//!  Initial ──next──▶ Trying(c) ──success──▶ Settled(c)
//!                       │
//!                    failure
//!                       ▼
//!                 Trying(c + 1) ── ... ──▶ Exhausted
//! ```
//!
//! Cursors are persisted per network id so a restart resumes where the
//! previous session stopped.

use crate::persistence::Persistence;
use crate::protocol::{CANONICAL_KINDS, Candidate, ConnectionKind, PortTable};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

/// Physical network type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkKind {
    Wifi,
    Cellular,
    Ethernet,
    #[default]
    None,
}

/// Protocol/port pinned by the user for one network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinnedPreference {
    pub kind: ConnectionKind,
    pub port: String,
}

/// The network the device is on right now
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkContext {
    /// SSID for Wi-Fi, otherwise an interface label
    pub id: String,
    #[serde(default)]
    pub kind: NetworkKind,
    /// User marked this network untrusted; the pinned candidate is always used
    #[serde(default)]
    pub untrusted_by_choice: bool,
    #[serde(default)]
    pub pinned: Option<PinnedPreference>,
}

impl NetworkContext {
    pub fn new(id: impl Into<String>, kind: NetworkKind) -> Self {
        Self {
            id: id.into(),
            kind,
            untrusted_by_choice: false,
            pinned: None,
        }
    }

    pub fn with_pinned(mut self, kind: ConnectionKind, port: impl Into<String>) -> Self {
        self.pinned = Some(PinnedPreference {
            kind,
            port: port.into(),
        });
        self
    }

    pub fn untrusted(mut self) -> Self {
        self.untrusted_by_choice = true;
        self
    }

    fn pinned_candidate(&self) -> Option<Candidate> {
        let pinned = self.pinned.as_ref()?;
        match Candidate::new(pinned.kind, pinned.port.as_str()) {
            Ok(candidate) => Some(candidate),
            Err(e) => {
                warn!("Ignoring invalid pinned preference for {}: {}", self.id, e);
                None
            }
        }
    }
}

/// Automatic ranking or a single user-chosen candidate
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConnectionMode {
    #[default]
    Auto,
    Manual { kind: ConnectionKind, port: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptOutcome {
    Succeeded,
    Failed,
}

/// Last candidate that connected, with a unix timestamp
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoodCandidate {
    pub candidate: Candidate,
    pub recorded_at: u64,
}

/// Persisted per-network selector state
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SelectorCursor {
    /// Index of the next candidate to hand out
    pub current_index: usize,
    pub last_outcome: Option<AttemptOutcome>,
    pub is_manual_mode: bool,
    pub preferred_protocol: Option<ConnectionKind>,
    pub preferred_port: Option<String>,
    #[serde(default)]
    pub last_good: Option<GoodCandidate>,
    /// The pinned candidate failed on a trusted network
    #[serde(default)]
    pub failing_over: bool,
}

impl SelectorCursor {
    fn restart(&mut self) {
        self.current_index = 0;
        self.last_outcome = None;
        self.failing_over = false;
    }

    fn apply_mode(&mut self, mode: &ConnectionMode) {
        match mode {
            ConnectionMode::Auto => {
                self.is_manual_mode = false;
                self.preferred_protocol = None;
                self.preferred_port = None;
            }
            ConnectionMode::Manual { kind, port } => {
                self.is_manual_mode = true;
                self.preferred_protocol = Some(*kind);
                self.preferred_port = Some(port.clone());
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectorPhase {
    Initial,
    Trying(Candidate),
    Settled(Candidate),
    Exhausted,
}

/// Read-only view for UI and diagnostics
#[derive(Debug, Clone)]
pub struct SelectorSnapshot {
    pub network_id: Option<String>,
    pub cursor: SelectorCursor,
    pub phase: SelectorPhase,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectorError {
    #[error("All {attempted} candidates failed")]
    Exhausted { attempted: usize },
}

/// Ranking and port policy
#[derive(Debug, Clone)]
pub struct SelectorConfig {
    pub ranking: Vec<ConnectionKind>,
    pub ports: PortTable,
    /// How long a successful port keeps priority
    pub good_protocol_ttl: Duration,
    /// Follow a failed manual candidate with the automatic list
    pub manual_fallback: bool,
    pub mode: ConnectionMode,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            ranking: CANONICAL_KINDS.to_vec(),
            ports: PortTable::default(),
            good_protocol_ttl: Duration::from_secs(12 * 60 * 60),
            manual_fallback: false,
            mode: ConnectionMode::Auto,
        }
    }
}

struct SelectorState {
    network_id: Option<String>,
    cursor: SelectorCursor,
    phase: SelectorPhase,
    trying_pinned: bool,
    mode: ConnectionMode,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Ordered candidate selection with a persisted cursor
pub struct ProtocolSelector {
    ranking: Vec<ConnectionKind>,
    ports: PortTable,
    good_protocol_ttl: Duration,
    manual_fallback: bool,
    persistence: Arc<dyn Persistence>,
    state: Mutex<SelectorState>,
    snapshot: watch::Sender<SelectorSnapshot>,
}

impl ProtocolSelector {
    pub fn new(config: SelectorConfig, persistence: Arc<dyn Persistence>) -> Self {
        let mut cursor = SelectorCursor::default();
        cursor.apply_mode(&config.mode);

        let (snapshot, _) = watch::channel(SelectorSnapshot {
            network_id: None,
            cursor: cursor.clone(),
            phase: SelectorPhase::Initial,
        });

        Self {
            ranking: config.ranking,
            ports: config.ports,
            good_protocol_ttl: config.good_protocol_ttl,
            manual_fallback: config.manual_fallback,
            persistence,
            state: Mutex::new(SelectorState {
                network_id: None,
                cursor,
                phase: SelectorPhase::Initial,
                trying_pinned: false,
                mode: config.mode,
            }),
            snapshot,
        }
    }

    /// Candidate to try next on `network`.
    ///
    /// `force_reset` restarts from the top of the list; otherwise the
    /// cursor carries over between calls.
    pub async fn next(&self, network: &NetworkContext, force_reset: bool) -> Result<Candidate, SelectorError> {
        let mut state = self.state.lock().await;
        self.activate_network(&mut state, network).await;

        if force_reset {
            debug!("Selector reset for network {}", network.id);
            state.cursor.restart();
            state.phase = SelectorPhase::Initial;
            self.persist(&state).await;
        }

        if let Some(pinned) = network.pinned_candidate() {
            if network.untrusted_by_choice || !state.cursor.failing_over {
                debug!("Using pinned {} for network {}", pinned, network.id);
                state.trying_pinned = true;
                state.phase = SelectorPhase::Trying(pinned.clone());
                self.publish(&state);
                return Ok(pinned);
            }
        }

        state.trying_pinned = false;
        let candidates = self.ordered(&state.mode, &state.cursor, network.pinned_candidate().as_ref());

        match candidates.get(state.cursor.current_index) {
            Some(candidate) => {
                debug!(
                    "Trying candidate {}/{}: {}",
                    state.cursor.current_index + 1,
                    candidates.len(),
                    candidate
                );
                state.phase = SelectorPhase::Trying(candidate.clone());
                self.publish(&state);
                Ok(candidate.clone())
            }
            None => {
                warn!("All {} candidates exhausted on network {}", candidates.len(), network.id);
                state.phase = SelectorPhase::Exhausted;
                self.publish(&state);
                Err(SelectorError::Exhausted {
                    attempted: candidates.len(),
                })
            }
        }
    }

    /// Move past `candidate` after it failed
    pub async fn record_failure(&self, candidate: &Candidate) {
        let mut state = self.state.lock().await;
        if !Self::is_current(&state, candidate) {
            debug!("Ignoring failure for stale candidate {}", candidate);
            return;
        }

        state.cursor.last_outcome = Some(AttemptOutcome::Failed);
        if state.trying_pinned {
            state.trying_pinned = false;
            state.cursor.failing_over = true;
        } else {
            state.cursor.current_index += 1;
        }
        info!("Candidate {} failed, cursor at {}", candidate, state.cursor.current_index);

        self.persist(&state).await;
        self.publish(&state);
    }

    /// Settle on `candidate` and remember its port for this network
    pub async fn record_success(&self, candidate: &Candidate) {
        let mut state = self.state.lock().await;
        if !Self::is_current(&state, candidate) {
            debug!("Ignoring success for stale candidate {}", candidate);
            return;
        }

        state.cursor.last_outcome = Some(AttemptOutcome::Succeeded);
        state.cursor.failing_over = false;
        state.cursor.last_good = Some(GoodCandidate {
            candidate: candidate.clone(),
            recorded_at: unix_now(),
        });
        state.trying_pinned = false;
        state.phase = SelectorPhase::Settled(candidate.clone());
        info!("Settled on {}", candidate);

        self.persist(&state).await;
        self.publish(&state);
    }

    /// Switch between automatic and manual selection; restarts the cursor
    pub async fn set_mode(&self, mode: ConnectionMode) {
        let mut state = self.state.lock().await;
        info!("Connection mode set to {:?}", mode);

        state.cursor.apply_mode(&mode);
        state.cursor.restart();
        state.mode = mode;
        state.phase = SelectorPhase::Initial;

        self.persist(&state).await;
        self.publish(&state);
    }

    /// Ordered list `next` would walk on `network`, without side effects
    pub async fn candidates(&self, network: &NetworkContext) -> Vec<Candidate> {
        let state = self.state.lock().await;
        let cursor = if state.network_id.as_deref() == Some(network.id.as_str()) {
            state.cursor.clone()
        } else {
            self.load_cursor(&network.id).await
        };

        let mut list: Vec<Candidate> = network.pinned_candidate().into_iter().collect();
        for candidate in self.ordered(&state.mode, &cursor, None) {
            if !list.contains(&candidate) {
                list.push(candidate);
            }
        }
        list
    }

    /// Non-blocking copy of the current state
    pub fn snapshot(&self) -> SelectorSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SelectorSnapshot> {
        self.snapshot.subscribe()
    }

    fn is_current(state: &SelectorState, candidate: &Candidate) -> bool {
        matches!(&state.phase, SelectorPhase::Trying(current) if current == candidate)
    }

    /// Swap in the cursor for `network` when the network changed.
    ///
    /// A stored cursor is resumed unless it already ran off the end.
    async fn activate_network(&self, state: &mut SelectorState, network: &NetworkContext) {
        if state.network_id.as_deref() == Some(network.id.as_str()) {
            return;
        }

        let mut cursor = self.load_cursor(&network.id).await;
        let mode_changed = cursor.is_manual_mode != matches!(state.mode, ConnectionMode::Manual { .. })
            || cursor.preferred_protocol != Self::mode_kind(&state.mode);
        cursor.apply_mode(&state.mode);

        let len = self.ordered(&state.mode, &cursor, None).len();
        if mode_changed || cursor.current_index >= len {
            cursor.restart();
        }

        info!(
            "Network changed to {} ({:?}), cursor at {}",
            network.id, network.kind, cursor.current_index
        );
        state.network_id = Some(network.id.clone());
        state.cursor = cursor;
        state.phase = SelectorPhase::Initial;
        state.trying_pinned = false;
    }

    fn mode_kind(mode: &ConnectionMode) -> Option<ConnectionKind> {
        match mode {
            ConnectionMode::Auto => None,
            ConnectionMode::Manual { kind, .. } => Some(*kind),
        }
    }

    async fn load_cursor(&self, network_id: &str) -> SelectorCursor {
        match self.persistence.load_cursor(network_id).await {
            Ok(cursor) => cursor.unwrap_or_default(),
            Err(e) => {
                warn!("Failed to load selector cursor for {}: {}", network_id, e);
                SelectorCursor::default()
            }
        }
    }

    fn ordered(
        &self,
        mode: &ConnectionMode,
        cursor: &SelectorCursor,
        exclude: Option<&Candidate>,
    ) -> Vec<Candidate> {
        let mut list: Vec<Candidate> = Vec::new();
        let mut push = |candidate: Candidate| {
            if Some(&candidate) != exclude && !list.contains(&candidate) {
                list.push(candidate);
            }
        };

        let include_automatic = match mode {
            ConnectionMode::Auto => true,
            ConnectionMode::Manual { kind, port } => {
                match Candidate::new(*kind, port.as_str()) {
                    Ok(candidate) => push(candidate),
                    Err(e) => warn!("Ignoring invalid manual candidate: {}", e),
                }
                self.manual_fallback
            }
        };

        if include_automatic {
            for kind in &self.ranking {
                let Some(port) = self.port_for(*kind, cursor) else {
                    debug!("No ports configured for {}, skipping", kind);
                    continue;
                };
                if let Ok(candidate) = Candidate::new(*kind, port) {
                    push(candidate);
                }
            }
        }

        list
    }

    /// Previously successful port for `kind` if still fresh, else the
    /// first configured port.
    fn port_for(&self, kind: ConnectionKind, cursor: &SelectorCursor) -> Option<String> {
        if let Some(good) = &cursor.last_good {
            let age = unix_now().saturating_sub(good.recorded_at);
            if good.candidate.kind() == kind && age < self.good_protocol_ttl.as_secs() {
                return Some(good.candidate.port().to_string());
            }
        }
        self.ports.first_port(kind).map(str::to_string)
    }

    async fn persist(&self, state: &SelectorState) {
        if let Some(network_id) = &state.network_id {
            if let Err(e) = self.persistence.save_cursor(network_id, &state.cursor).await {
                warn!("Failed to persist selector cursor for {}: {}", network_id, e);
            }
        }
    }

    fn publish(&self, state: &SelectorState) {
        self.snapshot.send_replace(SelectorSnapshot {
            network_id: state.network_id.clone(),
            cursor: state.cursor.clone(),
            phase: state.phase.clone(),
        });
    }
}
