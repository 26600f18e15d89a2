//! Connection Orchestrator
//!
//! Drives one connect request through selector, credentials, templater
//! and tunnel, failing over to the next candidate until something
//! connects, the list is exhausted, or the retry bound is hit.
//!
//! ```text
//!  Idle ──connect──▶ Preparing ──handoff ok──▶ Active
//!                      ▲    │
//!                      │  failure
//!                      │    ▼
//!                      └─ Failing ──exhausted / bound──▶ Idle
//! ```
//!
//! At most one attempt is in flight. A newer connect or disconnect cancels
//! the running attempt and waits for it to release the attempt slot; the
//! cancelled attempt returns [`OrchestratorError::Cancelled`] without
//! touching selector or credential state.

use crate::credentials::{CredentialError, CredentialStore};
use crate::custom_config::{CustomConfigError, CustomConfigRepository};
use crate::dns::{CustomDns, HostResolver, resolve_custom_dns};
use crate::protocol::{Candidate, ProtocolName};
use crate::remote::UserPass;
use crate::selector::{ConnectionMode, NetworkContext, ProtocolSelector, SelectorError};
use crate::state::{ConfigurationPhase, ConnectionStateTracker};
use crate::template::{BuildContext, ConfigTemplater, ConnectionConfig, ServerNode, TemplateError};
use crate::tunnel::{FailureKind, TunnelOutcome, TunnelProvider};
use std::future::Future;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Orchestrator lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrchestratorState {
    #[default]
    Idle,
    Preparing,
    Active,
    Failing,
}

impl OrchestratorState {
    pub fn is_active(&self) -> bool {
        matches!(self, OrchestratorState::Active)
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, OrchestratorState::Preparing | OrchestratorState::Failing)
    }
}

/// Where to connect
#[derive(Debug, Clone)]
pub enum ConnectTarget {
    /// A provider server; protocol and port come from the selector
    Server(ServerNode),
    /// A previously imported config
    Custom {
        id: Uuid,
        credentials: Option<UserPass>,
    },
}

#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub target: ConnectTarget,
    pub network: NetworkContext,
    /// Restart the candidate list from the top
    pub force_reset: bool,
}

impl ConnectRequest {
    pub fn server(server: ServerNode, network: NetworkContext) -> Self {
        Self {
            target: ConnectTarget::Server(server),
            network,
            force_reset: false,
        }
    }

    pub fn custom(id: Uuid, credentials: Option<UserPass>, network: NetworkContext) -> Self {
        Self {
            target: ConnectTarget::Custom { id, credentials },
            network,
            force_reset: false,
        }
    }

    pub fn with_reset(mut self) -> Self {
        self.force_reset = true;
        self
    }
}

/// What a successful connect settled on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSummary {
    pub candidate: Candidate,
    pub server_address: String,
    pub attempts: u32,
}

/// Orchestrator errors
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Connect attempt cancelled")]
    Cancelled,

    #[error("No candidate connected ({attempts} attempts)")]
    Exhausted { attempts: u32 },

    #[error("Stopped after {failures} consecutive failures")]
    RetryLimit { failures: u32 },

    #[error("Credential error: {0}")]
    Credentials(#[from] CredentialError),

    #[error("Config error: {0}")]
    Template(#[from] TemplateError),

    #[error("Custom config error: {0}")]
    CustomConfig(#[from] CustomConfigError),

    #[error("Tunnel failed: {0}")]
    TunnelFailed(FailureKind),
}

impl OrchestratorError {
    /// Errors that need the user to act before retrying
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrchestratorError::Cancelled)
    }
}

/// Retry and timeout policy
#[derive(Debug, Clone)]
pub struct OrchestratorPolicy {
    /// Upper bound on one tunnel establish call
    pub connect_timeout: Duration,
    /// Failed candidates in a row before giving up
    pub max_consecutive_failures: u32,
    pub dns_timeout: Duration,
}

impl Default for OrchestratorPolicy {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(20),
            max_consecutive_failures: 4,
            dns_timeout: Duration::from_secs(3),
        }
    }
}

struct CustomDnsSetting {
    value: CustomDns,
    resolver: Arc<dyn HostResolver>,
}

/// Await `future` unless `token` fires first
async fn guarded<F: Future>(token: &CancellationToken, future: F) -> Result<F::Output, OrchestratorError> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(OrchestratorError::Cancelled),
        output = future => Ok(output),
    }
}

fn ensure_live(token: &CancellationToken) -> Result<(), OrchestratorError> {
    if token.is_cancelled() {
        Err(OrchestratorError::Cancelled)
    } else {
        Ok(())
    }
}

/// Connects, fails over and disconnects
pub struct ConnectionOrchestrator {
    selector: Arc<ProtocolSelector>,
    credentials: Arc<CredentialStore>,
    templater: Arc<ConfigTemplater>,
    custom_configs: Arc<CustomConfigRepository>,
    tracker: Arc<ConnectionStateTracker>,
    tunnel: Arc<dyn TunnelProvider>,
    custom_dns: Option<CustomDnsSetting>,
    policy: OrchestratorPolicy,
    state: watch::Sender<OrchestratorState>,
    /// Held for the lifetime of one attempt
    attempt: tokio::sync::Mutex<()>,
    current: Mutex<CancellationToken>,
    last_server: Mutex<Option<String>>,
}

impl ConnectionOrchestrator {
    pub fn new(
        selector: Arc<ProtocolSelector>,
        credentials: Arc<CredentialStore>,
        templater: Arc<ConfigTemplater>,
        custom_configs: Arc<CustomConfigRepository>,
        tracker: Arc<ConnectionStateTracker>,
        tunnel: Arc<dyn TunnelProvider>,
    ) -> Self {
        let (state, _) = watch::channel(OrchestratorState::Idle);
        Self {
            selector,
            credentials,
            templater,
            custom_configs,
            tracker,
            tunnel,
            custom_dns: None,
            policy: OrchestratorPolicy::default(),
            state,
            attempt: tokio::sync::Mutex::new(()),
            current: Mutex::new(CancellationToken::new()),
            last_server: Mutex::new(None),
        }
    }

    pub fn with_policy(mut self, policy: OrchestratorPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Override issued DNS with `value`, resolving hostnames via `resolver`
    pub fn with_custom_dns(mut self, value: CustomDns, resolver: Arc<dyn HostResolver>) -> Self {
        self.custom_dns = Some(CustomDnsSetting { value, resolver });
        self
    }

    pub fn state(&self) -> OrchestratorState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<OrchestratorState> {
        self.state.subscribe()
    }

    pub fn selector(&self) -> &ProtocolSelector {
        &self.selector
    }

    pub fn tracker(&self) -> &ConnectionStateTracker {
        &self.tracker
    }

    /// Connect, cancelling any attempt already in flight
    pub async fn connect(&self, request: ConnectRequest) -> Result<ConnectionSummary, OrchestratorError> {
        let token = self.begin();
        let _slot = guarded(&token, self.attempt.lock()).await?;
        self.publish(OrchestratorState::Preparing);

        let result = match &request.target {
            ConnectTarget::Server(server) => self.connect_server(&request, server, &token).await,
            ConnectTarget::Custom { id, credentials } => {
                self.connect_custom(*id, credentials.as_ref(), &token).await
            }
        };

        match &result {
            Ok(summary) => info!(
                "Connected to {} via {} after {} attempt(s)",
                summary.server_address, summary.candidate, summary.attempts
            ),
            Err(OrchestratorError::Cancelled) => debug!("Connect attempt superseded"),
            Err(e) => {
                error!("Connect failed: {}", e);
                self.publish(OrchestratorState::Failing);
                self.publish(OrchestratorState::Idle);
            }
        }
        result
    }

    /// Cancel in-flight work and tear the tunnel down
    pub async fn disconnect(&self) {
        let token = self.begin();
        let _slot = self.attempt.lock().await;
        if token.is_cancelled() {
            debug!("Disconnect superseded");
            return;
        }

        info!("Disconnecting");
        self.tracker.set_configuration_state(ConfigurationPhase::Disabling);
        self.tunnel.stop().await;
        self.tracker.set_configuration_state(ConfigurationPhase::Initial);
        self.publish(OrchestratorState::Idle);
    }

    /// Disconnect and wipe every cached secret
    pub async fn logout(&self) -> Result<(), OrchestratorError> {
        self.disconnect().await;
        self.credentials.clear_all().await?;
        *self.last_server.lock().unwrap_or_else(PoisonError::into_inner) = None;
        info!("Logged out");
        Ok(())
    }

    /// Switch automatic/manual selection; the candidate list restarts
    pub async fn set_connection_mode(&self, mode: ConnectionMode) {
        self.selector.set_mode(mode).await;
    }

    /// Install a fresh token, cancelling the previous one
    fn begin(&self) -> CancellationToken {
        let token = CancellationToken::new();
        let previous = std::mem::replace(
            &mut *self.current.lock().unwrap_or_else(PoisonError::into_inner),
            token.clone(),
        );
        previous.cancel();
        token
    }

    fn publish(&self, state: OrchestratorState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                debug!("Orchestrator {:?} -> {:?}", *current, state);
                *current = state;
                true
            }
        });
    }

    fn server_changed(&self, server: &ServerNode) -> bool {
        let mut last = self.last_server.lock().unwrap_or_else(PoisonError::into_inner);
        let changed = last.as_deref() != Some(server.address.as_str());
        *last = Some(server.address.clone());
        changed
    }

    async fn connect_server(
        &self,
        request: &ConnectRequest,
        server: &ServerNode,
        token: &CancellationToken,
    ) -> Result<ConnectionSummary, OrchestratorError> {
        let mut reset = request.force_reset || self.server_changed(server);
        let mut attempts = 0u32;
        let mut failures = 0u32;

        loop {
            let candidate = match guarded(token, self.selector.next(&request.network, reset)).await? {
                Ok(candidate) => candidate,
                Err(SelectorError::Exhausted { attempted }) => {
                    warn!("Selector exhausted after {} candidates", attempted);
                    return Err(OrchestratorError::Exhausted { attempts });
                }
            };
            reset = false;
            attempts += 1;

            let credentials = match guarded(token, self.credentials.get_credentials(candidate.protocol())).await? {
                Ok(set) => set,
                Err(CredentialError::Unavailable(protocol)) => {
                    warn!("No {} credentials, skipping {}", protocol, candidate);
                    self.fail_candidate(&candidate, &mut failures, token).await?;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let base_template = match candidate.protocol() {
                ProtocolName::OpenVpn => match guarded(token, self.credentials.server_config_template()).await? {
                    Ok(template) => Some(template.text),
                    Err(e) => {
                        debug!("Using bundled OpenVPN template: {}", e);
                        None
                    }
                },
                _ => None,
            };
            let dns_servers = self.custom_dns_servers(token).await?;

            let context = BuildContext {
                base_template: base_template.as_deref(),
                dns_servers: &dns_servers,
            };
            let config = self.templater.build_with(&candidate, server, &credentials, &context)?;

            let outcome = self.hand_off(&config, token).await?;
            ensure_live(token)?;

            match outcome.failure() {
                None => {
                    self.selector.record_success(&candidate).await;
                    self.publish(OrchestratorState::Active);
                    return Ok(ConnectionSummary {
                        candidate,
                        server_address: config.server_address().to_string(),
                        attempts,
                    });
                }
                Some(failure) => {
                    warn!("{} failed: {}", candidate, failure);
                    if failure.is_auth() {
                        if let Err(e) = self.credentials.invalidate(candidate.protocol()).await {
                            warn!("Failed to invalidate {} credentials: {}", candidate.protocol(), e);
                        }
                    }
                    self.fail_candidate(&candidate, &mut failures, token).await?;
                }
            }
        }
    }

    /// Record a failed candidate and enforce the retry bound
    async fn fail_candidate(
        &self,
        candidate: &Candidate,
        failures: &mut u32,
        token: &CancellationToken,
    ) -> Result<(), OrchestratorError> {
        ensure_live(token)?;
        self.publish(OrchestratorState::Failing);
        self.selector.record_failure(candidate).await;

        *failures += 1;
        if *failures >= self.policy.max_consecutive_failures {
            return Err(OrchestratorError::RetryLimit { failures: *failures });
        }

        self.publish(OrchestratorState::Preparing);
        Ok(())
    }

    async fn connect_custom(
        &self,
        id: Uuid,
        credentials: Option<&UserPass>,
        token: &CancellationToken,
    ) -> Result<ConnectionSummary, OrchestratorError> {
        let descriptor = guarded(token, self.custom_configs.get(id)).await??;
        let text = guarded(token, self.custom_configs.load_file(&descriptor)).await??;
        // credentials on the request win over the saved pair
        let stored = match credentials {
            Some(_) => None,
            None => guarded(token, self.custom_configs.stored_credentials(&descriptor)).await??,
        };
        let config = self
            .templater
            .build_custom(&descriptor, &text, credentials.or(stored.as_ref()))?;

        let outcome = self.hand_off(&config, token).await?;
        ensure_live(token)?;

        match outcome.failure() {
            None => {
                self.publish(OrchestratorState::Active);
                Ok(ConnectionSummary {
                    candidate: config.candidate().clone(),
                    server_address: config.server_address().to_string(),
                    attempts: 1,
                })
            }
            Some(failure) => Err(OrchestratorError::TunnelFailed(failure)),
        }
    }

    async fn custom_dns_servers(&self, token: &CancellationToken) -> Result<Vec<IpAddr>, OrchestratorError> {
        let Some(setting) = &self.custom_dns else {
            return Ok(Vec::new());
        };

        let servers = guarded(
            token,
            resolve_custom_dns(setting.resolver.as_ref(), &setting.value, self.policy.dns_timeout),
        )
        .await?;
        if servers.is_empty() {
            debug!("Custom DNS unresolved, keeping issued DNS");
        }
        Ok(servers)
    }

    /// Give `config` to the tunnel and wait for a terminal outcome.
    ///
    /// The tracker reports `Connecting` for the whole call.
    async fn hand_off(
        &self,
        config: &ConnectionConfig,
        token: &CancellationToken,
    ) -> Result<TunnelOutcome, OrchestratorError> {
        self.tracker.set_configuration_state(ConfigurationPhase::Configuring);
        debug!("Handing {} config for {} to tunnel", config.candidate(), config.server_address());

        let establish = tokio::time::timeout(self.policy.connect_timeout, self.tunnel.establish(config));
        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            result = establish => Some(result.unwrap_or(TunnelOutcome::Failed(FailureKind::Timeout))),
        };

        let Some(outcome) = outcome else {
            self.tunnel.stop().await;
            self.tracker.set_configuration_state(ConfigurationPhase::Initial);
            return Err(OrchestratorError::Cancelled);
        };

        if !outcome.is_connected() {
            self.tunnel.stop().await;
        }
        self.tracker.set_configuration_state(ConfigurationPhase::Initial);
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::tests::FakeApi;
    use crate::keys::KeyPair;
    use crate::persistence::{MemoryPersistence, Persistence};
    use crate::protocol::{CANONICAL_KINDS, ConnectionKind, PortTable};
    use crate::selector::{NetworkKind, SelectorConfig, SelectorPhase};
    use crate::template::ConfigFormat;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Tunnel double replaying scripted outcomes, then connecting
    #[derive(Default)]
    struct ScriptedTunnel {
        outcomes: Mutex<VecDeque<TunnelOutcome>>,
        delay: Duration,
        established: Mutex<Vec<(Candidate, ConfigFormat)>>,
        usernames: Mutex<Vec<Option<String>>>,
        stops: AtomicUsize,
    }

    impl ScriptedTunnel {
        fn with_outcomes(outcomes: impl IntoIterator<Item = TunnelOutcome>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into_iter().collect()),
                ..Default::default()
            }
        }

        fn establish_count(&self) -> usize {
            self.established.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl TunnelProvider for ScriptedTunnel {
        async fn establish(&self, config: &ConnectionConfig) -> TunnelOutcome {
            self.established
                .lock()
                .unwrap()
                .push((config.candidate().clone(), config.format()));
            let username = config
                .credentials()
                .and_then(|set| set.credentials.user_pass())
                .map(|(username, _)| username.to_string());
            self.usernames.lock().unwrap().push(username);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(TunnelOutcome::Connected)
        }

        async fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Harness {
        orchestrator: Arc<ConnectionOrchestrator>,
        tunnel: Arc<ScriptedTunnel>,
        persistence: Arc<MemoryPersistence>,
        custom_configs: Arc<CustomConfigRepository>,
    }

    fn harness(api: FakeApi, tunnel: ScriptedTunnel, policy: OrchestratorPolicy) -> Harness {
        let persistence = Arc::new(MemoryPersistence::new());
        let tunnel = Arc::new(tunnel);
        let templater = Arc::new(ConfigTemplater::new(PortTable::default()));
        let selector = Arc::new(ProtocolSelector::new(SelectorConfig::default(), persistence.clone()));
        let credentials = Arc::new(CredentialStore::new(
            Arc::new(api),
            persistence.clone(),
            Duration::from_secs(5),
        ));
        let custom_configs = Arc::new(CustomConfigRepository::new(persistence.clone(), templater.clone()));
        let tracker = Arc::new(ConnectionStateTracker::new(Duration::from_millis(100)));

        let orchestrator = ConnectionOrchestrator::new(
            selector,
            credentials,
            templater,
            custom_configs.clone(),
            tracker,
            tunnel.clone(),
        )
        .with_policy(policy);

        Harness {
            orchestrator: Arc::new(orchestrator),
            tunnel,
            persistence,
            custom_configs,
        }
    }

    fn server() -> ServerNode {
        ServerNode::new("203.0.113.7").with_wg_public_key(KeyPair::generate().public.to_base64())
    }

    fn request() -> ConnectRequest {
        ConnectRequest::server(server(), NetworkContext::new("test-net", NetworkKind::Wifi))
    }

    fn generous() -> OrchestratorPolicy {
        OrchestratorPolicy {
            max_consecutive_failures: 10,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_connects_on_first_candidate() {
        let h = harness(FakeApi::working(), ScriptedTunnel::default(), generous());

        let summary = h.orchestrator.connect(request()).await.unwrap();

        assert_eq!(summary.candidate.kind(), ConnectionKind::WireGuard);
        assert_eq!(summary.server_address, "203.0.113.7");
        assert_eq!(summary.attempts, 1);
        assert_eq!(h.orchestrator.state(), OrchestratorState::Active);
        assert_eq!(h.orchestrator.tracker().configuration_state(), ConfigurationPhase::Initial);
        assert!(matches!(
            h.orchestrator.selector().snapshot().phase,
            SelectorPhase::Settled(_)
        ));
    }

    #[tokio::test]
    async fn test_fails_over_to_next_candidate() {
        let tunnel = ScriptedTunnel::with_outcomes([TunnelOutcome::Failed(FailureKind::Network)]);
        let h = harness(FakeApi::working(), tunnel, generous());

        let summary = h.orchestrator.connect(request()).await.unwrap();

        assert_eq!(summary.candidate.kind(), CANONICAL_KINDS[1]);
        assert_eq!(summary.attempts, 2);
        assert_eq!(h.tunnel.stops.load(Ordering::SeqCst), 1);

        let established = h.tunnel.established.lock().unwrap().clone();
        assert_eq!(established[1].1, ConfigFormat::OpenVpn);
    }

    #[tokio::test]
    async fn test_auth_failure_invalidates_credentials() {
        let tunnel = ScriptedTunnel::with_outcomes([TunnelOutcome::Failed(FailureKind::Auth)]);
        let h = harness(FakeApi::working(), tunnel, generous());

        h.orchestrator.connect(request()).await.unwrap();

        let wireguard = h.persistence.load_credentials(ProtocolName::WireGuard).await.unwrap();
        assert!(wireguard.is_none());
        let openvpn = h.persistence.load_credentials(ProtocolName::OpenVpn).await.unwrap();
        assert!(openvpn.is_some());
    }

    #[tokio::test]
    async fn test_network_failure_keeps_credentials() {
        let tunnel = ScriptedTunnel::with_outcomes([TunnelOutcome::Disconnected]);
        let h = harness(FakeApi::working(), tunnel, generous());

        h.orchestrator.connect(request()).await.unwrap();

        let wireguard = h.persistence.load_credentials(ProtocolName::WireGuard).await.unwrap();
        assert!(wireguard.is_some());
    }

    #[tokio::test]
    async fn test_exhaustion_is_terminal() {
        let failed = TunnelOutcome::Failed(FailureKind::Network);
        let h = harness(FakeApi::working(), ScriptedTunnel::with_outcomes([failed; 8]), generous());
        let mut states = h.orchestrator.subscribe();

        let result = h.orchestrator.connect(request()).await;

        assert!(matches!(result, Err(OrchestratorError::Exhausted { attempts: 4 })));
        assert_eq!(h.tunnel.establish_count(), 4);
        assert_eq!(h.orchestrator.state(), OrchestratorState::Idle);
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), OrchestratorState::Idle);
    }

    #[tokio::test]
    async fn test_retry_bound() {
        let failed = TunnelOutcome::Failed(FailureKind::Timeout);
        let policy = OrchestratorPolicy {
            max_consecutive_failures: 2,
            ..Default::default()
        };
        let h = harness(FakeApi::working(), ScriptedTunnel::with_outcomes([failed; 8]), policy);

        let result = h.orchestrator.connect(request()).await;

        assert!(matches!(result, Err(OrchestratorError::RetryLimit { failures: 2 })));
        assert_eq!(h.tunnel.establish_count(), 2);
    }

    #[tokio::test]
    async fn test_missing_credentials_never_reach_tunnel() {
        let h = harness(FakeApi::failing(), ScriptedTunnel::default(), generous());

        let result = h.orchestrator.connect(request()).await;

        assert!(matches!(result, Err(OrchestratorError::Exhausted { .. })));
        assert_eq!(h.tunnel.establish_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_server_is_terminal() {
        let h = harness(FakeApi::working(), ScriptedTunnel::default(), generous());
        let request = ConnectRequest::server(ServerNode::new(""), NetworkContext::new("n", NetworkKind::Ethernet));

        let result = h.orchestrator.connect(request).await;

        assert!(matches!(result, Err(OrchestratorError::Template(_))));
        assert_eq!(h.tunnel.establish_count(), 0);
        assert_eq!(h.orchestrator.state(), OrchestratorState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tunnel_timeout_counts_as_failure() {
        let tunnel = ScriptedTunnel {
            delay: Duration::from_secs(60),
            ..Default::default()
        };
        let policy = OrchestratorPolicy {
            max_consecutive_failures: 1,
            ..Default::default()
        };
        let h = harness(FakeApi::working(), tunnel, policy);

        let result = h.orchestrator.connect(request()).await;

        assert!(matches!(result, Err(OrchestratorError::RetryLimit { failures: 1 })));
        assert_eq!(h.tunnel.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_connect_cancels_first() {
        let api = FakeApi {
            delay: Duration::from_secs(2),
            ..FakeApi::working()
        };
        let h = harness(api, ScriptedTunnel::default(), generous());

        let first = {
            let orchestrator = h.orchestrator.clone();
            tokio::spawn(async move { orchestrator.connect(request()).await })
        };
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(h.orchestrator.state(), OrchestratorState::Preparing);

        let second = h.orchestrator.connect(request()).await.unwrap();
        let first = first.await.unwrap();

        assert!(matches!(first, Err(OrchestratorError::Cancelled)));
        assert_eq!(second.attempts, 1);
        assert_eq!(h.tunnel.establish_count(), 1);
        assert_eq!(h.orchestrator.state(), OrchestratorState::Active);
        assert_eq!(h.orchestrator.selector().snapshot().cursor.current_index, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_in_flight_attempt() {
        let tunnel = ScriptedTunnel {
            delay: Duration::from_secs(10),
            ..Default::default()
        };
        let h = harness(FakeApi::working(), tunnel, generous());

        let attempt = {
            let orchestrator = h.orchestrator.clone();
            tokio::spawn(async move { orchestrator.connect(request()).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.tunnel.establish_count(), 1);

        h.orchestrator.disconnect().await;

        assert!(matches!(attempt.await.unwrap(), Err(OrchestratorError::Cancelled)));
        assert_eq!(h.orchestrator.state(), OrchestratorState::Idle);
        assert_eq!(h.orchestrator.tracker().configuration_state(), ConfigurationPhase::Initial);
        assert_eq!(h.tunnel.stops.load(Ordering::SeqCst), 2);
        assert_eq!(
            h.orchestrator.selector().snapshot().cursor.last_outcome,
            None,
            "cancelled attempt must not record an outcome"
        );
    }

    #[tokio::test]
    async fn test_custom_config_connect() {
        let h = harness(FakeApi::working(), ScriptedTunnel::default(), generous());
        let descriptor = h
            .custom_configs
            .import("work.ovpn", b"client\nproto tcp\nremote vpn.example.org 443\n", None)
            .await
            .unwrap();
        let network = NetworkContext::new("test-net", NetworkKind::Wifi);

        let summary = h
            .orchestrator
            .connect(ConnectRequest::custom(descriptor.id, None, network))
            .await
            .unwrap();

        assert_eq!(summary.server_address, "vpn.example.org");
        assert_eq!(summary.candidate.to_string(), "TCP:443");
        assert_eq!(h.orchestrator.selector().snapshot().phase, SelectorPhase::Initial);
    }

    #[tokio::test]
    async fn test_custom_config_uses_saved_credentials() {
        let h = harness(FakeApi::working(), ScriptedTunnel::default(), generous());
        let descriptor = h
            .custom_configs
            .import("auth.ovpn", b"client\nproto udp\nremote vpn.example.org 1194\nauth-user-pass\n", None)
            .await
            .unwrap();
        assert!(descriptor.auth_required);
        let network = NetworkContext::new("test-net", NetworkKind::Wifi);

        let missing = h
            .orchestrator
            .connect(ConnectRequest::custom(descriptor.id, None, network.clone()))
            .await;
        assert!(matches!(
            missing,
            Err(OrchestratorError::Template(TemplateError::MissingCredentials(ProtocolName::OpenVpn)))
        ));
        assert_eq!(h.tunnel.establish_count(), 0);

        h.custom_configs
            .update_credentials(descriptor.id, &UserPass::new("saved-user", "saved-pass"))
            .await
            .unwrap();
        h.orchestrator
            .connect(ConnectRequest::custom(descriptor.id, None, network.clone()))
            .await
            .unwrap();

        let explicit = UserPass::new("typed-user", "typed-pass");
        h.orchestrator
            .connect(ConnectRequest::custom(descriptor.id, Some(explicit), network))
            .await
            .unwrap();

        let usernames = h.tunnel.usernames.lock().unwrap().clone();
        assert_eq!(
            usernames,
            vec![Some("saved-user".to_string()), Some("typed-user".to_string())]
        );
    }

    #[tokio::test]
    async fn test_custom_config_failure_is_terminal() {
        let tunnel = ScriptedTunnel::with_outcomes([TunnelOutcome::Failed(FailureKind::Rejected)]);
        let h = harness(FakeApi::working(), tunnel, generous());
        let descriptor = h
            .custom_configs
            .import("home.conf", b"[Interface]\nPrivateKey = x\n[Peer]\nEndpoint = 10.0.0.1:51820\n", None)
            .await
            .unwrap();
        let network = NetworkContext::new("test-net", NetworkKind::Wifi);

        let result = h
            .orchestrator
            .connect(ConnectRequest::custom(descriptor.id, None, network))
            .await;

        assert!(matches!(result, Err(OrchestratorError::TunnelFailed(FailureKind::Rejected))));
        assert_eq!(h.tunnel.establish_count(), 1);
    }

    #[tokio::test]
    async fn test_logout_clears_credentials() {
        let h = harness(FakeApi::working(), ScriptedTunnel::default(), generous());
        h.orchestrator.connect(request()).await.unwrap();
        assert!(h.persistence.file_count() > 0);

        h.orchestrator.logout().await.unwrap();

        for protocol in ProtocolName::all() {
            assert!(h.persistence.load_credentials(*protocol).await.unwrap().is_none());
        }
        assert_eq!(h.persistence.file_count(), 0);
        assert_eq!(h.orchestrator.state(), OrchestratorState::Idle);
    }

    #[tokio::test]
    async fn test_mode_change_restarts_list() {
        let tunnel = ScriptedTunnel::with_outcomes([TunnelOutcome::Failed(FailureKind::Network)]);
        let h = harness(FakeApi::working(), tunnel, generous());
        h.orchestrator.connect(request()).await.unwrap();

        h.orchestrator
            .set_connection_mode(ConnectionMode::Manual {
                kind: ConnectionKind::Tcp,
                port: "8080".into(),
            })
            .await;
        let summary = h.orchestrator.connect(request()).await.unwrap();

        assert_eq!(summary.candidate.to_string(), "TCP:8080");
    }
}
