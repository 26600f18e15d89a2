//! Switchyard Core - VPN connection orchestration
//!
//! Picks a protocol and port, obtains credentials, renders a config the
//! OS tunnel can consume, hands it over and fails over to the next
//! candidate when an attempt does not come up.
//!
//! # Architecture
//!
//! ```text
//!                 connect / disconnect
//!                         │
//!                         ▼
//!        ┌────────────────────────────────┐
//!        │     ConnectionOrchestrator     │
//!        └──┬──────────┬───────────┬──────┘
//!           │          │           │
//!           ▼          ▼           ▼
//!   ┌────────────┐ ┌────────────┐ ┌────────────────┐
//!   │  Protocol  │ │ Credential │ │ ConfigTemplater│
//!   │  Selector  │ │   Store    │ │                │
//!   └─────┬──────┘ └──┬─────┬───┘ └───────┬────────┘
//!         │           │     │             │ ConnectionConfig
//!         ▼           ▼     ▼             ▼
//!     Persistence ◀───┘  CredentialApi  TunnelProvider ──▶ raw status
//!                                                            │
//!                                  ConnectionStateTracker ◀──┘
//! ```
//!
//! The core owns no I/O of its own: persistence, the credential API, DNS
//! resolution and the tunnel are traits implemented by the host.

mod credentials;
mod custom_config;
mod dns;
mod keys;
mod orchestrator;
mod persistence;
mod protocol;
mod remote;
mod selector;
mod settings;
mod state;
mod template;
mod tunnel;

pub use credentials::{
    CredentialError, CredentialSet, CredentialStore, Credentials, Freshness, ServerTemplate,
    WireGuardCredentials, SERVER_TEMPLATE_FILE, WIREGUARD_KEY_FILE,
};
pub use custom_config::{
    CustomConfigDescriptor, CustomConfigError, CustomConfigRepository, protocol_from_extension,
};
pub use dns::{CustomDns, HostResolver, resolve_custom_dns};
pub use keys::{KeyError, KeyPair, PrivateKey, PublicKey};
pub use orchestrator::{
    ConnectRequest, ConnectTarget, ConnectionOrchestrator, ConnectionSummary, OrchestratorError,
    OrchestratorPolicy, OrchestratorState,
};
pub use persistence::{MemoryPersistence, Persistence, StoreError};
pub use protocol::{
    CANONICAL_KINDS, Candidate, ConnectionKind, PortTable, ProtocolError, ProtocolName, Transport,
};
pub use remote::{ApiError, CredentialApi, UserPass, WireGuardGrant};
pub use selector::{
    AttemptOutcome, ConnectionMode, GoodCandidate, NetworkContext, NetworkKind, PinnedPreference,
    ProtocolSelector, SelectorConfig, SelectorCursor, SelectorError, SelectorPhase, SelectorSnapshot,
};
pub use settings::{Settings, SettingsError};
pub use state::{
    ConfigurationPhase, ConnectionState, ConnectionStateTracker, RawStatus, effective_state,
};
pub use template::{
    BuildContext, ConfigFormat, ConfigTemplater, ConnectionConfig, DEFAULT_OPENVPN_TEMPLATE,
    ParsedConfig, ServerNode, TemplateError,
};
pub use tunnel::{FailureKind, TunnelOutcome, TunnelProvider};
