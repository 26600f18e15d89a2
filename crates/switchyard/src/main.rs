//! Switchyard: VPN protocol selection and config builder
//!
//! Wires the core to disk storage, the HTTPS credential API and the
//! hickory resolver, then runs one command. `connect` drives the full
//! orchestrator against a dry-run tunnel that prints the config.

mod cli;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use clap::Parser;
use cli::{Args, Commands, NetworkArgs, ServerArgs};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use switchyard_core::{
    ApiError, BuildContext, Candidate, ConfigTemplater, ConnectRequest, ConnectionConfig, ConnectionKind,
    ConnectionOrchestrator, ConnectionStateTracker, CredentialApi, CredentialStore, CustomConfigRepository,
    FailureKind, NetworkContext, ProtocolName, ProtocolSelector, RawStatus, ServerNode, Settings, TunnelOutcome,
    TunnelProvider, UserPass, WireGuardGrant, resolve_custom_dns,
};
use switchyard_net::{DnsConfig, DnsResolver, HttpClient, HttpClientConfig, HttpCredentialApi};
use switchyard_store::DiskStorage;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Stand-in when no API is configured; every fetch falls back to the cache
struct OfflineApi;

#[async_trait]
impl CredentialApi for OfflineApi {
    async fn fetch_openvpn_credentials(&self) -> Result<UserPass, ApiError> {
        Err(offline())
    }

    async fn fetch_ikev2_credentials(&self) -> Result<UserPass, ApiError> {
        Err(offline())
    }

    async fn fetch_wireguard_credentials(&self, _client_public_key: &str) -> Result<WireGuardGrant, ApiError> {
        Err(offline())
    }

    async fn fetch_server_config_template(&self) -> Result<String, ApiError> {
        Err(offline())
    }
}

fn offline() -> ApiError {
    ApiError::Network("no API base URL configured".to_string())
}

/// Prints the config instead of bringing a tunnel up.
///
/// Fails the first `fail_first` attempts so failover can be exercised
/// from the command line.
struct DryRunTunnel {
    tracker: Arc<ConnectionStateTracker>,
    fail_first: AtomicU32,
}

#[async_trait]
impl TunnelProvider for DryRunTunnel {
    async fn establish(&self, config: &ConnectionConfig) -> TunnelOutcome {
        self.tracker.observe(RawStatus::Connecting);

        let failing = self
            .fail_first
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            info!("Dry run: failing {}", config.candidate());
            self.tracker.observe(RawStatus::Disconnected);
            return TunnelOutcome::Failed(FailureKind::Network);
        }

        println!("# {} -> {}", config.candidate(), config.server_address());
        print!("{}", config.text());
        self.tracker.observe(RawStatus::Connected);
        TunnelOutcome::Connected
    }

    async fn stop(&self) {
        self.tracker.observe(RawStatus::Disconnected);
    }
}

struct App {
    settings: Settings,
    storage: Arc<DiskStorage>,
    templater: Arc<ConfigTemplater>,
    credentials: Arc<CredentialStore>,
    custom_configs: Arc<CustomConfigRepository>,
}

impl App {
    async fn open(args: &Args) -> Result<Self> {
        let settings = match &args.settings {
            Some(path) => Settings::load(path).with_context(|| format!("loading {}", path.display()))?,
            None => Settings::default(),
        };
        settings.validate()?;

        let data_dir = resolve_data_dir(args.data_dir.as_deref(), &settings)?;
        let storage = Arc::new(DiskStorage::new(&data_dir));
        storage.init().await?;

        let mut templater = ConfigTemplater::new(settings.ports.clone())
            .with_censorship_circumvention(settings.circumvent_censorship);
        if let Some(path) = &settings.bundled_cert_path {
            let pem = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading bundled certificate {}", path.display()))?;
            templater = templater.with_bundled_cert(pem);
        }

        let api: Arc<dyn CredentialApi> = match &settings.api_base_url {
            Some(base_url) => {
                let client = HttpClient::new(HttpClientConfig {
                    timeout: settings.credential_fetch_timeout(),
                    ..Default::default()
                });
                Arc::new(HttpCredentialApi::new(base_url, args.session.as_deref(), client)?)
            }
            None => {
                warn!("No API configured; only cached credentials are available");
                Arc::new(OfflineApi)
            }
        };
        let credentials = CredentialStore::new(api, storage.clone(), settings.credential_fetch_timeout());
        let templater = Arc::new(templater);
        let custom_configs = CustomConfigRepository::new(storage.clone(), templater.clone());

        Ok(Self {
            settings,
            storage,
            templater,
            credentials: Arc::new(credentials),
            custom_configs: Arc::new(custom_configs),
        })
    }

    fn dns_resolver(&self) -> Result<DnsResolver> {
        Ok(DnsResolver::new(DnsConfig {
            timeout: self.settings.dns_timeout(),
            ..Default::default()
        })?)
    }

    async fn import(&self, file: &Path, protocol: Option<ProtocolName>) -> Result<()> {
        let bytes = tokio::fs::read(file)
            .await
            .with_context(|| format!("reading {}", file.display()))?;
        let file_name = file
            .file_name()
            .and_then(|name| name.to_str())
            .context("import path has no file name")?;

        let descriptor = self.custom_configs.import(file_name, &bytes, protocol).await?;
        println!("{}", descriptor.id);
        Ok(())
    }

    async fn list(&self) -> Result<()> {
        for descriptor in self.custom_configs.list().await? {
            println!(
                "{}  {:<24} {:<9} {}:{} ({})",
                descriptor.id,
                descriptor.name,
                descriptor.protocol_type,
                descriptor.server_address,
                descriptor.port,
                descriptor.transport.as_str()
            );
        }
        Ok(())
    }

    async fn candidates(&self, args: &NetworkArgs) -> Result<()> {
        let network = network_context(args)?;
        let selector = ProtocolSelector::new(self.settings.selector_config(), self.storage.clone());
        for (index, candidate) in selector.candidates(&network).await.iter().enumerate() {
            println!("{:>2}. {}", index + 1, candidate);
        }
        Ok(())
    }

    async fn build(&self, server: ServerNode, kind: Option<ConnectionKind>, port: Option<String>) -> Result<()> {
        let kind = kind
            .or_else(|| self.settings.ranking.first().copied())
            .context("no connection kind ranked")?;
        let port = match port {
            Some(port) => port,
            None => self
                .templater
                .port_table()
                .first_port(kind)
                .with_context(|| format!("no port configured for {}", kind))?
                .to_string(),
        };
        let candidate = Candidate::new(kind, port)?;

        let credentials = self.credentials.get_credentials(candidate.protocol()).await?;
        if credentials.is_cached() {
            warn!("Using cached {} credentials", candidate.protocol());
        }

        let base_template = if candidate.protocol() == ProtocolName::OpenVpn {
            match self.credentials.server_config_template().await {
                Ok(template) => Some(template.text),
                Err(e) => {
                    info!("Using bundled OpenVPN template: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let dns_servers = match &self.settings.custom_dns {
            Some(value) => resolve_custom_dns(&self.dns_resolver()?, value, self.settings.dns_timeout()).await,
            None => Vec::new(),
        };

        let context = BuildContext {
            base_template: base_template.as_deref(),
            dns_servers: &dns_servers,
        };
        let config = self.templater.build_with(&candidate, &server, &credentials, &context)?;
        info!("Built {} config for {}", config.candidate(), config.server_address());
        print!("{}", config.text());
        Ok(())
    }

    async fn connect(&self, request: ConnectRequest, fail_first: u32) -> Result<()> {
        let tracker = Arc::new(ConnectionStateTracker::new(self.settings.status_debounce()));
        let tunnel = Arc::new(DryRunTunnel {
            tracker: tracker.clone(),
            fail_first: AtomicU32::new(fail_first),
        });
        let selector = Arc::new(ProtocolSelector::new(self.settings.selector_config(), self.storage.clone()));

        let mut orchestrator = ConnectionOrchestrator::new(
            selector,
            self.credentials.clone(),
            self.templater.clone(),
            self.custom_configs.clone(),
            tracker.clone(),
            tunnel,
        )
        .with_policy(self.settings.orchestrator_policy());
        if let Some(value) = &self.settings.custom_dns {
            orchestrator = orchestrator.with_custom_dns(value.clone(), Arc::new(self.dns_resolver()?));
        }

        let summary = orchestrator.connect(request).await?;
        info!(
            "Connected via {} to {} after {} attempt(s)",
            summary.candidate, summary.server_address, summary.attempts
        );

        let mut status = tracker.subscribe();
        let settle = self.settings.status_debounce() * 5;
        let settled = tokio::time::timeout(settle, status.wait_for(|state| state.is_connected()))
            .await
            .map(|result| result.map(|state| *state));
        match settled {
            Ok(Ok(state)) => info!("Tunnel state: {:?}", state),
            _ => warn!("Tunnel state did not settle: {:?}", tracker.current()),
        }

        orchestrator.disconnect().await;
        Ok(())
    }
}

fn server_node(args: ServerArgs) -> Result<ServerNode> {
    let address = args.server.filter(|s| !s.trim().is_empty());
    let Some(address) = address else {
        bail!("--server is required");
    };

    let mut node = ServerNode::new(address);
    if let Some(hostname) = args.hostname {
        node = node.with_hostname(hostname);
    }
    if let Some(key) = args.wg_public_key {
        node = node.with_wg_public_key(key);
    }
    if let Some(name) = args.x509_name {
        node = node.with_x509_name(name);
    }
    Ok(node)
}

fn network_context(args: &NetworkArgs) -> Result<NetworkContext> {
    let mut network = NetworkContext::new(args.network.as_str(), args.network_kind.into());
    if let Some(pin) = &args.pin {
        let (kind, port) = pin.split_once(':').context("pin must look like KIND:PORT")?;
        network = network.with_pinned(kind.parse()?, port);
    }
    if args.untrusted {
        network = network.untrusted();
    }
    Ok(network)
}

fn resolve_data_dir(flag: Option<&Path>, settings: &Settings) -> Result<PathBuf> {
    if let Some(dir) = flag.or(settings.data_dir.as_deref()) {
        return Ok(dir.to_path_buf());
    }
    dirs::data_local_dir()
        .map(|dir| dir.join("switchyard"))
        .context("no data directory; pass --data-dir")
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries command output.
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let app = App::open(&args).await?;

    match args.command {
        Commands::Import { file, protocol } => app.import(&file, protocol).await?,
        Commands::List => app.list().await?,
        Commands::Remove { id } => {
            app.custom_configs.remove(id).await?;
            info!("Removed {}", id);
        }
        Commands::Rename { id, name } => {
            let descriptor = app.custom_configs.rename(id, &name).await?;
            info!("Renamed {} to '{}'", id, descriptor.name);
        }
        Commands::Credentials { id, username, password } => {
            app.custom_configs
                .update_credentials(id, &UserPass::new(username, password))
                .await?;
            info!("Saved credentials for {}", id);
        }
        Commands::Candidates { network } => app.candidates(&network).await?,
        Commands::Build { server, kind, port } => app.build(server_node(server)?, kind, port).await?,
        Commands::Connect {
            server,
            custom,
            username,
            password,
            network,
            fail_first,
            reset,
        } => {
            let network = network_context(&network)?;
            let mut request = match custom {
                Some(id) => {
                    let credentials = username.zip(password).map(|(u, p)| UserPass::new(u, p));
                    ConnectRequest::custom(id, credentials, network)
                }
                None => ConnectRequest::server(server_node(server)?, network),
            };
            if reset {
                request = request.with_reset();
            }
            app.connect(request, fail_first).await?;
        }
        Commands::Settings => print!("{}", app.settings.to_toml()),
        Commands::Logout => {
            app.credentials.clear_all().await?;
            info!("Cached credentials cleared");
        }
    }

    Ok(())
}
