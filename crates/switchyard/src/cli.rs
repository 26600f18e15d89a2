//! Command-line argument definitions.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use switchyard_core::{ConnectionKind, NetworkKind, ProtocolName};
use uuid::Uuid;

/// Switchyard - VPN protocol selection and config builder
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Settings file (.toml or .json)
    #[arg(long, env = "SWITCHYARD_SETTINGS")]
    pub settings: Option<PathBuf>,

    /// Data directory; overrides the settings file
    #[arg(long, env = "SWITCHYARD_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Session token for the credential API
    #[arg(long, env = "SWITCHYARD_SESSION", hide_env_values = true)]
    pub session: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Import an OpenVPN (.ovpn) or WireGuard (.conf) file
    Import {
        file: PathBuf,
        /// Format, when the extension is ambiguous
        #[arg(long)]
        protocol: Option<ProtocolName>,
    },
    /// List imported configs
    List,
    /// Remove an imported config and its file
    Remove { id: Uuid },
    /// Rename an imported config
    Rename { id: Uuid, name: String },
    /// Save the username and password for an imported config
    Credentials {
        id: Uuid,
        #[arg(long)]
        username: String,
        #[arg(long, env = "SWITCHYARD_CUSTOM_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Show the candidate order for a network
    Candidates {
        #[command(flatten)]
        network: NetworkArgs,
    },
    /// Render a config for a server
    Build {
        #[command(flatten)]
        server: ServerArgs,
        /// Connection kind; the first ranked kind when omitted
        #[arg(long)]
        kind: Option<ConnectionKind>,
        /// Port; the first configured port for the kind when omitted
        #[arg(long)]
        port: Option<String>,
    },
    /// Run a connect attempt against a dry-run tunnel
    Connect {
        #[command(flatten)]
        server: ServerArgs,
        /// Connect to an imported config instead of a server
        #[arg(long, conflicts_with = "server")]
        custom: Option<Uuid>,
        /// Username for the imported config; overrides the saved one
        #[arg(long, requires = "custom", requires = "password")]
        username: Option<String>,
        #[arg(long, requires = "username")]
        password: Option<String>,
        #[command(flatten)]
        network: NetworkArgs,
        /// Dry-run tunnel fails this many attempts before connecting
        #[arg(long, default_value_t = 0)]
        fail_first: u32,
        /// Restart the candidate list from the top
        #[arg(long)]
        reset: bool,
    },
    /// Print the effective settings as TOML
    Settings,
    /// Forget every cached credential and key
    Logout,
}

#[derive(clap::Args, Debug)]
pub struct ServerArgs {
    /// Server address (IP or hostname)
    #[arg(long)]
    pub server: Option<String>,
    /// TLS/IKE identity of the server
    #[arg(long)]
    pub hostname: Option<String>,
    /// Server WireGuard public key (base64)
    #[arg(long)]
    pub wg_public_key: Option<String>,
    /// Expected certificate name for OpenVPN
    #[arg(long)]
    pub x509_name: Option<String>,
}

#[derive(clap::Args, Debug)]
pub struct NetworkArgs {
    /// Network id (SSID or interface name)
    #[arg(long, default_value = "default")]
    pub network: String,
    #[arg(long, value_enum, default_value_t = NetworkArg::Wifi)]
    pub network_kind: NetworkArg,
    /// Pin a candidate for this network, e.g. TCP:443
    #[arg(long)]
    pub pin: Option<String>,
    /// Always use the pinned candidate
    #[arg(long)]
    pub untrusted: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum NetworkArg {
    Wifi,
    Cellular,
    Ethernet,
    None,
}

impl From<NetworkArg> for NetworkKind {
    fn from(arg: NetworkArg) -> Self {
        match arg {
            NetworkArg::Wifi => NetworkKind::Wifi,
            NetworkArg::Cellular => NetworkKind::Cellular,
            NetworkArg::Ethernet => NetworkKind::Ethernet,
            NetworkArg::None => NetworkKind::None,
        }
    }
}
