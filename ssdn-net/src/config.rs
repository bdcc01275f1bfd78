//! Command-line flags and their validation.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use ipnet::Ipv4Net;
use thiserror::Error;

use crate::address::{Address, AddressError};
use crate::l2::L2_REGISTRY_SUFFIX;

pub const DEFAULT_MTU: usize = 32000;
pub const MIN_MTU: usize = 0x400;
pub const MAX_MTU: usize = 32767;

/// The tenant ID names the bridge, and Linux interface names top out at
/// 15 characters.
pub const TENANT_ID_MAX_LEN: usize = 15;

/// How containers reach the overlay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Routed; one tun per container.
    #[default]
    Tun,
    /// Routed; containers share a bridge behind a virtual gateway.
    Bridge,
    /// Bridged; Ethernet frames are carried between nodes.
    L2,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid tenant value '{0}'")]
    InvalidTenant(String),

    #[error("invalid tenant ID value '{0}'")]
    InvalidTenantId(String),

    #[error("tenant ID too long (max: 15 characters): {0}")]
    TenantIdTooLong(String),

    #[error("invalid MTU value {0} (must be between 1024 and 32767)")]
    InvalidMtu(usize),

    #[error("subnet {subnet} is not within network {network}")]
    SubnetOutsideNetwork { subnet: Ipv4Net, network: Ipv4Net },

    #[error("gateway {gateway} is not a host address of subnet {subnet}")]
    GatewayOutsideSubnet { gateway: Ipv4Addr, subnet: Ipv4Net },

    #[error("invalid listen address: {0}")]
    Listen(#[from] AddressError),

    #[error("listening on {0} requires --tls-cert and --tls-key")]
    ListenTlsRequired(String),

    #[error("--tls-cert and --tls-key must be given together")]
    IncompleteTls,
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Overlay network node
#[derive(Parser, Debug)]
#[command(name = "ssdn-net", version, about)]
pub struct Args {
    /// Tenant this node serves
    #[arg(long)]
    pub tenant: String,

    /// Short tenant identifier, used as the bridge name (defaults to the
    /// tenant, cut to 15 characters)
    #[arg(long)]
    pub tenant_id: Option<String>,

    /// How containers are attached
    #[arg(long, value_enum, default_value_t = Mode::Tun)]
    pub mode: Mode,

    /// MTU of overlay interfaces and peer frames
    #[arg(long, default_value_t = DEFAULT_MTU)]
    pub mtu: usize,

    /// Overlay network spanning all nodes
    #[arg(long, default_value = "192.168.0.0/16")]
    pub network: Ipv4Net,

    /// This node's share of the overlay network
    #[arg(long, default_value = "192.168.0.0/24")]
    pub subnet: Ipv4Net,

    /// Gateway address (defaults to the last host address of the subnet)
    #[arg(long)]
    pub gateway: Option<Ipv4Addr>,

    /// Listen URL for peer links, e.g. tcp://0.0.0.0:7000
    #[arg(long)]
    pub listen: Option<String>,

    /// IP advertised to peers (defaults to the listen IP)
    #[arg(long)]
    pub public: Option<IpAddr>,

    /// Peer URL to connect to (repeatable)
    #[arg(long = "peer")]
    pub peers: Vec<String>,

    /// PEM certificate chain for tcps listeners
    #[arg(long)]
    pub tls_cert: Option<PathBuf>,

    /// PEM private key for tcps listeners
    #[arg(long)]
    pub tls_key: Option<PathBuf>,

    /// PEM CA bundle for verifying tcps peers
    #[arg(long)]
    pub tls_ca: Option<PathBuf>,

    /// Directory holding per-tenant state
    #[arg(long, default_value = "/var/run/ssdn")]
    pub run_dir: PathBuf,

    /// Directory holding interface action scripts
    #[arg(long, default_value = "/etc/ssdn/actions")]
    pub actions_dir: PathBuf,

    /// Do not give the host an interface into the overlay
    #[arg(long)]
    pub no_host_tun: bool,

    /// Additional network routed through the host tun (repeatable)
    #[arg(long = "alt-network")]
    pub alternate_networks: Vec<Ipv4Net>,

    /// Directory of peer lists, one file per tenant, polled for changes
    #[arg(long)]
    pub registry_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub tenant: String,
    pub tenant_id: String,
    pub mode: Mode,
    pub mtu: usize,
    pub network: Ipv4Net,
    pub subnet: Ipv4Net,
    pub gateway: Ipv4Addr,
    pub listen: Option<Address>,
    pub peers: Vec<String>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub tls_ca: Option<PathBuf>,
    pub run_dir: PathBuf,
    pub actions_dir: PathBuf,
    pub host_tun: bool,
    pub alternate_networks: Vec<Ipv4Net>,
    pub registry_dir: Option<PathBuf>,
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

impl Config {
    pub fn from_args(args: Args) -> Result<Self> {
        if !valid_name(&args.tenant) {
            return Err(ConfigError::InvalidTenant(args.tenant));
        }

        let tenant_id = match args.tenant_id {
            Some(id) => {
                if id.len() > TENANT_ID_MAX_LEN {
                    return Err(ConfigError::TenantIdTooLong(id));
                }
                if !valid_name(&id) {
                    return Err(ConfigError::InvalidTenantId(id));
                }
                id
            }
            None => args.tenant.chars().take(TENANT_ID_MAX_LEN).collect(),
        };

        if !(MIN_MTU..=MAX_MTU).contains(&args.mtu) {
            return Err(ConfigError::InvalidMtu(args.mtu));
        }

        let network = args.network.trunc();
        let subnet = args.subnet.trunc();
        if !network.contains(&subnet) {
            return Err(ConfigError::SubnetOutsideNetwork { subnet, network });
        }

        let gateway = args
            .gateway
            .unwrap_or_else(|| Ipv4Addr::from(u32::from(subnet.broadcast()).wrapping_sub(1)));
        if !subnet.contains(&gateway)
            || gateway == subnet.network()
            || gateway == subnet.broadcast()
        {
            return Err(ConfigError::GatewayOutsideSubnet { gateway, subnet });
        }

        let has_cert = match (&args.tls_cert, &args.tls_key) {
            (Some(_), Some(_)) => true,
            (None, None) => false,
            _ => return Err(ConfigError::IncompleteTls),
        };

        let listen = match args.listen {
            Some(url) => {
                let mut address = Address::parse(&url)?;
                if address.tls() && !has_cert {
                    return Err(ConfigError::ListenTlsRequired(url));
                }
                if let Some(public) = args.public {
                    address = address.with_public(public);
                }
                Some(address)
            }
            None => None,
        };

        Ok(Self {
            tenant: args.tenant,
            tenant_id,
            mode: args.mode,
            mtu: args.mtu,
            network,
            subnet,
            gateway,
            listen,
            peers: args.peers,
            tls_cert: args.tls_cert,
            tls_key: args.tls_key,
            tls_ca: args.tls_ca,
            run_dir: args.run_dir,
            actions_dir: args.actions_dir,
            host_tun: !args.no_host_tun,
            alternate_networks: args.alternate_networks,
            registry_dir: args.registry_dir,
        })
    }

    /// Name of the tenant bridge in bridge and layer 2 modes.
    pub fn bridge_name(&self) -> &str {
        &self.tenant_id
    }

    /// Registry key this node advertises under. Layer 2 nodes only link
    /// with each other.
    pub fn registry_key(&self) -> String {
        match self.mode {
            Mode::L2 => format!("{}{}", self.tenant, L2_REGISTRY_SUFFIX),
            Mode::Tun | Mode::Bridge => self.tenant.clone(),
        }
    }

    /// URL advertised to peers. Without a listener this is
    /// `tcp://<gateway>:0`.
    pub fn advertise_url(&self) -> String {
        match &self.listen {
            Some(address) => address.public_url(),
            None => format!("tcp://{}:0", self.gateway),
        }
    }
}
