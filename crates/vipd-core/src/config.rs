use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;

pub const DEFAULT_SOCKET_PATH: &str = "/tmp/vipd.sock";
pub const DEFAULT_HOSTS_FILE: &str = "/etc/hosts";
pub const DEFAULT_CHAIN: &str = "VIPD";

/// The daemon configuration, read from `config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct VipdConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub firewall: FirewallConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerConfig {
    /// Unix domain socket the control protocol listens on.
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Where the registry snapshot is persisted.
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,

    /// Reinstall forwarding rules for persisted services when the daemon starts.
    /// Never applied when the persisted state was built under another configuration.
    #[serde(default = "default_true")]
    pub restore_on_start: bool,

    /// Remove the forwarding chain and managed host lines when the daemon exits.
    #[serde(default)]
    pub cleanup_on_exit: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            state_path: default_state_path(),
            restore_on_start: true,
            cleanup_on_exit: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkConfig {
    /// Block virtual addresses are allocated from.
    #[serde(default = "default_ip_block")]
    pub ip_block: Ipv4Net,

    /// Hosts-style file that publishes `<name>.svc` entries.
    #[serde(default = "default_hosts_file")]
    pub hosts_file: PathBuf,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ip_block: default_ip_block(),
            hosts_file: default_hosts_file(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FirewallKind {
    #[default]
    Iptables,
    /// Keeps rules in memory only. Names are still published.
    Memory,
}

impl FromStr for FirewallKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "iptables" => Ok(Self::Iptables),
            "memory" => Ok(Self::Memory),
            other => Err(format!(
                "unknown firewall backend '{other}' (expected 'iptables' or 'memory')"
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FirewallConfig {
    #[serde(default)]
    pub backend: FirewallKind,

    /// Name of the nat chain holding the DNAT rules.
    #[serde(default = "default_chain")]
    pub chain: String,

    /// The iptables executable.
    #[serde(default = "default_iptables")]
    pub iptables: PathBuf,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            backend: FirewallKind::default(),
            chain: default_chain(),
            iptables: default_iptables(),
        }
    }
}

fn default_socket_path() -> PathBuf {
    PathBuf::from(DEFAULT_SOCKET_PATH)
}

fn default_state_path() -> PathBuf {
    directories::ProjectDirs::from("dev", "vipd", "vipd").map_or_else(
        || PathBuf::from(".vipd/state.json"),
        |dirs| dirs.data_dir().join("state.json"),
    )
}

fn default_ip_block() -> Ipv4Net {
    Ipv4Net::new(Ipv4Addr::new(172, 22, 0, 0), 24).unwrap_or_default()
}

fn default_hosts_file() -> PathBuf {
    PathBuf::from(DEFAULT_HOSTS_FILE)
}

fn default_chain() -> String {
    DEFAULT_CHAIN.to_string()
}

fn default_iptables() -> PathBuf {
    PathBuf::from("iptables")
}

const fn default_true() -> bool {
    true
}
