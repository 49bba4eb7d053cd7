//! Forwarding rules in the host packet filter.
//!
//! The registry only talks to a [`FirewallBackend`]. Each live service maps to one
//! DNAT rule that rewrites TCP traffic for `virtual_address:virtual_port` to
//! `backend_address:backend_port`, kept in a dedicated chain hooked into the nat
//! `OUTPUT` path.

use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::sync::Arc;
use thiserror::Error;
use vipd_core::ServiceEntry;
use vipd_core::config::{FirewallConfig, FirewallKind};

pub mod iptables;
pub mod memory;

pub use iptables::IptablesFirewall;
pub use memory::{FirewallOp, MemoryFirewall};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ForwardRule {
    pub backend_address: Ipv4Addr,
    pub backend_port: u16,
    pub virtual_address: Ipv4Addr,
    pub virtual_port: u16,
}

impl From<&ServiceEntry> for ForwardRule {
    fn from(entry: &ServiceEntry) -> Self {
        Self {
            backend_address: entry.backend_address,
            backend_port: entry.backend_port,
            virtual_address: entry.virtual_address,
            virtual_port: entry.virtual_port,
        }
    }
}

impl ForwardRule {
    /// The rule in iptables syntax, without table or chain.
    #[must_use]
    pub fn rulespec(&self) -> Vec<String> {
        vec![
            "-p".to_string(),
            "tcp".to_string(),
            "-d".to_string(),
            self.virtual_address.to_string(),
            "--dport".to_string(),
            self.virtual_port.to_string(),
            "-j".to_string(),
            "DNAT".to_string(),
            "--to-destination".to_string(),
            format!("{}:{}", self.backend_address, self.backend_port),
        ]
    }
}

impl std::fmt::Display for ForwardRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.virtual_address, self.virtual_port, self.backend_address, self.backend_port
        )
    }
}

#[derive(Error, Debug)]
pub enum FirewallError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("`{command}` failed ({status}): {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },
    #[error("{0}")]
    Rejected(String),
}

/// The packet filter operations the registry relies on.
///
/// # Thread Safety
/// The registry serializes all mutating calls, but implementations are shared
/// behind an `Arc` and must be `Send + Sync`.
#[async_trait]
pub trait FirewallBackend: Send + Sync + std::fmt::Debug {
    /// Creates the managed chain and hooks it into the nat `OUTPUT` chain.
    /// Succeeds if both already exist.
    async fn initialize_chain(&self) -> Result<(), FirewallError>;

    /// Unhooks, flushes and deletes the managed chain. Succeeds if it is absent.
    async fn cleanup(&self) -> Result<(), FirewallError>;

    /// Installs the rule unless an identical one is present.
    async fn add_rule(&self, rule: &ForwardRule) -> Result<(), FirewallError>;

    /// Removes the rule. Fails if it is not installed.
    async fn remove_rule(&self, rule: &ForwardRule) -> Result<(), FirewallError>;
}

/// Builds the backend selected in the configuration.
pub fn from_config(config: &FirewallConfig) -> Arc<dyn FirewallBackend> {
    match config.backend {
        FirewallKind::Iptables => Arc::new(IptablesFirewall::new(
            config.iptables.clone(),
            config.chain.clone(),
        )),
        FirewallKind::Memory => Arc::new(MemoryFirewall::new()),
    }
}
