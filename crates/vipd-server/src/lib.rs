//! # vipd-server
//!
//! `vipd-server` is the daemon behind the `vipd` command. It hands out virtual
//! IPv4 addresses from a configured block, forwards each one to a real backend
//! with a DNAT rule, publishes `<name>.svc` in a hosts-style file, and answers
//! line commands on a Unix socket.
//!
//! ## Lifecycle
//!
//! 1.  **Startup**: [`run`] loads the configuration and opens the [`Registry`]
//!     from the persisted snapshot.
//! 2.  **Reconciliation**: A registry that matches the configuration is
//!     restored (rules and names rebuilt) when `restore_on_start` is set. A
//!     stale registry waits for an explicit `RESTORE`.
//! 3.  **Serving**: [`ipc::run_ipc_server`] handles one request per connection.
//! 4.  **Shutdown**: On Ctrl+C or SIGTERM the server stops accepting, finishes
//!     in-flight requests, optionally cleans up, and removes its socket.
//!
//! ## Entry Points
//!
//! *   **Main Loop**: [`run`]
//! *   **Configuration**: [`config_loader::ConfigLoader`]
//! *   **Requests**: [`ipc::handle_request`]

// =========================================================================
//  Strict Lints: Safety, Hygiene, and Documentation
// =========================================================================

// 1. Logic & Safety
#![warn(clippy::await_holding_lock)] // Prevent Async Deadlocks (Critical)
#![warn(clippy::wildcard_enum_match_arm)] // Force explicit enum matching
#![warn(clippy::redundant_pattern_matching)] // Catch redundant matches
#![warn(clippy::unused_async)] // Catch async functions that don't await

// 2. Numeric Safety (Critical for addresses/ports)
#![warn(clippy::cast_possible_truncation)] // Warn on u64 -> u32 (potential data loss)

// 3. Observability
#![warn(clippy::print_stdout)] // Ban println! (Use tracing::info!)

// 4. Import Hygiene
#![warn(clippy::wildcard_imports)] // Ban `use crate::*` (Explicit imports only)

// 5. Documentation
#![allow(missing_docs)]
#![allow(clippy::missing_errors_doc)]

pub mod allocator;
pub mod config_loader;
pub mod firewall;
pub mod ipc;
pub mod logging;
pub mod registry;
pub mod state;

pub use registry::{Registry, RegistryError};

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::{error, info, warn};
use vipd_core::ResolutionFile;

use crate::config_loader::ConfigLoader;
use crate::state::StateStore;

/// Overrides taken from the command line.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub config_path: Option<PathBuf>,
    pub socket_path: Option<PathBuf>,
}

/// Runs the daemon in the foreground until it is told to stop.
pub fn run(options: RunOptions) -> Result<()> {
    logging::init();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(options))
}

async fn async_main(options: RunOptions) -> Result<()> {
    info!("vipd starting... (version: {})", env!("CARGO_PKG_VERSION"));

    let mut config = ConfigLoader::load(options.config_path.as_deref())?.config;
    if let Some(socket_path) = options.socket_path {
        config.server.socket_path = socket_path;
    }

    let firewall = firewall::from_config(&config.firewall);
    let registry = Registry::open(
        config.network.ip_block,
        StateStore::new(config.server.state_path.clone()),
        ResolutionFile::with_path(config.network.hosts_file.clone()),
        firewall.clone(),
    )
    .await
    .context("Failed to open the service registry")?;

    if registry.is_stale().await {
        warn!("The configuration has changed since the last run. Run `vipd restore` to apply it.");
    } else if config.server.restore_on_start {
        match registry.restore().await {
            Ok(entries) => info!("Restored {} services on startup", entries.len()),
            Err(e) => warn!("Failed to restore services on startup: {e}"),
        }
    } else if let Err(e) = firewall.initialize_chain().await {
        warn!("Failed to initialize forwarding chain: {e}");
    }

    let socket_path = config.server.socket_path.clone();
    let listener = ipc::bind(&socket_path).await?;

    let served = ipc::run_ipc_server(listener, registry.clone(), shutdown_signal()).await;
    if let Err(e) = &served {
        error!("IPC server failed: {e}");
    }

    if config.server.cleanup_on_exit {
        info!("Removing forwarding rules and published names");
        if let Err(e) = registry.cleanup().await {
            warn!("Cleanup on exit failed: {e}");
        }
    }

    if let Err(e) = tokio::fs::remove_file(&socket_path).await {
        warn!("Failed to remove socket {}: {e}", socket_path.display());
    }
    info!("vipd stopped");
    served
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}
