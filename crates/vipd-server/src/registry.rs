//! The service registry.
//!
//! [`Registry`] owns the entry table and the address allocator and keeps three
//! pieces of external state in step with them: the persisted snapshot, the
//! forwarding rules and the resolution file. Every mutating operation runs under
//! one write lock, start to finish, so concurrent requests never observe or
//! produce a half-applied change.
//!
//! ## Configuration changes
//!
//! The snapshot records the address block and resolution file it was built
//! under. If either differs from the running configuration the registry starts
//! *stale*: `add` and `delete` are refused until [`Registry::restore`] has moved
//! every entry into the configured block and rebuilt the rules.
//!
//! ## Partial failures
//!
//! Once a change is persisted it is not rolled back. A failure to install a rule
//! or rewrite the resolution file after that point is returned to the caller and
//! the entry stays registered; `restore` reconciles.

use crate::allocator::{AddressAllocator, BlockExhausted};
use crate::firewall::{FirewallBackend, FirewallError, ForwardRule};
use crate::state::{RegistryState, StateStore, StoreError};
use ipnet::Ipv4Net;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};
use vipd_core::ResolutionFile;
use vipd_core::ServiceEntry;
use vipd_core::service::is_valid_name;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Entry for service {0} already exists")]
    DuplicateService(String),
    #[error("Service not found")]
    ServiceNotFound,
    #[error("IP block exhausted")]
    IpBlockExhausted,
    #[error("The configuration has changed. Please run the restore command.")]
    ConfigurationStale,
    #[error("Invalid service name '{0}'")]
    InvalidName(String),
    #[error("Failed to persist registry state: {0}")]
    Persistence(#[from] StoreError),
    #[error("Failed to sync forwarding rules: {0}")]
    RuleSync(#[from] FirewallError),
    #[error("Failed to update resolution file {}: {source}", path.display())]
    ResolutionFile {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl From<BlockExhausted> for RegistryError {
    fn from(_: BlockExhausted) -> Self {
        Self::IpBlockExhausted
    }
}

#[derive(Debug)]
struct Inner {
    entries: BTreeMap<String, ServiceEntry>,
    allocator: AddressAllocator,
    stale: bool,
}

fn address_in_use(entries: &BTreeMap<String, ServiceEntry>, address: Ipv4Addr) -> bool {
    entries.values().any(|entry| entry.virtual_address == address)
}

/// A cheap, cloneable handle to the shared registry.
#[derive(Debug, Clone)]
pub struct Registry {
    inner: Arc<RwLock<Inner>>,
    store: Arc<StateStore>,
    firewall: Arc<dyn FirewallBackend>,
    resolution: ResolutionFile,
}

impl Registry {
    /// Loads the persisted snapshot (if any) under the given configuration.
    ///
    /// # Errors
    ///
    /// Fails if the state file exists but cannot be read or parsed. There is no
    /// safe way to continue from a corrupt snapshot.
    pub async fn open(
        block: Ipv4Net,
        store: StateStore,
        resolution: ResolutionFile,
        firewall: Arc<dyn FirewallBackend>,
    ) -> Result<Self, RegistryError> {
        let inner = match store.load().await? {
            None => {
                info!("No registry state at {}, starting empty", store.path().display());
                Inner {
                    entries: BTreeMap::new(),
                    allocator: AddressAllocator::new(block),
                    stale: false,
                }
            }
            Some(state) => {
                let same_block = state.block == block;
                let same_file = state.resolution_file == resolution.path();
                if !same_block {
                    warn!("Address block changed from {} to {}", state.block, block);
                }
                if !same_file {
                    warn!(
                        "Resolution file changed from {} to {}",
                        state.resolution_file.display(),
                        resolution.path().display()
                    );
                }

                let allocator = if same_block {
                    AddressAllocator::from_parts(block, state.cursor, state.free_list)
                } else {
                    AddressAllocator::with_free_list(block, state.free_list)
                };

                info!("Loaded {} services from {}", state.entries.len(), store.path().display());
                Inner {
                    entries: state.entries,
                    allocator,
                    stale: !(same_block && same_file),
                }
            }
        };

        Ok(Self {
            inner: Arc::new(RwLock::new(inner)),
            store: Arc::new(store),
            firewall,
            resolution,
        })
    }

    /// True while the persisted state does not match the configuration.
    pub async fn is_stale(&self) -> bool {
        self.inner.read().await.stale
    }

    fn snapshot(
        &self,
        entries: &BTreeMap<String, ServiceEntry>,
        allocator: &AddressAllocator,
    ) -> RegistryState {
        RegistryState {
            entries: entries.clone(),
            cursor: allocator.cursor(),
            free_list: allocator.free_list().to_vec(),
            block: allocator.block(),
            resolution_file: self.resolution.path().to_path_buf(),
        }
    }

    async fn persist(&self, inner: &Inner) -> Result<(), RegistryError> {
        let state = self.snapshot(&inner.entries, &inner.allocator);
        self.store.save(&state).await?;
        Ok(())
    }

    async fn publish(
        &self,
        entries: &BTreeMap<String, ServiceEntry>,
        include: bool,
    ) -> Result<(), RegistryError> {
        let entries: Vec<ServiceEntry> = entries.values().cloned().collect();
        self.resolution
            .rewrite(&entries, include)
            .await
            .map_err(|source| RegistryError::ResolutionFile {
                path: self.resolution.path().to_path_buf(),
                source,
            })
    }

    /// Registers a service and starts forwarding its virtual address.
    pub async fn add(
        &self,
        name: &str,
        backend_address: Ipv4Addr,
        backend_port: u16,
        virtual_port: u16,
    ) -> Result<ServiceEntry, RegistryError> {
        let mut inner = self.inner.write().await;
        if inner.stale {
            return Err(RegistryError::ConfigurationStale);
        }
        if !is_valid_name(name) {
            return Err(RegistryError::InvalidName(name.to_string()));
        }
        if inner.entries.contains_key(name) {
            return Err(RegistryError::DuplicateService(name.to_string()));
        }

        let previous_allocator = inner.allocator.clone();
        let Inner {
            entries, allocator, ..
        } = &mut *inner;
        let virtual_address = allocator.allocate(|address| address_in_use(entries, address))?;

        let entry = ServiceEntry {
            name: name.to_string(),
            backend_address,
            backend_port,
            virtual_address,
            virtual_port,
        };
        inner.entries.insert(entry.name.clone(), entry.clone());

        if let Err(e) = self.persist(&inner).await {
            inner.entries.remove(name);
            inner.allocator = previous_allocator;
            return Err(e);
        }
        info!("Added service {} ({})", name, ForwardRule::from(&entry));

        if let Err(e) = self.firewall.add_rule(&ForwardRule::from(&entry)).await {
            warn!("Service {} is registered but its rule is missing: {}", name, e);
            return Err(e.into());
        }
        if let Err(e) = self.publish(&inner.entries, true).await {
            warn!("Service {} is registered but not published: {}", name, e);
            return Err(e);
        }

        Ok(entry)
    }

    /// Stops forwarding a service and forgets it.
    ///
    /// The rule is removed first; if that fails nothing else changes.
    pub async fn delete(&self, name: &str) -> Result<(), RegistryError> {
        let mut inner = self.inner.write().await;
        if inner.stale {
            return Err(RegistryError::ConfigurationStale);
        }
        let entry = inner
            .entries
            .get(name)
            .cloned()
            .ok_or(RegistryError::ServiceNotFound)?;

        self.firewall.remove_rule(&ForwardRule::from(&entry)).await?;

        inner.entries.remove(name);
        inner.allocator.release(entry.virtual_address);
        info!("Deleted service {} ({})", name, entry.virtual_address);

        self.persist(&inner).await?;
        self.publish(&inner.entries, true).await
    }

    pub async fn resolve(&self, name: &str) -> Result<ServiceEntry, RegistryError> {
        self.inner
            .read()
            .await
            .entries
            .get(name)
            .cloned()
            .ok_or(RegistryError::ServiceNotFound)
    }

    /// All services, ordered by name.
    pub async fn list(&self) -> Vec<ServiceEntry> {
        self.inner.read().await.entries.values().cloned().collect()
    }

    /// Rebuilds rules, addresses and the resolution file from the registry.
    ///
    /// Entries whose address is outside the configured block get a new one. The
    /// rule chain is flushed and recreated, so forwarding briefly stops. This is
    /// the only way out of the stale state, and it is idempotent.
    pub async fn restore(&self) -> Result<Vec<ServiceEntry>, RegistryError> {
        let mut inner = self.inner.write().await;

        // Work on copies so running out of addresses leaves everything as it was.
        let mut entries = inner.entries.clone();
        let mut allocator = inner.allocator.clone();
        let displaced: Vec<String> = entries
            .values()
            .filter(|entry| !allocator.contains(entry.virtual_address))
            .map(|entry| entry.name.clone())
            .collect();
        for name in displaced {
            let address = allocator.allocate(|address| address_in_use(&entries, address))?;
            if let Some(entry) = entries.get_mut(&name) {
                info!("Moving service {} from {} to {}", name, entry.virtual_address, address);
                entry.virtual_address = address;
            }
        }

        self.firewall.cleanup().await?;
        self.firewall.initialize_chain().await?;

        self.store.save(&self.snapshot(&entries, &allocator)).await?;
        inner.entries = entries;
        inner.allocator = allocator;
        if inner.stale {
            info!("Registry state now matches the configuration");
            inner.stale = false;
        }

        let mut first_error = None;
        for entry in inner.entries.values() {
            if let Err(e) = self.firewall.add_rule(&ForwardRule::from(entry)).await {
                warn!("Failed to install rule for {}: {}", entry.name, e);
                first_error.get_or_insert(e);
            }
        }
        self.publish(&inner.entries, true).await?;
        if let Some(e) = first_error {
            return Err(e.into());
        }

        info!("Restored {} services", inner.entries.len());
        Ok(inner.entries.values().cloned().collect())
    }

    /// Removes the rule chain and the managed resolution lines.
    ///
    /// The persisted registry is left alone so a later `restore` rebuilds
    /// everything.
    pub async fn cleanup(&self) -> Result<(), RegistryError> {
        let inner = self.inner.write().await;
        self.firewall.cleanup().await?;
        self.publish(&inner.entries, false).await?;
        info!("Removed forwarding rules and published names");
        Ok(())
    }
}
