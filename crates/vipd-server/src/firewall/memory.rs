use super::{FirewallBackend, FirewallError, ForwardRule};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Operations of [`FirewallBackend`], used to inject failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FirewallOp {
    InitializeChain,
    Cleanup,
    AddRule,
    RemoveRule,
}

#[derive(Debug, Default)]
struct MemoryState {
    chain_present: bool,
    rules: Vec<ForwardRule>,
    failing: HashSet<FirewallOp>,
}

/// A packet filter that only exists in memory.
///
/// Selected with `backend = "memory"` when only name publication is wanted, and
/// used by the tests to observe the rule set.
#[derive(Debug, Default)]
pub struct MemoryFirewall {
    state: Mutex<MemoryState>,
}

impl MemoryFirewall {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes the next call of `op` fail.
    pub fn fail_next(&self, op: FirewallOp) {
        self.lock().failing.insert(op);
    }

    /// Installed rules, in installation order.
    pub fn rules(&self) -> Vec<ForwardRule> {
        self.lock().rules.clone()
    }

    pub fn chain_present(&self) -> bool {
        self.lock().chain_present
    }

    fn take_failure(state: &mut MemoryState, op: FirewallOp) -> Result<(), FirewallError> {
        if state.failing.remove(&op) {
            return Err(FirewallError::Rejected(format!("injected {op:?} failure")));
        }
        Ok(())
    }
}

#[async_trait]
impl FirewallBackend for MemoryFirewall {
    async fn initialize_chain(&self) -> Result<(), FirewallError> {
        let mut state = self.lock();
        Self::take_failure(&mut state, FirewallOp::InitializeChain)?;
        state.chain_present = true;
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), FirewallError> {
        let mut state = self.lock();
        Self::take_failure(&mut state, FirewallOp::Cleanup)?;
        state.chain_present = false;
        state.rules.clear();
        Ok(())
    }

    async fn add_rule(&self, rule: &ForwardRule) -> Result<(), FirewallError> {
        let mut state = self.lock();
        Self::take_failure(&mut state, FirewallOp::AddRule)?;
        if !state.rules.contains(rule) {
            state.rules.push(*rule);
        }
        Ok(())
    }

    async fn remove_rule(&self, rule: &ForwardRule) -> Result<(), FirewallError> {
        let mut state = self.lock();
        Self::take_failure(&mut state, FirewallOp::RemoveRule)?;
        let Some(index) = state.rules.iter().position(|r| r == rule) else {
            return Err(FirewallError::Rejected(format!("no such rule: {rule}")));
        };
        state.rules.remove(index);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn rule(last_octet: u8) -> ForwardRule {
        ForwardRule {
            backend_address: Ipv4Addr::LOCALHOST,
            backend_port: 8080,
            virtual_address: Ipv4Addr::new(172, 22, 0, last_octet),
            virtual_port: 80,
        }
    }

    #[tokio::test]
    async fn test_rules_are_unique() {
        let firewall = MemoryFirewall::new();
        firewall.initialize_chain().await.unwrap();
        firewall.add_rule(&rule(1)).await.unwrap();
        firewall.add_rule(&rule(1)).await.unwrap();
        firewall.add_rule(&rule(2)).await.unwrap();

        assert_eq!(firewall.rules(), vec![rule(1), rule(2)]);

        firewall.remove_rule(&rule(1)).await.unwrap();
        assert_eq!(firewall.rules(), vec![rule(2)]);
        assert!(firewall.remove_rule(&rule(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_cleanup_drops_everything() {
        let firewall = MemoryFirewall::new();
        firewall.initialize_chain().await.unwrap();
        firewall.add_rule(&rule(1)).await.unwrap();

        firewall.cleanup().await.unwrap();

        assert!(!firewall.chain_present());
        assert!(firewall.rules().is_empty());
    }

    #[tokio::test]
    async fn test_injected_failure_fires_once() {
        let firewall = MemoryFirewall::new();
        firewall.fail_next(FirewallOp::AddRule);

        assert!(firewall.add_rule(&rule(1)).await.is_err());
        assert!(firewall.add_rule(&rule(1)).await.is_ok());
    }
}
