use super::{FirewallBackend, FirewallError, ForwardRule};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Output;
use tokio::process::Command;
use tracing::{debug, info};

const TABLE: &str = "nat";
const HOOK_CHAIN: &str = "OUTPUT";

/// Drives the `iptables` command line tool.
#[derive(Debug, Clone)]
pub struct IptablesFirewall {
    program: PathBuf,
    chain: String,
}

impl IptablesFirewall {
    pub fn new(program: PathBuf, chain: String) -> Self {
        Self { program, chain }
    }

    /// Full argument list for one invocation; `-w` waits for the xtables lock.
    fn command_args(&self, args: &[&str]) -> Vec<String> {
        ["-w", "-t", TABLE]
            .iter()
            .chain(args)
            .map(|arg| (*arg).to_string())
            .collect()
    }

    fn rule_args(&self, action: &'static str, rule: &ForwardRule) -> Vec<String> {
        let mut args = self.command_args(&[action, &self.chain]);
        args.extend(rule.rulespec());
        args
    }

    async fn output(&self, args: &[String]) -> Result<Output, FirewallError> {
        debug!("Running {} {}", self.program.display(), args.join(" "));
        Command::new(&self.program)
            .args(args)
            .output()
            .await
            .map_err(|source| FirewallError::Spawn {
                program: self.program.display().to_string(),
                source,
            })
    }

    /// Runs a query such as `-C` or `-S`; a non-zero exit means "no".
    async fn check(&self, args: &[String]) -> Result<bool, FirewallError> {
        Ok(self.output(args).await?.status.success())
    }

    async fn exec(&self, args: &[String]) -> Result<(), FirewallError> {
        let output = self.output(args).await?;
        if output.status.success() {
            return Ok(());
        }
        Err(FirewallError::Command {
            command: format!("{} {}", self.program.display(), args.join(" ")),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    async fn chain_exists(&self) -> Result<bool, FirewallError> {
        self.check(&self.command_args(&["-S", &self.chain])).await
    }

    async fn hook_exists(&self) -> Result<bool, FirewallError> {
        self.check(&self.command_args(&["-C", HOOK_CHAIN, "-j", &self.chain]))
            .await
    }
}

#[async_trait]
impl FirewallBackend for IptablesFirewall {
    async fn initialize_chain(&self) -> Result<(), FirewallError> {
        if !self.chain_exists().await? {
            info!("Creating chain {} in table {}", self.chain, TABLE);
            self.exec(&self.command_args(&["-N", &self.chain])).await?;
        }
        if !self.hook_exists().await? {
            self.exec(&self.command_args(&["-A", HOOK_CHAIN, "-j", &self.chain]))
                .await?;
        }
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), FirewallError> {
        if !self.chain_exists().await? {
            return Ok(());
        }

        info!("Deleting chain {}", self.chain);
        if self.hook_exists().await? {
            self.exec(&self.command_args(&["-D", HOOK_CHAIN, "-j", &self.chain]))
                .await?;
        }
        self.exec(&self.command_args(&["-F", &self.chain])).await?;
        self.exec(&self.command_args(&["-X", &self.chain])).await
    }

    async fn add_rule(&self, rule: &ForwardRule) -> Result<(), FirewallError> {
        if self.check(&self.rule_args("-C", rule)).await? {
            return Ok(());
        }
        self.exec(&self.rule_args("-A", rule)).await
    }

    async fn remove_rule(&self, rule: &ForwardRule) -> Result<(), FirewallError> {
        self.exec(&self.rule_args("-D", rule)).await
    }
}
