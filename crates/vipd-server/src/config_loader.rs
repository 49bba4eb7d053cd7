use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use vipd_core::VipdConfig;

/// Environment variables that override single configuration values.
pub const ENV_SOCKET: &str = "VIPD_SOCKET";
pub const ENV_STATE_PATH: &str = "VIPD_STATE_PATH";
pub const ENV_IP_BLOCK: &str = "VIPD_IP_BLOCK";
pub const ENV_HOSTS_FILE: &str = "VIPD_HOSTS_FILE";
pub const ENV_FIREWALL: &str = "VIPD_FIREWALL";

#[derive(Debug, Clone)]
pub struct ConfigLoader {
    pub config: VipdConfig,
    pub path: PathBuf,
}

impl ConfigLoader {
    /// Loads `explicit_path`, or the default config file if none is given.
    ///
    /// A missing default file yields the defaults; a missing explicit file is an
    /// error. Environment overrides are applied last.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(explicit_path, |key| std::env::var(key).ok())
    }

    pub fn load_with_env(
        explicit_path: Option<&Path>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let path = explicit_path.map_or_else(Self::default_path, Path::to_path_buf);

        let mut config: VipdConfig = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))?
        } else if explicit_path.is_some() {
            anyhow::bail!("Config file {} does not exist", path.display());
        } else {
            VipdConfig::default()
        };

        Self::apply_env(&mut config, env)?;

        let block = config.network.ip_block;
        if block.trunc() != block {
            warn!("Address block {} has host bits set, using {}", block, block.trunc());
            config.network.ip_block = block.trunc();
        }

        info!("Configuration loaded from {}", path.display());
        Ok(Self { config, path })
    }

    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("dev", "vipd", "vipd").map_or_else(
            || PathBuf::from("vipd-config.toml"),
            |dirs| dirs.config_dir().join("config.toml"),
        )
    }

    fn apply_env(config: &mut VipdConfig, env: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(socket) = env(ENV_SOCKET) {
            config.server.socket_path = PathBuf::from(socket);
        }
        if let Some(state_path) = env(ENV_STATE_PATH) {
            config.server.state_path = PathBuf::from(state_path);
        }
        if let Some(block) = env(ENV_IP_BLOCK) {
            config.network.ip_block = block
                .parse()
                .with_context(|| format!("{ENV_IP_BLOCK}={block} is not an IPv4 CIDR block"))?;
        }
        if let Some(hosts_file) = env(ENV_HOSTS_FILE) {
            config.network.hosts_file = PathBuf::from(hosts_file);
        }
        if let Some(backend) = env(ENV_FIREWALL) {
            config.firewall.backend = backend
                .parse()
                .map_err(|e: String| anyhow::anyhow!("{ENV_FIREWALL}: {e}"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use vipd_core::config::FirewallKind;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
            [server]
            socket_path = "/run/vipd.sock"
            restore_on_start = false

            [network]
            ip_block = "10.20.0.0/16"
            "#,
        )
        .unwrap();

        let loader = ConfigLoader::load_with_env(Some(path.as_path()), no_env).unwrap();
        assert_eq!(loader.path, path);
        assert_eq!(loader.config.server.socket_path, PathBuf::from("/run/vipd.sock"));
        assert!(!loader.config.server.restore_on_start);
        assert_eq!(loader.config.network.ip_block.to_string(), "10.20.0.0/16");
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = ConfigLoader::load_with_env(Some(dir.path().join("nope.toml").as_path()), no_env);
        assert!(result.is_err());
    }

    #[test]
    fn test_env_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[network]\nip_block = \"10.0.0.0/24\"\n").unwrap();

        let env: HashMap<&str, &str> = [
            (ENV_IP_BLOCK, "10.0.1.0/24"),
            (ENV_FIREWALL, "memory"),
            (ENV_HOSTS_FILE, "/tmp/hosts"),
            (ENV_SOCKET, "/tmp/test.sock"),
            (ENV_STATE_PATH, "/tmp/state.json"),
        ]
        .into();
        let loader =
            ConfigLoader::load_with_env(Some(path.as_path()), |key| env.get(key).map(ToString::to_string))
                .unwrap();

        let config = loader.config;
        assert_eq!(config.network.ip_block.to_string(), "10.0.1.0/24");
        assert_eq!(config.firewall.backend, FirewallKind::Memory);
        assert_eq!(config.network.hosts_file, PathBuf::from("/tmp/hosts"));
        assert_eq!(config.server.socket_path, PathBuf::from("/tmp/test.sock"));
        assert_eq!(config.server.state_path, PathBuf::from("/tmp/state.json"));
    }

    #[test]
    fn test_invalid_env_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "").unwrap();

        let bad_block = |key: &str| (key == ENV_IP_BLOCK).then(|| "10.0.0.0/40".to_string());
        assert!(ConfigLoader::load_with_env(Some(path.as_path()), bad_block).is_err());

        let bad_backend = |key: &str| (key == ENV_FIREWALL).then(|| "pf".to_string());
        assert!(ConfigLoader::load_with_env(Some(path.as_path()), bad_backend).is_err());
    }

    #[test]
    fn test_host_bits_are_masked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[network]\nip_block = \"172.22.0.9/24\"\n").unwrap();

        let loader = ConfigLoader::load_with_env(Some(path.as_path()), no_env).unwrap();
        assert_eq!(loader.config.network.ip_block.to_string(), "172.22.0.0/24");
    }
}
