use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Suffix appended to service names in the resolution file.
pub const HOST_SUFFIX: &str = "svc";

/// One managed service: a virtual address/port that is forwarded to a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub name: String,
    pub backend_address: Ipv4Addr,
    pub backend_port: u16,
    /// The service answers on this address, allocated from the configured block.
    pub virtual_address: Ipv4Addr,
    pub virtual_port: u16,
}

impl ServiceEntry {
    /// The name other processes resolve, e.g. `web.svc`.
    #[must_use]
    pub fn hostname(&self) -> String {
        format!("{}.{HOST_SUFFIX}", self.name)
    }
}

impl std::fmt::Display for ServiceEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}={}:{}->{}:{}",
            self.name,
            self.virtual_address,
            self.virtual_port,
            self.backend_address,
            self.backend_port
        )
    }
}

/// Returns true if `name` can be used as a service name.
///
/// Names travel through a whitespace-delimited protocol and end up in the
/// resolution file, so whitespace, `#` and `=` are rejected.
#[must_use]
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && !name.chars().any(|c| c.is_whitespace() || c == '#' || c == '=')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> ServiceEntry {
        ServiceEntry {
            name: "web".to_string(),
            backend_address: Ipv4Addr::new(127, 0, 0, 1),
            backend_port: 8080,
            virtual_address: Ipv4Addr::new(172, 22, 0, 1),
            virtual_port: 80,
        }
    }

    #[test]
    fn test_hostname() {
        assert_eq!(entry().hostname(), "web.svc");
    }

    #[test]
    fn test_display() {
        assert_eq!(entry().to_string(), "web=172.22.0.1:80->127.0.0.1:8080");
    }

    #[test]
    fn test_name_validation() {
        assert!(is_valid_name("web"));
        assert!(is_valid_name("api-v2.internal"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("two words"));
        assert!(!is_valid_name("tab\tname"));
        assert!(!is_valid_name("web#1"));
    }
}
