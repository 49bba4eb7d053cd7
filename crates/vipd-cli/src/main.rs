use anyhow::Result;
use clap::{Parser, Subcommand};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use vipd_core::{Reply, Request};
use vipd_server::config_loader::ConfigLoader;

mod client;

#[derive(Parser)]
#[command(name = "vipd")]
#[command(version, about = "Virtual service addresses with NAT forwarding", long_about = None)]
struct Cli {
    /// Control socket of the daemon (default: from the config file)
    #[arg(long, global = true, env = "VIPD_SOCKET")]
    socket: Option<PathBuf>,

    /// Config file (default: the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon in the foreground
    Server,
    /// Register a service and print its virtual address
    Add {
        name: String,
        backend_address: Ipv4Addr,
        backend_port: u16,
        virtual_port: u16,
    },
    /// Remove a service
    Delete { name: String },
    /// Print the virtual address of a service
    Resolve { name: String },
    /// List registered services
    List,
    /// Move services into the configured block and rebuild rules and names
    Restore,
    /// Remove all forwarding rules and published names
    Cleanup,
    /// Check that the daemon is answering
    Ping,
}

impl Commands {
    fn request(self) -> Option<Request> {
        let request = match self {
            Self::Server => return None,
            Self::Add {
                name,
                backend_address,
                backend_port,
                virtual_port,
            } => Request::Add {
                name,
                backend_address,
                backend_port,
                virtual_port,
            },
            Self::Delete { name } => Request::Delete { name },
            Self::Resolve { name } => Request::GetHostByName { name },
            Self::List => Request::List,
            Self::Restore => Request::Restore,
            Self::Cleanup => Request::Cleanup,
            Self::Ping => Request::Ping,
        };
        Some(request)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let Some(request) = cli.command.request() else {
        return vipd_server::run(vipd_server::RunOptions {
            config_path: cli.config,
            socket_path: cli.socket,
        });
    };

    let socket_path = match cli.socket {
        Some(path) => path,
        None => ConfigLoader::load(cli.config.as_deref())?.config.server.socket_path,
    };

    match client::send_request(&socket_path, &request)? {
        Reply::Ok(payload) => {
            // Listings put one service per line.
            for item in payload.split_whitespace() {
                println!("{item}");
            }
        }
        Reply::Pong => println!("PONG"),
        Reply::Error(message) => anyhow::bail!("{message}"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_add_maps_to_request() {
        let cli = Cli::try_parse_from(["vipd", "add", "web", "127.0.0.1", "8080", "80"]).unwrap();
        assert_eq!(
            cli.command.request(),
            Some(Request::Add {
                name: "web".to_string(),
                backend_address: Ipv4Addr::LOCALHOST,
                backend_port: 8080,
                virtual_port: 80,
            })
        );
    }

    #[test]
    fn test_resolve_maps_to_gethostbyname() {
        let cli = Cli::try_parse_from(["vipd", "resolve", "web"]).unwrap();
        assert_eq!(
            cli.command.request(),
            Some(Request::GetHostByName {
                name: "web".to_string()
            })
        );
    }

    #[test]
    fn test_server_is_not_a_request() {
        let cli = Cli::try_parse_from(["vipd", "--socket", "/tmp/x.sock", "server"]).unwrap();
        assert_eq!(cli.socket, Some(PathBuf::from("/tmp/x.sock")));
        assert_eq!(cli.command.request(), None);
    }

    #[test]
    fn test_bad_port_is_rejected_locally() {
        assert!(Cli::try_parse_from(["vipd", "add", "web", "127.0.0.1", "http", "80"]).is_err());
    }
}
