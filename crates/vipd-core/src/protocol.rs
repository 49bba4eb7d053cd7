//! The control socket protocol.
//!
//! A client opens a connection, writes one newline-terminated command, reads one
//! newline-terminated response and the connection is closed:
//!
//! ```text
//! ADD <name> <backend_address> <backend_port> <virtual_port>  -> OK <virtual_address>
//! DELETE <name>                                              -> OK
//! GETHOSTBYNAME <name>                                       -> OK <virtual_address>
//! LIST | RESTORE                                             -> OK <entry>...
//! CLEANUP                                                    -> OK
//! PING                                                       -> PONG
//! ```
//!
//! Any failure is reported as `ERROR <message>`.

use crate::service::ServiceEntry;
use std::net::{AddrParseError, Ipv4Addr};
use std::num::ParseIntError;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Add {
        name: String,
        backend_address: Ipv4Addr,
        backend_port: u16,
        virtual_port: u16,
    },
    Delete {
        name: String,
    },
    GetHostByName {
        name: String,
    },
    List,
    Restore,
    Cleanup,
    Ping,
}

/// Errors produced while parsing a protocol line.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Unknown Command")]
    UnknownCommand,
    #[error("Could not parse command")]
    Malformed,
    #[error("Invalid {field} '{value}': {source}")]
    InvalidPort {
        field: &'static str,
        value: String,
        source: ParseIntError,
    },
    #[error("Invalid backend address '{value}': {source}")]
    InvalidAddress {
        value: String,
        source: AddrParseError,
    },
    #[error("Malformed response: {0}")]
    MalformedResponse(String),
}

fn parse_port(field: &'static str, value: &str) -> Result<u16, ParseError> {
    value.parse().map_err(|source| ParseError::InvalidPort {
        field,
        value: value.to_string(),
        source,
    })
}

impl FromStr for Request {
    type Err = ParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let Some((command, args)) = fields.split_first() else {
            return Err(ParseError::Malformed);
        };

        match (*command, args) {
            ("ADD", [name, address, backend_port, virtual_port]) => {
                let backend_address =
                    address
                        .parse()
                        .map_err(|source| ParseError::InvalidAddress {
                            value: (*address).to_string(),
                            source,
                        })?;
                Ok(Self::Add {
                    name: (*name).to_string(),
                    backend_address,
                    backend_port: parse_port("backend port", backend_port)?,
                    virtual_port: parse_port("virtual port", virtual_port)?,
                })
            }
            ("DELETE", [name]) => Ok(Self::Delete {
                name: (*name).to_string(),
            }),
            ("GETHOSTBYNAME", [name]) => Ok(Self::GetHostByName {
                name: (*name).to_string(),
            }),
            ("LIST", []) => Ok(Self::List),
            ("RESTORE", []) => Ok(Self::Restore),
            ("CLEANUP", []) => Ok(Self::Cleanup),
            ("PING", []) => Ok(Self::Ping),
            ("ADD" | "DELETE" | "GETHOSTBYNAME" | "LIST" | "RESTORE" | "CLEANUP" | "PING", _) => {
                Err(ParseError::Malformed)
            }
            _ => Err(ParseError::UnknownCommand),
        }
    }
}

impl std::fmt::Display for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Add {
                name,
                backend_address,
                backend_port,
                virtual_port,
            } => write!(f, "ADD {name} {backend_address} {backend_port} {virtual_port}"),
            Self::Delete { name } => write!(f, "DELETE {name}"),
            Self::GetHostByName { name } => write!(f, "GETHOSTBYNAME {name}"),
            Self::List => write!(f, "LIST"),
            Self::Restore => write!(f, "RESTORE"),
            Self::Cleanup => write!(f, "CLEANUP"),
            Self::Ping => write!(f, "PING"),
        }
    }
}

/// What the server writes back, rendered with [`std::fmt::Display`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ok,
    Address(Ipv4Addr),
    Listing(Vec<ServiceEntry>),
    Pong,
    Error(String),
}

impl std::fmt::Display for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "OK"),
            Self::Address(address) => write!(f, "OK {address}"),
            Self::Listing(entries) => {
                write!(f, "OK")?;
                for entry in entries {
                    write!(f, " {entry}")?;
                }
                Ok(())
            }
            Self::Pong => write!(f, "PONG"),
            // Keep the response on a single line whatever the error says.
            Self::Error(message) => write!(f, "ERROR {}", message.replace(['\r', '\n'], " ")),
        }
    }
}

/// A response as seen by a client, which only cares about success and payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ok(String),
    Pong,
    Error(String),
}

impl FromStr for Reply {
    type Err = ParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (status, payload) = line.split_once(' ').unwrap_or((line, ""));
        match status {
            "OK" => Ok(Self::Ok(payload.to_string())),
            "PONG" => Ok(Self::Pong),
            "ERROR" => Ok(Self::Error(payload.to_string())),
            _ => Err(ParseError::MalformedResponse(line.to_string())),
        }
    }
}
