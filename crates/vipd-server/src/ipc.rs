use crate::registry::Registry;
use anyhow::Result;
use std::future::Future;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinSet;
use tracing::{debug, error, info};
use vipd_core::{Request, Response};

/// Longest command line accepted from a client.
const MAX_REQUEST_LEN: u64 = 4096;

/// A client that connects but never sends a line is dropped after this long,
/// so it cannot hold up shutdown.
const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Binds the control socket, replacing a stale socket file left by a crash.
pub async fn bind(socket_path: &Path) -> Result<UnixListener> {
    if let Ok(metadata) = tokio::fs::symlink_metadata(socket_path).await {
        if !metadata.file_type().is_socket() {
            anyhow::bail!(
                "{} exists and is not a socket, refusing to replace it",
                socket_path.display()
            );
        }
        // Try to connect to see if it's alive
        if UnixStream::connect(socket_path).await.is_ok() {
            anyhow::bail!(
                "Socket {} is already in use. Is vipd already running?",
                socket_path.display()
            );
        }
        // If we can't connect, it's likely a stale socket
        tokio::fs::remove_file(socket_path).await?;
    }

    if let Some(parent) = socket_path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }

    let listener = UnixListener::bind(socket_path)?;
    info!("IPC server listening on {:?}", socket_path);
    Ok(listener)
}

/// Serves connections until `shutdown` resolves, then waits for the requests
/// already in flight before returning.
pub async fn run_ipc_server(
    listener: UnixListener,
    registry: Registry,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let mut connections = JoinSet::new();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    let registry = registry.clone();
                    connections.spawn(async move {
                        if let Err(e) = handle_connection(stream, registry).await {
                            error!("Error handling connection: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                }
            },
        }

        // Reap finished connections so the set does not grow without bound.
        while connections.try_join_next().is_some() {}
    }

    drop(listener);
    if !connections.is_empty() {
        info!("Waiting for {} in-flight requests", connections.len());
    }
    while connections.join_next().await.is_some() {}
    Ok(())
}

async fn handle_connection(stream: UnixStream, registry: Registry) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half.take(MAX_REQUEST_LEN));

    let mut buf = Vec::new();
    let Ok(read) = tokio::time::timeout(READ_TIMEOUT, reader.read_until(b'\n', &mut buf)).await
    else {
        debug!("Client sent nothing within {:?}", READ_TIMEOUT);
        return Ok(());
    };
    let n = read?;

    if n == 0 {
        return Ok(());
    }

    let line = String::from_utf8_lossy(&buf);
    let response = handle_request(&registry, &line).await;

    write_half
        .write_all(format!("{response}\n").as_bytes())
        .await?;
    write_half.shutdown().await?;

    Ok(())
}

/// Parses one command line and runs it against the registry.
pub async fn handle_request(registry: &Registry, line: &str) -> Response {
    let request: Request = match line.parse() {
        Ok(request) => request,
        Err(e) => {
            debug!("Rejected request {:?}: {}", line.trim_end(), e);
            return Response::Error(e.to_string());
        }
    };
    debug!("Received request: {}", request);

    match request {
        Request::Add {
            name,
            backend_address,
            backend_port,
            virtual_port,
        } => match registry
            .add(&name, backend_address, backend_port, virtual_port)
            .await
        {
            Ok(entry) => Response::Address(entry.virtual_address),
            Err(e) => Response::Error(e.to_string()),
        },
        Request::Delete { name } => match registry.delete(&name).await {
            Ok(()) => Response::Ok,
            Err(e) => Response::Error(e.to_string()),
        },
        Request::GetHostByName { name } => match registry.resolve(&name).await {
            Ok(entry) => Response::Address(entry.virtual_address),
            Err(e) => Response::Error(e.to_string()),
        },
        Request::List => Response::Listing(registry.list().await),
        Request::Restore => match registry.restore().await {
            Ok(entries) => Response::Listing(entries),
            Err(e) => Response::Error(e.to_string()),
        },
        Request::Cleanup => match registry.cleanup().await {
            Ok(()) => Response::Ok,
            Err(e) => Response::Error(e.to_string()),
        },
        Request::Ping => Response::Pong,
    }
}
