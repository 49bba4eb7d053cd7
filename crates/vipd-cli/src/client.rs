use anyhow::{Context, Result};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;
use vipd_core::{Reply, Request};

/// How long to wait for the daemon's answer. Restores that rebuild many
/// rules can take a while.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(60);

/// Sends one command over the control socket and reads the reply line.
pub fn send_request(socket_path: &Path, request: &Request) -> Result<Reply> {
    let mut stream = UnixStream::connect(socket_path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            anyhow::anyhow!(
                "vipd is not running (socket not found at {})",
                socket_path.display()
            )
        } else if e.kind() == std::io::ErrorKind::ConnectionRefused {
            anyhow::anyhow!(
                "vipd is not running (connection refused at {})",
                socket_path.display()
            )
        } else {
            anyhow::Error::new(e)
        }
    })?;
    stream.set_read_timeout(Some(RESPONSE_TIMEOUT))?;

    stream.write_all(format!("{request}\n").as_bytes())?;

    let mut line = String::new();
    BufReader::new(stream)
        .read_line(&mut line)
        .context("Failed to read the daemon's response")?;
    if line.is_empty() {
        anyhow::bail!("vipd closed the connection without responding");
    }

    Ok(line.parse::<Reply>()?)
}
