//! Unix socket endpoints serving the control surface
//!
//! Each endpoint is a stream socket taking one request per line. The
//! attribute endpoint answers `show` (or an empty line) with the registered
//! ids and anything else with `ok <count>` or `error <errno> <message>`. The
//! command endpoint answers with the status of the command.

use super::attribute::MatchBusIdAttribute;
use super::command::CommandChannel;
use anyhow::{Context, Result};
use common::{HostBridge, HostCommand};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Which control surface an endpoint serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Attribute,
    Command,
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EndpointKind::Attribute => "match_busid",
            EndpointKind::Command => "command",
        })
    }
}

/// Request handler behind an endpoint
#[derive(Clone)]
pub enum ControlHandler {
    Attribute {
        attribute: MatchBusIdAttribute,
        /// Worker to rescan after the registry changed
        rescan: Option<HostBridge>,
    },
    Command(Arc<CommandChannel>),
}

impl ControlHandler {
    pub fn kind(&self) -> EndpointKind {
        match self {
            ControlHandler::Attribute { .. } => EndpointKind::Attribute,
            ControlHandler::Command(_) => EndpointKind::Command,
        }
    }

    /// Answer one request line (without its newline)
    ///
    /// The command channel may block while helpers are spawned, so callers
    /// on the runtime go through [`ControlHandler::handle_blocking`].
    pub fn handle_line(&self, line: &str) -> String {
        match self {
            ControlHandler::Attribute { attribute, rescan } => {
                if line.is_empty() || line == "show" {
                    return attribute.show();
                }
                match attribute.store(line.as_bytes()) {
                    Ok(count) => {
                        if let Some(bridge) = rescan
                            && let Err(e) = bridge.try_send_command(HostCommand::Rescan)
                        {
                            warn!("Failed to request rescan: {}", e);
                        }
                        format!("ok {}\n", count)
                    }
                    Err(e) => format!("error {} {}\n", e.errno() as i32, e),
                }
            }
            ControlHandler::Command(channel) => format!("{}\n", channel.write(line.as_bytes())),
        }
    }

    async fn handle_blocking(&self, line: String) -> String {
        match self {
            ControlHandler::Attribute { .. } => self.handle_line(&line),
            ControlHandler::Command(_) => {
                let handler = self.clone();
                match tokio::task::spawn_blocking(move || handler.handle_line(&line)).await {
                    Ok(reply) => reply,
                    Err(e) => {
                        error!("Command handler failed: {}", e);
                        format!("{}\n", -(nix::errno::Errno::EIO as i32))
                    }
                }
            }
        }
    }
}

/// A running endpoint
///
/// Dropping the handle leaves the endpoint running; call
/// [`EndpointHandle::unregister`] to stop it.
pub struct EndpointHandle {
    kind: EndpointKind,
    path: PathBuf,
    task: JoinHandle<()>,
}

impl EndpointHandle {
    pub fn kind(&self) -> EndpointKind {
        self.kind
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop accepting, drop open connections and remove the socket file
    pub fn unregister(self) {
        self.task.abort();
        if let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!("Failed to remove socket {}: {}", self.path.display(), e);
        }
        info!("Unregistered {} endpoint {}", self.kind, self.path.display());
    }
}

impl fmt::Debug for EndpointHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointHandle")
            .field("kind", &self.kind)
            .field("path", &self.path)
            .finish()
    }
}

/// Bind `path` and serve `handler` on it
///
/// A stale socket file left at `path` is replaced. Must be called within a
/// Tokio runtime.
pub fn serve(path: &Path, handler: ControlHandler) -> Result<EndpointHandle> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create socket directory: {}", parent.display()))?;
    }
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to remove stale socket: {}", path.display()))?;
    }

    let listener = UnixListener::bind(path)
        .with_context(|| format!("Failed to bind control socket: {}", path.display()))?;

    let kind = handler.kind();
    info!("Serving {} endpoint on {}", kind, path.display());

    let task = tokio::spawn(accept_loop(listener, handler));
    Ok(EndpointHandle {
        kind,
        path: path.to_path_buf(),
        task,
    })
}

async fn accept_loop(listener: UnixListener, handler: ControlHandler) {
    // Owned here so aborting the loop also aborts every connection
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    let handler = handler.clone();
                    connections.spawn(async move {
                        if let Err(e) = handle_connection(stream, handler).await {
                            debug!("Control connection error: {:#}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept control connection: {}", e);
                    break;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

async fn handle_connection(stream: UnixStream, handler: ControlHandler) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await.context("Failed to read request")? {
        let reply = handler.handle_blocking(line).await;
        writer
            .write_all(reply.as_bytes())
            .await
            .context("Failed to write reply")?;
    }

    Ok(())
}
