//! Bind/unbind/attach/detach command channel
//!
//! Each command runs a fixed sequence of helper programs. Helpers are only
//! spawned; the channel never waits for them to exit.

use crate::config::HelperSettings;
use nix::errno::Errno;
use std::fmt;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Commands accepted by the channel, matched exactly
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelperCommand {
    Bind,
    Unbind,
    Attach,
    Detach,
}

impl HelperCommand {
    pub fn parse(buf: &[u8]) -> Option<Self> {
        match buf {
            b"bind" => Some(HelperCommand::Bind),
            b"unbind" => Some(HelperCommand::Unbind),
            b"attach" => Some(HelperCommand::Attach),
            b"detach" => Some(HelperCommand::Detach),
            _ => None,
        }
    }

    /// Helper invocations of this command, in execution order
    pub fn sequence(self, helpers: &HelperSettings) -> Vec<HelperInvocation> {
        let busid = format!("--busid={}", helpers.busid);
        match self {
            HelperCommand::Bind => vec![
                HelperInvocation::new(&helpers.mausb, ["bind".to_string(), busid]),
                HelperInvocation::new(&helpers.upnp_server, ["&".to_string()]),
                HelperInvocation::new(&helpers.mausbd, ["-D".to_string()]),
            ],
            HelperCommand::Unbind => vec![
                HelperInvocation::new(
                    &helpers.busybox,
                    [
                        "pkill".to_string(),
                        "-15".to_string(),
                        helpers.upnp_server.display().to_string(),
                    ],
                ),
                HelperInvocation::new(&helpers.mausb, ["unbind".to_string(), busid]),
                HelperInvocation::new(
                    &helpers.busybox,
                    ["pkill".to_string(), helpers.mausbd.display().to_string()],
                ),
            ],
            HelperCommand::Detach => vec![
                HelperInvocation::new(
                    &helpers.mausb,
                    ["detach".to_string(), "--port=0".to_string()],
                ),
                HelperInvocation::new(
                    &helpers.busybox,
                    [
                        "pkill".to_string(),
                        "-15".to_string(),
                        helpers.upnp_client.display().to_string(),
                    ],
                ),
            ],
            HelperCommand::Attach => vec![HelperInvocation::new(
                &helpers.upnp_client,
                ["&".to_string()],
            )],
        }
    }
}

impl fmt::Display for HelperCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HelperCommand::Bind => "bind",
            HelperCommand::Unbind => "unbind",
            HelperCommand::Attach => "attach",
            HelperCommand::Detach => "detach",
        })
    }
}

/// One helper program with its arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperInvocation {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl HelperInvocation {
    pub fn new(program: &std::path::Path, args: impl IntoIterator<Item = String>) -> Self {
        Self {
            program: program.to_path_buf(),
            args: args.into_iter().collect(),
        }
    }
}

impl fmt::Display for HelperInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Starts helper programs
pub trait ProcessLauncher: Send + Sync {
    /// Start `invocation` with exactly `env` as its environment
    ///
    /// Returns once the program was executed: 0 on success, otherwise the
    /// negated errno of the failure.
    fn launch(&self, invocation: &HelperInvocation, env: &[(String, String)]) -> i32;
}

/// [`ProcessLauncher`] spawning real processes
///
/// Children are reaped on a detached thread so they never linger as zombies.
#[derive(Debug, Default, Clone, Copy)]
pub struct SpawnLauncher;

impl ProcessLauncher for SpawnLauncher {
    fn launch(&self, invocation: &HelperInvocation, env: &[(String, String)]) -> i32 {
        let spawned = Command::new(&invocation.program)
            .args(&invocation.args)
            .env_clear()
            .envs(env.iter().map(|(name, value)| (name, value)))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();

        match spawned {
            Ok(child) => {
                debug!("Started {} (pid {})", invocation, child.id());
                reap(child);
                0
            }
            Err(e) => {
                warn!("Failed to start {}: {}", invocation, e);
                -e.raw_os_error().unwrap_or(Errno::EIO as i32)
            }
        }
    }
}

fn reap(mut child: Child) {
    let spawned = std::thread::Builder::new()
        .name("helper-reaper".to_string())
        .spawn(move || match child.wait() {
            Ok(status) => debug!("helper pid {} exited: {}", child.id(), status),
            Err(e) => warn!("Failed to wait for helper pid {}: {}", child.id(), e),
        });
    if let Err(e) = spawned {
        warn!("Failed to start reaper thread: {}", e);
    }
}

/// Runs helper sequences for commands written to the channel
#[derive(Clone)]
pub struct CommandChannel {
    helpers: HelperSettings,
    env: Vec<(String, String)>,
    launcher: Arc<dyn ProcessLauncher>,
}

impl CommandChannel {
    pub fn new(helpers: HelperSettings, launcher: Arc<dyn ProcessLauncher>) -> Self {
        let env = helpers.env_pairs();
        Self {
            helpers,
            env,
            launcher,
        }
    }

    /// Execute the command in `buf`
    ///
    /// Returns the status of the last helper run. Anything that is not a
    /// known command runs nothing and returns 0.
    pub fn write(&self, buf: &[u8]) -> i32 {
        let Some(command) = HelperCommand::parse(buf) else {
            debug!(
                "ignoring unknown command '{}'",
                String::from_utf8_lossy(buf).escape_debug()
            );
            return 0;
        };

        info!("{} command received", command);
        let mut status = 0;
        for invocation in command.sequence(&self.helpers) {
            status = self.launcher.launch(&invocation, &self.env);
            debug!("{}: status {}", invocation, status);
        }
        status
    }
}

impl fmt::Debug for CommandChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandChannel")
            .field("helpers", &self.helpers)
            .finish_non_exhaustive()
    }
}
