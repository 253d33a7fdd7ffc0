//! Child process management for the supervised daemons
//!
//! This module describes how the Tor proxy and the full node are launched
//! ([`ChildSpec`]) and provides the handle that owns one spawned OS process
//! ([`ChildProcess`]).

use crate::config::NodeVariant;
use crate::error::SpawnError;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tracing::{debug, info, warn};

/// Control port Tor listens on; the node reaches Tor through it
pub const TOR_CONTROL_PORT: u16 = 9051;

/// Tor data directory, relative to the base directory
pub const TOR_DATA_SUBDIR: &str = "tordata";

/// Identifies one of the two supervised children
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChildName {
    Tor,
    Node,
}

impl ChildName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChildName::Tor => "tor",
            ChildName::Node => "node",
        }
    }
}

impl fmt::Display for ChildName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable description of one child to launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildSpec {
    /// Which child this is
    pub name: ChildName,

    /// Executable to run
    pub program: PathBuf,

    /// Arguments to pass to the executable
    pub args: Vec<String>,

    /// Working directory for the process
    pub working_dir: PathBuf,
}

impl ChildSpec {
    /// Tor with isolated sockets, automatic SOCKS port, cookie-authenticated
    /// control port and its data directory under `base_dir`
    pub fn tor(base_dir: &Path) -> Self {
        let data_dir = base_dir.join(TOR_DATA_SUBDIR);

        Self {
            name: ChildName::Tor,
            program: base_dir.join("tor"),
            args: vec![
                "SafeSocks".to_string(),
                "1".to_string(),
                "SocksPort".to_string(),
                "auto".to_string(),
                "NoExec".to_string(),
                "1".to_string(),
                "CookieAuthentication".to_string(),
                "1".to_string(),
                "ControlPort".to_string(),
                TOR_CONTROL_PORT.to_string(),
                "DataDirectory".to_string(),
                data_dir.display().to_string(),
            ],
            working_dir: base_dir.to_path_buf(),
        }
    }

    /// The full node daemon selected by `variant`, with RPC enabled
    pub fn node(base_dir: &Path, variant: NodeVariant, datadir: &Path, conf: &Path) -> Self {
        Self {
            name: ChildName::Node,
            program: base_dir.join(variant.daemon_name()),
            args: vec![
                "--server=1".to_string(),
                format!("--datadir={}", datadir.display()),
                format!("--conf={}", conf.display()),
            ],
            working_dir: base_dir.to_path_buf(),
        }
    }

    /// Executable followed by its arguments
    pub fn command_line(&self) -> Vec<String> {
        std::iter::once(self.program.display().to_string())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

/// Observed status of a spawned child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStatus {
    Running,
    Exited(Option<i32>),
}

/// Owns one spawned OS process and its output pipes
pub struct ChildProcess {
    name: ChildName,
    pid: u32,
    child: Child,
}

impl ChildProcess {
    /// Spawn a child process from `spec`, with stdout and stderr piped
    pub fn spawn(spec: &ChildSpec) -> Result<Self, SpawnError> {
        info!(child = %spec.name, "Spawning child process...");
        debug!(child = %spec.name, "  Command: {:?}", spec.program);
        debug!(child = %spec.name, "  Working directory: {:?}", spec.working_dir);
        debug!(child = %spec.name, "  Args: {:?}", spec.args);

        let child = Command::new(&spec.program)
            .current_dir(&spec.working_dir)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SpawnError {
                name: spec.name,
                path: spec.program.clone(),
                source,
            })?;

        let pid = child.id().unwrap_or_default();
        info!(child = %spec.name, pid, "Child process spawned");

        Ok(Self {
            name: spec.name,
            pid,
            child,
        })
    }

    pub fn name(&self) -> ChildName {
        self.name
    }

    /// Get the process ID
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Take the stdout pipe; `None` once taken
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    /// Take the stderr pipe; `None` once taken
    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Ask the OS to terminate the process. Does not wait for it to exit.
    pub fn terminate(&mut self) {
        // Already reaped: the pid may have been reused.
        let Some(pid) = self.child.id() else {
            return;
        };

        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                warn!(child = %self.name, pid, "Failed to send SIGTERM: {}", e);
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = self.child.start_kill() {
                warn!(child = %self.name, pid, "Failed to terminate process: {}", e);
            }
        }
    }

    /// Forcefully kill the process and reap it
    pub async fn kill(&mut self) -> io::Result<()> {
        self.child.kill().await
    }

    /// Wait until the process exits. Safe to call again after it has exited.
    pub async fn wait_for_exit(&mut self) -> io::Result<ExitStatus> {
        self.child.wait().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tor_spec() {
        let spec = ChildSpec::tor(Path::new("/data/app"));

        assert_eq!(spec.name, ChildName::Tor);
        assert_eq!(spec.program, PathBuf::from("/data/app/tor"));
        assert_eq!(spec.working_dir, PathBuf::from("/data/app"));
        assert_eq!(
            spec.args,
            vec![
                "SafeSocks", "1", "SocksPort", "auto", "NoExec", "1",
                "CookieAuthentication", "1", "ControlPort", "9051",
                "DataDirectory", "/data/app/tordata",
            ]
        );
    }

    #[test]
    fn test_node_spec_core() {
        let spec = ChildSpec::node(
            Path::new("/data/app"),
            NodeVariant::Core,
            Path::new("/data/app/.bitcoin"),
            Path::new("/data/app/.bitcoin/bitcoin.conf"),
        );

        assert_eq!(
            spec.command_line(),
            vec![
                "/data/app/bitcoind",
                "--server=1",
                "--datadir=/data/app/.bitcoin",
                "--conf=/data/app/.bitcoin/bitcoin.conf",
            ]
        );
    }

    #[test]
    fn test_node_spec_liquid_only_changes_executable() {
        let base = Path::new("/data/app");
        let datadir = Path::new("/d");
        let conf = Path::new("/c");
        let core = ChildSpec::node(base, NodeVariant::Core, datadir, conf);
        let liquid = ChildSpec::node(base, NodeVariant::Liquid, datadir, conf);

        assert_eq!(liquid.program, PathBuf::from("/data/app/liquidd"));
        assert_eq!(liquid.args, core.args);
        assert_eq!(liquid.working_dir, core.working_dir);
    }

    #[test]
    fn test_child_name_display() {
        assert_eq!(ChildName::Tor.to_string(), "tor");
        assert_eq!(ChildName::Node.to_string(), "node");
    }
}
