//! Process-execution collaborator
//!
//! The harness never talks to the store in-process: node daemons are
//! launched and halted as child processes, and maintenance operations go
//! through the store's own binary (`--dump-tlog`, `--dump-store`,
//! `--collapse-remote`, `--version`, ...). [`ProcessHost`] is the seam the
//! rest of the crate depends on; [`LocalProcessHost`] is the real
//! implementation for locally managed nodes. Tests substitute their own
//! hosts.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::{debug, warn};
use parking_lot::Mutex;
use std::time::Duration;
use tokio::process::{Child, Command};

/// Captured result of one store-binary invocation.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Whether a node daemon is currently running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Running,
    Halted,
}

/// Execution seam between the harness and the store's processes.
#[async_trait]
pub trait ProcessHost: Send + Sync {
    /// Run the store binary with the given flags and wait for it to exit.
    async fn run_tool(&self, args: &[String]) -> io::Result<CommandOutput>;

    /// Launch the daemon for `node`, reading the given configuration file.
    async fn start_daemon(&self, node: &str, config_path: &Path) -> io::Result<()>;

    /// Halt the daemon for `node` and return its exit code. Stopping a node
    /// that is not running returns 0.
    async fn stop_daemon(&self, node: &str) -> io::Result<i32>;

    /// Poll the daemon's status.
    async fn status(&self, node: &str) -> NodeStatus;
}

/// Runs the store binary directly and keeps the spawned daemons as child
/// processes of the harness.
pub struct LocalProcessHost {
    binary: PathBuf,
    children: Mutex<HashMap<String, Child>>,
    stop_grace: Duration,
}

impl LocalProcessHost {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        LocalProcessHost {
            binary: binary.into(),
            children: Mutex::new(HashMap::new()),
            stop_grace: Duration::from_secs(10),
        }
    }

    /// How long `stop_daemon` waits after SIGTERM before resorting to kill.
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    fn exit_code(status: std::process::ExitStatus) -> i32 {
        // Terminated-by-signal has no code; report -1 so callers asserting
        // on zero see the unclean stop.
        status.code().unwrap_or(-1)
    }
}

#[async_trait]
impl ProcessHost for LocalProcessHost {
    async fn run_tool(&self, args: &[String]) -> io::Result<CommandOutput> {
        debug!("running {} {}", self.binary.display(), args.join(" "));
        let output = Command::new(&self.binary).args(args).output().await?;
        Ok(CommandOutput {
            exit_code: Self::exit_code(output.status),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn start_daemon(&self, node: &str, config_path: &Path) -> io::Result<()> {
        {
            let children = self.children.lock();
            if children.contains_key(node) {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("node {node} is already running"),
                ));
            }
        }
        let child = Command::new(&self.binary)
            .arg("--node")
            .arg(node)
            .arg("-config")
            .arg(config_path)
            .kill_on_drop(true)
            .spawn()?;
        debug!("started node {node} (pid {:?})", child.id());
        self.children.lock().insert(node.to_string(), child);
        Ok(())
    }

    async fn stop_daemon(&self, node: &str) -> io::Result<i32> {
        let Some(mut child) = self.children.lock().remove(node) else {
            return Ok(0);
        };
        if let Some(pid) = child.id() {
            // Ask for a clean shutdown first; a healthy daemon exits 0.
            let pid = pid.to_string();
            let _ = Command::new("kill")
                .args(["-TERM", pid.as_str()])
                .status()
                .await;
        }
        match tokio::time::timeout(self.stop_grace, child.wait()).await {
            Ok(status) => Ok(Self::exit_code(status?)),
            Err(_) => {
                warn!("node {node} ignored SIGTERM, killing");
                child.kill().await?;
                Ok(Self::exit_code(child.wait().await?))
            }
        }
    }

    async fn status(&self, node: &str) -> NodeStatus {
        let mut children = self.children.lock();
        match children.get_mut(node) {
            Some(child) => match child.try_wait() {
                Ok(Some(_)) | Err(_) => {
                    children.remove(node);
                    NodeStatus::Halted
                }
                Ok(None) => NodeStatus::Running,
            },
            None => NodeStatus::Halted,
        }
    }
}

/// Extract the entries-per-file constant from `--version` output: the value
/// after `tlogEntriesPerFile:` on whichever line carries it.
pub fn parse_entries_per_file(stdout: &str) -> Option<u64> {
    const KEY: &str = "tlogEntriesPerFile:";
    for line in stdout.lines() {
        if let Some(idx) = line.find(KEY) {
            return line[idx + KEY.len()..].trim().parse().ok();
        }
    }
    None
}

/// Parse the last-applied counter line from `--dump-store` output.
///
/// `i: Some("19999")` yields 19999; `i: None` yields 0 (a store that never
/// applied an entry).
pub fn parse_counter_line(line: &str) -> Option<i64> {
    let rest = line.trim().strip_prefix("i:")?.trim();
    if rest == "None" {
        return Some(0);
    }
    let inner = rest.strip_prefix("Some(")?.strip_suffix(')')?;
    inner.trim().trim_matches('"').parse().ok()
}
