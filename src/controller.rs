//! Cluster lifecycle controller
//!
//! [`ClusterController`] wraps the in-memory topology with operational side
//! effects: config persistence, directory provisioning, daemon start/stop
//! and the maintenance operations forwarded to the store binary. Topology
//! mutations take `&mut self` and are persisted immediately; process
//! operations take `&self` so concurrent scenario tasks can share the
//! controller while the topology stays frozen. That split is what enforces
//! the single-writer discipline: no task can mutate membership while
//! workloads hold shared references.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};
use thiserror::Error;

use crate::config;
use crate::process::{CommandOutput, NodeStatus, ProcessHost};
use crate::tlog;
use crate::topology::{ClusterTopology, LocalNodeSet, LogLevel, Node, NodeSpec, TopologyError};

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// The store binary exited nonzero for an operation that must succeed.
    #[error("store tool failed (exit {exit_code}): {stderr}")]
    Tool { exit_code: i32, stderr: String },
    #[error("field {0:?} missing from store tool output")]
    MissingField(&'static str),
}

/// Lifecycle operations for one cluster, acting on its topology and its
/// locally managed daemons.
pub struct ClusterController {
    topology: ClusterTopology,
    local: LocalNodeSet,
    host: Arc<dyn ProcessHost>,
    config_dir: PathBuf,
}

impl ClusterController {
    pub fn new(
        topology: ClusterTopology,
        host: Arc<dyn ProcessHost>,
        config_dir: impl Into<PathBuf>,
    ) -> Result<Self, ControllerError> {
        let controller = ClusterController {
            topology,
            local: LocalNodeSet::new(),
            host,
            config_dir: config_dir.into(),
        };
        controller.save()?;
        Ok(controller)
    }

    pub fn topology(&self) -> &ClusterTopology {
        &self.topology
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_dir
            .join(format!("{}.cfg", self.topology.cluster_id()))
    }

    pub fn local_nodes_path(&self) -> PathBuf {
        self.config_dir
            .join(format!("{}_local_nodes", self.topology.cluster_id()))
    }

    fn save(&self) -> Result<(), ControllerError> {
        std::fs::create_dir_all(&self.config_dir)?;
        std::fs::write(self.config_path(), config::to_config_text(&self.topology))?;
        std::fs::write(
            self.local_nodes_path(),
            config::to_local_nodes_text(&self.local),
        )?;
        Ok(())
    }

    // --- Topology mutations (persisted immediately) ---

    pub fn add_node(&mut self, spec: NodeSpec) -> Result<(), ControllerError> {
        self.topology.add_node(spec)?;
        self.save()
    }

    pub fn remove_node(&mut self, name: &str) -> Result<(), ControllerError> {
        self.topology.remove_node(name)?;
        if self.local.contains(name) {
            self.local.remove(name)?;
        }
        self.save()
    }

    pub fn force_master(
        &mut self,
        name: Option<&str>,
        preferred: bool,
    ) -> Result<(), ControllerError> {
        self.topology.force_master(name, preferred)?;
        self.save()
    }

    pub fn set_quorum(&mut self, quorum: u32) -> Result<(), ControllerError> {
        self.topology.set_quorum(quorum)?;
        self.save()
    }

    pub fn set_read_only(&mut self, read_only: bool) -> Result<(), ControllerError> {
        self.topology.set_read_only(read_only);
        self.save()
    }

    pub fn set_log_level(&mut self, level: LogLevel) -> Result<(), ControllerError> {
        self.topology.set_log_level(level);
        self.save()
    }

    pub fn set_master_lease(&mut self, seconds: u32) -> Result<(), ControllerError> {
        self.topology.set_lease_period(seconds);
        self.save()
    }

    pub fn add_local_node(&mut self, name: &str) -> Result<(), ControllerError> {
        self.local.add(&self.topology, name)?;
        self.save()
    }

    pub fn remove_local_node(&mut self, name: &str) -> Result<(), ControllerError> {
        self.local.remove(name)?;
        self.save()
    }

    // --- Queries ---

    pub fn list_nodes(&self) -> Vec<&str> {
        self.topology.list_nodes()
    }

    pub fn list_local_nodes(&self) -> &[String] {
        self.local.list()
    }

    pub fn node_config(&self, name: &str) -> Result<&Node, ControllerError> {
        Ok(self.topology.node(name)?)
    }

    pub fn client_config(&self) -> Vec<(&str, &str, u16)> {
        self.topology.client_config()
    }

    /// Path of the node's database file.
    pub fn db_path(&self, name: &str) -> Result<PathBuf, ControllerError> {
        let node = self.topology.node(name)?;
        Ok(node.home.join(format!("{name}.db")))
    }

    // --- Directory provisioning ---

    fn node_dirs(node: &Node) -> Vec<&Path> {
        let mut dirs: Vec<&Path> = vec![&node.home, &node.log_dir];
        if let Some(dir) = &node.tlf_dir {
            dirs.push(dir);
        }
        if let Some(dir) = &node.head_dir {
            dirs.push(dir);
        }
        dirs
    }

    /// Create the node's directories. Idempotent.
    pub fn create_dirs(&self, name: &str) -> Result<(), ControllerError> {
        let node = self.topology.node(name)?;
        for dir in Self::node_dirs(node) {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Remove the node's directories. Idempotent.
    pub fn remove_dirs(&self, name: &str) -> Result<(), ControllerError> {
        let node = self.topology.node(name)?;
        for dir in Self::node_dirs(node) {
            match std::fs::remove_dir_all(dir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Destroy and recreate the node's data directories (home and tlf).
    /// Log and head directories survive for post-mortem inspection.
    pub fn wipe(&self, name: &str) -> Result<(), ControllerError> {
        let node = self.topology.node(name)?;
        let mut dirs: Vec<&Path> = vec![&node.home];
        if let Some(dir) = &node.tlf_dir {
            dirs.push(dir);
        }
        for dir in &dirs {
            match std::fs::remove_dir_all(dir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            std::fs::create_dir_all(dir)?;
        }
        info!("wiped {name} (dirs={dirs:?})");
        Ok(())
    }

    // --- Daemon lifecycle ---

    pub async fn start_one(&self, name: &str) -> Result<(), ControllerError> {
        self.topology.node(name)?;
        debug!("starting node {name}");
        self.host.start_daemon(name, &self.config_path()).await?;
        Ok(())
    }

    /// Halt one node and return its exit code. A clean stop is 0; callers
    /// deciding pass/fail must assert on it.
    pub async fn stop_one(&self, name: &str) -> Result<i32, ControllerError> {
        self.topology.node(name)?;
        debug!("stopping node {name}");
        Ok(self.host.stop_daemon(name).await?)
    }

    /// Start every local node in join order.
    pub async fn start(&self) -> Result<(), ControllerError> {
        for name in self.ordered_local_nodes() {
            self.start_one(&name).await?;
        }
        Ok(())
    }

    /// Stop every local node; returns the per-node exit codes. Callers
    /// must assert all codes are zero.
    pub async fn stop(&self) -> Result<BTreeMap<String, i32>, ControllerError> {
        let mut codes = BTreeMap::new();
        for name in self.ordered_local_nodes() {
            let code = self.stop_one(&name).await?;
            info!("stop {name} => {code}");
            codes.insert(name, code);
        }
        Ok(codes)
    }

    pub async fn restart(&self) -> Result<(), ControllerError> {
        self.stop().await?;
        self.start().await
    }

    pub async fn restart_one(&self, name: &str) -> Result<(), ControllerError> {
        self.stop_one(name).await?;
        self.start_one(name).await
    }

    pub async fn status_one(&self, name: &str) -> Result<NodeStatus, ControllerError> {
        self.topology.node(name)?;
        Ok(self.host.status(name).await)
    }

    fn ordered_local_nodes(&self) -> Vec<String> {
        // Join order, restricted to the local set.
        self.topology
            .list_nodes()
            .into_iter()
            .filter(|n| self.local.contains(n))
            .map(str::to_string)
            .collect()
    }

    // --- Maintenance operations through the store binary ---

    async fn run_expecting_success(
        &self,
        args: Vec<String>,
    ) -> Result<CommandOutput, ControllerError> {
        let output = self.host.run_tool(&args).await?;
        if !output.success() {
            return Err(ControllerError::Tool {
                exit_code: output.exit_code,
                stderr: output.stderr,
            });
        }
        Ok(output)
    }

    /// Collapse `count` transaction logs of the node into its head store.
    pub async fn collapse(&self, name: &str, count: u32) -> Result<(), ControllerError> {
        let node = self.topology.node(name)?;
        info!("collapsing {count} tlog(s) on {name}");
        self.run_expecting_success(vec![
            "--collapse-remote".to_string(),
            self.topology.cluster_id().to_string(),
            node.ip.clone(),
            node.client_port.to_string(),
            count.to_string(),
        ])
        .await?;
        Ok(())
    }

    /// Make the node relinquish mastership.
    pub async fn drop_master(&self, name: &str) -> Result<(), ControllerError> {
        let node = self.topology.node(name)?;
        self.run_expecting_success(vec![
            "--drop-master".to_string(),
            self.topology.cluster_id().to_string(),
            node.ip.clone(),
            node.client_port.to_string(),
        ])
        .await?;
        Ok(())
    }

    pub async fn optimize_db(&self, name: &str) -> Result<(), ControllerError> {
        let node = self.topology.node(name)?;
        self.run_expecting_success(vec![
            "--optimize-db".to_string(),
            node.ip.clone(),
            node.client_port.to_string(),
        ])
        .await?;
        Ok(())
    }

    pub async fn defrag_db(&self, name: &str) -> Result<(), ControllerError> {
        let node = self.topology.node(name)?;
        self.run_expecting_success(vec![
            "--defrag-db".to_string(),
            node.ip.clone(),
            node.client_port.to_string(),
        ])
        .await?;
        Ok(())
    }

    /// Run the node in catchup-only mode: replay what the cluster has,
    /// then exit without serving.
    pub async fn catchup_only(&self, name: &str) -> Result<(), ControllerError> {
        self.topology.node(name)?;
        self.run_expecting_success(vec![
            "--catchup-only".to_string(),
            name.to_string(),
            "-config".to_string(),
            self.config_path().display().to_string(),
        ])
        .await?;
        Ok(())
    }

    /// Dump one rollover segment of the node's transaction log as text.
    pub async fn dump_tlog(&self, name: &str, segment: u64) -> Result<String, ControllerError> {
        let node = self.topology.node(name)?;
        let path = node.home.join(tlog::tlog_file_name(segment));
        debug!("dumping tlog {}", path.display());
        let output = self
            .run_expecting_success(vec![
                "--dump-tlog".to_string(),
                path.display().to_string(),
            ])
            .await?;
        Ok(output.stdout)
    }

    /// Dump the node's store (counter line + key/value lines) as text.
    pub async fn dump_store(&self, name: &str) -> Result<String, ControllerError> {
        let db = self.db_path(name)?;
        let output = self
            .run_expecting_success(vec![
                "--dump-store".to_string(),
                db.display().to_string(),
            ])
            .await?;
        Ok(output.stdout)
    }

    /// The store's tlog rollover constant, from `--version` output.
    pub async fn entries_per_file(&self) -> Result<u64, ControllerError> {
        let output = self
            .run_expecting_success(vec!["--version".to_string()])
            .await?;
        crate::process::parse_entries_per_file(&output.stdout)
            .ok_or(ControllerError::MissingField("tlogEntriesPerFile"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::CommandOutput;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Records invocations; every daemon stop exits 0.
    #[derive(Default)]
    struct RecordingHost {
        calls: Mutex<Vec<Vec<String>>>,
        running: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ProcessHost for RecordingHost {
        async fn run_tool(&self, args: &[String]) -> std::io::Result<CommandOutput> {
            self.calls.lock().push(args.to_vec());
            let stdout = if args[0] == "--version" {
                "version: 1.8.6\ntlogEntriesPerFile: 1000\n".to_string()
            } else {
                String::new()
            };
            Ok(CommandOutput {
                exit_code: 0,
                stdout,
                stderr: String::new(),
            })
        }

        async fn start_daemon(&self, node: &str, _config: &Path) -> std::io::Result<()> {
            self.running.lock().push(node.to_string());
            Ok(())
        }

        async fn stop_daemon(&self, node: &str) -> std::io::Result<i32> {
            self.running.lock().retain(|n| n != node);
            Ok(0)
        }

        async fn status(&self, node: &str) -> NodeStatus {
            if self.running.lock().iter().any(|n| n == node) {
                NodeStatus::Running
            } else {
                NodeStatus::Halted
            }
        }
    }

    fn controller(host: Arc<RecordingHost>) -> (ClusterController, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let topology = ClusterTopology::new("sturdy", dir.path());
        let mut c = ClusterController::new(topology, host, dir.path().join("cfg")).unwrap();
        for i in 0..2 {
            let name = format!("sturdy_{i}");
            c.add_node(NodeSpec::new(&name)).unwrap();
            c.add_local_node(&name).unwrap();
        }
        (c, dir)
    }

    #[tokio::test]
    async fn persists_config_on_mutation() {
        let host = Arc::new(RecordingHost::default());
        let (c, _dir) = controller(host);
        let text = std::fs::read_to_string(c.config_path()).unwrap();
        assert!(text.contains("cluster = sturdy_0,sturdy_1"));
        let local = std::fs::read_to_string(c.local_nodes_path()).unwrap();
        assert!(local.contains("cluster = sturdy_0,sturdy_1"));
    }

    #[tokio::test]
    async fn remove_node_also_drops_local_membership() {
        let host = Arc::new(RecordingHost::default());
        let (mut c, _dir) = controller(host);
        c.remove_node("sturdy_1").unwrap();
        assert_eq!(c.list_local_nodes(), ["sturdy_0"]);
        let local = std::fs::read_to_string(c.local_nodes_path()).unwrap();
        assert!(!local.contains("sturdy_1"));
    }

    #[tokio::test]
    async fn start_and_stop_follow_join_order() {
        let host = Arc::new(RecordingHost::default());
        let (c, _dir) = controller(host.clone());
        c.start().await.unwrap();
        assert_eq!(*host.running.lock(), ["sturdy_0", "sturdy_1"]);
        let codes = c.stop().await.unwrap();
        assert_eq!(codes.get("sturdy_0"), Some(&0));
        assert_eq!(codes.get("sturdy_1"), Some(&0));
        assert!(host.running.lock().is_empty());
    }

    #[tokio::test]
    async fn operations_require_membership() {
        let host = Arc::new(RecordingHost::default());
        let (c, _dir) = controller(host);
        let err = c.start_one("sturdy_9").await.unwrap_err();
        assert!(matches!(
            err,
            ControllerError::Topology(TopologyError::UnknownNode(_))
        ));
        let err = c.collapse("sturdy_9", 1).await.unwrap_err();
        assert!(matches!(
            err,
            ControllerError::Topology(TopologyError::UnknownNode(_))
        ));
    }

    #[tokio::test]
    async fn collapse_invokes_remote_collapse() {
        let host = Arc::new(RecordingHost::default());
        let (c, _dir) = controller(host.clone());
        c.collapse("sturdy_1", 3).await.unwrap();
        let calls = host.calls.lock();
        assert_eq!(
            calls[0],
            vec!["--collapse-remote", "sturdy", "127.0.0.1", "7081", "3"]
        );
    }

    #[tokio::test]
    async fn entries_per_file_comes_from_version_output() {
        let host = Arc::new(RecordingHost::default());
        let (c, _dir) = controller(host);
        assert_eq!(c.entries_per_file().await.unwrap(), 1000);
    }

    #[tokio::test]
    async fn create_and_remove_dirs_are_idempotent() {
        let host = Arc::new(RecordingHost::default());
        let (c, _dir) = controller(host);
        c.create_dirs("sturdy_0").unwrap();
        c.create_dirs("sturdy_0").unwrap();
        let home = c.node_config("sturdy_0").unwrap().home.clone();
        assert!(home.is_dir());
        c.remove_dirs("sturdy_0").unwrap();
        c.remove_dirs("sturdy_0").unwrap();
        assert!(!home.exists());
    }

    #[tokio::test]
    async fn wipe_recreates_empty_data_dir() {
        let host = Arc::new(RecordingHost::default());
        let (c, _dir) = controller(host);
        c.create_dirs("sturdy_0").unwrap();
        let home = c.node_config("sturdy_0").unwrap().home.clone();
        std::fs::write(home.join("000.tlog"), b"data").unwrap();
        c.wipe("sturdy_0").unwrap();
        assert!(home.is_dir());
        assert_eq!(std::fs::read_dir(&home).unwrap().count(), 0);
    }
}
