//! Cluster topology model
//!
//! Typed, in-memory description of a cluster: its member nodes, their
//! addresses and directories, and cluster-wide parameters (quorum, forced
//! master, read-only flag, lease period). The on-disk representation lives
//! in [`crate::config`]; this module only enforces the structural rules.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use thiserror::Error;

/// Default client port for the first node of a cluster.
pub const DEFAULT_CLIENT_PORT: u16 = 7080;
/// Default messaging port for the first node of a cluster.
pub const DEFAULT_MESSAGING_PORT: u16 = 10000;
/// Default node IP.
pub const DEFAULT_IP: &str = "127.0.0.1";

/// Errors raised by topology mutations and queries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopologyError {
    /// Node names are restricted to `[A-Za-z0-9_]+`.
    #[error("invalid node name {0:?}")]
    InvalidName(String),
    #[error("node {0:?} already exists")]
    DuplicateNode(String),
    #[error("unknown node {0:?}")]
    UnknownNode(String),
    #[error("invalid log level {0:?}")]
    InvalidLogLevel(String),
    /// Quorum must satisfy `1 <= quorum <= member count` at all times.
    #[error("invalid quorum {quorum} for {members} member(s)")]
    InvalidQuorum { quorum: u32, members: usize },
    #[error("node {0:?} is already a local node")]
    DuplicateLocalNode(String),
}

/// Log levels recognized by the store daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Notice,
    Warning,
    Error,
    Fatal,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Notice => "notice",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Fatal => "fatal",
        }
    }
}

impl FromStr for LogLevel {
    type Err = TopologyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "notice" => Ok(LogLevel::Notice),
            "warning" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            "fatal" => Ok(LogLevel::Fatal),
            other => Err(TopologyError::InvalidLogLevel(other.to_string())),
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Check a candidate node name against the allowed pattern `[A-Za-z0-9_]+`.
pub fn valid_node_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// One member of a cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub name: String,
    pub ip: String,
    pub client_port: u16,
    pub messaging_port: u16,
    pub log_level: LogLevel,
    pub log_dir: PathBuf,
    /// Database + transaction-log home directory.
    pub home: PathBuf,
    /// Separate directory for rolled-over tlog files, if configured.
    pub tlf_dir: Option<PathBuf>,
    /// Separate directory for collapsed head databases, if configured.
    pub head_dir: Option<PathBuf>,
    /// Witness nodes take part in quorum but never become master.
    pub is_witness: bool,
    /// Set when this node was forced as master with `preferred = true`.
    pub is_preferred_master: bool,
    /// Artificial per-step collapse delay (seconds), for slow-compaction races.
    pub collapse_slowdown: Option<u32>,
}

/// Parameters for [`ClusterTopology::add_node`]. Unset fields fall back to
/// the documented defaults (ports offset by join position, directories
/// derived from the topology's base directory).
#[derive(Debug, Clone, Default)]
pub struct NodeSpec {
    name: String,
    ip: Option<String>,
    client_port: Option<u16>,
    messaging_port: Option<u16>,
    log_level: Option<LogLevel>,
    log_dir: Option<PathBuf>,
    home: Option<PathBuf>,
    tlf_dir: Option<PathBuf>,
    head_dir: Option<PathBuf>,
    is_witness: bool,
    collapse_slowdown: Option<u32>,
}

impl NodeSpec {
    pub fn new(name: impl Into<String>) -> Self {
        NodeSpec {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    pub fn client_port(mut self, port: u16) -> Self {
        self.client_port = Some(port);
        self
    }

    pub fn messaging_port(mut self, port: u16) -> Self {
        self.messaging_port = Some(port);
        self
    }

    /// Parsed against the recognized level set.
    pub fn log_level(mut self, level: &str) -> Result<Self, TopologyError> {
        self.log_level = Some(level.parse()?);
        Ok(self)
    }

    pub fn log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    pub fn home(mut self, dir: impl Into<PathBuf>) -> Self {
        self.home = Some(dir.into());
        self
    }

    pub fn tlf_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.tlf_dir = Some(dir.into());
        self
    }

    pub fn head_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.head_dir = Some(dir.into());
        self
    }

    pub fn witness(mut self, yes: bool) -> Self {
        self.is_witness = yes;
        self
    }

    pub fn collapse_slowdown(mut self, seconds: u32) -> Self {
        self.collapse_slowdown = Some(seconds);
        self
    }
}

/// Ordered cluster membership plus cluster-wide parameters.
///
/// Node order is join order and is significant: the serialized membership
/// list and port defaults both follow it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterTopology {
    cluster_id: String,
    base_dir: PathBuf,
    nodes: Vec<Node>,
    quorum: Option<u32>,
    forced_master: Option<String>,
    preferred_master: bool,
    read_only: bool,
    /// Master lease period in seconds.
    lease_period: Option<u32>,
}

impl ClusterTopology {
    pub fn new(cluster_id: impl Into<String>, base_dir: impl Into<PathBuf>) -> Self {
        ClusterTopology {
            cluster_id: cluster_id.into(),
            base_dir: base_dir.into(),
            nodes: Vec::new(),
            quorum: None,
            forced_master: None,
            preferred_master: false,
            read_only: false,
            lease_period: None,
        }
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn quorum(&self) -> Option<u32> {
        self.quorum
    }

    pub fn forced_master(&self) -> Option<&str> {
        self.forced_master.as_deref()
    }

    pub fn preferred_master(&self) -> bool {
        self.preferred_master
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn lease_period(&self) -> Option<u32> {
        self.lease_period
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.iter().any(|n| n.name == name)
    }

    /// Add a member. Name, uniqueness and log level are validated before
    /// anything is mutated; a failed call leaves the topology unchanged.
    pub fn add_node(&mut self, spec: NodeSpec) -> Result<(), TopologyError> {
        if !valid_node_name(&spec.name) {
            return Err(TopologyError::InvalidName(spec.name));
        }
        if self.contains(&spec.name) {
            return Err(TopologyError::DuplicateNode(spec.name));
        }

        let offset = self.nodes.len() as u16;
        let name = spec.name;
        let node = Node {
            ip: spec.ip.unwrap_or_else(|| DEFAULT_IP.to_string()),
            client_port: spec.client_port.unwrap_or(DEFAULT_CLIENT_PORT + offset),
            messaging_port: spec
                .messaging_port
                .unwrap_or(DEFAULT_MESSAGING_PORT + offset),
            log_level: spec.log_level.unwrap_or_default(),
            log_dir: spec
                .log_dir
                .unwrap_or_else(|| self.default_log_dir(&name)),
            home: spec.home.unwrap_or_else(|| self.default_home(&name)),
            tlf_dir: spec.tlf_dir,
            head_dir: spec.head_dir,
            is_witness: spec.is_witness,
            is_preferred_master: false,
            collapse_slowdown: spec.collapse_slowdown,
            name,
        };
        self.nodes.push(node);
        Ok(())
    }

    /// Remove a member. Clears the forced-master override if it named this
    /// node. Fails with `InvalidQuorum` if a configured quorum would no
    /// longer fit the remaining membership; quorum is never auto-adjusted.
    pub fn remove_node(&mut self, name: &str) -> Result<Node, TopologyError> {
        let idx = self
            .nodes
            .iter()
            .position(|n| n.name == name)
            .ok_or_else(|| TopologyError::UnknownNode(name.to_string()))?;
        if let Some(q) = self.quorum {
            if q as usize > self.nodes.len() - 1 {
                return Err(TopologyError::InvalidQuorum {
                    quorum: q,
                    members: self.nodes.len() - 1,
                });
            }
        }
        if self.forced_master.as_deref() == Some(name) {
            self.forced_master = None;
            self.preferred_master = false;
        }
        Ok(self.nodes.remove(idx))
    }

    /// Force (or clear) the master override. With `preferred = true` the
    /// override is recorded as a preference instead of a hard assignment;
    /// clearing drops both.
    pub fn force_master(
        &mut self,
        name: Option<&str>,
        preferred: bool,
    ) -> Result<(), TopologyError> {
        match name {
            Some(name) => {
                if !self.contains(name) {
                    return Err(TopologyError::UnknownNode(name.to_string()));
                }
                self.forced_master = Some(name.to_string());
                self.preferred_master = preferred;
                for node in &mut self.nodes {
                    node.is_preferred_master = preferred && node.name == name;
                }
            }
            None => {
                self.forced_master = None;
                self.preferred_master = false;
                for node in &mut self.nodes {
                    node.is_preferred_master = false;
                }
            }
        }
        Ok(())
    }

    pub fn set_quorum(&mut self, quorum: u32) -> Result<(), TopologyError> {
        if quorum < 1 || quorum as usize > self.nodes.len() {
            return Err(TopologyError::InvalidQuorum {
                quorum,
                members: self.nodes.len(),
            });
        }
        self.quorum = Some(quorum);
        Ok(())
    }

    /// `false` removes the flag entirely from the persisted state instead of
    /// writing a negative value (sparse-serialization convention).
    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    pub fn set_lease_period(&mut self, seconds: u32) {
        self.lease_period = Some(seconds);
    }

    /// Change the log level of every member.
    pub fn set_log_level(&mut self, level: LogLevel) {
        for node in &mut self.nodes {
            node.log_level = level;
        }
    }

    pub fn node(&self, name: &str) -> Result<&Node, TopologyError> {
        self.nodes
            .iter()
            .find(|n| n.name == name)
            .ok_or_else(|| TopologyError::UnknownNode(name.to_string()))
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Member names in join order.
    pub fn list_nodes(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.name.as_str()).collect()
    }

    /// The `(name, ip, client_port)` triples a client needs to reach the
    /// cluster, in join order.
    pub fn client_config(&self) -> Vec<(&str, &str, u16)> {
        self.nodes
            .iter()
            .map(|n| (n.name.as_str(), n.ip.as_str(), n.client_port))
            .collect()
    }

    fn default_home(&self, name: &str) -> PathBuf {
        self.base_dir.join("db").join(&self.cluster_id).join(name)
    }

    fn default_log_dir(&self, name: &str) -> PathBuf {
        self.base_dir.join("log").join(&self.cluster_id).join(name)
    }

    pub(crate) fn restore(
        cluster_id: String,
        base_dir: PathBuf,
        nodes: Vec<Node>,
        quorum: Option<u32>,
        forced_master: Option<String>,
        preferred_master: bool,
        read_only: bool,
        lease_period: Option<u32>,
    ) -> Self {
        ClusterTopology {
            cluster_id,
            base_dir,
            nodes,
            quorum,
            forced_master,
            preferred_master,
            read_only,
            lease_period,
        }
    }
}

/// Names of the nodes this harness instance manages and may launch.
/// Membership requires the node to exist in the topology; insertion order
/// is preserved for listing and serialization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalNodeSet {
    names: Vec<String>,
}

impl LocalNodeSet {
    pub fn new() -> Self {
        LocalNodeSet::default()
    }

    pub fn add(&mut self, topology: &ClusterTopology, name: &str) -> Result<(), TopologyError> {
        if !topology.contains(name) {
            return Err(TopologyError::UnknownNode(name.to_string()));
        }
        if self.names.iter().any(|n| n == name) {
            return Err(TopologyError::DuplicateLocalNode(name.to_string()));
        }
        self.names.push(name.to_string());
        Ok(())
    }

    /// Removing a name that was never added fails with `UnknownNode`,
    /// mirroring `add`.
    pub fn remove(&mut self, name: &str) -> Result<(), TopologyError> {
        let idx = self
            .names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| TopologyError::UnknownNode(name.to_string()))?;
        self.names.remove(idx);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    pub fn list(&self) -> &[String] {
        &self.names
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub(crate) fn restore(names: Vec<String>) -> Self {
        LocalNodeSet { names }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topology() -> ClusterTopology {
        ClusterTopology::new("sturdy", "/tmp/sturdy_tests")
    }

    #[test]
    fn add_node_applies_defaults() {
        let mut t = topology();
        t.add_node(NodeSpec::new("sturdy_0")).unwrap();
        let n = t.node("sturdy_0").unwrap();
        assert_eq!(n.ip, "127.0.0.1");
        assert_eq!(n.client_port, 7080);
        assert_eq!(n.messaging_port, 10000);
        assert_eq!(n.log_level, LogLevel::Info);
        assert_eq!(n.home, PathBuf::from("/tmp/sturdy_tests/db/sturdy/sturdy_0"));
        assert_eq!(
            n.log_dir,
            PathBuf::from("/tmp/sturdy_tests/log/sturdy/sturdy_0")
        );
        assert!(!n.is_witness);
    }

    #[test]
    fn add_node_keeps_explicit_attributes() {
        let mut t = topology();
        let spec = NodeSpec::new("sturdy_1")
            .ip("192.168.0.1")
            .client_port(7081)
            .messaging_port(12345)
            .log_level("debug")
            .unwrap()
            .log_dir("/tmp")
            .home("/tmp/joe");
        t.add_node(spec).unwrap();
        let n = t.node("sturdy_1").unwrap();
        assert_eq!(n.ip, "192.168.0.1");
        assert_eq!(n.client_port, 7081);
        assert_eq!(n.messaging_port, 12345);
        assert_eq!(n.log_level, LogLevel::Debug);
        assert_eq!(n.log_dir, PathBuf::from("/tmp"));
        assert_eq!(n.home, PathBuf::from("/tmp/joe"));
    }

    #[test]
    fn add_node_rejects_invalid_names() {
        let mut t = topology();
        for bad in ["arak oon", "arak#oon", "arako,on", ""] {
            let err = t.add_node(NodeSpec::new(bad)).unwrap_err();
            assert_eq!(err, TopologyError::InvalidName(bad.to_string()));
        }
        assert!(t.is_empty());
    }

    #[test]
    fn add_node_rejects_duplicates() {
        let mut t = topology();
        t.add_node(NodeSpec::new("sturdy_0")).unwrap();
        let err = t.add_node(NodeSpec::new("sturdy_0")).unwrap_err();
        assert_eq!(err, TopologyError::DuplicateNode("sturdy_0".to_string()));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn add_node_rejects_bad_log_level() {
        let err = NodeSpec::new("sturdy_0").log_level("depug").unwrap_err();
        assert_eq!(err, TopologyError::InvalidLogLevel("depug".to_string()));
    }

    #[test]
    fn remove_node_unknown() {
        let mut t = topology();
        let err = t.remove_node("sturdy_4").unwrap_err();
        assert_eq!(err, TopologyError::UnknownNode("sturdy_4".to_string()));
    }

    #[test]
    fn remove_node_clears_forced_master() {
        let mut t = topology();
        t.add_node(NodeSpec::new("sturdy_0")).unwrap();
        t.add_node(NodeSpec::new("sturdy_1")).unwrap();
        t.force_master(Some("sturdy_0"), false).unwrap();
        t.remove_node("sturdy_0").unwrap();
        assert_eq!(t.forced_master(), None);
    }

    #[test]
    fn remove_node_respects_quorum() {
        let mut t = topology();
        for i in 0..3 {
            t.add_node(NodeSpec::new(format!("sturdy_{i}"))).unwrap();
        }
        t.set_quorum(3).unwrap();
        let err = t.remove_node("sturdy_2").unwrap_err();
        assert_eq!(
            err,
            TopologyError::InvalidQuorum {
                quorum: 3,
                members: 2
            }
        );
        assert_eq!(t.len(), 3);
    }

    #[test]
    fn force_master_requires_member() {
        let mut t = topology();
        t.add_node(NodeSpec::new("sturdy_0")).unwrap();
        let err = t.force_master(Some("sturdy_9"), false).unwrap_err();
        assert_eq!(err, TopologyError::UnknownNode("sturdy_9".to_string()));
    }

    #[test]
    fn force_master_preferred_marks_node() {
        let mut t = topology();
        t.add_node(NodeSpec::new("sturdy_0")).unwrap();
        t.add_node(NodeSpec::new("sturdy_1")).unwrap();
        t.force_master(Some("sturdy_0"), true).unwrap();
        assert!(t.preferred_master());
        assert!(t.node("sturdy_0").unwrap().is_preferred_master);
        assert!(!t.node("sturdy_1").unwrap().is_preferred_master);
        t.force_master(None, false).unwrap();
        assert_eq!(t.forced_master(), None);
        assert!(!t.preferred_master());
    }

    #[test]
    fn quorum_bounds() {
        let mut t = topology();
        for i in 0..3 {
            t.add_node(NodeSpec::new(format!("sturdy_{i}"))).unwrap();
        }
        assert!(t.set_quorum(0).is_err());
        assert!(t.set_quorum(4).is_err());
        for q in 1..=3 {
            t.set_quorum(q).unwrap();
            assert_eq!(t.quorum(), Some(q));
        }
    }

    #[test]
    fn list_nodes_in_join_order() {
        let mut t = topology();
        for i in 0..3 {
            t.add_node(NodeSpec::new(format!("sturdy_{i}"))).unwrap();
        }
        assert_eq!(t.list_nodes(), vec!["sturdy_0", "sturdy_1", "sturdy_2"]);
        assert_eq!(
            t.client_config(),
            vec![
                ("sturdy_0", "127.0.0.1", 7080),
                ("sturdy_1", "127.0.0.1", 7081),
                ("sturdy_2", "127.0.0.1", 7082),
            ]
        );
    }

    #[test]
    fn local_nodes_require_membership() {
        let mut t = topology();
        let mut local = LocalNodeSet::new();
        let err = local.add(&t, "sturdy_0").unwrap_err();
        assert_eq!(err, TopologyError::UnknownNode("sturdy_0".to_string()));

        t.add_node(NodeSpec::new("sturdy_0")).unwrap();
        local.add(&t, "sturdy_0").unwrap();
        let err = local.add(&t, "sturdy_0").unwrap_err();
        assert_eq!(err, TopologyError::DuplicateLocalNode("sturdy_0".to_string()));
    }

    #[test]
    fn local_nodes_keep_insertion_order() {
        let mut t = topology();
        let mut local = LocalNodeSet::new();
        for name in ["sturdy_1", "sturdy_0", "sturdy_2"] {
            t.add_node(NodeSpec::new(name)).unwrap();
        }
        local.add(&t, "sturdy_1").unwrap();
        local.add(&t, "sturdy_0").unwrap();
        assert_eq!(local.list(), ["sturdy_1", "sturdy_0"]);

        local.remove("sturdy_1").unwrap();
        assert_eq!(local.list(), ["sturdy_0"]);
        let err = local.remove("sturdy_1").unwrap_err();
        assert_eq!(err, TopologyError::UnknownNode("sturdy_1".to_string()));
    }
}
