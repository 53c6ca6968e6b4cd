//! Test harness for the sturdy replicated key-value store
//!
//! Drives a multi-node cluster through lifecycle operations (provisioning,
//! start/stop, master failover, log collapsing), runs concurrent client
//! workloads with failure injection, and certifies afterwards that the
//! replicas converged: transaction logs are decoded directly and store
//! dumps are diffed within a bounded tolerance.
//!
//! The store itself is an external collaborator: daemons and maintenance
//! tools run through [`process::ProcessHost`], client traffic goes through
//! [`client::StoreClient`].

pub mod audit;
pub mod client;
pub mod compare;
pub mod config;
pub mod controller;
pub mod process;
pub mod scenario;
pub mod tlog;
pub mod topology;

/// Testing utilities for integration tests.
pub mod testing;

pub use audit::{AuditError, ConsistencyAuditor};
pub use client::{ClientError, ClientFactory, StoreClient};
pub use compare::{certify, diff_dumps, CompareError, DivergenceReport, StoreDump, EXEMPT_KEYS};
pub use controller::{ClusterController, ControllerError};
pub use process::{CommandOutput, LocalProcessHost, NodeStatus, ProcessHost};
pub use scenario::{
    iterate_n_times, restart_single_slave_scenario, retrying, run_scenario, FailFlag,
    IterateOptions, ScenarioError, ScenarioOrchestrator, SlaveRestartScenario,
};
pub use tlog::{LogEntry, TlogError, TlogScanner};
pub use topology::{ClusterTopology, LocalNodeSet, LogLevel, Node, NodeSpec, TopologyError};
