//! Consistency auditing
//!
//! After a disruptive scenario, [`ConsistencyAuditor`] certifies that two
//! nodes' stores converged: it flushes the stores through dirty reads,
//! requires the nodes to be halted, dumps and diffs their stores within
//! the bounded tolerance, and cross-checks the last-applied sequence
//! numbers straight out of the transaction logs. Failures carry the full
//! divergence report; cluster state is left as-is for post-mortem
//! inspection.

use log::{debug, error};
use thiserror::Error;

use crate::client::{ClientError, ClientFactory};
use crate::compare::{certify, CompareError, DivergenceReport, StoreDump, EXEMPT_KEYS};
use crate::controller::{ClusterController, ControllerError};
use crate::process::NodeStatus;
use crate::tlog::{self, TlogError, ENTRY_KIND_MASTER_SET};

#[derive(Debug, Error)]
pub enum AuditError {
    /// Store dumps are only taken from halted nodes.
    #[error("node {0} must be halted to audit its store")]
    NodeNotHalted(String),
    #[error("no complete entry in the last tlog of {0}")]
    EmptyLog(String),
    #[error(
        "tlog rollover violated on {node}: segment {segment} opens at {first_i}, \
         expected {segment} x {entries_per_file}"
    )]
    RolloverViolation {
        node: String,
        first_i: i64,
        segment: u64,
        entries_per_file: u64,
    },
    #[error(
        "last applied entries out of sync: {left}={left_i}, {right}={right_i} \
         (last entry kind {kind:?})"
    )]
    CountersOutOfSync {
        left: String,
        left_i: i64,
        right: String,
        right_i: i64,
        kind: Option<u32>,
    },
    #[error(transparent)]
    Controller(#[from] ControllerError),
    #[error(transparent)]
    Tlog(#[from] TlogError),
    #[error(transparent)]
    Compare(#[from] CompareError),
    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Certifies replica convergence for one cluster.
pub struct ConsistencyAuditor<'a> {
    controller: &'a ClusterController,
}

impl<'a> ConsistencyAuditor<'a> {
    pub fn new(controller: &'a ClusterController) -> Self {
        ConsistencyAuditor { controller }
    }

    /// Force one node to sync its store to disk by issuing a bounded dirty
    /// read pinned to it.
    pub async fn flush_store(
        &self,
        factory: &dyn ClientFactory,
        node: &str,
    ) -> Result<(), AuditError> {
        self.controller.node_config(node)?;
        let client = factory.client();
        client.allow_dirty_reads().await;
        client.set_dirty_read_node(node).await?;
        client.range(Some(""), true, Some("a"), false, Some(1)).await?;
        client.disallow_dirty_reads().await;
        Ok(())
    }

    /// [`Self::flush_store`] for the given nodes, or every member when
    /// `nodes` is `None`.
    pub async fn flush_stores(
        &self,
        factory: &dyn ClientFactory,
        nodes: Option<&[&str]>,
    ) -> Result<(), AuditError> {
        let all;
        let nodes = match nodes {
            Some(nodes) => nodes,
            None => {
                all = self.controller.list_nodes();
                all.as_slice()
            }
        };
        for node in nodes {
            self.flush_store(factory, node).await?;
        }
        Ok(())
    }

    async fn require_halted(&self, node: &str) -> Result<(), AuditError> {
        match self.controller.status_one(node).await? {
            NodeStatus::Halted => Ok(()),
            NodeStatus::Running => Err(AuditError::NodeNotHalted(node.to_string())),
        }
    }

    /// Dump a halted node's store.
    pub async fn dump_store(&self, node: &str) -> Result<StoreDump, AuditError> {
        self.require_halted(node).await?;
        let text = self.controller.dump_store(node).await?;
        Ok(StoreDump::parse(&text)?)
    }

    /// Dump both stores and certify them within the bounded tolerance.
    /// The failing verdict carries the full report, which is also logged
    /// as JSON for post-mortem runs.
    pub async fn compare_stores(
        &self,
        left: &str,
        right: &str,
    ) -> Result<DivergenceReport, AuditError> {
        let left_dump = self.dump_store(left).await?;
        debug!("counter value for store of {left}: {}", left_dump.counter);
        let right_dump = self.dump_store(right).await?;
        debug!("counter value for store of {right}: {}", right_dump.counter);
        match certify(left, &left_dump, right, &right_dump, &EXEMPT_KEYS) {
            Ok(report) => Ok(report),
            Err(e) => {
                if let CompareError::TooManyDivergences { report, .. } = &e {
                    error!("stores of {left} and {right} diverge:\n{report}");
                }
                Err(e.into())
            }
        }
    }

    fn last_tlog_bytes(&self, node: &str) -> Result<(u64, Vec<u8>), AuditError> {
        let home = &self.controller.node_config(node)?.home;
        let (segment, path) = tlog::last_tlog_in(home)?;
        debug!("reading i from {}", path.display());
        let data = std::fs::read(&path).map_err(TlogError::from)?;
        Ok((segment, data))
    }

    /// Last applied sequence number, read from the node's newest tlog.
    pub async fn last_sequence_number(&self, node: &str) -> Result<Option<i64>, AuditError> {
        let (_, data) = self.last_tlog_bytes(node)?;
        Ok(tlog::last_sequence_number(&data)?)
    }

    /// Type code of the node's newest tlog entry.
    pub async fn last_entry_kind(&self, node: &str) -> Result<Option<u32>, AuditError> {
        let (_, data) = self.last_tlog_bytes(node)?;
        Ok(tlog::last_entry_kind(&data)?)
    }

    /// Check that two nodes applied the same entries, allowing the leading
    /// node to be a single entry ahead. A larger skew is accepted only
    /// when the leading node's last entry is the master-set marker (it is
    /// not replicated to witnesses in lockstep).
    pub async fn assert_last_i_in_sync(&self, left: &str, right: &str) -> Result<(), AuditError> {
        let left_i = self
            .last_sequence_number(left)
            .await?
            .ok_or_else(|| AuditError::EmptyLog(left.to_string()))?;
        let right_i = self
            .last_sequence_number(right)
            .await?
            .ok_or_else(|| AuditError::EmptyLog(right.to_string()))?;
        let (hi_node, hi, lo) = if left_i > right_i {
            (left, left_i, right_i)
        } else {
            (right, right_i, left_i)
        };
        if hi - lo > 1 {
            let kind = self.last_entry_kind(hi_node).await?;
            if kind != Some(ENTRY_KIND_MASTER_SET) {
                return Err(AuditError::CountersOutOfSync {
                    left: left.to_string(),
                    left_i,
                    right: right.to_string(),
                    right_i,
                    kind,
                });
            }
        }
        Ok(())
    }

    /// Check the rollover invariant on the node's newest tlog: segment `n`
    /// must open at `n * entries_per_file`.
    pub async fn check_rollover(&self, node: &str) -> Result<(), AuditError> {
        let entries_per_file = self.controller.entries_per_file().await?;
        let (segment, data) = self.last_tlog_bytes(node)?;
        let first_i = tlog::first_sequence_number(&data)?
            .ok_or_else(|| AuditError::EmptyLog(node.to_string()))?;
        if !tlog::rollover_start_ok(first_i, segment, entries_per_file) {
            return Err(AuditError::RolloverViolation {
                node: node.to_string(),
                first_i,
                segment,
                entries_per_file,
            });
        }
        Ok(())
    }

    /// Number of tlog files (any lifecycle stage) in the node's home.
    pub async fn tlog_count(&self, node: &str) -> Result<usize, AuditError> {
        let home = &self.controller.node_config(node)?.home;
        Ok(tlog::tlog_census(home)?)
    }
}
