//! Store client collaborator
//!
//! The harness does not implement the store's wire protocol; it drives an
//! externally supplied client through [`StoreClient`]. What the harness
//! *does* own is the error taxonomy: a closed set of variants with a
//! single retryability capability, so workload code never matches on
//! open-ended error chains.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

/// Closed client error taxonomy.
///
/// The retryable class covers transient transport failures and master
/// redirections: the cluster is expected to recover from these while a
/// scenario disrupts it. Everything else is fatal to the workload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// The contacted node is not the master; it may hint at who is.
    #[error("node is not the master (hint: {hint:?})")]
    NotMaster { hint: Option<String> },
    /// The node lost mastership while handling the request.
    #[error("node is no longer the master")]
    NoLongerMaster,
    #[error("key not found: {0}")]
    NotFound(String),
    #[error("not connected to any node")]
    NotConnected,
    /// The peer closed the connection (reset, EOF mid-read, unreadable
    /// socket).
    #[error("connection closed: {0}")]
    ConnectionClosed(String),
    #[error("socket error: {0}")]
    Socket(String),
    #[error("request timed out")]
    Timeout,
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl ClientError {
    /// Whether a workload may drop its connection, re-acquire a client and
    /// try the same operation again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::NotMaster { .. }
                | ClientError::NoLongerMaster
                | ClientError::NotConnected
                | ClientError::ConnectionClosed(_)
                | ClientError::Socket(_)
        )
    }
}

/// Operations the harness needs from the store's client library.
///
/// Range queries take optional bounds (`None` = open end) with per-bound
/// inclusivity and an optional result cap, mirroring the store's API.
#[async_trait]
pub trait StoreClient: Send + Sync {
    async fn set(&self, key: &str, value: &str) -> Result<(), ClientError>;
    async fn get(&self, key: &str) -> Result<String, ClientError>;
    async fn delete(&self, key: &str) -> Result<(), ClientError>;

    async fn range(
        &self,
        first: Option<&str>,
        include_first: bool,
        last: Option<&str>,
        include_last: bool,
        max: Option<usize>,
    ) -> Result<Vec<String>, ClientError>;

    async fn range_entries(
        &self,
        first: Option<&str>,
        include_first: bool,
        last: Option<&str>,
        include_last: bool,
        max: Option<usize>,
    ) -> Result<Vec<(String, String)>, ClientError>;

    async fn rev_range_entries(
        &self,
        first: Option<&str>,
        include_first: bool,
        last: Option<&str>,
        include_last: bool,
        max: Option<usize>,
    ) -> Result<Vec<(String, String)>, ClientError>;

    async fn prefix(&self, prefix: &str, max: Option<usize>) -> Result<Vec<String>, ClientError>;

    /// Identity of the current master, if one is elected.
    async fn who_master(&self) -> Result<Option<String>, ClientError>;

    /// Whether the cluster can currently make progress (enough members up
    /// and in sync to accept writes).
    async fn expect_progress_possible(&self) -> Result<bool, ClientError>;

    /// Tear down any cached connections; the next call reconnects.
    async fn drop_connections(&self);

    /// Permit reads from non-master nodes.
    async fn allow_dirty_reads(&self);
    async fn disallow_dirty_reads(&self);
    /// Pin dirty reads to one node.
    async fn set_dirty_read_node(&self, node: &str) -> Result<(), ClientError>;
}

/// Hands out client handles. Workload tasks own their clients and
/// re-acquire fresh ones after dropping a broken connection; factories are
/// shared across tasks, clients are not.
pub trait ClientFactory: Send + Sync {
    fn client(&self) -> Arc<dyn StoreClient>;
}
