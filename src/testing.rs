//! Testing utilities
//!
//! In-memory stand-ins for the external collaborators, used by this
//! crate's own tests and by integration tests that exercise scenarios
//! without a real cluster: an in-memory [`StoreClient`] with scriptable
//! failures, and a [`ProcessHost`] that serves canned tool output.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::client::{ClientError, ClientFactory, StoreClient};
use crate::process::{CommandOutput, NodeStatus, ProcessHost};

/// Failures an [`InMemoryStore`] injects into upcoming client operations.
#[derive(Debug, Clone)]
pub struct ScriptedFailures {
    remaining: u32,
    error: ClientError,
}

impl ScriptedFailures {
    /// Fail the next `count` key/value operations with clones of `error`.
    pub fn fail_next(count: u32, error: ClientError) -> Self {
        ScriptedFailures {
            remaining: count,
            error,
        }
    }
}

#[derive(Default)]
struct StoreState {
    data: BTreeMap<String, String>,
    script: Option<ScriptedFailures>,
    master: Option<String>,
    dirty_read_node: Option<String>,
    dirty_reads_allowed: bool,
}

/// Shared in-memory key/value store. Acts as its own [`ClientFactory`];
/// every handed-out client reads and writes the same map, so concurrent
/// workload tasks observe each other the way they would against a real
/// cluster.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<StoreState>>,
    dropped: Arc<AtomicU32>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        InMemoryStore::default()
    }

    /// Queue failures for upcoming operations.
    pub fn script(&self, failures: ScriptedFailures) {
        self.state.lock().script = Some(failures);
    }

    /// Declare which node the store should report as master.
    pub fn set_master(&self, node: Option<&str>) {
        self.state.lock().master = node.map(str::to_string);
    }

    /// Synchronous peek for assertions.
    pub fn get_sync(&self, key: &str) -> Option<String> {
        self.state.lock().data.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().data.is_empty()
    }

    /// How many times clients dropped their connections.
    pub fn dropped_connections(&self) -> u32 {
        self.dropped.load(Ordering::SeqCst)
    }

    pub fn dirty_reads_allowed(&self) -> bool {
        self.state.lock().dirty_reads_allowed
    }

    pub fn dirty_read_node(&self) -> Option<String> {
        self.state.lock().dirty_read_node.clone()
    }

    /// Snapshot of the whole map, in key order.
    pub fn entries(&self) -> Vec<(String, String)> {
        self.state
            .lock()
            .data
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn take_failure(&self) -> Option<ClientError> {
        let mut state = self.state.lock();
        if let Some(script) = &mut state.script {
            if script.remaining > 0 {
                script.remaining -= 1;
                return Some(script.error.clone());
            }
            state.script = None;
        }
        None
    }
}

impl ClientFactory for InMemoryStore {
    fn client(&self) -> Arc<dyn StoreClient> {
        Arc::new(InMemoryClient {
            store: self.clone(),
        })
    }
}

/// Client handle over an [`InMemoryStore`].
pub struct InMemoryClient {
    store: InMemoryStore,
}

impl InMemoryClient {
    fn bounded_range(
        data: &BTreeMap<String, String>,
        first: Option<&str>,
        include_first: bool,
        last: Option<&str>,
        include_last: bool,
    ) -> Vec<(String, String)> {
        data.iter()
            .filter(|(k, _)| match first {
                Some(f) => {
                    if include_first {
                        k.as_str() >= f
                    } else {
                        k.as_str() > f
                    }
                }
                None => true,
            })
            .filter(|(k, _)| match last {
                Some(l) => {
                    if include_last {
                        k.as_str() <= l
                    } else {
                        k.as_str() < l
                    }
                }
                None => true,
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn cap<T>(mut items: Vec<T>, max: Option<usize>) -> Vec<T> {
        if let Some(max) = max {
            items.truncate(max);
        }
        items
    }
}

#[async_trait]
impl StoreClient for InMemoryClient {
    async fn set(&self, key: &str, value: &str) -> Result<(), ClientError> {
        if let Some(err) = self.store.take_failure() {
            return Err(err);
        }
        self.store
            .state
            .lock()
            .data
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<String, ClientError> {
        if let Some(err) = self.store.take_failure() {
            return Err(err);
        }
        self.store
            .state
            .lock()
            .data
            .get(key)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), ClientError> {
        if let Some(err) = self.store.take_failure() {
            return Err(err);
        }
        self.store
            .state
            .lock()
            .data
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| ClientError::NotFound(key.to_string()))
    }

    async fn range(
        &self,
        first: Option<&str>,
        include_first: bool,
        last: Option<&str>,
        include_last: bool,
        max: Option<usize>,
    ) -> Result<Vec<String>, ClientError> {
        if let Some(err) = self.store.take_failure() {
            return Err(err);
        }
        let state = self.store.state.lock();
        let entries = Self::bounded_range(&state.data, first, include_first, last, include_last);
        Ok(Self::cap(
            entries.into_iter().map(|(k, _)| k).collect(),
            max,
        ))
    }

    async fn range_entries(
        &self,
        first: Option<&str>,
        include_first: bool,
        last: Option<&str>,
        include_last: bool,
        max: Option<usize>,
    ) -> Result<Vec<(String, String)>, ClientError> {
        if let Some(err) = self.store.take_failure() {
            return Err(err);
        }
        let state = self.store.state.lock();
        let entries = Self::bounded_range(&state.data, first, include_first, last, include_last);
        Ok(Self::cap(entries, max))
    }

    async fn rev_range_entries(
        &self,
        first: Option<&str>,
        include_first: bool,
        last: Option<&str>,
        include_last: bool,
        max: Option<usize>,
    ) -> Result<Vec<(String, String)>, ClientError> {
        if let Some(err) = self.store.take_failure() {
            return Err(err);
        }
        let state = self.store.state.lock();
        // Reversed iteration order means reversed bounds.
        let mut entries =
            Self::bounded_range(&state.data, last, include_last, first, include_first);
        entries.reverse();
        Ok(Self::cap(entries, max))
    }

    async fn prefix(&self, prefix: &str, max: Option<usize>) -> Result<Vec<String>, ClientError> {
        if let Some(err) = self.store.take_failure() {
            return Err(err);
        }
        let state = self.store.state.lock();
        Ok(Self::cap(
            state
                .data
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect(),
            max,
        ))
    }

    async fn who_master(&self) -> Result<Option<String>, ClientError> {
        if let Some(err) = self.store.take_failure() {
            return Err(err);
        }
        Ok(self.store.state.lock().master.clone())
    }

    async fn expect_progress_possible(&self) -> Result<bool, ClientError> {
        Ok(self.store.state.lock().master.is_some())
    }

    async fn drop_connections(&self) {
        self.store.dropped.fetch_add(1, Ordering::SeqCst);
    }

    async fn allow_dirty_reads(&self) {
        self.store.state.lock().dirty_reads_allowed = true;
    }

    async fn disallow_dirty_reads(&self) {
        let mut state = self.store.state.lock();
        state.dirty_reads_allowed = false;
        state.dirty_read_node = None;
    }

    async fn set_dirty_read_node(&self, node: &str) -> Result<(), ClientError> {
        self.store.state.lock().dirty_read_node = Some(node.to_string());
        Ok(())
    }
}

/// [`ProcessHost`] that answers tool invocations from canned responses,
/// keyed by the leading flag, and tracks daemon state in memory.
#[derive(Default)]
pub struct CannedProcessHost {
    responses: Mutex<HashMap<String, Vec<CommandOutput>>>,
    running: Mutex<Vec<String>>,
    calls: Mutex<Vec<Vec<String>>>,
}

impl CannedProcessHost {
    pub fn new() -> Self {
        CannedProcessHost::default()
    }

    /// Queue a response for invocations whose first argument is `flag`.
    /// Responses are served in FIFO order; the last one is sticky.
    pub fn respond(&self, flag: &str, output: CommandOutput) {
        self.responses
            .lock()
            .entry(flag.to_string())
            .or_default()
            .push(output);
    }

    /// Shorthand for a successful response with the given stdout.
    pub fn respond_stdout(&self, flag: &str, stdout: &str) {
        self.respond(
            flag,
            CommandOutput {
                exit_code: 0,
                stdout: stdout.to_string(),
                stderr: String::new(),
            },
        );
    }

    /// Every tool invocation seen so far.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().clone()
    }

    pub fn mark_running(&self, node: &str) {
        self.running.lock().push(node.to_string());
    }
}

#[async_trait]
impl ProcessHost for CannedProcessHost {
    async fn run_tool(&self, args: &[String]) -> std::io::Result<CommandOutput> {
        self.calls.lock().push(args.to_vec());
        let flag = args.first().cloned().unwrap_or_default();
        let mut responses = self.responses.lock();
        match responses.get_mut(&flag) {
            Some(queue) if !queue.is_empty() => {
                if queue.len() == 1 {
                    Ok(queue[0].clone())
                } else {
                    Ok(queue.remove(0))
                }
            }
            _ => Ok(CommandOutput {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            }),
        }
    }

    async fn start_daemon(&self, node: &str, _config_path: &Path) -> std::io::Result<()> {
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
