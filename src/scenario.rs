//! Scenario orchestration
//!
//! Runs client workloads and failure-injection routines as concurrent
//! tasks, aggregates their failures, and enforces join timeouts and retry
//! policy. The cancellation signal is a shared [`FailFlag`]: any task that
//! hits a fatal error sets it, iterative workloads poll it at loop
//! boundaries and abort early. The flag is a best-effort signal — tasks
//! racing on it may run one extra iteration, which is acceptable.
//!
//! A timed-out join reports [`ScenarioError::JoinTimeout`] but never kills
//! the tasks; they may outlive the join. Callers must accept this.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use log::{debug, error, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::audit::{AuditError, ConsistencyAuditor};
use crate::client::{ClientError, ClientFactory, StoreClient};
use crate::controller::{ClusterController, ControllerError};

/// Key used by workload iteration `suffix`.
pub fn format_key(suffix: u64) -> String {
    format!("key_{suffix:012}")
}

/// Value paired with [`format_key`].
pub fn format_value(suffix: u64) -> String {
    format!("value_{suffix:012}")
}

/// Random string of uppercase letters, for payloads that must not collide.
pub fn random_string(len: usize) -> String {
    let mut rng = StdRng::from_os_rng();
    (0..len)
        .map(|_| rng.random_range(b'A'..=b'Z') as char)
        .collect()
}

/// Shared abort signal for one scenario. Cloned into every task; setting
/// it is a single atomic write. Best-effort: readers only observe it at
/// loop boundaries.
#[derive(Clone, Debug, Default)]
pub struct FailFlag(Arc<AtomicBool>);

impl FailFlag {
    pub fn new() -> Self {
        FailFlag::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Error)]
pub enum ScenarioError {
    /// The join deadline passed with tasks still running. The tasks are
    /// left running.
    #[error("scenario join timed out after {0:?}")]
    JoinTimeout(Duration),
    #[error("task {task:?} failed: {cause}")]
    TaskFailed { task: String, cause: String },
    /// The fail flag was set without any joined task reporting an error.
    #[error("scenario marked as failed")]
    MarkedFailed,
    #[error("failure budget exceeded after {failures} failure(s) (max {max}): {last}")]
    FailureBudgetExceeded {
        failures: u32,
        max: u32,
        last: ClientError,
    },
    #[error("assertion failed for {key:?}: expected {expected:?}, got {got:?}")]
    AssertionFailed {
        key: String,
        expected: String,
        got: String,
    },
    #[error("node {node} stopped uncleanly (exit {exit_code})")]
    UncleanStop { node: String, exit_code: i32 },
    #[error("cluster has no master")]
    NoMaster,
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Controller(#[from] ControllerError),
    #[error(transparent)]
    Audit(#[from] AuditError),
}

/// Spawns named workload/failure-injection tasks and joins them.
#[derive(Default)]
pub struct ScenarioOrchestrator {
    flag: FailFlag,
    tasks: Vec<(String, JoinHandle<Result<(), ScenarioError>>)>,
}

impl ScenarioOrchestrator {
    pub fn new() -> Self {
        ScenarioOrchestrator::default()
    }

    /// The scenario's shared abort signal.
    pub fn flag(&self) -> FailFlag {
        self.flag.clone()
    }

    /// Spawn a task. A task returning an error sets the fail flag so
    /// sibling workloads can abort early.
    pub fn spawn<F>(&mut self, name: impl Into<String>, fut: F)
    where
        F: Future<Output = Result<(), ScenarioError>> + Send + 'static,
    {
        let name = name.into();
        let flag = self.flag.clone();
        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            match fut.await {
                Ok(()) => Ok(()),
                Err(e) => {
                    error!("task {task_name:?} failed: {e}");
                    flag.set();
                    Err(e)
                }
            }
        });
        self.tasks.push((name, handle));
    }

    /// Join every spawned task, reporting the first failure with the name
    /// of the task that caused it. With a timeout, exceeding the deadline
    /// yields `JoinTimeout`; the tasks keep running.
    pub async fn join(self, timeout: Option<Duration>) -> Result<(), ScenarioError> {
        let flag = self.flag;
        let tasks = self.tasks;
        let join_all = async move {
            let mut first: Option<ScenarioError> = None;
            for (name, handle) in tasks {
                match handle.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        if first.is_none() {
                            first = Some(ScenarioError::TaskFailed {
                                task: name,
                                cause: e.to_string(),
                            });
                        }
                    }
                    Err(join_err) => {
                        if first.is_none() {
                            first = Some(ScenarioError::TaskFailed {
                                task: name,
                                cause: join_err.to_string(),
                            });
                        }
                    }
                }
            }
            first
        };

        let first = match timeout {
            Some(limit) => match tokio::time::timeout(limit, join_all).await {
                Ok(first) => first,
                Err(_) => return Err(ScenarioError::JoinTimeout(limit)),
            },
            None => join_all.await,
        };

        match first {
            Some(e) => Err(e),
            None if flag.is_set() => Err(ScenarioError::MarkedFailed),
            None => Ok(()),
        }
    }
}

/// A keyed workload operation, passed by value into iteration loops.
pub type WorkloadOp = for<'a> fn(
    &'a dyn ClientFactory,
    &'a str,
    &'a str,
) -> BoxFuture<'a, Result<(), ScenarioError>>;

/// Options for [`iterate_n_times`].
#[derive(Clone, Copy)]
pub struct IterateOptions {
    /// First key/value suffix.
    pub start_suffix: u64,
    /// Tolerated failures per run; exceeding it is fatal.
    pub failure_max: u32,
    /// Which client errors count against the budget instead of failing
    /// immediately.
    pub tolerated: fn(&ClientError) -> bool,
}

impl Default for IterateOptions {
    fn default() -> Self {
        IterateOptions {
            start_suffix: 0,
            failure_max: 0,
            tolerated: |_| false,
        }
    }
}

/// Apply `op` to `n` consecutive keys. Checks the fail flag at every loop
/// boundary and stops early when another task set it. Tolerated client
/// errors count against the failure budget; a fatal error or an exhausted
/// budget sets the flag and fails the task.
pub async fn iterate_n_times(
    factory: &dyn ClientFactory,
    flag: &FailFlag,
    n: u64,
    op: WorkloadOp,
    opts: IterateOptions,
) -> Result<(), ScenarioError> {
    let mut failures = 0u32;
    for iteration in 0..n {
        if flag.is_set() {
            error!("scenario marked as failed, aborting workload at iteration {iteration}");
            break;
        }
        let suffix = iteration + opts.start_suffix;
        let key = format_key(suffix);
        let value = format_value(suffix);
        match op(factory, &key, &value).await {
            Ok(()) => {}
            Err(e) => {
                info!("{iteration}: {e} for key={key}");
                failures += 1;
                let tolerable = match &e {
                    ScenarioError::Client(client_err) => (opts.tolerated)(client_err),
                    _ => false,
                };
                if !tolerable || failures > opts.failure_max {
                    factory.client().drop_connections().await;
                    flag.set();
                    error!("!!! failing scenario");
                    return match e {
                        ScenarioError::Client(last) if tolerable => {
                            Err(ScenarioError::FailureBudgetExceeded {
                                failures,
                                max: opts.failure_max,
                                last,
                            })
                        }
                        other => Err(other),
                    };
                }
                // Tolerated: start over with a fresh connection.
                factory.client().drop_connections().await;
            }
        }
    }
    Ok(())
}

/// Default wall-clock window for one retried operation.
pub const DEFAULT_RETRY_WINDOW: Duration = Duration::from_secs(60);
/// Pause between retry attempts.
pub const RETRY_PAUSE: Duration = Duration::from_millis(500);

/// Retry `op` until it succeeds, a non-tolerated error occurs, or the
/// wall-clock window closes (bounded by duration, not attempt count).
/// Between attempts the client connection is dropped and a fresh client
/// acquired from the factory.
pub async fn retrying<T, Op>(
    factory: &dyn ClientFactory,
    tolerated: fn(&ClientError) -> bool,
    window: Duration,
    mut op: Op,
) -> Result<T, ClientError>
where
    Op: FnMut(Arc<dyn StoreClient>) -> BoxFuture<'static, Result<T, ClientError>>,
{
    let deadline = tokio::time::Instant::now() + window;
    let mut client = factory.client();
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match op(client.clone()).await {
            Ok(v) => return Ok(v),
            Err(e) => {
                debug!("caught {e} (attempt {attempts})");
                if !tolerated(&e) || tokio::time::Instant::now() >= deadline {
                    return Err(e);
                }
                sleep(RETRY_PAUSE).await;
                debug!("re-acquiring client");
                client.drop_connections().await;
                client = factory.client();
            }
        }
    }
}

// --- Standard workload operations ---

/// Set one key, retrying only across master handovers.
pub fn simple_set<'a>(
    factory: &'a dyn ClientFactory,
    key: &'a str,
    value: &'a str,
) -> BoxFuture<'a, Result<(), ScenarioError>> {
    Box::pin(async move {
        let key = key.to_string();
        let value = value.to_string();
        retrying(
            factory,
            |e| matches!(e, ClientError::NoLongerMaster),
            DEFAULT_RETRY_WINDOW,
            move |client| {
                let key = key.clone();
                let value = value.clone();
                Box::pin(async move { client.set(&key, &value).await })
            },
        )
        .await?;
        Ok(())
    })
}

/// Read one key and require the workload's value.
pub fn assert_get<'a>(
    factory: &'a dyn ClientFactory,
    key: &'a str,
    value: &'a str,
) -> BoxFuture<'a, Result<(), ScenarioError>> {
    Box::pin(async move {
        let got = factory.client().get(key).await?;
        if got != value {
            return Err(ScenarioError::AssertionFailed {
                key: key.to_string(),
                expected: value.to_string(),
                got,
            });
        }
        Ok(())
    })
}

/// Set, read back, delete, and verify the key is gone. No retries: any
/// client error surfaces to the iteration loop's policy.
pub fn set_get_and_delete<'a>(
    factory: &'a dyn ClientFactory,
    key: &'a str,
    value: &'a str,
) -> BoxFuture<'a, Result<(), ScenarioError>> {
    Box::pin(async move {
        let client = factory.client();
        client.set(key, value).await?;
        let got = client.get(key).await?;
        if got != value {
            return Err(ScenarioError::AssertionFailed {
                key: key.to_string(),
                expected: value.to_string(),
                got,
            });
        }
        client.delete(key).await?;
        match client.get(key).await {
            Err(ClientError::NotFound(_)) => Ok(()),
            Ok(got) => Err(ScenarioError::AssertionFailed {
                key: key.to_string(),
                expected: "<deleted>".to_string(),
                got,
            }),
            Err(e) => Err(e.into()),
        }
    })
}

/// [`set_get_and_delete`] with every step retried across transport
/// failures and master handovers for up to the default window. The final
/// delete tolerates `NotFound` (an earlier, half-acknowledged attempt may
/// already have removed the key).
pub fn retrying_set_get_and_delete<'a>(
    factory: &'a dyn ClientFactory,
    key: &'a str,
    value: &'a str,
) -> BoxFuture<'a, Result<(), ScenarioError>> {
    Box::pin(async move {
        let key_owned = key.to_string();
        let value_owned = value.to_string();

        let k = key_owned.clone();
        let v = value_owned.clone();
        retrying(
            factory,
            ClientError::is_retryable,
            DEFAULT_RETRY_WINDOW,
            move |client| {
                let k = k.clone();
                let v = v.clone();
                Box::pin(async move { client.set(&k, &v).await })
            },
        )
        .await?;

        let k = key_owned.clone();
        let got = retrying(
            factory,
            ClientError::is_retryable,
            DEFAULT_RETRY_WINDOW,
            move |client| {
                let k = k.clone();
                Box::pin(async move { client.get(&k).await })
            },
        )
        .await?;
        if got != value_owned {
            return Err(ScenarioError::AssertionFailed {
                key: key_owned,
                expected: value_owned,
                got,
            });
        }

        let k = key_owned.clone();
        match retrying(
            factory,
            ClientError::is_retryable,
            DEFAULT_RETRY_WINDOW,
            move |client| {
                let k = k.clone();
                Box::pin(async move { client.delete(&k).await })
            },
        )
        .await
        {
            Ok(()) | Err(ClientError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    })
}

// --- Failure-injection routines ---

/// Stop a node and require a clean exit.
pub async fn stop_node_clean(
    controller: &ClusterController,
    node: &str,
) -> Result<(), ScenarioError> {
    let exit_code = controller.stop_one(node).await?;
    if exit_code != 0 {
        return Err(ScenarioError::UncleanStop {
            node: node.to_string(),
            exit_code,
        });
    }
    Ok(())
}

/// Repeatedly bounce one node: wait, stop, wait, start.
pub async fn restart_loop(
    controller: &ClusterController,
    node: &str,
    iterations: u32,
    stop_after: Duration,
    start_after: Duration,
) -> Result<(), ScenarioError> {
    for _ in 0..iterations {
        sleep(stop_after).await;
        stop_node_clean(controller, node).await?;
        sleep(start_after).await;
        controller.start_one(node).await?;
    }
    Ok(())
}

/// Stop a set of nodes, keep them down for a random time (up to a
/// minute), then bring them back.
pub async fn delayed_restart_nodes(
    controller: &ClusterController,
    nodes: &[&str],
) -> Result<(), ScenarioError> {
    let downtime = {
        let mut rng = StdRng::from_os_rng();
        Duration::from_millis(rng.random_range(0..60_000))
    };
    for node in nodes {
        stop_node_clean(controller, node).await?;
    }
    debug!("nodes {nodes:?} down for {downtime:?}");
    sleep(downtime).await;
    for node in nodes {
        controller.start_one(node).await?;
    }
    Ok(())
}

/// [`delayed_restart_nodes`] against one randomly chosen local node.
pub async fn restart_random_node(controller: &ClusterController) -> Result<(), ScenarioError> {
    let locals = controller.list_local_nodes();
    if locals.is_empty() {
        return Ok(());
    }
    let pick = {
        let mut rng = StdRng::from_os_rng();
        rng.random_range(0..locals.len())
    };
    let node = locals[pick].clone();
    delayed_restart_nodes(controller, &[node.as_str()]).await
}

/// Waterfall restart: stop the nodes one by one with a fixed step, then
/// start them again in the same order.
pub async fn restart_nodes_waterfall(
    controller: &ClusterController,
    nodes: &[&str],
    step: Duration,
) -> Result<(), ScenarioError> {
    for node in nodes {
        stop_node_clean(controller, node).await?;
        sleep(step).await;
    }
    for node in nodes {
        controller.start_one(node).await?;
        sleep(step).await;
    }
    Ok(())
}

/// Repeatedly find the master through the client, stop it, prove the
/// remaining members elect a new master and make progress, then bring the
/// old master back.
pub async fn delayed_master_restart_loop(
    factory: &dyn ClientFactory,
    controller: &ClusterController,
    iterations: u32,
    delay: Duration,
) -> Result<(), ScenarioError> {
    for _ in 0..iterations {
        sleep(delay).await;
        let client = factory.client();
        client
            .set("delayed_master_restart_loop", "delayed_master_restart_loop")
            .await?;
        let master = client.who_master().await?.ok_or(ScenarioError::NoMaster)?;
        client.drop_connections().await;
        stop_node_clean(controller, &master).await?;
        let client = factory.client();
        client
            .set(
                "delayed_master_restart_loop",
                "slaves elect a new master and make progress",
            )
            .await?;
        controller.start_one(&master).await?;
    }
    Ok(())
}

/// Parameters for [`restart_single_slave_scenario`].
#[derive(Clone, Debug)]
pub struct SlaveRestartScenario {
    /// Replica to bounce.
    pub slave: String,
    /// Node to certify the slave against afterwards.
    pub peer: String,
    pub restart_count: u32,
    pub set_count: u64,
    /// Whether to run the full store comparison after the sync check.
    pub compare_stores: bool,
    /// Uptime before each stop.
    pub stop_after: Duration,
    /// Downtime before each start.
    pub start_after: Duration,
    /// Catch-up time granted after the workload before halting the
    /// cluster.
    pub settle: Duration,
}

impl SlaveRestartScenario {
    pub fn new(slave: impl Into<String>, peer: impl Into<String>) -> Self {
        SlaveRestartScenario {
            slave: slave.into(),
            peer: peer.into(),
            restart_count: 3,
            set_count: 100,
            compare_stores: true,
            stop_after: Duration::from_secs(3),
            start_after: Duration::from_secs(1),
            settle: Duration::from_secs(5),
        }
    }
}

/// Bounce one replica while a set/get/delete workload runs against the
/// cluster, give the replica time to catch up, halt everything, and
/// certify that it converged with its peer.
pub async fn restart_single_slave_scenario(
    controller: Arc<ClusterController>,
    factory: Arc<dyn ClientFactory>,
    params: SlaveRestartScenario,
) -> Result<(), ScenarioError> {
    let mut orchestrator = ScenarioOrchestrator::new();

    let slave = params.slave.clone();
    let bounce_controller = controller.clone();
    let (stop_after, start_after) = (params.stop_after, params.start_after);
    let restart_count = params.restart_count;
    orchestrator.spawn("slave_restart_loop", async move {
        restart_loop(
            &bounce_controller,
            &slave,
            restart_count,
            stop_after,
            start_after,
        )
        .await
    });

    let workload_factory = factory.clone();
    let flag = orchestrator.flag();
    let set_count = params.set_count;
    orchestrator.spawn("set_workload", async move {
        let opts = IterateOptions {
            tolerated: ClientError::is_retryable,
            failure_max: restart_count,
            ..Default::default()
        };
        iterate_n_times(
            workload_factory.as_ref(),
            &flag,
            set_count,
            set_get_and_delete,
            opts,
        )
        .await
    });

    orchestrator.join(None).await?;

    // Let the bounced replica catch up before halting the cluster.
    sleep(params.settle).await;

    let auditor = ConsistencyAuditor::new(&controller);
    auditor.flush_stores(factory.as_ref(), None).await?;
    let codes = controller.stop().await?;
    for (node, code) in &codes {
        if *code != 0 {
            return Err(ScenarioError::UncleanStop {
                node: node.clone(),
                exit_code: *code,
            });
        }
    }
    auditor
        .assert_last_i_in_sync(&params.peer, &params.slave)
        .await?;
    if params.compare_stores {
        auditor.compare_stores(&params.peer, &params.slave).await?;
    }
    Ok(())
}

/// Run a scenario as (setup, body, teardown). Teardown runs on every exit
/// path once setup succeeded, receives whether the body passed, and the
/// body's error is reported only after teardown completes. Partial cluster
/// state is the teardown closure's to keep or clean.
pub async fn run_scenario<S, SF, B, BF, T, TF>(
    setup: S,
    body: B,
    teardown: T,
) -> Result<(), ScenarioError>
where
    S: FnOnce() -> SF,
    SF: Future<Output = Result<(), ScenarioError>>,
    B: FnOnce() -> BF,
    BF: Future<Output = Result<(), ScenarioError>>,
    T: FnOnce(bool) -> TF,
    TF: Future<Output = ()>,
{
    setup().await?;
    let result = body().await;
    if let Err(e) = &result {
        error!("scenario body failed: {e}");
    }
    teardown(result.is_ok()).await;
    result
}
