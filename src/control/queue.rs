//! Per-server reconciliation queue
//!
//! Remote work is handed to one worker task per server. The worker owns the
//! only management session to its server, so applies and statistics reads
//! against one host never overlap while different hosts proceed in
//! parallel. Workers are spawned on first use and end once the queue drops
//! their channel.

use crate::config::RetryPolicy;
use crate::error::{ApplyError, FleetError, Result};
use crate::model::{Client, ServerId, Store};
use crate::monitoring::{PeerStats, StatsCollector};
use crate::remote::{ApplyOptions, RemoteApplier};
use crate::wireguard::PublicKey;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

/// Peer statistics of one server keyed by public key
pub type ServerStats = HashMap<PublicKey, PeerStats>;

/// Work item for a server worker
enum Job {
    /// Push the full config and optionally one peer change
    Apply {
        changed: Option<Client>,
        options: ApplyOptions,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Read live peer statistics
    Collect {
        reply: oneshot::Sender<Result<ServerStats>>,
    },
}

/// Shared state used by every worker
struct Reconciler {
    store: Arc<dyn Store>,
    applier: RemoteApplier,
    collector: StatsCollector,
    retry: RetryPolicy,
}

impl Reconciler {
    async fn apply(
        &self,
        server_id: ServerId,
        changed: Option<&Client>,
        options: ApplyOptions,
    ) -> Result<()> {
        // load at execution time so queued jobs see the latest records
        let server = self
            .store
            .get_server(server_id)
            .await?
            .ok_or_else(|| FleetError::NotFound(format!("server {}", server_id)))?;
        let clients = self.store.list_clients(server_id).await?;

        with_retry(&self.retry, server_id, || {
            self.applier.apply(&server, &clients, changed, options)
        })
        .await
        .map_err(FleetError::from)
    }

    async fn collect(&self, server_id: ServerId) -> Result<ServerStats> {
        let server = self
            .store
            .get_server(server_id)
            .await?
            .ok_or_else(|| FleetError::NotFound(format!("server {}", server_id)))?;
        if !server.is_enabled {
            return Err(FleetError::InvalidState(format!(
                "server {} is disabled",
                server_id
            )));
        }

        let target = self.applier.target(&server);
        with_retry(&self.retry, server_id, || {
            self.collector.collect(&server, &target)
        })
        .await
        .map_err(FleetError::from)
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// the policy runs out of attempts.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    server_id: ServerId,
    mut operation: F,
) -> std::result::Result<T, ApplyError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, ApplyError>>,
{
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.backoff(attempt);
                warn!(
                    "Server {} attempt {}/{} failed: {}; retrying in {:?}",
                    server_id, attempt, policy.max_attempts, e, delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Serializes remote work per server
pub struct ReconcileQueue {
    reconciler: Arc<Reconciler>,
    workers: Mutex<HashMap<ServerId, mpsc::UnboundedSender<Job>>>,
}

impl ReconcileQueue {
    /// Create a queue reading entity state from `store`
    pub fn new(
        store: Arc<dyn Store>,
        applier: RemoteApplier,
        collector: StatsCollector,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            reconciler: Arc::new(Reconciler {
                store,
                applier,
                collector,
                retry,
            }),
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Queue an apply without waiting for it. The receiver yields the
    /// outcome; dropping it leaves the job running.
    pub async fn submit_apply(
        &self,
        server_id: ServerId,
        changed: Option<Client>,
        options: ApplyOptions,
    ) -> oneshot::Receiver<Result<()>> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(
            server_id,
            Job::Apply {
                changed,
                options,
                reply,
            },
        )
        .await;
        rx
    }

    /// Queue an apply and wait for its outcome
    pub async fn apply(
        &self,
        server_id: ServerId,
        changed: Option<Client>,
        options: ApplyOptions,
    ) -> Result<()> {
        let rx = self.submit_apply(server_id, changed, options).await;
        rx.await.map_err(|_| worker_gone(server_id))?
    }

    /// Queue a statistics read and wait for it
    pub async fn collect(&self, server_id: ServerId) -> Result<ServerStats> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(server_id, Job::Collect { reply }).await;
        rx.await.map_err(|_| worker_gone(server_id))?
    }

    /// Stop the worker of a removed server once its queue drains
    pub async fn forget(&self, server_id: ServerId) {
        if self.workers.lock().await.remove(&server_id).is_some() {
            debug!("Released reconcile worker for server {}", server_id);
        }
    }

    async fn dispatch(&self, server_id: ServerId, job: Job) {
        let mut workers = self.workers.lock().await;
        let job = match workers.get(&server_id) {
            Some(tx) => match tx.send(job) {
                Ok(()) => return,
                // the worker exited; start a fresh one below
                Err(mpsc::error::SendError(job)) => job,
            },
            None => job,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let reconciler = self.reconciler.clone();
        tokio::spawn(worker(reconciler, server_id, rx));
        // the receiver is alive: the worker was just spawned with it
        let _ = tx.send(job);
        workers.insert(server_id, tx);
    }
}

async fn worker(
    reconciler: Arc<Reconciler>,
    server_id: ServerId,
    mut jobs: mpsc::UnboundedReceiver<Job>,
) {
    info!("Reconcile worker for server {} started", server_id);

    while let Some(job) = jobs.recv().await {
        match job {
            Job::Apply {
                changed,
                options,
                reply,
            } => {
                let result = reconciler
                    .apply(server_id, changed.as_ref(), options)
                    .await;
                if reply.send(result).is_err() {
                    debug!("Apply result for server {} was not awaited", server_id);
                }
            }
            Job::Collect { reply } => {
                let result = reconciler.collect(server_id).await;
                let _ = reply.send(result);
            }
        }
    }

    info!("Reconcile worker for server {} stopped", server_id);
}

fn worker_gone(server_id: ServerId) -> FleetError {
    FleetError::InvalidState(format!("reconcile worker for server {} stopped", server_id))
}
