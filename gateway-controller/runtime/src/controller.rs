use crate::{
    admission,
    core::{DataplaneApplier, PodRef},
    dataplane::Dataplane,
    index::SharedManager,
    informer::Change,
    k8s,
    metrics::ControllerMetrics,
    queue::{Exponential, FastSlow, WorkQueue},
};
use futures::prelude::*;
use std::{fmt::Display, hash::Hash, sync::Arc};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinSet,
    time::Duration,
};
use tracing::{debug, error, info, info_span, warn, Instrument};

const DATAPLANE_RETRY_BASE: Duration = Duration::from_millis(100);
const DATAPLANE_RETRY_MAX: Duration = Duration::from_secs(30);

/// Controls how failed syncs are retried.
#[derive(Clone, Debug)]
pub struct Retries {
    /// The number of times a key is retried before it is dropped.
    pub max_retries: usize,
    pub fast_delay: Duration,
    pub slow_delay: Duration,
    pub max_fast_attempts: usize,
}

/// Feeds observed changes through per-kind work queues into the index, and namespaces whose
/// gateways changed into the dataplane.
#[derive(Clone)]
pub struct Controller {
    manager: SharedManager,
    policies: WorkQueue<String>,
    namespaces: WorkQueue<String>,
    pods: WorkQueue<PodRef>,
    dataplane: WorkQueue<String>,
    max_retries: usize,
}

// === impl Retries ===

impl Default for Retries {
    fn default() -> Self {
        Self {
            max_retries: 15,
            fast_delay: Duration::from_secs(1),
            slow_delay: Duration::from_secs(5),
            max_fast_attempts: 5,
        }
    }
}

impl Retries {
    fn limiter<K: Eq + Hash>(&self) -> FastSlow<K> {
        FastSlow::new(self.fast_delay, self.slow_delay, self.max_fast_attempts)
    }
}

// === impl Controller ===

impl Controller {
    pub fn new(manager: SharedManager, retries: &Retries, metrics: &ControllerMetrics) -> Self {
        Self {
            manager,
            policies: WorkQueue::new("policy", retries.limiter(), metrics.queue("policy")),
            namespaces: WorkQueue::new(
                "namespace",
                retries.limiter(),
                metrics.queue("namespace"),
            ),
            pods: WorkQueue::new("pod", retries.limiter(), metrics.queue("pod")),
            dataplane: WorkQueue::new(
                "dataplane",
                Exponential::new(DATAPLANE_RETRY_BASE, DATAPLANE_RETRY_MAX),
                metrics.queue("dataplane"),
            ),
            max_retries: retries.max_retries,
        }
    }

    pub fn handle_policy(&self, change: Change<k8s::AdminPolicyBasedExternalRoute>) {
        if let Some(name) = admission::policy(&change) {
            self.policies.add(name);
        }
    }

    pub fn handle_namespace(&self, change: Change<k8s::Namespace>) {
        if let Some(name) = admission::namespace(&change) {
            self.namespaces.add(name);
        }
    }

    pub fn handle_pod(&self, change: Change<k8s::Pod>) {
        if let Some(pod) = admission::pod(&change) {
            self.pods.add(pod);
        }
    }

    /// Runs `workers` workers per queue until `drain` is signaled.
    ///
    /// On shutdown, keys waiting in the policy, namespace and pod queues are discarded and
    /// in-flight syncs complete. The namespaces those syncs changed are then handed off and the
    /// dataplane queue is drained before the drain is released.
    pub async fn run<A: DataplaneApplier>(
        self,
        workers: usize,
        mut changes: mpsc::UnboundedReceiver<String>,
        dataplane: Dataplane<A>,
        drain: drain::Watch,
    ) {
        let dataplane = Arc::new(dataplane);
        let mut syncs = JoinSet::new();
        let mut reconciles = JoinSet::new();
        for _ in 0..workers.max(1) {
            let manager = self.manager.clone();
            syncs.spawn(
                process(self.policies.clone(), self.max_retries, move |name| {
                    let manager = manager.clone();
                    async move { manager.sync_policy(&name).await.map_err(Into::into) }
                })
                .instrument(info_span!("policy")),
            );

            let manager = self.manager.clone();
            syncs.spawn(
                process(self.namespaces.clone(), self.max_retries, move |name| {
                    let manager = manager.clone();
                    async move { manager.sync_namespace(&name).await.map_err(Into::into) }
                })
                .instrument(info_span!("namespace")),
            );

            let manager = self.manager.clone();
            syncs.spawn(
                process(self.pods.clone(), self.max_retries, move |pod| {
                    let manager = manager.clone();
                    async move { manager.sync_pod(&pod).await.map_err(Into::into) }
                })
                .instrument(info_span!("pod")),
            );

            let dataplane = dataplane.clone();
            reconciles.spawn(
                process(self.dataplane.clone(), self.max_retries, move |ns| {
                    let dataplane = dataplane.clone();
                    async move { dataplane.reconcile(&ns).await }
                })
                .instrument(info_span!("dataplane")),
            );
        }

        let (stop_handoff, mut stopped) = oneshot::channel::<()>();
        let handoff = tokio::spawn({
            let queue = self.dataplane.clone();
            async move {
                loop {
                    tokio::select! {
                        biased;
                        Some(ns) = changes.recv() => queue.add(ns),
                        _ = &mut stopped => break,
                    }
                }
                while let Ok(ns) = changes.try_recv() {
                    queue.add(ns);
                }
            }
        });

        let release = drain.signaled().await;
        info!("Shutting down workers");
        release
            .release_after(async move {
                self.policies.shut_down();
                self.namespaces.shut_down();
                self.pods.shut_down();
                join_all(syncs).await;

                let _ = stop_handoff.send(());
                if let Err(error) = handoff.await {
                    error!(%error, "Dataplane hand-off failed");
                }
                self.dataplane.shut_down_with_drain();
                join_all(reconciles).await;
            })
            .await;
    }
}

async fn join_all(mut tasks: JoinSet<()>) {
    while let Some(res) = tasks.join_next().await {
        if let Err(error) = res {
            error!(%error, "Worker failed");
        }
    }
}

/// Processes keys from a queue until it is shut down.
async fn process<K, F, S>(queue: WorkQueue<K>, max_retries: usize, mut sync: F)
where
    K: Clone + Eq + Hash + Display + Send + Sync + 'static,
    F: FnMut(K) -> S,
    S: Future<Output = anyhow::Result<()>>,
{
    while let Some(key) = queue.get().await {
        match sync(key.clone()).await {
            Ok(()) => queue.forget(&key),
            Err(error) if queue.num_requeues(&key) < max_retries => {
                debug!(%key, error = %format_args!("{error:#}"), "Sync failed; retrying");
                queue.add_rate_limited(key.clone());
            }
            Err(error) => {
                warn!(%key, error = %format_args!("{error:#}"), "Dropping key after too many retries");
                queue.metrics().drop_key();
                queue.forget(&key);
            }
        }
        queue.done(&key);
    }
    debug!(queue = queue.name(), "Queue shut down");
}

#[cfg(test)]
impl Controller {
    pub(crate) fn queues(
        &self,
    ) -> (
        &WorkQueue<String>,
        &WorkQueue<String>,
        &WorkQueue<PodRef>,
        &WorkQueue<String>,
    ) {
        (&self.policies, &self.namespaces, &self.pods, &self.dataplane)
    }
}
