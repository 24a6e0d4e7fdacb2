use crate::{
    controller::{Controller, Retries},
    dataplane::{Dataplane, LogApplier},
    index::{Listers, Manager},
    informer::{self, Informer},
    k8s::{self, reflector, watcher},
    metrics::ControllerMetrics,
};
use anyhow::{bail, Result};
use clap::Parser;
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tokio::{sync::mpsc, time::Duration};
use tracing::{info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(
    name = "exgw",
    about = "Routes namespace egress traffic through external gateways"
)]
pub struct Args {
    #[clap(long, default_value = "exgw=info,warn", env = "EXGW_CONTROLLER_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// The number of workers processing each queue.
    #[clap(long, default_value = "1")]
    workers: usize,

    /// The number of times a failed sync is retried before its key is dropped.
    #[clap(long, default_value = "15")]
    max_retries: usize,

    #[clap(long, default_value = "1000")]
    retry_fast_delay_ms: u64,

    #[clap(long, default_value = "5000")]
    retry_slow_delay_ms: u64,

    /// The number of retries that use the fast delay before falling back to the slow delay.
    #[clap(long, default_value = "5")]
    retry_max_fast_attempts: usize,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            workers,
            max_retries,
            retry_fast_delay_ms,
            retry_slow_delay_ms,
            retry_max_fast_attempts,
        } = self;

        let retries = Retries {
            max_retries,
            fast_delay: Duration::from_millis(retry_fast_delay_ms),
            slow_delay: Duration::from_millis(retry_slow_delay_ms),
            max_fast_attempts: retry_max_fast_attempts,
        };

        let mut prom = <Registry>::default();
        let metrics = ControllerMetrics::register(prom.sub_registry_with_prefix("exgw_queue"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        // Build the listings that every sync re-derives its state from, and the index over them.
        let (policies, policies_writer) = reflector::store::<k8s::AdminPolicyBasedExternalRoute>();
        let (namespaces, namespaces_writer) = reflector::store::<k8s::Namespace>();
        let (pods, pods_writer) = reflector::store::<k8s::Pod>();
        let (changes_tx, changes_rx) = mpsc::unbounded_channel();
        let manager = Manager::shared(
            Listers {
                policies: Arc::new(policies.clone()),
                namespaces: Arc::new(namespaces.clone()),
                pods: Arc::new(pods.clone()),
            },
            changes_tx,
        );
        let controller = Controller::new(manager.clone(), &retries, &metrics);

        // Spawn resource watches.

        let policy_events = runtime
            .watch_all::<k8s::AdminPolicyBasedExternalRoute>(watcher::Config::default());
        tokio::spawn(
            informer::run(Informer::new(policies_writer), policy_events, {
                let controller = controller.clone();
                move |change| controller.handle_policy(change)
            })
            .instrument(info_span!("adminpolicybasedexternalroutes")),
        );

        let namespace_events = runtime.watch_all::<k8s::Namespace>(watcher::Config::default());
        tokio::spawn(
            informer::run(Informer::new(namespaces_writer), namespace_events, {
                let controller = controller.clone();
                move |change| controller.handle_namespace(change)
            })
            .instrument(info_span!("namespaces")),
        );

        let pod_events = runtime.watch_all::<k8s::Pod>(watcher::Config::default());
        tokio::spawn(
            informer::run(Informer::new(pods_writer), pod_events, {
                let controller = controller.clone();
                move |change| controller.handle_pod(change)
            })
            .instrument(info_span!("pods")),
        );

        // Start the workers once all listings have synced.
        let dataplane = Dataplane::new(manager, LogApplier::default());
        let drain = runtime.shutdown_handle();
        tokio::spawn(
            async move {
                let synced = async {
                    tokio::try_join!(
                        policies.wait_until_ready(),
                        namespaces.wait_until_ready(),
                        pods.wait_until_ready(),
                    )
                };
                tokio::select! {
                    res = synced => {
                        if let Err(error) = res {
                            tracing::error!(?error, "Watch ended before its listing synced");
                            return;
                        }
                    }
                    _release = drain.clone().signaled() => return,
                }
                info!(workers, "Listings synced; starting workers");
                controller.run(workers, changes_rx, dataplane, drain).await
            }
            .instrument(info_span!("controller")),
        );

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}
