use crate::{
    core::{DataplaneApplier, Gateways},
    index::SharedManager,
};
use ahash::AHashMap as HashMap;
use anyhow::Result;
use parking_lot::Mutex;
use std::{collections::BTreeSet, net::IpAddr};
use tracing::{debug, info, instrument};

/// Programs the resolved gateways of each namespace into the dataplane.
///
/// Reconciliation of a namespace only happens after its cache entry has been committed and
/// unlocked. Callers must not reconcile the same namespace concurrently.
pub struct Dataplane<A> {
    manager: SharedManager,
    applier: A,

    /// The gateways last applied, by namespace.
    applied: Mutex<HashMap<String, Gateways>>,
}

/// An applier that only logs the decisions it is handed.
#[derive(Clone, Debug, Default)]
pub struct LogApplier(());

// === impl Dataplane ===

impl<A: DataplaneApplier> Dataplane<A> {
    pub fn new(manager: SharedManager, applier: A) -> Self {
        Self {
            manager,
            applier,
            applied: Default::default(),
        }
    }

    #[instrument(skip(self), fields(namespace = %ns))]
    pub async fn reconcile(&self, ns: &str) -> Result<()> {
        let desired = self.manager.resolve_gateways(ns).await?;
        let applied = self.applied.lock().get(ns).cloned().unwrap_or_default();
        if desired == applied {
            debug!("Dataplane is up to date");
            return Ok(());
        }

        if desired.is_empty() {
            self.applier.withdraw(ns).await?;
        } else {
            self.applier.apply(ns, &desired).await?;
        }

        let stale = applied
            .ips()
            .difference(&desired.ips())
            .copied()
            .collect::<BTreeSet<_>>();
        if !stale.is_empty() {
            self.applier.flush_conntrack(ns, &stale).await?;
        }

        info!(gateways = ?desired.ips(), stale = ?stale, "Updated dataplane");
        let mut applied = self.applied.lock();
        if desired.is_empty() {
            applied.remove(ns);
        } else {
            applied.insert(ns.to_string(), desired);
        }
        Ok(())
    }

    /// Returns the gateways last applied for a namespace.
    pub fn applied(&self, ns: &str) -> Option<Gateways> {
        self.applied.lock().get(ns).cloned()
    }
}

// === impl LogApplier ===

#[async_trait::async_trait]
impl DataplaneApplier for LogApplier {
    async fn apply(&self, namespace: &str, gateways: &Gateways) -> Result<()> {
        info!(
            %namespace,
            static_ips = ?gateways.static_ips,
            dynamic_ips = ?gateways.dynamic_ips,
            bfd_ips = ?gateways.bfd_ips,
            "Routing external traffic"
        );
        Ok(())
    }

    async fn withdraw(&self, namespace: &str) -> Result<()> {
        info!(%namespace, "Withdrawing external routes");
        Ok(())
    }

    async fn flush_conntrack(&self, namespace: &str, stale: &BTreeSet<IpAddr>) -> Result<()> {
        info!(%namespace, ?stale, "Flushing conntrack entries");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        core::GatewayInfo,
        index::{Listers, Manager},
        k8s::{self, reflector, watcher},
        tests::{ip, mk_namespace, mk_route, Recorded, RecordingApplier},
    };
    use maplit::btreeset;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn applies_changes_and_flushes_stale_gateways() {
        let (policies, mut policies_writer) =
            reflector::store::<k8s::AdminPolicyBasedExternalRoute>();
        let (namespaces, mut namespaces_writer) = reflector::store::<k8s::Namespace>();
        let (pods, _pods_writer) = reflector::store::<k8s::Pod>();
        let (changes_tx, _changes_rx) = mpsc::unbounded_channel();
        let manager = Manager::shared(
            Listers {
                policies: Arc::new(policies),
                namespaces: Arc::new(namespaces),
                pods: Arc::new(pods),
            },
            changes_tx,
        );
        let applier = RecordingApplier::default();
        let dataplane = Dataplane::new(manager.clone(), applier.clone());

        namespaces_writer.apply_watcher_event(&watcher::Event::Apply(mk_namespace(
            "ns-0",
            [("env", "prod")],
        )));
        policies_writer.apply_watcher_event(&watcher::Event::Apply(mk_route(
            "route-0",
            "prod",
            ["10.0.0.1", "10.0.0.2"],
        )));
        manager.sync_policy("route-0").await.unwrap();

        dataplane.reconcile("ns-0").await.unwrap();
        let mut expected = Gateways::default();
        expected.insert_static(&GatewayInfo::new([ip("10.0.0.1"), ip("10.0.0.2")], false));
        assert_eq!(
            applier.take(),
            vec![Recorded::Apply("ns-0".to_string(), expected.clone())]
        );
        assert_eq!(dataplane.applied("ns-0"), Some(expected));

        // Nothing changed.
        dataplane.reconcile("ns-0").await.unwrap();
        assert!(applier.take().is_empty());

        policies_writer.apply_watcher_event(&watcher::Event::Apply(mk_route(
            "route-0",
            "prod",
            ["10.0.0.1"],
        )));
        manager.sync_policy("route-0").await.unwrap();
        dataplane.reconcile("ns-0").await.unwrap();
        let mut expected = Gateways::default();
        expected.insert_static(&GatewayInfo::new([ip("10.0.0.1")], false));
        assert_eq!(
            applier.take(),
            vec![
                Recorded::Apply("ns-0".to_string(), expected),
                Recorded::FlushConntrack("ns-0".to_string(), btreeset! {ip("10.0.0.2")}),
            ]
        );

        policies_writer.apply_watcher_event(&watcher::Event::Delete(mk_route(
            "route-0",
            "prod",
            ["10.0.0.1"],
        )));
        manager.sync_policy("route-0").await.unwrap();
        dataplane.reconcile("ns-0").await.unwrap();
        assert_eq!(
            applier.take(),
            vec![
                Recorded::Withdraw("ns-0".to_string()),
                Recorded::FlushConntrack("ns-0".to_string(), btreeset! {ip("10.0.0.1")}),
            ]
        );
        assert_eq!(dataplane.applied("ns-0"), None);
    }

    #[tokio::test]
    async fn failed_apply_is_not_recorded() {
        let (policies, mut policies_writer) =
            reflector::store::<k8s::AdminPolicyBasedExternalRoute>();
        let (namespaces, mut namespaces_writer) = reflector::store::<k8s::Namespace>();
        let (pods, _pods_writer) = reflector::store::<k8s::Pod>();
        let (changes_tx, _changes_rx) = mpsc::unbounded_channel();
        let manager = Manager::shared(
            Listers {
                policies: Arc::new(policies),
                namespaces: Arc::new(namespaces),
                pods: Arc::new(pods),
            },
            changes_tx,
        );
        let applier = RecordingApplier::failing(1);
        let dataplane = Dataplane::new(manager.clone(), applier.clone());

        namespaces_writer.apply_watcher_event(&watcher::Event::Apply(mk_namespace(
            "ns-0",
            [("env", "prod")],
        )));
        policies_writer.apply_watcher_event(&watcher::Event::Apply(mk_route(
            "route-0",
            "prod",
            ["10.0.0.1"],
        )));
        manager.sync_policy("route-0").await.unwrap();

        dataplane
            .reconcile("ns-0")
            .await
            .expect_err("apply must fail");
        assert_eq!(dataplane.applied("ns-0"), None);

        dataplane.reconcile("ns-0").await.unwrap();
        assert!(dataplane.applied("ns-0").is_some());
        assert_eq!(applier.take().len(), 1);
    }
}
