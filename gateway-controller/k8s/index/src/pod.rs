use crate::{policy::RoutePolicy, Manager, Result};
use ahash::AHashMap as HashMap;
use exgw_controller_core::{GatewayInfo, PodRef};
use exgw_controller_k8s_api::{self as k8s, labels::Labels, network_status, ResourceExt};
use std::{
    collections::{BTreeMap, BTreeSet},
    net::IpAddr,
};
use tracing::{debug, info, instrument};

/// Returns the IPs a gateway pod offers as next hops.
///
/// Without an attachment name these are the pod's assigned IPs. Otherwise they are read from the
/// attachment's entry in the pod's network-status annotation.
pub(crate) fn gateway_ips(pod: &k8s::Pod, attachment: Option<&str>) -> BTreeSet<IpAddr> {
    let ips = match attachment {
        None => pod
            .status
            .iter()
            .filter_map(|status| status.pod_ips.as_ref())
            .flatten()
            .map(|ip| ip.ip.clone())
            .collect::<Vec<_>>(),
        Some(attachment) => {
            let statuses = match network_status::annotation(&pod.metadata)
                .map(network_status::parse)
            {
                Some(Ok(statuses)) => statuses,
                Some(Err(error)) => {
                    debug!(pod = %pod.name_unchecked(), %error, "Invalid network status annotation");
                    return BTreeSet::new();
                }
                None => return BTreeSet::new(),
            };
            let ns = pod.namespace().unwrap_or_default();
            match network_status::find(&statuses, &ns, attachment) {
                Some(status) => status.ips.clone(),
                None => return BTreeSet::new(),
            }
        }
    };

    ips.iter()
        .filter_map(|ip| match ip.parse::<IpAddr>() {
            Ok(ip) => Some(ip),
            Err(error) => {
                debug!(pod = %pod.name_unchecked(), %ip, %error, "Ignoring invalid pod IP");
                None
            }
        })
        .collect()
}

// === impl Manager ===

impl Manager {
    /// Reconciles a pod's dynamic next hops with the namespace entries it serves.
    #[instrument(skip_all, fields(pod = %pod_ref))]
    pub async fn sync_pod(&self, pod_ref: &PodRef) -> Result<()> {
        let namespaces = self.namespaces_using_pod(pod_ref);
        let pod = self
            .listers
            .pods
            .get(Some(&pod_ref.namespace), &pod_ref.name)
            .filter(|pod| !k8s::is_terminating(&pod.metadata));

        let pod = match pod {
            Some(pod) => pod,
            None => {
                if namespaces.is_empty() {
                    return Ok(());
                }
                info!(namespaces = ?namespaces, "Deleting gateway pod");
                return self
                    .patch_pod_gateways(namespaces, pod_ref, &BTreeMap::new())
                    .await;
            }
        };

        let desired = self.pod_gateways(&pod);
        if namespaces.is_empty() {
            if desired.is_empty() {
                return Ok(());
            }
            info!(policies = ?desired.keys().collect::<Vec<_>>(), "Adding gateway pod");
        } else {
            debug!(policies = ?desired.keys().collect::<Vec<_>>(), "Updating gateway pod");
        }

        // A policy that is still being linked is not yet indexed, so the namespaces it targets
        // are included as well.
        let mut targets = namespaces;
        for policy in desired.keys() {
            targets.extend(self.namespaces_with_policy(policy));
            targets.extend(self.mirrored_policy_targets(policy));
        }
        self.patch_pod_gateways(targets, pod_ref, &desired).await
    }

    /// Patches a pod's contributions into each namespace, continuing past namespaces that are
    /// being torn down. Fails if any of them was.
    async fn patch_pod_gateways(
        &self,
        namespaces: BTreeSet<String>,
        pod: &PodRef,
        desired: &BTreeMap<String, GatewayInfo>,
    ) -> Result<()> {
        let mut result = Ok(());
        for ns in namespaces {
            if let Err(error) = self.patch_pod_gateway(&ns, pod, desired).await {
                result = Err(error);
            }
        }
        result
    }

    async fn patch_pod_gateway(
        &self,
        ns: &str,
        pod: &PodRef,
        desired: &BTreeMap<String, GatewayInfo>,
    ) -> Result<()> {
        let mut info = match self.lock_namespace(ns).await {
            Some(info) => info,
            None => return Ok(()),
        };
        info.ensure_active(ns)?;
        let changed = self.set_pod_gateway(ns, &mut info, pod, desired);
        drop(info);
        if changed {
            self.notify(ns);
        }
        Ok(())
    }

    /// Re-syncs the listed pods of a namespace, whose labels select gateway pods for dynamic hops.
    pub(crate) async fn sync_namespace_pods(&self, ns: &str) -> Result<()> {
        let pods = self
            .listers
            .pods
            .list()
            .iter()
            .filter(|pod| pod.namespace().as_deref() == Some(ns))
            .map(|pod| PodRef::new(ns, pod.name_unchecked()))
            .collect::<Vec<_>>();

        let mut result = Ok(());
        for pod in pods {
            if let Err(error) = self.sync_pod(&pod).await {
                result = Err(error);
            }
        }
        result
    }

    /// Returns the next hops a pod contributes, by policy.
    fn pod_gateways(&self, pod: &k8s::Pod) -> BTreeMap<String, GatewayInfo> {
        let ns_labels = match pod.namespace().and_then(|ns| self.namespace_labels(&ns)) {
            Some(labels) => labels,
            None => return BTreeMap::new(),
        };
        self.listers
            .policies
            .list()
            .iter()
            .filter_map(|route| RoutePolicy::from_resource(route).ok())
            .filter_map(|policy| {
                let gateway = policy.pod_gateway(pod, &ns_labels)?;
                Some((policy.name, gateway))
            })
            .collect()
    }

    /// Returns the next hops each listed gateway pod contributes through a policy.
    pub(crate) fn dynamic_gateways(&self, policy: &RoutePolicy) -> BTreeMap<PodRef, GatewayInfo> {
        if policy.dynamic_hops.is_empty() {
            return BTreeMap::new();
        }

        let mut ns_labels = HashMap::<String, Option<Labels>>::new();
        let mut gateways = BTreeMap::new();
        for pod in self.listers.pods.list() {
            if k8s::is_terminating(&pod.metadata) {
                continue;
            }
            let ns = match pod.namespace() {
                Some(ns) => ns,
                None => continue,
            };
            let labels = ns_labels
                .entry(ns.clone())
                .or_insert_with(|| self.namespace_labels(&ns));
            if let Some(gateway) = labels
                .as_ref()
                .and_then(|labels| policy.pod_gateway(&pod, labels))
            {
                gateways.insert(PodRef::new(ns, pod.name_unchecked()), gateway);
            }
        }
        gateways
    }

    fn namespace_labels(&self, ns: &str) -> Option<Labels> {
        self.listers
            .namespaces
            .get(None, ns)
            .map(|ns| Labels::from(ns.metadata.labels.clone()))
    }
}
