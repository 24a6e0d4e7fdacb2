use crate::{manager::PolicyState, pod::gateway_ips, Error, Manager, Result};
use exgw_controller_core::GatewayInfo;
use exgw_controller_k8s_api::{
    self as k8s,
    labels::{Labels, Selector},
    DynamicHop, ResourceExt,
};
use std::{collections::BTreeSet, net::IpAddr};
use tracing::{debug, info, instrument, warn};

/// A validated `AdminPolicyBasedExternalRoute`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoutePolicy {
    pub name: String,
    pub namespace_selector: Selector,

    /// One entry per static hop.
    pub static_hops: Vec<GatewayInfo>,
    pub dynamic_hops: Vec<DynamicHop>,
}

// === impl RoutePolicy ===

impl RoutePolicy {
    pub fn from_resource(route: &k8s::AdminPolicyBasedExternalRoute) -> Result<Self> {
        let name = route.name_unchecked();
        let static_hops = route
            .spec
            .next_hops
            .static_hops
            .iter()
            .map(|hop| {
                let ip = hop.ip.trim().parse::<IpAddr>().map_err(|source| {
                    Error::InvalidPolicy {
                        policy: name.clone(),
                        ip: hop.ip.clone(),
                        source,
                    }
                })?;
                Ok(GatewayInfo::new(Some(ip), hop.bfd_enabled))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            namespace_selector: route.spec.from.namespace_selector.clone(),
            static_hops,
            dynamic_hops: route.spec.next_hops.dynamic_hops.clone(),
            name,
        })
    }

    /// Returns true if the policy routes the namespace's traffic.
    pub fn targets(&self, ns: &k8s::Namespace) -> bool {
        !k8s::is_terminating(&ns.metadata)
            && self
                .namespace_selector
                .matches(&Labels::from(ns.metadata.labels.clone()))
    }

    /// Returns the next hops the pod contributes through this policy's dynamic hops, if any hop
    /// selects it. `ns_labels` are the labels of the pod's namespace.
    pub(crate) fn pod_gateway(&self, pod: &k8s::Pod, ns_labels: &Labels) -> Option<GatewayInfo> {
        let labels = Labels::from(pod.metadata.labels.clone());
        let mut gateway = None::<GatewayInfo>;
        for hop in &self.dynamic_hops {
            if !hop.namespace_selector.matches(ns_labels) || !hop.pod_selector.matches(&labels) {
                continue;
            }
            let info = GatewayInfo::new(
                gateway_ips(pod, hop.network_attachment_name.as_deref()),
                hop.bfd_enabled,
            );
            if info.is_empty() {
                continue;
            }
            match gateway.as_mut() {
                Some(gateway) => gateway.merge(info),
                None => gateway = Some(info),
            }
        }
        gateway
    }
}

// === impl Manager ===

impl Manager {
    /// Reconciles a policy with the namespace entries it targets.
    #[instrument(skip_all, fields(policy = %name))]
    pub async fn sync_policy(&self, name: &str) -> Result<()> {
        let route = match self.listers.policies.get(None, name) {
            Some(route) => route,
            None => {
                info!("Deleting policy");
                self.delete_policy(name).await;
                return Ok(());
            }
        };
        let policy = RoutePolicy::from_resource(&route)?;

        let current = self.policies.read().get(name).cloned();
        match current {
            None => {
                info!("Adding policy");
                self.add_policy(policy).await
            }
            Some(PolicyState {
                mark_for_delete: true,
                ..
            }) => {
                warn!("Policy is being deleted; skipping");
                Ok(())
            }
            Some(PolicyState {
                policy: current, ..
            }) => {
                info!("Updating policy");
                self.update_policy(current, policy).await
            }
        }
    }

    async fn add_policy(&self, policy: RoutePolicy) -> Result<()> {
        let targets = self.target_namespaces(&policy);
        self.policies.write().insert(
            policy.name.clone(),
            PolicyState {
                policy: policy.clone(),
                mark_for_delete: false,
            },
        );

        let mut result = Ok(());
        for ns in targets {
            if let Err(error) = self.link_policy_to_namespace(&ns, &policy).await {
                result = Err(error);
            }
        }
        result
    }

    async fn update_policy(&self, current: RoutePolicy, policy: RoutePolicy) -> Result<()> {
        let spec_changed = current != policy;
        let previous = self.namespaces_with_policy(&policy.name);
        let targets = self.target_namespaces(&policy);
        self.policies.write().insert(
            policy.name.clone(),
            PolicyState {
                policy: policy.clone(),
                mark_for_delete: false,
            },
        );

        for ns in previous.difference(&targets) {
            self.unlink_policy_from_namespace(ns, &policy.name).await;
        }
        let mut result = Ok(());
        for ns in targets.iter() {
            if spec_changed || !previous.contains(ns) {
                if let Err(error) = self.link_policy_to_namespace(ns, &policy).await {
                    result = Err(error);
                }
            }
        }
        result
    }

    async fn delete_policy(&self, name: &str) {
        if let Some(state) = self.policies.write().get_mut(name) {
            state.mark_for_delete = true;
        }
        for ns in self.namespaces_with_policy(name) {
            self.unlink_policy_from_namespace(&ns, name).await;
        }
        self.policies.write().remove(name);
    }

    /// Links a policy into a namespace's entry, creating the entry if needed.
    ///
    /// Fails if the entry is being torn down, so that the policy is linked into the entry's
    /// replacement once the teardown completes.
    async fn link_policy_to_namespace(&self, ns: &str, policy: &RoutePolicy) -> Result<()> {
        let (mut info, created) = self.lock_or_create_namespace(ns).await;
        info.ensure_active(ns)?;

        // The namespace may have been deleted since the targets were listed, in which case its
        // teardown has already run and the new entry must not outlive it.
        if created && !self.namespace_is_active(ns) {
            debug!(%ns, "Namespace no longer exists");
            self.remove_namespace(ns, &mut info);
            return Ok(());
        }

        // Gateway pods are listed while the entry is locked so that a pod sync that missed this
        // policy's link waits on the entry and observes it.
        let dynamic = self.dynamic_gateways(policy);
        let before = info.gateways();
        self.link_policy(ns, &mut info, policy, &dynamic);
        let changed = created || info.gateways() != before;
        drop(info);
        if changed {
            self.notify(ns);
        }
        Ok(())
    }

    async fn unlink_policy_from_namespace(&self, ns: &str, policy: &str) {
        let mut info = match self.lock_namespace(ns).await {
            Some(info) => info,
            None => return,
        };
        if let Err(error) = info.ensure_active(ns) {
            debug!(%error, "Skipping namespace");
            return;
        }
        if !self.unlink_policy(ns, &mut info, policy) {
            return;
        }
        if info.policies.is_empty() {
            info!(%ns, "Namespace is no longer targeted by any policy");
            self.remove_namespace(ns, &mut info);
        }
        drop(info);
        self.notify(ns);
    }

    /// Returns the namespaces targeted by the mirrored state of a policy, including those it has
    /// not been linked into yet.
    pub(crate) fn mirrored_policy_targets(&self, name: &str) -> BTreeSet<String> {
        let policy = match self.policies.read().get(name) {
            Some(state) if !state.mark_for_delete => state.policy.clone(),
            _ => return BTreeSet::new(),
        };
        self.target_namespaces(&policy)
    }

    /// Returns the names of the listed namespaces the policy targets.
    fn target_namespaces(&self, policy: &RoutePolicy) -> BTreeSet<String> {
        self.listers
            .namespaces
            .list()
            .iter()
            .filter(|ns| policy.targets(ns))
            .map(|ns| ns.name_unchecked())
            .collect()
    }
}
