use crate::{policy::RoutePolicy, Error, Manager, Result};
use exgw_controller_core::{GatewayInfo, PodRef};
use exgw_controller_k8s_api::{self as k8s, ResourceExt};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, instrument};

/// The external route state of a single namespace.
#[derive(Debug, Default)]
pub struct NamespaceRouteInfo {
    /// The policies whose `from` selector matches the namespace.
    pub(crate) policies: BTreeSet<String>,

    /// Static next hops, by policy.
    pub(crate) static_gateways: BTreeMap<String, Vec<GatewayInfo>>,

    /// Dynamic next hops, by policy and gateway pod.
    pub(crate) dynamic_gateways: BTreeMap<String, BTreeMap<PodRef, GatewayInfo>>,

    /// Set once teardown of the entry has started. A marked entry accepts no further changes.
    pub(crate) mark_for_delete: bool,
}

// === impl NamespaceRouteInfo ===

impl NamespaceRouteInfo {
    pub fn policies(&self) -> &BTreeSet<String> {
        &self.policies
    }

    pub fn is_marked_for_delete(&self) -> bool {
        self.mark_for_delete
    }

    pub(crate) fn ensure_active(&self, ns: &str) -> Result<()> {
        if self.mark_for_delete {
            return Err(Error::DeletionInProgress(ns.to_string()));
        }
        Ok(())
    }

    /// Returns true if the pod contributes next hops through any policy.
    pub(crate) fn serves(&self, pod: &PodRef) -> bool {
        self.dynamic_gateways
            .values()
            .any(|pods| pods.contains_key(pod))
    }
}

// === impl Manager ===

impl Manager {
    /// Reconciles a namespace's entry with the current namespace and policy listings, then
    /// re-syncs the gateway pods in the namespace, since dynamic hops select them by the
    /// namespace's labels.
    #[instrument(skip_all, fields(namespace = %name))]
    pub async fn sync_namespace(&self, name: &str) -> Result<()> {
        self.sync_namespace_entry(name).await?;
        self.sync_namespace_pods(name).await
    }

    async fn sync_namespace_entry(&self, name: &str) -> Result<()> {
        let namespace = match self.listers.namespaces.get(None, name) {
            Some(ns) if !k8s::is_terminating(&ns.metadata) => ns,
            _ => {
                self.delete_namespace(name).await;
                return Ok(());
            }
        };

        let matches = self.policies_for_namespace(&namespace);
        if matches.is_empty() && !self.has_namespace(name) {
            return Ok(());
        }

        let (mut info, created) = self.lock_or_create_namespace(name).await;
        info.ensure_active(name)?;

        let names = matches.keys().cloned().collect::<BTreeSet<_>>();
        if created {
            info!(policies = ?names, "Adding namespace");
            for policy in matches.values() {
                let dynamic = self.dynamic_gateways(policy);
                self.link_policy(name, &mut info, policy, &dynamic);
            }
        } else if info.policies != names {
            info!(from = ?info.policies, to = ?names, "Updating namespace");
            let removed = info
                .policies
                .difference(&names)
                .cloned()
                .collect::<Vec<_>>();
            for policy in removed {
                self.unlink_policy(name, &mut info, &policy);
            }
            for (policy_name, policy) in matches.iter() {
                if !info.policies.contains(policy_name) {
                    let dynamic = self.dynamic_gateways(policy);
                    self.link_policy(name, &mut info, policy, &dynamic);
                }
            }
        } else {
            debug!("Namespace is up to date");
            return Ok(());
        }

        if info.policies.is_empty() {
            info!("Namespace is no longer targeted by any policy");
            self.remove_namespace(name, &mut info);
        }
        drop(info);
        self.notify(name);
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) {
        let mut info = match self.lock_namespace(name).await {
            Some(info) if !info.mark_for_delete => info,
            _ => return,
        };
        info!("Deleting namespace");
        self.remove_namespace(name, &mut info);
        drop(info);
        self.notify(name);
    }

    /// Returns the listed policies whose `from` selector matches the namespace.
    fn policies_for_namespace(&self, ns: &k8s::Namespace) -> BTreeMap<String, RoutePolicy> {
        self.listers
            .policies
            .list()
            .iter()
            .filter_map(|route| match RoutePolicy::from_resource(route) {
                Ok(policy) => Some(policy),
                Err(error) => {
                    debug!(policy = %route.name_unchecked(), %error, "Ignoring invalid policy");
                    None
                }
            })
            .filter(|policy| policy.targets(ns))
            .map(|policy| (policy.name.clone(), policy))
            .collect()
    }

    /// Returns true if the namespace is listed and its deletion has not started.
    pub(crate) fn namespace_is_active(&self, name: &str) -> bool {
        self.listers
            .namespaces
            .get(None, name)
            .map(|ns| !k8s::is_terminating(&ns.metadata))
            .unwrap_or(false)
    }
}
