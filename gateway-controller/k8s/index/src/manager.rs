use crate::{lister::Listers, namespace::NamespaceRouteInfo, policy::RoutePolicy};
use ahash::AHashMap as HashMap;
use exgw_controller_core::{GatewayInfo, PodRef};
use parking_lot::RwLock;
use std::{
    collections::{hash_map::Entry, BTreeMap, BTreeSet},
    sync::Arc,
};
use tokio::sync::{mpsc::UnboundedSender, Mutex, OwnedMutexGuard};
use tracing::{debug, error};

pub type SharedManager = Arc<Manager>;

type NamespaceEntry = Arc<Mutex<NamespaceRouteInfo>>;

pub(crate) type NamespaceGuard = OwnedMutexGuard<NamespaceRouteInfo>;

/// Holds the resolved external gateway state for all namespaces targeted by a policy.
///
/// Lock ordering: a task holds at most one namespace entry lock at a time. The map-level locks
/// are only ever held for the duration of a synchronous lookup or update and never across an
/// await point.
pub struct Manager {
    pub(crate) listers: Listers,

    /// The map lock guards membership; each entry's lock guards its contents.
    namespaces: RwLock<HashMap<String, NamespaceEntry>>,

    /// The last policy mirrored by a policy sync, by name.
    pub(crate) policies: RwLock<HashMap<String, PolicyState>>,

    /// Indexes the namespaces whose entry lists each policy. Only updated while holding the
    /// entry lock of the namespace being linked or unlinked.
    policy_namespaces: RwLock<HashMap<String, BTreeSet<String>>>,

    /// Indexes the namespaces to which each gateway pod contributes next hops. Only updated
    /// while holding the entry lock of the namespace being changed.
    pod_namespaces: RwLock<HashMap<PodRef, BTreeSet<String>>>,

    /// Receives the names of namespaces whose resolved gateways may have changed.
    changes: UnboundedSender<String>,
}

#[derive(Clone, Debug)]
pub(crate) struct PolicyState {
    pub policy: RoutePolicy,
    pub mark_for_delete: bool,
}

// === impl Manager ===

impl Manager {
    pub fn new(listers: Listers, changes: UnboundedSender<String>) -> Self {
        Self {
            listers,
            namespaces: Default::default(),
            policies: Default::default(),
            policy_namespaces: Default::default(),
            pod_namespaces: Default::default(),
            changes,
        }
    }

    pub fn shared(listers: Listers, changes: UnboundedSender<String>) -> SharedManager {
        Arc::new(Self::new(listers, changes))
    }

    /// Returns true if the namespace currently has a cache entry.
    pub fn has_namespace(&self, ns: &str) -> bool {
        self.namespaces.read().contains_key(ns)
    }

    /// Returns the names of all namespaces with a cache entry.
    pub fn namespaces(&self) -> Vec<String> {
        self.namespaces.read().keys().cloned().collect()
    }

    /// Returns the namespaces to which a gateway pod currently contributes next hops.
    pub fn namespaces_using_pod(&self, pod: &PodRef) -> BTreeSet<String> {
        self.pod_namespaces.read().get(pod).cloned().unwrap_or_default()
    }

    /// Returns the namespaces whose entry currently lists a policy.
    pub fn namespaces_with_policy(&self, policy: &str) -> BTreeSet<String> {
        self.policy_namespaces
            .read()
            .get(policy)
            .cloned()
            .unwrap_or_default()
    }

    /// Locks an existing namespace entry.
    ///
    /// The returned entry may have been marked for deletion while this task waited on it.
    pub(crate) async fn lock_namespace(&self, ns: &str) -> Option<NamespaceGuard> {
        let entry = self.namespaces.read().get(ns).cloned()?;
        Some(entry.lock_owned().await)
    }

    /// Locks a namespace entry, creating it if it does not exist. Returns true if the entry was
    /// created by this call.
    pub(crate) async fn lock_or_create_namespace(&self, ns: &str) -> (NamespaceGuard, bool) {
        let entry = {
            let mut namespaces = self.namespaces.write();
            match namespaces.entry(ns.to_string()) {
                Entry::Occupied(entry) => entry.get().clone(),
                Entry::Vacant(entry) => {
                    // The new entry is locked before it becomes visible to other tasks.
                    let info = Arc::new(Mutex::new(NamespaceRouteInfo::default()));
                    let guard = info
                        .clone()
                        .try_lock_owned()
                        .expect("new namespace entry must not be locked");
                    entry.insert(info);
                    return (guard, true);
                }
            }
        };
        (entry.lock_owned().await, false)
    }

    /// Tears down a locked namespace entry.
    ///
    /// The entry is marked for deletion before its contents are released and is removed from the
    /// map last, so tasks already waiting on its lock observe the tombstone.
    pub(crate) fn remove_namespace(&self, ns: &str, info: &mut NamespaceRouteInfo) {
        info.mark_for_delete = true;
        let policies = info.policies.iter().cloned().collect::<Vec<_>>();
        for policy in policies {
            self.unlink_policy(ns, info, &policy);
        }
        self.namespaces.write().remove(ns);
        debug!(%ns, "Removed namespace entry");
    }

    /// Records a policy's contributions in a locked namespace entry, replacing any it previously
    /// made.
    pub(crate) fn link_policy(
        &self,
        ns: &str,
        info: &mut NamespaceRouteInfo,
        policy: &RoutePolicy,
        dynamic: &BTreeMap<PodRef, GatewayInfo>,
    ) {
        let mut pods = info
            .dynamic_gateways
            .get(&policy.name)
            .map(|pods| pods.keys().cloned().collect::<BTreeSet<_>>())
            .unwrap_or_default();
        pods.extend(dynamic.keys().cloned());

        info.policies.insert(policy.name.clone());
        info.static_gateways
            .insert(policy.name.clone(), policy.static_hops.clone());
        info.dynamic_gateways
            .insert(policy.name.clone(), dynamic.clone());

        self.policy_namespaces
            .write()
            .entry(policy.name.clone())
            .or_default()
            .insert(ns.to_string());
        self.reindex_pods(ns, info, pods);
    }

    /// Removes a policy and all of its contributions from a locked namespace entry. Returns false
    /// if the entry did not list the policy.
    pub(crate) fn unlink_policy(&self, ns: &str, info: &mut NamespaceRouteInfo, policy: &str) -> bool {
        if !info.policies.remove(policy) {
            return false;
        }
        info.static_gateways.remove(policy);
        let pods = info
            .dynamic_gateways
            .remove(policy)
            .map(|pods| pods.into_keys().collect::<Vec<_>>())
            .unwrap_or_default();

        if let Entry::Occupied(mut entry) = self.policy_namespaces.write().entry(policy.to_string()) {
            entry.get_mut().remove(ns);
            if entry.get().is_empty() {
                entry.remove();
            }
        }
        self.reindex_pods(ns, info, pods);
        true
    }

    /// Sets the gateway a pod contributes through each policy listed by a locked namespace entry.
    /// Policies absent from `desired` lose the pod. Returns true if the entry changed.
    pub(crate) fn set_pod_gateway(
        &self,
        ns: &str,
        info: &mut NamespaceRouteInfo,
        pod: &PodRef,
        desired: &BTreeMap<String, GatewayInfo>,
    ) -> bool {
        let mut changed = false;
        for policy in info.policies.iter() {
            match desired.get(policy) {
                Some(gateway) => {
                    let pods = info.dynamic_gateways.entry(policy.clone()).or_default();
                    if pods.get(pod) != Some(gateway) {
                        pods.insert(pod.clone(), gateway.clone());
                        changed = true;
                    }
                }
                None => {
                    if let Some(pods) = info.dynamic_gateways.get_mut(policy) {
                        changed |= pods.remove(pod).is_some();
                    }
                }
            }
        }
        self.reindex_pods(ns, info, Some(pod.clone()));
        changed
    }

    /// Brings the reverse pod index in line with a locked namespace entry's contents.
    fn reindex_pods(
        &self,
        ns: &str,
        info: &NamespaceRouteInfo,
        pods: impl IntoIterator<Item = PodRef>,
    ) {
        let mut index = self.pod_namespaces.write();
        for pod in pods {
            if info.serves(&pod) {
                index.entry(pod).or_default().insert(ns.to_string());
            } else if let Entry::Occupied(mut entry) = index.entry(pod) {
                entry.get_mut().remove(ns);
                if entry.get().is_empty() {
                    entry.remove();
                }
            }
        }
    }

    /// Hands a namespace off to the dataplane. Must only be called after the namespace's entry
    /// lock has been released.
    pub(crate) fn notify(&self, ns: &str) {
        if let Err(error) = self.changes.send(ns.to_string()) {
            error!(%ns, %error, "Failed to hand off namespace to the dataplane");
        }
    }
}
