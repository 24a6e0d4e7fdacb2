//! Decides which observed changes warrant a sync, and of which key.

use crate::{
    core::PodRef,
    informer::Change,
    k8s::{self, network_status, ResourceExt},
};

pub(crate) fn policy(change: &Change<k8s::AdminPolicyBasedExternalRoute>) -> Option<String> {
    match change {
        Change::Added(route) => Some(route.name_any()),
        Change::Updated { old, new } => {
            let changed = old.metadata.generation != new.metadata.generation;
            (changed && !k8s::is_terminating(&new.metadata)).then(|| new.name_any())
        }
        Change::Deleted(deleted) => Some(deleted.object().name_any()),
    }
}

pub(crate) fn namespace(change: &Change<k8s::Namespace>) -> Option<String> {
    match change {
        Change::Added(ns) => Some(ns.name_any()),
        Change::Updated { old, new } => {
            let changed = old.metadata.resource_version != new.metadata.resource_version;
            (changed && !k8s::is_terminating(&new.metadata)).then(|| new.name_any())
        }
        Change::Deleted(deleted) => Some(deleted.object().name_any()),
    }
}

pub(crate) fn pod(change: &Change<k8s::Pod>) -> Option<PodRef> {
    match change {
        Change::Added(pod) => (has_ips(pod) || network_status::annotation(&pod.metadata).is_some())
            .then(|| pod_ref(pod)),
        Change::Updated { old, new } => {
            let changed = old.metadata.labels != new.metadata.labels
                || pod_ips(old) != pod_ips(new)
                || network_status::annotation(&old.metadata)
                    != network_status::annotation(&new.metadata)
                || k8s::is_terminating(&old.metadata) != k8s::is_terminating(&new.metadata);
            changed.then(|| pod_ref(new))
        }
        Change::Deleted(deleted) => Some(pod_ref(deleted.object())),
    }
}

fn pod_ref(pod: &k8s::Pod) -> PodRef {
    PodRef::new(pod.namespace().unwrap_or_default(), pod.name_any())
}

fn pod_ips(pod: &k8s::Pod) -> Vec<&str> {
    pod.status
        .iter()
        .filter_map(|status| status.pod_ips.as_ref())
        .flatten()
        .map(|ip| ip.ip.as_str())
        .collect()
}

fn has_ips(pod: &k8s::Pod) -> bool {
    !pod_ips(pod).is_empty()
}
