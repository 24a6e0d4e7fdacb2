//! The multi-network status annotation written by the CNI meta-plugin.

use crate::ObjectMeta;
use serde::{Deserialize, Serialize};

pub const NETWORK_STATUS_ANNOTATION: &str = "k8s.v1.cni.cncf.io/network-status";

/// A single attachment entry in the network-status annotation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct NetworkStatus {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,

    #[serde(default)]
    pub ips: Vec<String>,

    #[serde(default)]
    pub default: bool,
}

/// Returns the raw network-status annotation, if it is set and not empty.
pub fn annotation(meta: &ObjectMeta) -> Option<&str> {
    meta.annotations
        .as_ref()?
        .get(NETWORK_STATUS_ANNOTATION)
        .map(String::as_str)
        .filter(|v| !v.is_empty())
}

pub fn parse(annotation: &str) -> serde_json::Result<Vec<NetworkStatus>> {
    serde_json::from_str(annotation)
}

/// Finds the entry for `attachment` on a pod in `namespace`.
///
/// Attachments are recorded as `<namespace>/<name>`; an unqualified attachment name refers to
/// the pod's own namespace.
pub fn find<'s>(
    statuses: &'s [NetworkStatus],
    namespace: &str,
    attachment: &str,
) -> Option<&'s NetworkStatus> {
    let qualified = if attachment.contains('/') {
        attachment.to_string()
    } else {
        format!("{namespace}/{attachment}")
    };
    statuses
        .iter()
        .find(|s| s.name == qualified || s.name == attachment)
}
