use super::labels::Selector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Routes the egress traffic of the selected namespaces through external gateways.
#[derive(Clone, Debug, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "k8s.ovn.org",
    version = "v1",
    kind = "AdminPolicyBasedExternalRoute",
    shortname = "apbexternalroute"
)]
#[serde(rename_all = "camelCase")]
pub struct AdminPolicyBasedExternalRouteSpec {
    pub from: ExternalNetworkSource,
    pub next_hops: ExternalNextHops,
}

/// Selects the namespaces whose traffic is routed by a policy.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExternalNetworkSource {
    pub namespace_selector: Selector,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct ExternalNextHops {
    #[serde(default, rename = "static")]
    pub static_hops: Vec<StaticHop>,

    #[serde(default, rename = "dynamic")]
    pub dynamic_hops: Vec<DynamicHop>,
}

/// A fixed next-hop IP.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StaticHop {
    pub ip: String,

    #[serde(default)]
    pub bfd_enabled: bool,
}

/// Next hops derived from the IPs of the selected gateway pods.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DynamicHop {
    pub pod_selector: Selector,

    /// Selects the namespaces in which gateway pods are looked up.
    pub namespace_selector: Selector,

    /// When set, the gateway IPs are read from the pod's network-status annotation entry with
    /// this name rather than from the pod's primary IPs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_attachment_name: Option<String>,

    #[serde(default)]
    pub bfd_enabled: bool,
}
