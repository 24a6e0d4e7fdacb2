#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod external_route;
pub mod labels;
pub mod network_status;

pub use self::{
    external_route::{
        AdminPolicyBasedExternalRoute, AdminPolicyBasedExternalRouteSpec, DynamicHop,
        ExternalNetworkSource, ExternalNextHops, StaticHop,
    },
    labels::Labels,
};
pub use k8s_openapi::{
    api::{
        self,
        core::v1::{Namespace, Pod, PodIP, PodSpec, PodStatus},
    },
    apimachinery::pkg::apis::meta::v1::Time,
};
pub use kube::{
    api::{ObjectMeta, ResourceExt},
    runtime::{reflector, watcher},
    Resource,
};

/// Returns true if the object's deletion has started.
pub fn is_terminating(meta: &ObjectMeta) -> bool {
    meta.deletion_timestamp.is_some()
}
