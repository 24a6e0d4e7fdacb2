#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod gateway;

pub use self::gateway::{GatewayInfo, Gateways, PodRef};
use anyhow::Result;
use std::{collections::BTreeSet, net::IpAddr};

/// Answers which gateway IPs currently carry a namespace's external traffic.
#[async_trait::async_trait]
pub trait ResolveGatewayIps {
    /// Returns the union of static and dynamic gateway IPs for `namespace`.
    ///
    /// A namespace that no policy targets resolves to an empty set.
    async fn resolve_gateway_ips(&self, namespace: &str) -> Result<BTreeSet<IpAddr>>;
}

/// Programs resolved gateway decisions into the node's network stack.
///
/// All operations must be idempotent. They are only invoked after a decision has been committed
/// to the resolved-state cache.
#[async_trait::async_trait]
pub trait DataplaneApplier: Send + Sync + 'static {
    /// Routes `namespace`'s external traffic through `gateways`.
    async fn apply(&self, namespace: &str, gateways: &Gateways) -> Result<()>;

    /// Removes all external gateway routes for `namespace`.
    async fn withdraw(&self, namespace: &str) -> Result<()>;

    /// Flushes connection-tracking entries in `namespace` that were established through gateways
    /// that are no longer in use.
    async fn flush_conntrack(&self, namespace: &str, stale: &BTreeSet<IpAddr>) -> Result<()>;
}
