use crate::{Manager, NamespaceRouteInfo, Result};
use exgw_controller_core::{Gateways, ResolveGatewayIps};
use std::{collections::BTreeSet, net::IpAddr};

impl NamespaceRouteInfo {
    /// Returns the union of all static and dynamic next hops recorded for the namespace.
    pub fn gateways(&self) -> Gateways {
        let mut gateways = Gateways::default();
        for info in self.static_gateways.values().flatten() {
            gateways.insert_static(info);
        }
        for info in self.dynamic_gateways.values().flat_map(|pods| pods.values()) {
            gateways.insert_dynamic(info);
        }
        gateways
    }
}

impl Manager {
    /// Resolves the gateways that carry a namespace's external traffic.
    ///
    /// A namespace without a cache entry resolves to no gateways. A namespace whose entry is being
    /// torn down fails with [`Error::DeletionInProgress`](crate::Error::DeletionInProgress).
    pub async fn resolve_gateways(&self, ns: &str) -> Result<Gateways> {
        let info = match self.lock_namespace(ns).await {
            Some(info) => info,
            None => return Ok(Gateways::default()),
        };
        info.ensure_active(ns)?;
        Ok(info.gateways())
    }
}

#[async_trait::async_trait]
impl ResolveGatewayIps for Manager {
    async fn resolve_gateway_ips(&self, namespace: &str) -> anyhow::Result<BTreeSet<IpAddr>> {
        let gateways = self.resolve_gateways(namespace).await?;
        Ok(gateways.ips())
    }
}
