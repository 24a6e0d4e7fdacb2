use std::{collections::BTreeSet, fmt, net::IpAddr};

/// Identifies a pod by namespace and name.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PodRef {
    pub namespace: String,
    pub name: String,
}

/// The next-hop IPs contributed by a single static hop or a single gateway pod.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GatewayInfo {
    pub ips: BTreeSet<IpAddr>,

    /// Whether the next hops should be monitored with BFD.
    pub bfd_enabled: bool,
}

/// The gateways resolved for a single namespace.
///
/// Contributions are merged with set semantics: an IP contributed by several policies or pods is
/// carried once.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Gateways {
    pub static_ips: BTreeSet<IpAddr>,
    pub dynamic_ips: BTreeSet<IpAddr>,

    /// The subset of IPs that were contributed by at least one BFD-enabled hop.
    pub bfd_ips: BTreeSet<IpAddr>,
}

// === impl PodRef ===

impl PodRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for PodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// === impl GatewayInfo ===

impl GatewayInfo {
    pub fn new(ips: impl IntoIterator<Item = IpAddr>, bfd_enabled: bool) -> Self {
        Self {
            ips: ips.into_iter().collect(),
            bfd_enabled,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ips.is_empty()
    }

    /// Merges another hop's IPs into this one, enabling BFD if either hop requires it.
    pub fn merge(&mut self, other: GatewayInfo) {
        self.ips.extend(other.ips);
        self.bfd_enabled |= other.bfd_enabled;
    }
}

// === impl Gateways ===

impl Gateways {
    pub fn is_empty(&self) -> bool {
        self.static_ips.is_empty() && self.dynamic_ips.is_empty()
    }

    /// Returns the union of static and dynamic gateway IPs.
    pub fn ips(&self) -> BTreeSet<IpAddr> {
        self.static_ips.union(&self.dynamic_ips).copied().collect()
    }

    pub fn insert_static(&mut self, info: &GatewayInfo) {
        self.static_ips.extend(info.ips.iter().copied());
        if info.bfd_enabled {
            self.bfd_ips.extend(info.ips.iter().copied());
        }
    }

    pub fn insert_dynamic(&mut self, info: &GatewayInfo) {
        self.dynamic_ips.extend(info.ips.iter().copied());
        if info.bfd_enabled {
            self.bfd_ips.extend(info.ips.iter().copied());
        }
    }
}
