use exgw_controller_k8s_api::{
    self as k8s,
    reflector::{ObjectRef, Store},
};
use std::{hash::Hash, sync::Arc};

/// A read-only view of the current state of a kind of resource.
pub trait Lister<K>: Send + Sync {
    fn list(&self) -> Vec<Arc<K>>;

    /// Looks up a resource by name. `namespace` must be set for namespaced resources.
    fn get(&self, namespace: Option<&str>, name: &str) -> Option<Arc<K>>;
}

/// The authoritative listings that syncs re-derive their state from.
#[derive(Clone)]
pub struct Listers {
    pub policies: Arc<dyn Lister<k8s::AdminPolicyBasedExternalRoute>>,
    pub namespaces: Arc<dyn Lister<k8s::Namespace>>,
    pub pods: Arc<dyn Lister<k8s::Pod>>,
}

impl<K> Lister<K> for Store<K>
where
    K: k8s::Resource + Clone + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone + Send + Sync,
{
    fn list(&self) -> Vec<Arc<K>> {
        self.state()
    }

    fn get(&self, namespace: Option<&str>, name: &str) -> Option<Arc<K>> {
        let mut key = ObjectRef::new(name);
        if let Some(ns) = namespace {
            key = key.within(ns);
        }
        Store::get(self, &key)
    }
}
