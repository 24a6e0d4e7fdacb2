//! Mirrors a watch into a reflector store and describes every change to a handler.

use crate::k8s::{
    reflector::{store::Writer, ObjectRef, Store},
    watcher, Resource, ResourceExt,
};
use ahash::AHashMap as HashMap;
use futures::prelude::*;
use std::{fmt::Debug, sync::Arc};

/// A change to an object as observed by an [`Informer`].
#[derive(Clone, Debug)]
pub enum Change<K> {
    Added(Arc<K>),
    Updated { old: Arc<K>, new: Arc<K> },
    Deleted(Deleted<K>),
}

#[derive(Clone, Debug)]
pub enum Deleted<K> {
    /// The deletion was observed directly.
    Object(Arc<K>),

    /// The object was missing from a relist. Its final state is unknown; `obj` is the last state
    /// that was observed.
    FinalStateUnknown { key: String, obj: Arc<K> },
}

pub struct Informer<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + std::hash::Hash + Clone,
{
    writer: Writer<K>,

    /// The store's contents when a relist started, used to find objects that were deleted while
    /// the watch was interrupted.
    relist: Option<Relist<K>>,
}

struct Relist<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + std::hash::Hash + Clone,
{
    prior: HashMap<ObjectRef<K>, Arc<K>>,
    seen: Vec<ObjectRef<K>>,
}

// === impl Deleted ===

impl<K> Deleted<K> {
    pub fn object(&self) -> &Arc<K> {
        match self {
            Self::Object(obj) => obj,
            Self::FinalStateUnknown { obj, .. } => obj,
        }
    }
}

// === impl Informer ===

impl<K> Informer<K>
where
    K: Resource + Clone + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + std::hash::Hash + Clone,
{
    pub fn new(writer: Writer<K>) -> Self {
        Self {
            writer,
            relist: None,
        }
    }

    pub fn store(&self) -> Store<K> {
        self.writer.as_reader()
    }

    /// Applies a watch event to the store and reports the resulting changes.
    pub fn apply(&mut self, event: watcher::Event<K>, handler: &mut impl FnMut(Change<K>)) {
        let store = self.writer.as_reader();
        match event {
            watcher::Event::Apply(obj) => {
                let key = ObjectRef::from_obj(&obj);
                let old = store.get(&key);
                self.writer
                    .apply_watcher_event(&watcher::Event::Apply(obj));
                if let Some(new) = store.get(&key) {
                    match old {
                        Some(old) => handler(Change::Updated { old, new }),
                        None => handler(Change::Added(new)),
                    }
                }
            }

            watcher::Event::Delete(obj) => {
                self.writer
                    .apply_watcher_event(&watcher::Event::Delete(obj.clone()));
                handler(Change::Deleted(Deleted::Object(Arc::new(obj))));
            }

            watcher::Event::Init => {
                let prior = store
                    .state()
                    .into_iter()
                    .map(|obj| (ObjectRef::from_obj(&*obj), obj))
                    .collect();
                self.relist = Some(Relist {
                    prior,
                    seen: Vec::new(),
                });
                self.writer.apply_watcher_event(&watcher::Event::Init);
            }

            watcher::Event::InitApply(obj) => {
                if let Some(relist) = self.relist.as_mut() {
                    relist.seen.push(ObjectRef::from_obj(&obj));
                }
                self.writer
                    .apply_watcher_event(&watcher::Event::InitApply(obj));
            }

            watcher::Event::InitDone => {
                self.writer.apply_watcher_event(&watcher::Event::InitDone);
                let Relist { mut prior, seen } = match self.relist.take() {
                    Some(relist) => relist,
                    None => return,
                };

                for key in seen {
                    let new = match store.get(&key) {
                        Some(new) => new,
                        None => continue,
                    };
                    match prior.remove(&key) {
                        Some(old) => handler(Change::Updated { old, new }),
                        None => handler(Change::Added(new)),
                    }
                }

                for (_, obj) in prior {
                    let key = match obj.namespace() {
                        Some(ns) => format!("{ns}/{}", obj.name_any()),
                        None => obj.name_any(),
                    };
                    handler(Change::Deleted(Deleted::FinalStateUnknown { key, obj }));
                }
            }
        }
    }
}

/// Drives an informer from a watch until the watch ends.
pub async fn run<K>(
    mut informer: Informer<K>,
    events: impl Stream<Item = watcher::Event<K>>,
    mut handler: impl FnMut(Change<K>),
) where
    K: Resource + Clone + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + std::hash::Hash + Clone,
{
    tokio::pin!(events);
    while let Some(event) = events.next().await {
        informer.apply(event, &mut handler);
    }
}
