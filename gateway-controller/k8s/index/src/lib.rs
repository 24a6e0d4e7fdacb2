//! External gateway route index
//!
//! Maintains, for every namespace targeted by an `AdminPolicyBasedExternalRoute`, the set of
//! gateway IPs through which the namespace's external traffic is routed. Three inputs change
//! independently:
//!
//! - Each policy selects its target namespaces with `from.namespaceSelector` and contributes
//!   static next hops and/or dynamic next hops derived from gateway pods.
//! - Each `Namespace`'s labels determine which policies target it.
//! - Each gateway `Pod`'s labels and IPs determine the dynamic next hops it contributes.
//!
//! ```text
//! [ Policy ] -> [ NamespaceRouteInfo ] <- [ Pod ]
//! ```
//!
//! Every sync re-derives the desired state of its key from the current listings, so a missed,
//! duplicated or reordered notification is corrected by the next sync of the same key.
//!
//! Namespace entries are guarded at two levels: a membership lock over the map of entries and
//! an exclusive lock per entry. An entry that is being torn down is marked for deletion while
//! its lock is held and is removed from the map last, so tasks waiting on the entry observe the
//! tombstone rather than resurrecting it.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod error;
mod lister;
mod manager;
mod namespace;
mod pod;
mod policy;
mod resolve;


pub use self::{
    error::{Error, Result},
    lister::{Lister, Listers},
    manager::{Manager, SharedManager},
    namespace::NamespaceRouteInfo,
    policy::RoutePolicy,
};
