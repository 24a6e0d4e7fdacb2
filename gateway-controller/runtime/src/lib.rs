pub use exgw_controller_core as core;
pub use exgw_controller_k8s_api as k8s;
pub use exgw_controller_k8s_index as index;

mod admission;
mod args;
pub mod controller;
pub mod dataplane;
pub mod informer;
mod metrics;
pub mod queue;


pub use self::{
    args::Args,
    controller::{Controller, Retries},
    dataplane::{Dataplane, LogApplier},
    metrics::{ControllerMetrics, QueueMetrics},
};
