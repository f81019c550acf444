pub mod backend;
pub mod batch;
pub mod dataplane;
pub mod desired;
pub mod hash;
pub mod ipsets;
pub mod metrics;
pub mod policies;
pub mod reconcile;

pub use dataplane::{Config, Dataplane};
