//! Dispatch engine: backend registry and the client-facing accept loop.

mod dispatcher;
mod registry;

pub use dispatcher::Balancer;
pub use registry::{Backend, BackendRegistry};
