pub mod config;
pub mod context;
pub mod error;
pub mod metrics;
pub mod port_forward;
pub mod predicate;
pub mod reconciler;
pub mod requeue;
pub mod selector;
pub mod server;
