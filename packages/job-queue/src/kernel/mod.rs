//! Kernel module - queue infrastructure and background services.

pub mod jobs;
pub mod scheduler;
pub mod service_host;

pub use service_host::{Service, ServiceHost};
