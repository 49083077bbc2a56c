//! keel-proxy: load balancer configuration for the nginx front proxy.
//!
//! Derives one server entry per public domain of every exposed app, renders
//! them through Tera templates, swaps the generated files in atomically and
//! signals nginx to reload.
//!
//! # Components
//!
//! - **`routes`**: server entries from app records and cluster settings
//! - **`render`**: built-in templates and Tera rendering
//! - **`swap`**: `.fut` / `.bak` / `.conf` atomic replacement
//! - **`reconciler`**: `LoadBalancerReconciler`, the serialized reload queue
//! - **`bootstrap`**: places and mounts the nginx service at daemon start

pub mod bootstrap;
pub mod error;
pub mod reconciler;
pub mod render;
pub mod routes;
pub mod swap;

pub use bootstrap::ProxyBootstrap;
pub use error::{ProxyError, ProxyResult};
pub use reconciler::LoadBalancerReconciler;
pub use routes::{NginxPaths, ServerEntry};
