//! keel-docker: the orchestrator seam.
//!
//! Everything keel asks of the container cluster goes through the
//! [`Orchestrator`] trait. Two implementations ship here:
//!
//! ```text
//!                 ┌──────────────────────┐
//!   callers ────► │  dyn Orchestrator    │
//!                 └──────────┬───────────┘
//!              ┌─────────────┴──────────────┐
//!              ▼                            ▼
//!   DockerClient                     MemoryOrchestrator
//!   (Engine API over the             (versioned in-process fake
//!    Unix socket, hyper http1)        used by tests)
//! ```
//!
//! Image build, push and pull return a [`ProgressStream`] of raw output
//! chunks; [`progress::parse_chunk`] turns each chunk into structured
//! progress entries.

pub mod client;
pub mod error;
pub mod memory;
pub mod orchestrator;
pub mod progress;
pub mod retry;

pub use client::DockerClient;
pub use error::{OrchestratorError, OrchestratorResult};
pub use memory::MemoryOrchestrator;
pub use orchestrator::*;
pub use progress::{parse_chunk, ProgressChunk};
pub use retry::RetryPolicy;
