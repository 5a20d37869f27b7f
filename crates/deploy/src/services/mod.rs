//! Chain backend services.
//!
//! Each service is in its own submodule with:
//! - `cmd.rs` - Command builder for the backend's launch command
//! - `mod.rs` - Config, handle, and supervision logic

pub mod node;

pub use node::{BackendKind, NodeConfig, NodeHandle, NodeState, NodeSupervisor};
