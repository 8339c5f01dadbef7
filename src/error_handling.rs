//! Error types of every subsystem.
//!
//! Each subsystem has its own enum; the orchestrator and the controller wrap
//! the lower ones through `From` so `?` can be used across layers.

pub mod types;
