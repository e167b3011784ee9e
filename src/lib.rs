//! macvm: lifecycle orchestration for a single macOS guest VM.
//!
//! The [`vm::Orchestrator`] drives a bundle directory through image
//! acquisition, installation and boot on top of a pluggable
//! [`engine::Hypervisor`].

pub mod config;
pub mod engine;
pub mod log_stream;
pub mod logging;
pub mod paths;
pub mod state_machine;
pub mod vm;
