/// model-ci library crate.
///
/// Exposes the queueing, generation, reporting, import and deployment modules as a
/// public API so that integration tests in tests/ can import them via
/// `model_ci::`.
///
/// The binary entry point (src/main.rs) wires these modules to subcommands.
pub mod az;
pub mod config;
pub mod deploy;
pub mod error;
pub mod github;
pub mod models;
pub mod queue;
pub mod registration;
pub mod setup;
pub mod status;
pub mod template;
pub mod utils;
pub mod workflow;
