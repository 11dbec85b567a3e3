pub mod config;
pub mod deploy;
pub mod digest;
pub mod error;
pub mod locator;
pub mod lockfile;
pub mod observability;
pub mod orchestrator;
pub mod runner;
pub mod service;
pub mod summary;
pub mod validation;

pub use config::{PipelineConfig, RunOverrides};
pub use error::PipelineError;
pub use orchestrator::{PipelineOrchestrator, PipelineReport, PipelineState};
