//! The cook pipeline and its collaborators
//!
//! Dockerfile generation, distribution detection, diff splitting,
//! output staging, and the orchestrator driving them end to end.

pub mod dockerfile;
pub mod flavour;
pub mod output;
pub mod pipeline;
pub mod splitter;

pub use pipeline::{cook, CookOptions};

/// Package index refresh policy for the dependency-install step
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum UpdateMode {
    /// Probe the base image's index cache for staleness
    Auto,
    /// Never refresh
    Never,
    /// Always refresh
    Always,
}
