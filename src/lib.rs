//! Kiln - Container Package Builder
//!
//! Builds native OS packages by assembling a source tree, running a
//! declarative build recipe inside a disposable container, and
//! harvesting only the files the build actually produced.

pub mod cli;
pub mod config;
pub mod cook;
pub mod docker;
pub mod error;
pub mod recipe;
pub mod source;

pub use error::{KilnError, KilnResult};
