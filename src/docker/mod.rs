//! Container engine plumbing
//!
//! The typed HTTP client, the attach-stream demultiplexer, and the
//! image build log parser.

pub mod buildlog;
pub mod client;
pub mod demux;
pub mod transport;

pub use buildlog::BuildLogParser;
pub use client::{DiffEntry, DiffKind, Docker};
