//! Error types for Kiln
//!
//! All modules use `KilnResult<T>` as their return type.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for Kiln operations
pub type KilnResult<T> = Result<T, KilnError>;

/// All errors that can occur in Kiln
#[derive(Error, Debug)]
pub enum KilnError {
    // Source cache errors
    #[error("Failed to fetch {url}: {reason}")]
    FetchFailed { url: String, reason: String },

    #[error("Checksum mismatch for {url}: expected {expected}, got {given}")]
    ChecksumMismatch {
        url: String,
        expected: String,
        given: String,
    },

    #[error("Too many redirects while fetching {url} (limit 3)")]
    TooManyRedirects { url: String },

    #[error("Unknown archive type: {url} (supported: {supported})")]
    UnknownArchiveType { url: String, supported: String },

    #[error("No source backend recognizes url: {url}")]
    SourceUnrecognized { url: String },

    #[error("Ambiguous source url {url}: matched by {}", .candidates.join(", "))]
    SourceAmbiguous {
        url: String,
        candidates: Vec<String>,
    },

    #[error("Failed to apply patch {}: patch exited with code {code}", .patch.display())]
    PatchFailed { patch: PathBuf, code: i32 },

    // Recipe errors
    #[error("Recipe not found: {0}")]
    RecipeNotFound(PathBuf),

    #[error("Invalid recipe {}: {reason}", .path.display())]
    RecipeInvalid { path: PathBuf, reason: String },

    #[error("Recipe lint failed:\n{}", .problems.join("\n"))]
    RecipeLint { problems: Vec<String> },

    // Container engine errors
    #[error("Engine returned status {status}: {message}")]
    EngineStatus { status: u16, message: String },

    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("File not found in container: {0}")]
    FileNotFound(String),

    #[error("Build failed: container exited with code {code}")]
    BuildFailed { code: i64 },

    #[error("Image missing from build log, the build script probably failed before producing output")]
    ImageIdMissing,

    // Attach stream protocol errors
    #[error("Short read in attach stream (truncated frame)")]
    ShortRead,

    #[error("Wrong stream type in attach frame: {0}")]
    UnknownStreamType(u8),

    #[error("Invalid chunk size line: {0:?}")]
    InvalidChunkSize(String),

    // Distribution / flavour errors
    #[error("Unknown flavour for distribution: {0}")]
    UnknownFlavour(String),

    #[error("Could not detect distribution of image {0}")]
    DistributionUndetected(String),

    // Output errors
    #[error("Output path already exists: {0}")]
    OutputExists(PathBuf),

    #[error("Output hook failed: {command} (exit code {code})")]
    OutputHookFailed { command: String, code: i32 },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    // Process errors
    #[error("Command failed: {command}")]
    CommandFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command execution error: {command}, stderr: {stderr}")]
    CommandExecution { command: String, stderr: String },

    // Transport errors
    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("Invalid engine host: {0}")]
    InvalidHost(String),

    #[error("Malformed engine response: {0}")]
    InvalidResponse(String),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
}

impl KilnError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a command failed error
    pub fn command_failed(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::CommandFailed {
            command: command.into(),
            source,
        }
    }

    /// Create a command execution error
    pub fn command_exec(command: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::CommandExecution {
            command: command.into(),
            stderr: stderr.into(),
        }
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::RecipeNotFound(_) => {
                Some("Run kiln from the recipe directory or pass the recipe path")
            }
            Self::UnknownFlavour(_) | Self::DistributionUndetected(_) => {
                Some("Pass --distribution (e.g. --distribution ubuntu-24.04)")
            }
            Self::OutputExists(_) => Some("Pass --overwrite to replace it"),
            Self::Io { context, .. } if context.starts_with("connecting to") => {
                Some("Is the container engine running? Set --host or DOCKER_HOST")
            }
            _ => None,
        }
    }
}
