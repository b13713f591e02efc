/*!
 * BPF Object Types
 * Metadata and errors exposed by object loaders
 */

use crate::core::types::RawFd;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Loader-level errors
#[derive(Error, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "error_type")]
pub enum BpfError {
    #[error("Failed to load BPF object: {reason}")]
    LoadFailed { reason: String },

    #[error("Failed to attach: {reason}")]
    AttachFailed { reason: String },

    #[error("Failed to detach: {reason}")]
    DetachFailed { reason: String },

    #[error("Map operation failed: {reason}")]
    MapError { reason: String },

    #[error("Program not found: {name}")]
    ProgramNotFound { name: String },

    #[error("Map not found: {name}")]
    MapNotFound { name: String },

    #[error("Program run failed: {reason}")]
    RunFailed { reason: String },

    #[error("Object already unloaded")]
    Unloaded,

    #[error("BPF feature not available")]
    NotAvailable,
}

/// Result type for loader operations
pub type BpfResult<T> = Result<T, BpfError>;

/// Input artifact handed to an [`ObjectLoader`](super::ObjectLoader)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectArtifact {
    /// Compiled object on disk
    Path(PathBuf),
    /// Compiled object embedded in the binary
    Bytes(Vec<u8>),
}

impl ObjectArtifact {
    pub fn describe(&self) -> String {
        match self {
            ObjectArtifact::Path(path) => path.display().to_string(),
            ObjectArtifact::Bytes(bytes) => format!("<embedded, {} bytes>", bytes.len()),
        }
    }
}

/// Map type as reported by the loader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MapKind {
    Array,
    Hash,
    /// Kernel-to-userspace ring buffer
    RingBuf,
    /// Userspace-to-kernel ring buffer
    UserRingBuf,
    /// Scheduler attach point
    StructOps,
    Other(u32),
}

impl MapKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Array => "BPF_MAP_TYPE_ARRAY",
            Self::Hash => "BPF_MAP_TYPE_HASH",
            Self::RingBuf => "BPF_MAP_TYPE_RINGBUF",
            Self::UserRingBuf => "BPF_MAP_TYPE_USER_RINGBUF",
            Self::StructOps => "BPF_MAP_TYPE_STRUCT_OPS",
            Self::Other(_) => "BPF_MAP_TYPE_UNSPEC",
        }
    }
}

impl fmt::Display for MapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Other(raw) => write!(f, "{}({})", self.as_str(), raw),
            _ => f.write_str(self.as_str()),
        }
    }
}

/// Program type as reported by the loader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgramKind {
    Kprobe,
    StructOps,
    /// Runnable on demand through the test-run interface
    Syscall,
    Tracing,
    Other,
}

/// Enumerated map
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapInfo {
    pub name: String,
    pub kind: MapKind,
    pub fd: RawFd,
}

/// Enumerated program
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramInfo {
    pub name: String,
    pub kind: ProgramKind,
}
