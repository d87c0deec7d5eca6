//! # cf-av
//!
//! Video transcoding for clipforge workers.
//!
//! This crate provides:
//!
//! - **Tool discovery** ([`ToolRegistry`]) -- find ffmpeg and ffprobe.
//! - **Command execution** ([`ToolCommand`]) -- async builder with timeout,
//!   cancellation, and streamed stderr for external processes.
//! - **Presets** ([`Profile`]) -- the renditions a job can be encoded to.
//! - **The engine seam** ([`TranscodeEngine`], [`FfmpegEngine`]) -- encode a
//!   local file with progress reporting.
//! - **Scratch space** ([`Workspace`]) -- per-attempt temporary directories.

pub mod command;
pub mod engine;
pub mod profile;
pub mod tools;
pub mod workspace;

pub use command::{ToolCommand, ToolOutput};
pub use engine::{FfmpegEngine, ProgressCallback, ProgressTracker, TranscodeEngine};
pub use profile::Profile;
pub use tools::{ToolInfo, ToolRegistry};
pub use workspace::Workspace;
