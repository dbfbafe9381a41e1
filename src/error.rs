//! Error taxonomy for the image output pipeline.
//!
//! Each stage has its own error type so callers can tell where a build
//! failed; the dispatcher wraps them in [`OutputError`] together with the
//! format tag being produced. Nothing here retries or recovers — the first
//! failure aborts the remaining outputs.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failures while splitting a source image tar into kernel/initrd/cmdline.
#[derive(Debug, Error)]
pub enum ConversionError {
    /// The source tar stream could not be parsed or read.
    #[error("reading image archive: {0}")]
    Archive(#[source] io::Error),

    /// The source archive carries no `kernel` entry.
    #[error("image archive has no kernel entry")]
    MissingKernel,

    /// A write into the initrd (cpio) writer failed.
    #[error("writing initrd entry '{name}': {source}")]
    InitrdWrite {
        name: String,
        #[source]
        source: io::Error,
    },

    /// A hardlink entry referenced a name that was never emitted.
    #[error("hardlink '{name}' references missing entry '{target}'")]
    DanglingHardlink { name: String, target: String },
}

/// Failure while writing the three-entry transport archive.
///
/// `name` is the transport entry whose header or body write failed.
#[derive(Debug, Error)]
#[error("writing transport entry '{name}': {source}")]
pub struct PackagingError {
    pub name: &'static str,
    #[source]
    pub source: io::Error,
}

/// Failures while invoking an external image builder.
#[derive(Debug, Error)]
pub enum BuilderError {
    /// The container runtime is not installed or not on PATH.
    #[error("container runtime '{runtime}' not found in PATH")]
    RuntimeMissing { runtime: String },

    /// No builder is registered for the requested format.
    #[error("no builder registered for {format} output")]
    Unregistered { format: &'static str },

    /// The builder could not be started, could not be fed its input, or
    /// exited non-zero. `cause` carries the captured stderr where available.
    #[error("builder {builder} failed: {cause}")]
    Invocation {
        builder: String,
        cause: anyhow::Error,
    },

    /// The builder exited successfully but emitted no artifact bytes.
    #[error("builder {builder} produced no output")]
    EmptyOutput { builder: String },
}

/// Top-level error for a single requested output.
///
/// Carries the format tag and the stage at which processing failed, so a
/// multi-output request reports exactly which artifact went wrong.
#[derive(Debug, Error)]
pub enum OutputError {
    #[error("no format specified for output")]
    NoFormat,

    #[error("unknown output type {0}")]
    UnknownFormat(String),

    #[error("converting image for {format} output: {source}")]
    Conversion {
        format: &'static str,
        #[source]
        source: ConversionError,
    },

    #[error("packaging boot artifacts for {format} output: {source}")]
    Packaging {
        format: &'static str,
        #[source]
        source: PackagingError,
    },

    #[error("building {format} image: {source}")]
    Builder {
        format: &'static str,
        #[source]
        source: BuilderError,
    },

    #[error("writing {format} output '{path}': {source}")]
    Io {
        format: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}
