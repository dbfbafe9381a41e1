//! Image output pipeline: turn a built system tarball into bootable artifacts.
//!
//! The input is a tar stream of a root filesystem carrying two marker
//! entries, `kernel` and `cmdline`. From it this crate produces any of the
//! supported output formats:
//!
//! - **kernel+initrd** - the raw kernel, a cpio newc initrd and the command
//!   line written side by side
//! - **iso-bios / iso-efi** - bootable ISOs
//! - **img-gz / gcp-img / qcow2 / vhd / vmdk** - disk images
//! - **tar** - the source archive passed through unmodified
//!
//! # Architecture
//!
//! ```text
//! source tar ──► initrd::convert ──► ImageArtifact {kernel, initrd, cmdline}
//!                                         │
//!                                         ├─► kernel+initrd: written directly
//!                                         │
//!                                         └─► transport::package ──► three-entry tar
//!                                                  │
//!                                                  ▼
//!                                        builder::BuilderRunner
//!                                        (pinned container image,
//!                                         tar on stdin, artifact on stdout)
//! ```
//!
//! Disk and ISO mastering is delegated to pinned, content-addressed external
//! builders; this crate only defines the invocation contract. Processing is
//! strictly sequential: one output completes before the next starts, and the
//! first failure aborts the rest of the request.
//!
//! # Example
//!
//! ```rust,ignore
//! use image_output::{OutputPipeline, OutputSpec};
//!
//! let image = std::fs::read("system.tar")?;
//! let pipeline = OutputPipeline::new();
//! pipeline.write_outputs(&[OutputSpec::new("qcow2")], "output/img", &image)?;
//! ```

pub mod builder;
pub mod error;
pub mod initrd;
pub mod output;
pub mod process;
pub mod transport;

pub use builder::{BuilderDescriptor, BuilderRunner, BuilderTable, DockerRunner};
pub use error::{BuilderError, ConversionError, OutputError, PackagingError};
pub use initrd::{convert, ImageArtifact, InitrdWriter};
pub use output::{OutputFormat, OutputPipeline, OutputSpec};
pub use transport::package;
