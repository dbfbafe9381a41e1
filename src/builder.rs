//! External image builders.
//!
//! Each disk/ISO format is produced by a pinned, content-addressed container
//! image that reads the transport archive on stdin and writes the finished
//! artifact to stdout. This module holds the builder identities, the lookup
//! table injected into the output pipeline, and the invocation seam.

use crate::error::BuilderError;
use crate::output::OutputFormat;
use crate::process::Cmd;

/// Immutable identity of an external builder.
///
/// `reference` is a pinned container image reference; changing it is a
/// deliberate version bump, never something derived at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuilderDescriptor {
    pub name: &'static str,
    pub reference: &'static str,
}

/// Pinned builder references for every format that needs one.
const PINNED: &[(OutputFormat, BuilderDescriptor)] = &[
    (
        OutputFormat::IsoBios,
        BuilderDescriptor {
            name: "mkimage-iso-bios",
            reference: "linuxkit/aarch64/mkimage-iso-bios:afc9d3470557101f53aed9784b5215f8cc05a029",
        },
    ),
    (
        OutputFormat::IsoEfi,
        BuilderDescriptor {
            name: "mkimage-iso-efi",
            reference: "linuxkit/aarch64/mkimage-iso-efi:29204397d5128dbe6df31d0187fd706239b0f862",
        },
    ),
    (
        OutputFormat::ImgGz,
        BuilderDescriptor {
            name: "mkimage-img-gz",
            reference: "linuxkit/aarch64/mkimage-img-gz:dcd6839dc5ee1c67e5ddb2de308ed8a355f4bc5d",
        },
    ),
    (
        OutputFormat::GcpImg,
        BuilderDescriptor {
            name: "mkimage-gcp",
            reference: "linuxkit/mkimage-gcp:46716b3d3f7aa1a7607a3426fe0ccebc554b14ee@sha256:18d8e0482f65a2481f5b6ba1e7ce77723b246bf13bdb612be5e64df90297940c",
        },
    ),
    (
        OutputFormat::Qcow2,
        BuilderDescriptor {
            name: "mkimage-qcow",
            reference: "linuxkit/mkimage-qcow:69890f35b55e4ff8a2c7a714907f988e57056d02@sha256:f89dc09f82bdbf86d7edae89604544f20b99d99c9b5cabcf1f93308095d8c244",
        },
    ),
    (
        OutputFormat::Vhd,
        BuilderDescriptor {
            name: "mkimage-vhd",
            reference: "linuxkit/mkimage-vhd:a04c8480d41ca9cef6b7710bd45a592220c3acb2@sha256:ba373dc8ae5dc72685dbe4b872d8f588bc68b2114abd8bdc6a74d82a2b62cce3",
        },
    ),
    (
        OutputFormat::Vmdk,
        BuilderDescriptor {
            name: "mkimage-vmdk",
            reference: "linuxkit/mkimage-vmdk:182b541474ca7965c8e8f987389b651859f760da@sha256:99638c5ddb17614f54c6b8e11bd9d49d1dea9d837f38e0f6c1a5f451085d449b",
        },
    ),
];

/// Static format→builder lookup table.
///
/// Injected into the pipeline at construction so version pins can be audited
/// (and swapped in tests) independently of dispatch logic.
#[derive(Debug, Clone, Copy)]
pub struct BuilderTable {
    entries: &'static [(OutputFormat, BuilderDescriptor)],
}

impl BuilderTable {
    pub const fn new(entries: &'static [(OutputFormat, BuilderDescriptor)]) -> Self {
        Self { entries }
    }

    /// The pinned production table.
    pub const fn pinned() -> Self {
        Self::new(PINNED)
    }

    pub fn get(&self, format: OutputFormat) -> Option<&BuilderDescriptor> {
        self.entries
            .iter()
            .find(|(f, _)| *f == format)
            .map(|(_, d)| d)
    }
}

/// Invocation seam for external builders.
///
/// The production implementation shells out to a container runtime; tests
/// substitute an in-process implementation returning canned bytes. The call
/// is synchronous and blocking with no timeout: a hung builder hangs the
/// pipeline (a known gap, reproduced deliberately).
pub trait BuilderRunner {
    /// Run `builder`, feeding `transport` on stdin, and return its stdout.
    fn run(
        &self,
        builder: &BuilderDescriptor,
        transport: &[u8],
        args: &[String],
    ) -> Result<Vec<u8>, BuilderError>;
}

/// Runs builders via `docker run --rm -i <reference> <args…>`.
#[derive(Debug, Clone)]
pub struct DockerRunner {
    runtime: String,
}

impl DockerRunner {
    pub fn new(runtime: impl Into<String>) -> Self {
        Self {
            runtime: runtime.into(),
        }
    }
}

impl Default for DockerRunner {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl BuilderRunner for DockerRunner {
    fn run(
        &self,
        builder: &BuilderDescriptor,
        transport: &[u8],
        args: &[String],
    ) -> Result<Vec<u8>, BuilderError> {
        which::which(&self.runtime).map_err(|_| BuilderError::RuntimeMissing {
            runtime: self.runtime.clone(),
        })?;

        let result = Cmd::new(&self.runtime)
            .args(["run", "--rm", "-i", builder.reference])
            .args(args)
            .input(transport)
            .error_msg(format!("builder {} failed", builder.name))
            .run()
            .map_err(|cause| BuilderError::Invocation {
                builder: builder.name.to_string(),
                cause,
            })?;

        if result.stdout.is_empty() {
            return Err(BuilderError::EmptyOutput {
                builder: builder.name.to_string(),
            });
        }
        Ok(result.stdout)
    }
}
