//! Output format dispatch and file emission.
//!
//! Drives the whole pipeline for a list of requested outputs: parse the
//! format tag, convert the source image where the format needs kernel/initrd
//! separation, package and hand off to the external builder where one is
//! required, and write the result under its deterministic name.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::builder::{BuilderRunner, BuilderTable, DockerRunner};
use crate::error::{BuilderError, OutputError};
use crate::initrd::{self, ImageArtifact};
use crate::transport;

/// Target size handed to the img-gz builder when the spec carries none.
const DEFAULT_IMG_SIZE: &str = "1G";

/// One requested artifact, as it appears in a build configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSpec {
    /// Format tag, e.g. `"iso-bios"` or `"kernel+initrd"`.
    pub format: String,
    /// Target size for size-aware formats, e.g. `"1G"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
}

impl OutputSpec {
    pub fn new(format: impl Into<String>) -> Self {
        Self {
            format: format.into(),
            size: None,
        }
    }
}

/// The closed set of supported output formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputFormat {
    Tar,
    KernelInitrd,
    IsoBios,
    IsoEfi,
    ImgGz,
    GcpImg,
    Qcow2,
    Vhd,
    Vmdk,
}

impl OutputFormat {
    /// Parse a format tag. An empty tag and an unknown tag are distinct
    /// hard failures, matching the input-validation contract.
    pub fn from_tag(tag: &str) -> Result<Self, OutputError> {
        match tag {
            "" => Err(OutputError::NoFormat),
            "tar" => Ok(Self::Tar),
            "kernel+initrd" => Ok(Self::KernelInitrd),
            "iso-bios" => Ok(Self::IsoBios),
            "iso-efi" => Ok(Self::IsoEfi),
            "img-gz" => Ok(Self::ImgGz),
            "gcp-img" => Ok(Self::GcpImg),
            "qcow" | "qcow2" => Ok(Self::Qcow2),
            "vhd" => Ok(Self::Vhd),
            "vmdk" => Ok(Self::Vmdk),
            other => Err(OutputError::UnknownFormat(other.to_string())),
        }
    }

    /// Canonical tag, used in progress and error messages.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Tar => "tar",
            Self::KernelInitrd => "kernel+initrd",
            Self::IsoBios => "iso-bios",
            Self::IsoEfi => "iso-efi",
            Self::ImgGz => "img-gz",
            Self::GcpImg => "gcp-img",
            Self::Qcow2 => "qcow2",
            Self::Vhd => "vhd",
            Self::Vmdk => "vmdk",
        }
    }

    /// Deterministic output file names for this format under `base`.
    ///
    /// Every format emits a single file except `kernel+initrd`, which emits
    /// the kernel, initrd and cmdline side by side.
    pub fn file_names(&self, base: &str) -> Vec<String> {
        match self {
            Self::Tar => vec![format!("{base}.tar")],
            Self::KernelInitrd => vec![
                format!("{base}-kernel"),
                format!("{base}-initrd.img"),
                format!("{base}-cmdline"),
            ],
            Self::IsoBios => vec![format!("{base}.iso")],
            Self::IsoEfi => vec![format!("{base}-efi.iso")],
            Self::ImgGz => vec![format!("{base}.img.gz")],
            Self::GcpImg => vec![format!("{base}.img.tar.gz")],
            Self::Qcow2 => vec![format!("{base}.qcow2")],
            Self::Vhd => vec![format!("{base}.vhd")],
            Self::Vmdk => vec![format!("{base}.vmdk")],
        }
    }

    /// Whether producing this format requires an external builder.
    pub fn needs_builder(&self) -> bool {
        !matches!(self, Self::Tar | Self::KernelInitrd)
    }
}

/// Sequential output pipeline: builder table plus invocation seam.
pub struct OutputPipeline<R = DockerRunner> {
    runner: R,
    builders: BuilderTable,
}

impl OutputPipeline<DockerRunner> {
    /// Pipeline with the pinned builder table and the docker runner.
    pub fn new() -> Self {
        Self::with_runner(DockerRunner::default())
    }
}

impl Default for OutputPipeline<DockerRunner> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: BuilderRunner> OutputPipeline<R> {
    pub fn with_runner(runner: R) -> Self {
        Self {
            runner,
            builders: BuilderTable::pinned(),
        }
    }

    pub fn with_builders(mut self, builders: BuilderTable) -> Self {
        self.builders = builders;
        self
    }

    /// Produce every requested output, strictly in list order.
    ///
    /// The first failure aborts the loop: outputs already written stay on
    /// disk, later specs are never attempted, and the error names the format
    /// and stage that failed.
    pub fn write_outputs(
        &self,
        specs: &[OutputSpec],
        base: &str,
        image: &[u8],
    ) -> Result<(), OutputError> {
        for spec in specs {
            self.write_output(spec, base, image)?;
        }
        Ok(())
    }

    fn write_output(&self, spec: &OutputSpec, base: &str, image: &[u8]) -> Result<(), OutputError> {
        let format = OutputFormat::from_tag(&spec.format)?;
        let names = format.file_names(base);

        match format {
            OutputFormat::Tar => {
                println!("  {}", names[0]);
                write_file(format, Path::new(&names[0]), image)
            }
            OutputFormat::KernelInitrd => {
                let artifact = self.convert(format, image)?;
                println!("  {} {} {}", names[0], names[1], names[2]);
                write_file(format, Path::new(&names[0]), &artifact.kernel)?;
                write_file(format, Path::new(&names[1]), &artifact.initrd)?;
                write_file(format, Path::new(&names[2]), artifact.cmdline.as_bytes())
            }
            _ => {
                let artifact = self.convert(format, image)?;
                println!("  {}", names[0]);
                let bytes = self.run_builder(format, spec, &artifact)?;
                write_file(format, Path::new(&names[0]), &bytes)
            }
        }
    }

    fn convert(&self, format: OutputFormat, image: &[u8]) -> Result<ImageArtifact, OutputError> {
        initrd::convert(image).map_err(|source| OutputError::Conversion {
            format: format.tag(),
            source,
        })
    }

    fn run_builder(
        &self,
        format: OutputFormat,
        spec: &OutputSpec,
        artifact: &ImageArtifact,
    ) -> Result<Vec<u8>, OutputError> {
        let descriptor = self.builders.get(format).ok_or(OutputError::Builder {
            format: format.tag(),
            source: BuilderError::Unregistered {
                format: format.tag(),
            },
        })?;

        let transport = transport::package(artifact).map_err(|source| OutputError::Packaging {
            format: format.tag(),
            source,
        })?;

        // The boot command line is always passed; size-aware formats get
        // the target size appended.
        let mut args = vec![artifact.cmdline.clone()];
        if format == OutputFormat::ImgGz {
            args.push(
                spec.size
                    .clone()
                    .unwrap_or_else(|| DEFAULT_IMG_SIZE.to_string()),
            );
        }

        self.runner
            .run(descriptor, &transport, &args)
            .map_err(|source| OutputError::Builder {
                format: format.tag(),
                source,
            })
    }
}

fn write_file(format: OutputFormat, path: &Path, bytes: &[u8]) -> Result<(), OutputError> {
    fs::write(path, bytes).map_err(|source| OutputError::Io {
        format: format.tag(),
        path: PathBuf::from(path),
        source,
    })
}
