use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub mod checkpoint;
pub mod gguf;
pub mod library;

pub use checkpoint::{inspect, CheckpointKind, CheckpointSummary, TensorSummary};
pub use library::{CandleLibrary, LoadedModel, ModelLibrary, NamedTensors};

/// Serialization targets a checkpoint can be exported to.
///
/// Which of these actually work is up to the [`ModelLibrary`]; the tag set
/// itself is fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Safetensors,
    Gguf,
    Npz,
    TorchScript,
    Onnx,
}

impl ExportFormat {
    pub fn all() -> &'static [ExportFormat] {
        &[
            ExportFormat::Safetensors,
            ExportFormat::Gguf,
            ExportFormat::Npz,
            ExportFormat::TorchScript,
            ExportFormat::Onnx,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            ExportFormat::Safetensors => "safetensors",
            ExportFormat::Gguf => "gguf",
            ExportFormat::Npz => "npz",
            ExportFormat::TorchScript => "torchscript",
            ExportFormat::Onnx => "onnx",
        }
    }

    pub fn extension(&self) -> &'static str {
        self.name()
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        ExportFormat::all()
            .iter()
            .copied()
            .find(|f| f.name() == lowered)
            .ok_or_else(|| s.to_string())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExportOptions {
    /// Store floating point tensors as F16.
    pub half: bool,
    /// Sub-dictionary of a PyTorch checkpoint that holds the weights.
    pub pickle_key: Option<String>,
    /// Model name recorded in artifact metadata. Defaults to the file stem.
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionReport {
    pub source_path: PathBuf,
    pub output_path: PathBuf,
    pub format: ExportFormat,
    pub tensor_count: usize,
    pub parameter_count: u64,
    pub source_size_bytes: u64,
    pub output_size_bytes: u64,
}

/// Where the artifact for `checkpoint` lands: same directory, same base
/// name, the format's extension.
pub fn artifact_path<P: AsRef<Path>>(checkpoint: P, format: ExportFormat) -> PathBuf {
    checkpoint.as_ref().with_extension(format.extension())
}

/// Load `checkpoint` with the candle backend and export it as `format`.
pub fn convert<P: AsRef<Path>>(checkpoint: P, format: &str) -> Result<PathBuf> {
    Converter::new(CandleLibrary::new())
        .convert(checkpoint, format)
        .map(|report| report.output_path)
}

/// Runs the load-then-export pipeline against a model library.
pub struct Converter<L: ModelLibrary> {
    library: L,
    options: ExportOptions,
}

impl<L: ModelLibrary> Converter<L> {
    pub fn new(library: L) -> Self {
        Self {
            library,
            options: ExportOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ExportOptions) -> Self {
        self.options = options;
        self
    }

    pub fn library(&self) -> &L {
        &self.library
    }

    pub fn options(&self) -> &ExportOptions {
        &self.options
    }

    /// Resolve a format tag against what the library can produce.
    pub fn resolve_format(&self, format: &str) -> Result<ExportFormat> {
        let supported = self.library.supported_formats();
        match ExportFormat::from_str(format) {
            Ok(f) if supported.contains(&f) => Ok(f),
            _ => Err(Error::UnsupportedFormat {
                format: format.to_string(),
                supported: supported
                    .iter()
                    .map(|f| f.name())
                    .collect::<Vec<_>>()
                    .join(", "),
            }),
        }
    }

    pub fn convert<P: AsRef<Path>>(&self, checkpoint: P, format: &str) -> Result<ConversionReport> {
        let checkpoint = checkpoint.as_ref();
        let format = self.resolve_format(format)?;
        let source_size_bytes = ensure_readable(checkpoint)?;

        let output = artifact_path(checkpoint, format);
        if output == checkpoint {
            return Err(Error::ExportFailure {
                path: output,
                format: format.to_string(),
                reason: "artifact path is the checkpoint itself".to_string(),
                source: None,
            });
        }

        tracing::info!(path = %checkpoint.display(), format = %format, "Loading checkpoint");
        let model = self
            .library
            .load(checkpoint, &self.options)
            .map_err(|e| Error::corrupt_from(checkpoint, e))?;

        if model.tensor_count() == 0 {
            return Err(Error::corrupt(checkpoint, "checkpoint contains no tensors"));
        }
        tracing::debug!(
            tensors = model.tensor_count(),
            parameters = model.parameter_count(),
            "Checkpoint loaded"
        );

        tracing::info!(output = %output.display(), format = %format, "Exporting");
        model
            .export(format, &output, &self.options)
            .map_err(|e| Error::export_from(&output, format, e))?;

        let output_size_bytes = fs::metadata(&output)
            .map_err(|e| Error::export_from(&output, format, e.into()))?
            .len();

        Ok(ConversionReport {
            source_path: checkpoint.to_path_buf(),
            output_path: output,
            format,
            tensor_count: model.tensor_count(),
            parameter_count: model.parameter_count(),
            source_size_bytes,
            output_size_bytes,
        })
    }
}

/// Open the checkpoint for reading without consuming it. Returns its size.
pub(crate) fn ensure_readable(path: &Path) -> Result<u64> {
    let not_found = |source: std::io::Error| Error::CheckpointNotFound {
        path: path.to_path_buf(),
        source,
    };

    let meta = fs::metadata(path).map_err(not_found)?;
    if meta.is_dir() {
        return Err(not_found(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "path is a directory",
        )));
    }
    File::open(path).map_err(not_found)?;
    Ok(meta.len())
}
