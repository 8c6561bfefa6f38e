use super::checkpoint::{self, CheckpointKind};
use super::gguf::GgufWriter;
use super::{ExportFormat, ExportOptions};
use anyhow::{bail, Context, Result};
use candle_core::{DType, Tensor};
use std::collections::HashMap;
use std::path::Path;

/// The model library the converter delegates to: it turns a path into a
/// loaded model and declares which export targets it can produce.
pub trait ModelLibrary {
    fn supported_formats(&self) -> &[ExportFormat];

    fn load(&self, path: &Path, options: &ExportOptions) -> Result<Box<dyn LoadedModel>>;
}

/// In-memory model handle returned by [`ModelLibrary::load`].
pub trait LoadedModel {
    fn tensor_count(&self) -> usize;

    fn parameter_count(&self) -> u64;

    /// Serialize the model as `format` into `output`, creating or
    /// overwriting the file.
    fn export(&self, format: ExportFormat, output: &Path, options: &ExportOptions) -> Result<()>;
}

const CANDLE_FORMATS: &[ExportFormat] = &[
    ExportFormat::Safetensors,
    ExportFormat::Gguf,
    ExportFormat::Npz,
];

/// Pure Rust backend built on candle's readers and writers.
#[derive(Debug, Clone, Default)]
pub struct CandleLibrary;

impl CandleLibrary {
    pub fn new() -> Self {
        Self
    }
}

impl ModelLibrary for CandleLibrary {
    fn supported_formats(&self) -> &[ExportFormat] {
        CANDLE_FORMATS
    }

    fn load(&self, path: &Path, options: &ExportOptions) -> Result<Box<dyn LoadedModel>> {
        let kind = CheckpointKind::detect(path)?;
        let tensors = checkpoint::load_tensors(path, kind, options.pickle_key.as_deref())?;
        let name = options.name.clone().unwrap_or_else(|| file_stem(path));
        Ok(Box::new(NamedTensors::new(name, path, tensors)))
    }
}

/// A checkpoint held as named tensors, sorted by name so every export of
/// the same checkpoint is byte-identical.
#[derive(Debug, Clone)]
pub struct NamedTensors {
    name: String,
    source: String,
    tensors: Vec<(String, Tensor)>,
}

impl NamedTensors {
    pub fn new<P: AsRef<Path>>(name: impl Into<String>, source: P, mut tensors: Vec<(String, Tensor)>) -> Self {
        tensors.sort_by(|a, b| a.0.cmp(&b.0));
        let source = source
            .as_ref()
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            name: name.into(),
            source,
            tensors,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tensors(&self) -> &[(String, Tensor)] {
        &self.tensors
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors
            .binary_search_by(|(n, _)| n.as_str().cmp(name))
            .ok()
            .map(|i| &self.tensors[i].1)
    }

    /// Tensors as they should be written: floats narrowed to F16 when
    /// `half` is set, everything else untouched.
    fn prepared(&self, half: bool) -> Result<Vec<(String, Tensor)>> {
        self.tensors
            .iter()
            .map(|(name, t)| -> Result<(String, Tensor)> {
                let t = if half && t.dtype().is_float() && t.dtype() != DType::F16 {
                    t.to_dtype(DType::F16)
                        .with_context(|| format!("casting {} to f16", name))?
                } else {
                    t.clone()
                };
                Ok((name.clone(), t))
            })
            .collect()
    }

    fn write_safetensors(&self, output: &Path, half: bool) -> Result<()> {
        let tensors: HashMap<String, Tensor> = self.prepared(half)?.into_iter().collect();
        candle_core::safetensors::save(&tensors, output)?;
        Ok(())
    }

    fn write_npz(&self, output: &Path, half: bool) -> Result<()> {
        let tensors = self.prepared(half)?;
        Tensor::write_npz(&tensors, output)?;
        Ok(())
    }

    fn write_gguf(&self, output: &Path, half: bool) -> Result<()> {
        let mut writer = GgufWriter::new();
        for (name, tensor) in &self.tensors {
            writer.add_tensor(name, tensor, half)?;
        }

        let file_type = writer.file_type();
        writer.metadata_string("general.architecture", "checkpoint");
        writer.metadata_string("general.name", &self.name);
        writer.metadata_u32("general.file_type", file_type);
        writer.metadata_u64("general.parameter_count", self.parameter_count());
        writer.metadata_string("general.source.file", &self.source);
        tracing::debug!(tensors = writer.tensor_count(), output = %output.display(), "Writing GGUF");
        writer.write_to_path(output)
    }
}

impl LoadedModel for NamedTensors {
    fn tensor_count(&self) -> usize {
        self.tensors.len()
    }

    fn parameter_count(&self) -> u64 {
        self.tensors.iter().map(|(_, t)| t.elem_count() as u64).sum()
    }

    fn export(&self, format: ExportFormat, output: &Path, options: &ExportOptions) -> Result<()> {
        match format {
            ExportFormat::Safetensors => self.write_safetensors(output, options.half),
            ExportFormat::Npz => self.write_npz(output, options.half),
            ExportFormat::Gguf => self.write_gguf(output, options.half),
            other => bail!("the candle backend cannot produce {}", other),
        }
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "model".to_string())
}
