//! Recognising checkpoint files and reading their tensors.
//!
//! Four on-disk kinds are understood: safetensors, PyTorch pickles (zip
//! archives written by `torch.save`), numpy `.npz` archives and GGUF files.
//! The kind comes from the extension when it is unambiguous and from the
//! leading magic bytes otherwise. Bare pickles from torch before 1.6 are not
//! read; they are reported as an unrecognized format.

use super::ensure_readable;
use crate::error::Error;
use anyhow::{Context, Result};
use candle_core::quantized::gguf_file;
use candle_core::{Device, Tensor};
use memmap2::Mmap;
use safetensors::SafeTensors;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

const SAFETENSORS_MAX_HEADER: u64 = 100 * 1024 * 1024;

/// Key most training frameworks nest the weights under.
const STATE_DICT_KEY: &str = "state_dict";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointKind {
    Safetensors,
    Torch,
    Numpy,
    Gguf,
}

impl CheckpointKind {
    pub fn detect(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("safetensors") => return Ok(CheckpointKind::Safetensors),
            Some("npz") => return Ok(CheckpointKind::Numpy),
            Some("gguf") => return Ok(CheckpointKind::Gguf),
            _ => {}
        }

        let mut prefix = [0u8; 9];
        let n = read_prefix(path, &mut prefix)?;
        Self::from_magic(&prefix[..n], file_len(path)?)
            .with_context(|| format!("unrecognized checkpoint format: {}", path.display()))
    }

    fn from_magic(prefix: &[u8], file_len: u64) -> Option<Self> {
        if prefix.starts_with(b"PK\x03\x04") {
            return Some(CheckpointKind::Torch);
        }
        if prefix.starts_with(b"GGUF") {
            return Some(CheckpointKind::Gguf);
        }
        if prefix.len() == 9 && prefix[8] == b'{' {
            let mut len = [0u8; 8];
            len.copy_from_slice(&prefix[..8]);
            let header_len = u64::from_le_bytes(len);
            if header_len <= SAFETENSORS_MAX_HEADER && header_len + 8 <= file_len {
                return Some(CheckpointKind::Safetensors);
            }
        }
        None
    }
}

impl fmt::Display for CheckpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CheckpointKind::Safetensors => "safetensors",
            CheckpointKind::Torch => "torch",
            CheckpointKind::Numpy => "npz",
            CheckpointKind::Gguf => "gguf",
        };
        f.write_str(name)
    }
}

fn read_prefix(path: &Path, buf: &mut [u8]) -> Result<usize> {
    let mut file = File::open(path)?;
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn file_len(path: &Path) -> Result<u64> {
    Ok(std::fs::metadata(path)?.len())
}

/// Read every tensor of a checkpoint onto the CPU.
pub fn load_tensors(path: &Path, kind: CheckpointKind, pickle_key: Option<&str>) -> Result<Vec<(String, Tensor)>> {
    tracing::debug!(path = %path.display(), kind = %kind, "Reading tensors");
    let tensors: Vec<(String, Tensor)> = match kind {
        CheckpointKind::Safetensors => candle_core::safetensors::load(path, &Device::Cpu)?
            .into_iter()
            .collect(),
        CheckpointKind::Torch => load_torch(path, pickle_key)?,
        CheckpointKind::Numpy => Tensor::read_npz(path)?,
        CheckpointKind::Gguf => load_gguf(path)?,
    };
    Ok(tensors)
}

fn load_torch(path: &Path, pickle_key: Option<&str>) -> Result<Vec<(String, Tensor)>> {
    let tensors = candle_core::pickle::read_all_with_key(path, pickle_key)?;
    if tensors.is_empty() && pickle_key.is_none() {
        tracing::debug!("No top-level tensors, retrying under '{}'", STATE_DICT_KEY);
        return candle_core::pickle::read_all_with_key(path, Some(STATE_DICT_KEY))
            .with_context(|| format!("no top-level tensors and none under '{}'", STATE_DICT_KEY));
    }
    Ok(tensors)
}

fn load_gguf(path: &Path) -> Result<Vec<(String, Tensor)>> {
    let mut file = File::open(path)?;
    let content = gguf_file::Content::read(&mut file)?;
    let mut names: Vec<String> = content.tensor_infos.keys().cloned().collect();
    names.sort();

    names
        .into_iter()
        .map(|name| -> Result<(String, Tensor)> {
            let qtensor = content.tensor(&mut file, &name, &Device::Cpu)?;
            let tensor = qtensor
                .dequantize(&Device::Cpu)
                .with_context(|| format!("dequantizing {}", name))?;
            Ok((name, tensor))
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TensorSummary {
    pub name: String,
    pub dtype: String,
    pub shape: Vec<usize>,
    pub parameters: u64,
}

impl TensorSummary {
    fn new(name: String, dtype: impl fmt::Debug, shape: &[usize]) -> Self {
        Self {
            name,
            dtype: format!("{:?}", dtype).to_ascii_lowercase(),
            shape: shape.to_vec(),
            parameters: shape.iter().product::<usize>() as u64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointSummary {
    pub path: PathBuf,
    pub kind: CheckpointKind,
    pub size_bytes: u64,
    pub tensor_count: usize,
    pub parameter_count: u64,
    pub tensors: Vec<TensorSummary>,
}

/// List the tensors of a checkpoint without exporting anything.
///
/// Safetensors files are summarised straight from their header; the other
/// kinds are loaded in full.
pub fn inspect<P: AsRef<Path>>(path: P, pickle_key: Option<&str>) -> crate::error::Result<CheckpointSummary> {
    let path = path.as_ref();
    let size_bytes = ensure_readable(path)?;
    let kind = CheckpointKind::detect(path).map_err(|e| Error::corrupt_from(path, e))?;

    let mut tensors = match kind {
        CheckpointKind::Safetensors => summarize_safetensors(path),
        _ => load_tensors(path, kind, pickle_key).map(|ts| {
            ts.into_iter()
                .map(|(name, t)| TensorSummary::new(name, t.dtype(), t.dims()))
                .collect()
        }),
    }
    .map_err(|e| Error::corrupt_from(path, e))?;

    if tensors.is_empty() {
        return Err(Error::corrupt(path, "checkpoint contains no tensors"));
    }
    tensors.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(CheckpointSummary {
        path: path.to_path_buf(),
        kind,
        size_bytes,
        tensor_count: tensors.len(),
        parameter_count: tensors.iter().map(|t| t.parameters).sum(),
        tensors,
    })
}

fn summarize_safetensors(path: &Path) -> Result<Vec<TensorSummary>> {
    let file = File::open(path)?;
    // SAFETY: the map is read-only and dropped before this function returns.
    let mmap = unsafe { Mmap::map(&file)? };
    let st = SafeTensors::deserialize(&mmap)?;
    let summaries = st
        .tensors()
        .into_iter()
        .map(|(name, view)| TensorSummary::new(name, view.dtype(), view.shape()))
        .collect();
    Ok(summaries)
}
