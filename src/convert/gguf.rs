use anyhow::{Context, Result};
use byteorder::{LittleEndian, WriteBytesExt};
use candle_core::{DType, Tensor};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

const GGUF_MAGIC: &[u8; 4] = b"GGUF";
const GGUF_VERSION: u32 = 3;
pub const GGUF_ALIGNMENT: u64 = 32;

// metadata value types
const GGUF_TYPE_UINT32: u32 = 4;
const GGUF_TYPE_STRING: u32 = 8;
const GGUF_TYPE_UINT64: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GgmlType {
    F32,
    F16,
}

impl GgmlType {
    pub fn id(self) -> u32 {
        match self {
            GgmlType::F32 => 0,
            GgmlType::F16 => 1,
        }
    }

    pub fn bytes_per_element(self) -> usize {
        match self {
            GgmlType::F32 => 4,
            GgmlType::F16 => 2,
        }
    }
}

#[derive(Debug, Clone)]
enum MetadataValue {
    U32(u32),
    U64(u64),
    String(String),
}

#[derive(Debug, Clone)]
struct TensorEntry {
    name: String,
    dims: Vec<u64>,
    ggml_type: GgmlType,
    data: Vec<u8>,
}

/// Accumulates metadata and tensors, then lays them out as a GGUF v3 file.
#[derive(Debug, Default)]
pub struct GgufWriter {
    metadata: Vec<(String, MetadataValue)>,
    tensors: Vec<TensorEntry>,
}

impl GgufWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn metadata_u32(&mut self, key: &str, value: u32) {
        self.metadata.push((key.to_string(), MetadataValue::U32(value)));
    }

    pub fn metadata_u64(&mut self, key: &str, value: u64) {
        self.metadata.push((key.to_string(), MetadataValue::U64(value)));
    }

    pub fn metadata_string(&mut self, key: &str, value: &str) {
        self.metadata.push((key.to_string(), MetadataValue::String(value.to_string())));
    }

    /// Floating tensors become F16 when `half` is set, everything else F32.
    /// Scalars are stored as one-element vectors.
    pub fn add_tensor(&mut self, name: &str, tensor: &Tensor, half: bool) -> Result<()> {
        let ggml_type = if half && tensor.dtype().is_float() {
            GgmlType::F16
        } else {
            GgmlType::F32
        };

        let flat = tensor
            .flatten_all()
            .with_context(|| format!("flattening {}", name))?;
        let mut data = Vec::with_capacity(flat.elem_count() * ggml_type.bytes_per_element());
        match ggml_type {
            GgmlType::F32 => {
                for v in flat.to_dtype(DType::F32)?.to_vec1::<f32>()? {
                    data.write_f32::<LittleEndian>(v)?;
                }
            }
            GgmlType::F16 => {
                for v in flat.to_dtype(DType::F16)?.to_vec1::<half::f16>()? {
                    data.write_u16::<LittleEndian>(v.to_bits())?;
                }
            }
        }

        // ggml orders dimensions innermost first
        let mut dims: Vec<u64> = tensor.dims().iter().map(|d| *d as u64).collect();
        if dims.is_empty() {
            dims.push(1);
        }
        dims.reverse();

        self.tensors.push(TensorEntry {
            name: name.to_string(),
            dims,
            ggml_type,
            data,
        });
        Ok(())
    }

    pub fn tensor_count(&self) -> usize {
        self.tensors.len()
    }

    /// `general.file_type` for the tensors added so far: mostly-F16 as soon
    /// as one tensor was stored as F16, all-F32 otherwise.
    pub fn file_type(&self) -> u32 {
        if self.tensors.iter().any(|t| t.ggml_type == GgmlType::F16) {
            GgmlType::F16.id()
        } else {
            GgmlType::F32.id()
        }
    }

    pub fn write_to_path<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut file = BufWriter::new(File::create(&path)?);
        self.write(&mut file)?;
        file.flush()?;
        Ok(())
    }

    pub fn write<W: Write>(&self, w: &mut W) -> Result<()> {
        let mut w = CountingWriter { inner: w, count: 0 };

        w.write_all(GGUF_MAGIC)?;
        w.write_u32::<LittleEndian>(GGUF_VERSION)?;
        w.write_u64::<LittleEndian>(self.tensors.len() as u64)?;
        w.write_u64::<LittleEndian>(self.metadata.len() as u64 + 1)?;

        write_string(&mut w, "general.alignment")?;
        w.write_u32::<LittleEndian>(GGUF_TYPE_UINT32)?;
        w.write_u32::<LittleEndian>(GGUF_ALIGNMENT as u32)?;

        for (key, value) in &self.metadata {
            write_string(&mut w, key)?;
            match value {
                MetadataValue::U32(v) => {
                    w.write_u32::<LittleEndian>(GGUF_TYPE_UINT32)?;
                    w.write_u32::<LittleEndian>(*v)?;
                }
                MetadataValue::U64(v) => {
                    w.write_u32::<LittleEndian>(GGUF_TYPE_UINT64)?;
                    w.write_u64::<LittleEndian>(*v)?;
                }
                MetadataValue::String(v) => {
                    w.write_u32::<LittleEndian>(GGUF_TYPE_STRING)?;
                    write_string(&mut w, v)?;
                }
            }
        }

        let mut offset: u64 = 0;
        for tensor in &self.tensors {
            write_string(&mut w, &tensor.name)?;
            w.write_u32::<LittleEndian>(tensor.dims.len() as u32)?;
            for dim in &tensor.dims {
                w.write_u64::<LittleEndian>(*dim)?;
            }
            w.write_u32::<LittleEndian>(tensor.ggml_type.id())?;
            w.write_u64::<LittleEndian>(offset)?;
            offset = align(offset + tensor.data.len() as u64);
        }

        let pad = align(w.count) - w.count;
        write_padding(&mut w, pad)?;

        for tensor in &self.tensors {
            w.write_all(&tensor.data)?;
            let len = tensor.data.len() as u64;
            write_padding(&mut w, align(len) - len)?;
        }

        Ok(())
    }
}

fn align(n: u64) -> u64 {
    n.div_ceil(GGUF_ALIGNMENT) * GGUF_ALIGNMENT
}

fn write_string<W: Write>(w: &mut W, s: &str) -> Result<()> {
    let bytes = s.as_bytes();
    w.write_u64::<LittleEndian>(bytes.len() as u64)?;
    w.write_all(bytes)?;
    Ok(())
}

fn write_padding<W: Write>(w: &mut W, n: u64) -> Result<()> {
    for _ in 0..n {
        w.write_u8(0)?;
    }
    Ok(())
}

struct CountingWriter<'a, W: Write> {
    inner: &'a mut W,
    count: u64,
}

impl<W: Write> Write for CountingWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::quantized::{gguf_file, GgmlDType};
    use candle_core::Device;
    use std::io::Cursor;

    #[test]
    fn test_align() {
        assert_eq!(align(0), 0);
        assert_eq!(align(1), 32);
        assert_eq!(align(32), 32);
        assert_eq!(align(33), 64);
    }

    #[test]
    fn test_header_layout() {
        let mut writer = GgufWriter::new();
        writer.metadata_string("general.name", "best");
        let t = Tensor::new(&[[1f32, 2., 3.], [4., 5., 6.]], &Device::Cpu).unwrap();
        writer.add_tensor("w", &t, false).unwrap();

        let mut buf = Vec::new();
        writer.write(&mut buf).unwrap();

        assert_eq!(&buf[..4], b"GGUF");
        assert_eq!(u32::from_le_bytes(buf[4..8].try_into().unwrap()), 3);
        assert_eq!(u64::from_le_bytes(buf[8..16].try_into().unwrap()), 1);
        // general.alignment plus general.name
        assert_eq!(u64::from_le_bytes(buf[16..24].try_into().unwrap()), 2);
        assert_eq!(buf.len() % GGUF_ALIGNMENT as usize, 0);

        // last tensor payload: six f32 values padded to 32 bytes
        let data = &buf[buf.len() - 32..buf.len() - 8];
        let first = f32::from_le_bytes(data[..4].try_into().unwrap());
        assert_eq!(first, 1.0);
    }

    #[test]
    fn test_readable_by_candle() {
        let dev = Device::Cpu;
        let mut writer = GgufWriter::new();
        writer.metadata_u64("general.parameter_count", 24);
        let w = Tensor::arange(0f32, 24., &dev).unwrap().reshape((2, 3, 4)).unwrap();
        writer.add_tensor("conv.weight", &w, true).unwrap();

        let mut buf = Vec::new();
        writer.write(&mut buf).unwrap();

        let mut cursor = Cursor::new(buf);
        let content = gguf_file::Content::read(&mut cursor).unwrap();
        let info = &content.tensor_infos["conv.weight"];
        assert_eq!(info.shape.dims(), &[2, 3, 4]);
        assert_eq!(info.ggml_dtype, GgmlDType::F16);

        let back = content
            .tensor(&mut cursor, "conv.weight", &dev)
            .unwrap()
            .dequantize(&dev)
            .unwrap();
        assert_eq!(back.flatten_all().unwrap().to_vec1::<f32>().unwrap()[23], 23.0);
    }

    #[test]
    fn test_integer_tensor_stays_f32_under_half() {
        let dev = Device::Cpu;
        let mut writer = GgufWriter::new();
        let tracked = Tensor::new(7i64, &dev).unwrap();
        writer.add_tensor("model.0.bn.num_batches_tracked", &tracked, true).unwrap();
        assert_eq!(writer.file_type(), GgmlType::F32.id());

        let mut buf = Vec::new();
        writer.write(&mut buf).unwrap();
        let mut cursor = Cursor::new(buf);
        let content = gguf_file::Content::read(&mut cursor).unwrap();
        let info = &content.tensor_infos["model.0.bn.num_batches_tracked"];
        assert_eq!(info.ggml_dtype, GgmlDType::F32);
        assert_eq!(info.shape.dims(), &[1]);

        let back = content
            .tensor(&mut cursor, "model.0.bn.num_batches_tracked", &dev)
            .unwrap()
            .dequantize(&dev)
            .unwrap();
        assert_eq!(back.to_vec1::<f32>().unwrap(), vec![7.0]);
    }

    #[test]
    fn test_file_type_follows_stored_tensors() {
        let dev = Device::Cpu;
        let mut writer = GgufWriter::new();
        assert_eq!(writer.file_type(), 0);

        writer
            .add_tensor("bias", &Tensor::zeros(3, DType::F32, &dev).unwrap(), false)
            .unwrap();
        assert_eq!(writer.file_type(), 0);

        writer
            .add_tensor("weight", &Tensor::ones((4, 4), DType::F32, &dev).unwrap(), true)
            .unwrap();
        assert_eq!(writer.file_type(), 1);
    }
}
