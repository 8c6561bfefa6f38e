#![allow(dead_code)]

use candle_core::{DType, Device, Tensor};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const NUM_CLASSES: usize = 3;
pub const DETECTOR_PARAMS: u64 = 16 * 27 + 16 + 64 * 16 + NUM_CLASSES as u64 * 16 + NUM_CLASSES as u64;

/// A small stand-in for a trained YOLO-style detector with three classes.
pub fn detector_tensors() -> HashMap<String, Tensor> {
    let dev = Device::Cpu;
    let mut tensors = HashMap::new();
    tensors.insert(
        "model.0.conv.weight".to_string(),
        Tensor::arange(0f32, 432., &dev).unwrap().reshape((16, 3, 3, 3)).unwrap(),
    );
    tensors.insert("model.0.bn.weight".to_string(), Tensor::ones(16, DType::F32, &dev).unwrap());
    tensors.insert(
        "model.22.cv2.0.2.weight".to_string(),
        Tensor::full(0.5f32, (64, 16, 1, 1), &dev).unwrap(),
    );
    tensors.insert(
        "model.22.cv3.0.2.weight".to_string(),
        Tensor::full(-0.25f32, (NUM_CLASSES, 16, 1, 1), &dev).unwrap(),
    );
    tensors.insert(
        "model.22.cv3.0.2.bias".to_string(),
        Tensor::new(&[-4.5f32, -4.5, -4.5], &dev).unwrap(),
    );
    tensors
}

pub fn write_detector(dir: &Path, file_name: &str) -> PathBuf {
    let path = dir.join(file_name);
    candle_core::safetensors::save(&detector_tensors(), &path).unwrap();
    path
}

/// Parameters in the PyTorch fixtures under `tests/fixtures/`: the stem
/// conv, the class bias and the scalar `num_batches_tracked` counter.
pub const TORCH_PARAMS: u64 = 16 * 27 + 3 + 1;

/// Copy a committed fixture into `dir` so exports land next to the copy.
pub fn copy_fixture(dir: &Path, file_name: &str) -> PathBuf {
    let source = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(file_name);
    let path = dir.join(file_name);
    std::fs::copy(&source, &path).unwrap();
    path
}

pub fn write_bytes(dir: &Path, file_name: &str, bytes: &[u8]) -> PathBuf {
    let path = dir.join(file_name);
    std::fs::write(&path, bytes).unwrap();
    path
}
