pub mod convert;
pub mod envconfig;
pub mod error;
pub mod format;
pub mod progress;

pub use convert::{
    artifact_path, convert, inspect, CandleLibrary, CheckpointKind, CheckpointSummary, ConversionReport,
    Converter, ExportFormat, ExportOptions, LoadedModel, ModelLibrary, NamedTensors, TensorSummary,
};
pub use envconfig::EnvConfig;
pub use error::{Error, ErrorKind, Result};
