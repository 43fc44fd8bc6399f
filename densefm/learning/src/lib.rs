#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! densefm learning stack: dense tensor RecordIO encoding and the
//! load → encode → upload → train → deploy → evaluate → teardown pipeline
//! around a factorization machines classifier.

/// Protobuf messages carried inside RecordIO frames.
#[path = "../proto.rs"]
pub mod proto;

/// Dense tensor RecordIO encoder and decoder.
#[path = "../recordio.rs"]
pub mod recordio;

/// IDX image/label loading and dataset shaping.
#[path = "../dataset.rs"]
pub mod dataset;

/// Object storage boundary and local implementation.
#[path = "../storage.rs"]
pub mod storage;

/// Hyperparameters, job specs and the training service boundary.
#[path = "../training.rs"]
pub mod training;

/// JSON-lines job manifest.
#[path = "../manifest.rs"]
pub mod manifest;

/// Endpoint hosting boundary and registry implementation.
#[path = "../hosting.rs"]
pub mod hosting;

/// Prediction JSON contract and HTTP client.
#[path = "../inference.rs"]
pub mod inference;

/// Confusion matrix and accuracy metrics.
#[path = "../evaluation.rs"]
pub mod evaluation;

/// TOML pipeline configuration.
#[path = "../config.rs"]
pub mod config;

/// Telemetry helpers for logging/event emission.
#[path = "../telemetry.rs"]
pub mod telemetry;

/// Stage functions and the end-to-end pipeline.
#[path = "../pipeline.rs"]
pub mod pipeline;

pub use config::{ConfigError, PipelineConfig};
pub use dataset::{split_rows, DatasetError, LabeledDataset};
pub use evaluation::{ConfusionMatrix, EvaluationError};
pub use hosting::{Endpoint, EndpointConfig, HostingError, HostingService, RegistryHostingService};
pub use inference::{predict_in_batches, HttpPredictor, InferenceError, Prediction, Predictor};
pub use manifest::{JobManifest, JobManifestEntry};
pub use pipeline::{Pipeline, PipelineReport, PredictorFactory};
pub use recordio::{
    decode_dense_tensor, encode_dense_tensor, read_dense_tensor, write_dense_tensor, DecodeError,
    DenseRecord, DenseTensorWriter, EncodeError, EncodeSummary, InvalidValuePolicy, RecordReader,
};
pub use storage::{LocalObjectStore, ObjectReceipt, ObjectStore, ObjectUri, StorageError};
pub use telemetry::PipelineTelemetry;
pub use training::{
    Hyperparameters, JobStatus, PredictorType, ResourceConfig, RunnerTrainingService, TrainingError,
    TrainingJob, TrainingJobSpec, TrainingService,
};
