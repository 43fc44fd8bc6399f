use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use shared_logging::LogLevel;
use thiserror::Error;

use crate::{
    dataset::IMAGE_PIXELS,
    recordio::InvalidValuePolicy,
    storage::{ObjectUri, StorageError},
    training::{Hyperparameters, ResourceConfig},
};

/// Object name of the encoded training data under `<prefix>/train/`.
pub const TRAINING_DATA_KEY: &str = "recordio-pb-data";

/// Errors raised while loading a pipeline configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("reading config {path}: {source}")]
    Io {
        /// Config file.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: std::io::Error,
    },
    /// The file is not valid TOML for this schema.
    #[error("parsing config: {0}")]
    Parse(#[from] toml::de::Error),
    /// A value failed validation.
    #[error("invalid config: {0}")]
    Invalid(String),
    /// Derived object URI is malformed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Where labelled images come from.
    pub dataset: DatasetConfig,
    /// Where encoded data and artifacts live.
    pub storage: StorageConfig,
    /// Training job settings.
    pub training: TrainingConfig,
    /// Endpoint settings.
    pub hosting: HostingConfig,
    /// Prediction client settings.
    pub inference: InferenceConfig,
    /// Logs and events.
    pub telemetry: TelemetryConfig,
    #[serde(skip)]
    source_dir: Option<PathBuf>,
}

impl PipelineConfig {
    /// Loads, normalizes and validates a TOML file. Relative paths resolve
    /// against the file's directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml(&raw)?;
        let source_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        config.resolve_paths(&source_dir);
        config.source_dir = Some(source_dir);
        Ok(config)
    }

    /// Parses and validates TOML text without touching paths.
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Directory of the loaded file, if any.
    #[must_use]
    pub fn source_dir(&self) -> Option<&Path> {
        self.source_dir.as_deref()
    }

    /// Resolves `candidate` against the config file's directory.
    #[must_use]
    pub fn resolve_path(&self, candidate: impl AsRef<Path>) -> PathBuf {
        let candidate = candidate.as_ref();
        match &self.source_dir {
            Some(dir) if candidate.is_relative() => dir.join(candidate),
            _ => candidate.to_path_buf(),
        }
    }

    fn resolve_paths(&mut self, dir: &Path) {
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = dir.join(&*path);
            }
        };
        for path in [
            &mut self.dataset.train_images,
            &mut self.dataset.train_labels,
            &mut self.dataset.test_images,
            &mut self.dataset.test_labels,
            &mut self.training.runner,
        ]
        .into_iter()
        .flatten()
        {
            resolve(path);
        }
        resolve(&mut self.storage.root);
        resolve(&mut self.training.spec_dir);
        resolve(&mut self.training.manifest);
        resolve(&mut self.hosting.registry);
        resolve(&mut self.telemetry.log_path);
        if let Some(events) = &mut self.telemetry.events_path {
            resolve(events);
        }
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dataset.positive_digit > 9 {
            return Err(ConfigError::Invalid(format!(
                "dataset.positive_digit {} is not a digit",
                self.dataset.positive_digit
            )));
        }
        if self.dataset.synthetic.is_none() {
            let idx = [
                &self.dataset.train_images,
                &self.dataset.train_labels,
                &self.dataset.test_images,
                &self.dataset.test_labels,
            ];
            if idx.iter().any(|p| p.is_none()) {
                return Err(ConfigError::Invalid(
                    "dataset needs train/test image and label paths or a [dataset.synthetic] table"
                        .into(),
                ));
            }
        }
        if let Some(synthetic) = &self.dataset.synthetic {
            if synthetic.feature_dim != self.training.hyperparameters.feature_dim {
                return Err(ConfigError::Invalid(format!(
                    "dataset.synthetic.feature_dim {} differs from training.hyperparameters.feature_dim {}",
                    synthetic.feature_dim, self.training.hyperparameters.feature_dim
                )));
            }
        }
        if self.inference.batches == 0 || self.inference.concurrency == 0 {
            return Err(ConfigError::Invalid(
                "inference.batches and inference.concurrency must be > 0".into(),
            ));
        }
        if self.inference.timeout_ms == 0 {
            return Err(ConfigError::Invalid("inference.timeout_ms must be > 0".into()));
        }
        self.training
            .hyperparameters
            .validate()
            .map_err(|err| ConfigError::Invalid(err.to_string()))?;
        self.storage.prefix_uri()?;
        Ok(())
    }
}

/// Dataset settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    /// IDX3 training images.
    pub train_images: Option<PathBuf>,
    /// IDX1 training labels.
    pub train_labels: Option<PathBuf>,
    /// IDX3 evaluation images.
    pub test_images: Option<PathBuf>,
    /// IDX1 evaluation labels.
    pub test_labels: Option<PathBuf>,
    /// Digit mapped to label 1.0.
    pub positive_digit: u8,
    /// Maximum training rows.
    pub train_limit: Option<usize>,
    /// Maximum evaluation rows.
    pub test_limit: Option<usize>,
    /// Generated data used instead of IDX files.
    pub synthetic: Option<SyntheticConfig>,
    /// Handling of NaN or infinite features while encoding.
    pub invalid_values: InvalidValuePolicy,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            train_images: None,
            train_labels: None,
            test_images: None,
            test_labels: None,
            positive_digit: 0,
            train_limit: None,
            test_limit: None,
            synthetic: None,
            invalid_values: InvalidValuePolicy::Abort,
        }
    }
}

/// Generated dataset parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyntheticConfig {
    /// Training rows.
    pub train_rows: usize,
    /// Evaluation rows.
    pub test_rows: usize,
    /// Row width.
    #[serde(default = "default_feature_dim")]
    pub feature_dim: usize,
    /// RNG seed; the evaluation set uses `seed + 1`.
    #[serde(default)]
    pub seed: u64,
}

/// Object storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Local directory backing the object store.
    pub root: PathBuf,
    /// URI scheme written into object URIs.
    pub scheme: String,
    /// Bucket name.
    pub bucket: String,
    /// Key prefix for this pipeline's objects.
    pub prefix: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("object-store"),
            scheme: "s3".into(),
            bucket: "densefm".into(),
            prefix: "fm/DEMO-1".into(),
        }
    }
}

impl StorageConfig {
    /// `<scheme>://<bucket>/<prefix>`.
    pub fn prefix_uri(&self) -> Result<ObjectUri, StorageError> {
        ObjectUri::new(&self.scheme, &self.bucket, &self.prefix)
    }

    /// `<prefix>/train/recordio-pb-data`.
    pub fn training_data_uri(&self) -> Result<ObjectUri, StorageError> {
        self.prefix_uri()?
            .join(&format!("train/{TRAINING_DATA_KEY}"))
    }

    /// `<prefix>/output`.
    pub fn output_uri(&self) -> Result<ObjectUri, StorageError> {
        self.prefix_uri()?.join("output")
    }
}

/// Training job settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Algorithm image recorded on the job.
    pub image: String,
    /// Runner executable that performs the job.
    pub runner: Option<PathBuf>,
    /// Extra arguments placed before `--spec <file>`.
    pub runner_args: Vec<String>,
    /// Directory receiving job spec files.
    pub spec_dir: PathBuf,
    /// JSON-lines job manifest.
    pub manifest: PathBuf,
    /// Fail the job when the runner exits cleanly without writing an artifact.
    pub verify_artifact: bool,
    /// Model settings.
    pub hyperparameters: Hyperparameters,
    /// Compute sizing.
    pub resources: ResourceConfig,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            image: "factorization-machines:1".into(),
            runner: None,
            runner_args: Vec::new(),
            spec_dir: PathBuf::from("jobs"),
            manifest: PathBuf::from("jobs/index.jsonl"),
            verify_artifact: true,
            hyperparameters: Hyperparameters::default(),
            resources: ResourceConfig::training(),
        }
    }
}

/// Endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostingConfig {
    /// Model server base URL.
    pub base_url: String,
    /// JSON-lines endpoint registry.
    pub registry: PathBuf,
    /// Endpoint name; defaults to the training job name.
    pub endpoint_name: Option<String>,
    /// Delete the endpoint once the run finishes.
    pub delete_after_run: bool,
    /// Serving compute.
    pub resources: ResourceConfig,
}

impl Default for HostingConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".into(),
            registry: PathBuf::from("endpoints.jsonl"),
            endpoint_name: None,
            delete_after_run: true,
            resources: ResourceConfig::hosting(),
        }
    }
}

/// Prediction client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Overrides the endpoint URL returned by hosting.
    pub url: Option<String>,
    /// Bearer token sent with each request.
    pub bearer_token: Option<String>,
    /// Per-request timeout in milliseconds.
    pub timeout_ms: u64,
    /// Number of request chunks the evaluation set is split into.
    pub batches: usize,
    /// Requests in flight.
    pub concurrency: usize,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            url: None,
            bearer_token: None,
            timeout_ms: 30_000,
            batches: 100,
            concurrency: 4,
        }
    }
}

impl InferenceConfig {
    /// Request timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Log and event sinks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Module name stamped on records.
    pub module: String,
    /// JSON-lines log file.
    pub log_path: PathBuf,
    /// JSON-lines event archive; events are dropped when unset.
    pub events_path: Option<PathBuf>,
    /// Lowest level written to the log.
    pub min_level: LogLevel,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            module: "densefm".into(),
            log_path: PathBuf::from("logs/densefm.jsonl"),
            events_path: Some(PathBuf::from("logs/events.jsonl")),
            min_level: LogLevel::Info,
        }
    }
}

const fn default_feature_dim() -> usize {
    IMAGE_PIXELS
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn loads_and_resolves_relative_paths() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("densefm.toml");
        fs::write(
            &path,
            r#"
[dataset]
train_images = "mnist/train-images-idx3-ubyte"
train_labels = "mnist/train-labels-idx1-ubyte"
test_images = "/data/t10k-images-idx3-ubyte"
test_labels = "/data/t10k-labels-idx1-ubyte"
positive_digit = 3
invalid_values = "skip_row"

[storage]
root = "store"
bucket = "localide"

[training]
runner = "bin/fm-runner"

[training.hyperparameters]
num_factors = 64
epochs = 3

[training.hyperparameters.bias]
lr = 0.5
wd = 0.0

[training.hyperparameters.bias.init]
method = "constant"
value = 0.0

[training.resources]
instance_type = "local"
instance_count = 2

[hosting]
delete_after_run = false

[telemetry]
min_level = "warn"
"#,
        )
        .unwrap();
        let config = PipelineConfig::load(&path).unwrap();
        assert_eq!(config.dataset.train_images.as_deref(), Some(dir.path().join("mnist/train-images-idx3-ubyte").as_path()));
        assert_eq!(config.dataset.test_images.as_deref(), Some(Path::new("/data/t10k-images-idx3-ubyte")));
        assert_eq!(config.dataset.invalid_values, InvalidValuePolicy::SkipRow);
        assert_eq!(config.storage.root, dir.path().join("store"));
        assert_eq!(config.training.runner.as_deref(), Some(dir.path().join("bin/fm-runner").as_path()));
        assert_eq!(config.training.manifest, dir.path().join("jobs/index.jsonl"));
        assert_eq!(config.training.hyperparameters.num_factors, 64);
        assert_eq!(config.training.hyperparameters.mini_batch_size, 200);
        assert_eq!(config.training.hyperparameters.bias.lr, 0.5);
        assert_eq!(config.training.resources.instance_count, 2);
        assert!(!config.hosting.delete_after_run);
        assert_eq!(config.telemetry.min_level, LogLevel::Warn);
        assert_eq!(
            config.storage.training_data_uri().unwrap().to_string(),
            "s3://localide/fm/DEMO-1/train/recordio-pb-data"
        );
        assert_eq!(config.resolve_path("x.bin"), dir.path().join("x.bin"));
    }

    #[test]
    fn synthetic_dataset_needs_no_files() {
        let config = PipelineConfig::from_toml(
            r#"
[dataset.synthetic]
train_rows = 64
test_rows = 16
feature_dim = 8

[training.hyperparameters]
feature_dim = 8
"#,
        )
        .unwrap();
        assert_eq!(config.dataset.synthetic.unwrap().train_rows, 64);
        assert_eq!(config.inference.timeout(), Duration::from_secs(30));
    }

    #[test]
    fn rejects_inconsistent_values() {
        for raw in [
            "",
            "[dataset]\npositive_digit = 12\n[dataset.synthetic]\ntrain_rows = 1\ntest_rows = 1",
            "[dataset.synthetic]\ntrain_rows = 1\ntest_rows = 1\nfeature_dim = 4",
            "[dataset.synthetic]\ntrain_rows = 1\ntest_rows = 1\n[inference]\nbatches = 0",
            "[dataset.synthetic]\ntrain_rows = 1\ntest_rows = 1\n[training.hyperparameters]\nnum_factors = 0",
            "[dataset.synthetic]\ntrain_rows = 1\ntest_rows = 1\n[storage]\nprefix = \"a/../b\"",
        ] {
            assert!(
                matches!(PipelineConfig::from_toml(raw), Err(ConfigError::Invalid(_) | ConfigError::Storage(_))),
                "accepted: {raw}"
            );
        }
        assert!(matches!(
            PipelineConfig::from_toml("[dataset\n"),
            Err(ConfigError::Parse(_))
        ));
    }
}
