use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use uuid::Uuid;

use crate::storage::{ObjectStore, ObjectUri, StorageError};

/// Training objective.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictorType {
    /// Real-valued target.
    Regressor,
    /// 0/1 target; predictions carry a score and a predicted label.
    #[default]
    BinaryClassifier,
}

impl fmt::Display for PredictorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Regressor => f.write_str("regressor"),
            Self::BinaryClassifier => f.write_str("binary_classifier"),
        }
    }
}

/// Weight initialisation for one model component.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum InitMethod {
    /// Zero-mean normal with the given standard deviation.
    Normal {
        /// Standard deviation.
        sigma: f64,
    },
    /// Uniform on `[-scale, scale]`.
    Uniform {
        /// Half-width of the interval.
        scale: f64,
    },
    /// Every weight set to `value`.
    Constant {
        /// Initial value.
        value: f64,
    },
}

impl InitMethod {
    const fn name(&self) -> &'static str {
        match self {
            Self::Normal { .. } => "normal",
            Self::Uniform { .. } => "uniform",
            Self::Constant { .. } => "constant",
        }
    }
}

/// Initialisation and optimiser settings of one component (bias, linear, factors).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ComponentHyperparameters {
    /// Initialisation scheme.
    pub init: InitMethod,
    /// Learning rate.
    pub lr: f64,
    /// Weight decay.
    pub wd: f64,
}

impl ComponentHyperparameters {
    /// Defaults for the global bias term.
    #[must_use]
    pub const fn bias() -> Self {
        Self {
            init: InitMethod::Normal { sigma: 0.01 },
            lr: 0.1,
            wd: 0.01,
        }
    }

    /// Defaults for the linear weights.
    #[must_use]
    pub const fn linear() -> Self {
        Self {
            init: InitMethod::Normal { sigma: 0.01 },
            lr: 0.001,
            wd: 0.001,
        }
    }

    /// Defaults for the latent factor matrix.
    #[must_use]
    pub const fn factors() -> Self {
        Self {
            init: InitMethod::Normal { sigma: 0.001 },
            lr: 0.0001,
            wd: 0.000_01,
        }
    }

    fn validate(&self, component: &str) -> Result<(), TrainingError> {
        let invalid = |what: &str| {
            Err(TrainingError::InvalidHyperparameter(format!(
                "{component}_{what}"
            )))
        };
        match self.init {
            InitMethod::Normal { sigma } if !(sigma.is_finite() && sigma >= 0.0) => {
                return invalid("init_sigma must be finite and >= 0");
            }
            InitMethod::Uniform { scale } if !(scale.is_finite() && scale >= 0.0) => {
                return invalid("init_scale must be finite and >= 0");
            }
            InitMethod::Constant { value } if !value.is_finite() => {
                return invalid("init_value must be finite");
            }
            _ => {}
        }
        if !(self.lr.is_finite() && self.lr >= 0.0) {
            return invalid("lr must be finite and >= 0");
        }
        if !(self.wd.is_finite() && self.wd >= 0.0) {
            return invalid("wd must be finite and >= 0");
        }
        Ok(())
    }

    fn write_wire(&self, component: &str, out: &mut IndexMap<String, String>) {
        out.insert(format!("{component}_init_method"), self.init.name().into());
        match self.init {
            InitMethod::Normal { sigma } => {
                out.insert(format!("{component}_init_sigma"), sigma.to_string());
            }
            InitMethod::Uniform { scale } => {
                out.insert(format!("{component}_init_scale"), scale.to_string());
            }
            InitMethod::Constant { value } => {
                out.insert(format!("{component}_init_value"), value.to_string());
            }
        }
        out.insert(format!("{component}_lr"), self.lr.to_string());
        out.insert(format!("{component}_wd"), self.wd.to_string());
    }
}

/// Factorization machine training configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Hyperparameters {
    /// Width of every feature vector.
    pub feature_dim: usize,
    /// Objective.
    pub predictor_type: PredictorType,
    /// Rows per optimiser step.
    pub mini_batch_size: usize,
    /// Latent factor count.
    pub num_factors: usize,
    /// Passes over the training channel.
    pub epochs: usize,
    /// Bias component settings.
    pub bias: ComponentHyperparameters,
    /// Linear component settings.
    pub linear: ComponentHyperparameters,
    /// Factor component settings.
    pub factors: ComponentHyperparameters,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Self {
            feature_dim: crate::dataset::IMAGE_PIXELS,
            predictor_type: PredictorType::BinaryClassifier,
            mini_batch_size: 200,
            num_factors: 10,
            epochs: 1,
            bias: ComponentHyperparameters::bias(),
            linear: ComponentHyperparameters::linear(),
            factors: ComponentHyperparameters::factors(),
        }
    }
}

impl Hyperparameters {
    /// Checks ranges before a job is submitted.
    pub fn validate(&self) -> Result<(), TrainingError> {
        for (name, value) in [
            ("feature_dim", self.feature_dim),
            ("mini_batch_size", self.mini_batch_size),
            ("num_factors", self.num_factors),
            ("epochs", self.epochs),
        ] {
            if value == 0 {
                return Err(TrainingError::InvalidHyperparameter(format!(
                    "{name} must be > 0"
                )));
            }
        }
        self.bias.validate("bias")?;
        self.linear.validate("linear")?;
        self.factors.validate("factors")?;
        Ok(())
    }

    /// Flattens to the string map managed training services accept, in a stable order.
    #[must_use]
    pub fn to_wire(&self) -> IndexMap<String, String> {
        let mut out = IndexMap::new();
        out.insert("feature_dim".into(), self.feature_dim.to_string());
        out.insert("predictor_type".into(), self.predictor_type.to_string());
        out.insert("mini_batch_size".into(), self.mini_batch_size.to_string());
        out.insert("num_factors".into(), self.num_factors.to_string());
        out.insert("epochs".into(), self.epochs.to_string());
        self.bias.write_wire("bias", &mut out);
        self.linear.write_wire("linear", &mut out);
        self.factors.write_wire("factors", &mut out);
        out
    }
}

/// Compute sizing for a training job or endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Instance type name.
    pub instance_type: String,
    /// Instance count.
    pub instance_count: u32,
}

impl ResourceConfig {
    /// Default training sizing.
    #[must_use]
    pub fn training() -> Self {
        Self {
            instance_type: "ml.c4.xlarge".into(),
            instance_count: 1,
        }
    }

    /// Default hosting sizing.
    #[must_use]
    pub fn hosting() -> Self {
        Self {
            instance_type: "ml.m4.xlarge".into(),
            instance_count: 1,
        }
    }
}

/// Everything a training service needs to run one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingJobSpec {
    /// Unique job name.
    pub job_name: String,
    /// Algorithm container image.
    pub image: String,
    /// Validated hyperparameters.
    pub hyperparameters: Hyperparameters,
    /// Wire form of the hyperparameters.
    pub hyperparameter_map: IndexMap<String, String>,
    /// RecordIO training data.
    pub train_channel: ObjectUri,
    /// Prefix receiving model artifacts.
    pub output_path: ObjectUri,
    /// Compute sizing.
    pub resources: ResourceConfig,
}

impl TrainingJobSpec {
    /// Validates hyperparameters and assigns a fresh job name.
    pub fn new(
        image: impl Into<String>,
        hyperparameters: Hyperparameters,
        train_channel: ObjectUri,
        output_path: ObjectUri,
        resources: ResourceConfig,
    ) -> Result<Self, TrainingError> {
        hyperparameters.validate()?;
        if resources.instance_count == 0 {
            return Err(TrainingError::InvalidHyperparameter(
                "instance_count must be > 0".into(),
            ));
        }
        Ok(Self {
            job_name: job_name(Utc::now()),
            image: image.into(),
            hyperparameter_map: hyperparameters.to_wire(),
            hyperparameters,
            train_channel,
            output_path,
            resources,
        })
    }

    /// Where the finished model archive is expected.
    pub fn model_artifact(&self) -> Result<ObjectUri, StorageError> {
        self.output_path
            .join(&format!("{}/output/model.tar.gz", self.job_name))
    }
}

fn job_name(now: DateTime<Utc>) -> String {
    let short = Uuid::new_v4().simple().to_string();
    format!("densefm-{}-{}", now.format("%Y%m%d-%H%M%S"), &short[..8])
}

/// Lifecycle state of a training job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Recorded, not yet handed to a service.
    Pending,
    /// Running.
    Running,
    /// Finished with a model artifact.
    Completed,
    /// Finished without a usable artifact.
    Failed,
}

impl JobStatus {
    /// Whether the job can no longer change state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Outcome reported by a training service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingJob {
    /// Job name.
    pub job_id: String,
    /// Final or current state.
    pub status: JobStatus,
    /// Model archive once completed.
    pub model_artifact: Option<ObjectUri>,
    /// Failure description.
    pub failure_reason: Option<String>,
}

/// Errors raised by training services.
#[derive(Debug, Error)]
pub enum TrainingError {
    /// A hyperparameter is out of range.
    #[error("invalid hyperparameter: {0}")]
    InvalidHyperparameter(String),
    /// Storage lookup failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// I/O error (spec file or process spawn).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON encoding failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Remote training boundary.
#[async_trait]
pub trait TrainingService: Send + Sync {
    /// Runs the job to completion and reports the outcome.
    async fn submit(&self, spec: &TrainingJobSpec) -> Result<TrainingJob, TrainingError>;
}

/// Hands each job to an external runner executable.
///
/// The runner is invoked as `<program> <args..> --spec <file>` where `<file>`
/// holds the [`TrainingJobSpec`] as JSON. Exit code 0 means the artifact was
/// written to [`TrainingJobSpec::model_artifact`].
#[derive(Clone)]
pub struct RunnerTrainingService {
    program: PathBuf,
    args: Vec<String>,
    spec_dir: PathBuf,
    store: Option<Arc<dyn ObjectStore>>,
}

impl fmt::Debug for RunnerTrainingService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnerTrainingService")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("spec_dir", &self.spec_dir)
            .finish_non_exhaustive()
    }
}

impl RunnerTrainingService {
    /// Creates a service writing spec files to `spec_dir`.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>, spec_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            spec_dir: spec_dir.into(),
            store: None,
        }
    }

    /// Extra arguments placed before `--spec`.
    #[must_use]
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Verifies the artifact exists in `store` after the runner exits.
    #[must_use]
    pub fn with_artifact_check(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Location of the spec file for a job.
    #[must_use]
    pub fn spec_path(&self, job_name: &str) -> PathBuf {
        self.spec_dir.join(format!("{job_name}.json"))
    }

    async fn write_spec(&self, spec: &TrainingJobSpec) -> Result<PathBuf, TrainingError> {
        tokio::fs::create_dir_all(&self.spec_dir).await?;
        let path = self.spec_path(&spec.job_name);
        tokio::fs::write(&path, serde_json::to_vec_pretty(spec)?).await?;
        Ok(path)
    }

    fn failed(spec: &TrainingJobSpec, reason: String) -> TrainingJob {
        TrainingJob {
            job_id: spec.job_name.clone(),
            status: JobStatus::Failed,
            model_artifact: None,
            failure_reason: Some(reason),
        }
    }
}

#[async_trait]
impl TrainingService for RunnerTrainingService {
    async fn submit(&self, spec: &TrainingJobSpec) -> Result<TrainingJob, TrainingError> {
        spec.hyperparameters.validate()?;
        let spec_file = self.write_spec(spec).await?;
        let status = Command::new(&self.program)
            .args(&self.args)
            .arg("--spec")
            .arg(&spec_file)
            .env("DENSEFM_JOB_NAME", &spec.job_name)
            .kill_on_drop(true)
            .status()
            .await?;
        if !status.success() {
            return Ok(Self::failed(spec, format!("runner exited with {status}")));
        }

        let artifact = spec.model_artifact()?;
        if let Some(store) = &self.store {
            if !store.exists(&artifact).await? {
                return Ok(Self::failed(
                    spec,
                    format!("runner succeeded but {artifact} is missing"),
                ));
            }
        }
        Ok(TrainingJob {
            job_id: spec.job_name.clone(),
            status: JobStatus::Completed,
            model_artifact: Some(artifact),
            failure_reason: None,
        })
    }
}

/// Reads a spec file written by [`RunnerTrainingService`].
pub fn read_spec(path: impl AsRef<Path>) -> Result<TrainingJobSpec, TrainingError> {
    let raw = std::fs::read(path)?;
    Ok(serde_json::from_slice(&raw)?)
}
