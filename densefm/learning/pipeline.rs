use std::{future::Future, sync::Arc};

use anyhow::{bail, ensure, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{
    config::{DatasetConfig, InferenceConfig, PipelineConfig},
    dataset::LabeledDataset,
    evaluation::ConfusionMatrix,
    hosting::{Endpoint, EndpointConfig, HostingService, RegistryHostingService},
    inference::{predict_in_batches, HttpPredictor, Predictor},
    manifest::{JobManifest, JobManifestEntry},
    recordio::{write_dense_tensor, EncodeSummary, InvalidValuePolicy},
    storage::{LocalObjectStore, ObjectReceipt, ObjectStore, ObjectUri},
    telemetry::PipelineTelemetry,
    training::{JobStatus, RunnerTrainingService, TrainingJob, TrainingJobSpec, TrainingService},
};

/// Builds a predictor for a freshly deployed endpoint.
pub type PredictorFactory = Arc<dyn Fn(&Endpoint) -> Result<Arc<dyn Predictor>> + Send + Sync>;

/// Encoded training data ready for upload.
#[derive(Debug, Clone)]
pub struct EncodedData {
    /// RecordIO stream.
    pub bytes: Vec<u8>,
    /// Encode totals.
    pub summary: EncodeSummary,
}

/// Everything a completed run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineReport {
    /// Uploaded training data.
    pub training_data: ObjectReceipt,
    /// Encode totals.
    pub encode: EncodeSummary,
    /// Finished training job.
    pub job: TrainingJob,
    /// Endpoint as last seen (deleted when torn down).
    pub endpoint: Endpoint,
    /// Actuals against predictions on the evaluation set.
    pub confusion: ConfusionMatrix,
    /// Diagonal fraction of `confusion`.
    pub accuracy: Option<f64>,
}

/// Loads the training split described by `config`.
pub fn load_training_data(config: &DatasetConfig) -> Result<LabeledDataset> {
    if let Some(synthetic) = &config.synthetic {
        return Ok(LabeledDataset::synthetic(
            synthetic.train_rows,
            synthetic.feature_dim,
            synthetic.seed,
        ));
    }
    load_idx_split(
        config.train_images.as_deref(),
        config.train_labels.as_deref(),
        config.positive_digit,
        config.train_limit,
        "train",
    )
}

/// Loads the evaluation split described by `config`.
pub fn load_evaluation_data(config: &DatasetConfig) -> Result<LabeledDataset> {
    if let Some(synthetic) = &config.synthetic {
        return Ok(LabeledDataset::synthetic(
            synthetic.test_rows,
            synthetic.feature_dim,
            synthetic.seed.wrapping_add(1),
        ));
    }
    load_idx_split(
        config.test_images.as_deref(),
        config.test_labels.as_deref(),
        config.positive_digit,
        config.test_limit,
        "test",
    )
}

fn load_idx_split(
    images: Option<&std::path::Path>,
    labels: Option<&std::path::Path>,
    positive_digit: u8,
    limit: Option<usize>,
    split: &str,
) -> Result<LabeledDataset> {
    let images = images.with_context(|| format!("dataset.{split}_images is not set"))?;
    let labels = labels.with_context(|| format!("dataset.{split}_labels is not set"))?;
    LabeledDataset::from_idx(images, labels, positive_digit, limit).with_context(|| {
        format!(
            "loading {split} split from {} and {}",
            images.display(),
            labels.display()
        )
    })
}

/// Encodes a labelled dataset into a RecordIO buffer.
pub fn encode_stage(dataset: &LabeledDataset, policy: InvalidValuePolicy) -> Result<EncodedData> {
    let mut bytes = Vec::new();
    let summary = write_dense_tensor(&mut bytes, dataset.features(), Some(dataset.labels()), policy)
        .context("encoding training data")?;
    ensure!(
        summary.records > 0,
        "no rows left to train on ({} skipped)",
        summary.skipped_rows.len()
    );
    Ok(EncodedData { bytes, summary })
}

/// Stores encoded data at `uri`.
pub async fn upload_stage(
    store: &dyn ObjectStore,
    uri: &ObjectUri,
    bytes: Vec<u8>,
) -> Result<ObjectReceipt> {
    store
        .put(uri, bytes)
        .await
        .with_context(|| format!("uploading training data to {uri}"))
}

/// Records the job in the manifest, runs it and records the outcome. Fails
/// unless the job completed with an artifact.
pub async fn submit_stage(
    service: &dyn TrainingService,
    manifest: &JobManifest,
    spec: &TrainingJobSpec,
) -> Result<TrainingJob> {
    manifest.append(&JobManifestEntry::pending(spec))?;
    manifest.update_status(&spec.job_name, JobStatus::Running)?;
    let job = match service.submit(spec).await {
        Ok(job) => job,
        Err(err) => {
            manifest.update_status(&spec.job_name, JobStatus::Failed)?;
            return Err(err).with_context(|| format!("submitting training job {}", spec.job_name));
        }
    };
    manifest.record_outcome(&job)?;
    if job.status != JobStatus::Completed {
        bail!(
            "training job {} ended {}: {}",
            job.job_id,
            job.status,
            job.failure_reason.as_deref().unwrap_or("no reason given")
        );
    }
    ensure!(
        job.model_artifact.is_some(),
        "training job {} completed without a model artifact",
        job.job_id
    );
    Ok(job)
}

/// Puts a model behind an endpoint.
pub async fn deploy_stage(hosting: &dyn HostingService, config: &EndpointConfig) -> Result<Endpoint> {
    hosting
        .deploy(config)
        .await
        .with_context(|| format!("deploying endpoint {}", config.name))
}

/// Scores `dataset` against `predictor` and tabulates the result.
pub async fn evaluate_stage(
    predictor: &dyn Predictor,
    dataset: &LabeledDataset,
    batches: usize,
    concurrency: usize,
) -> Result<ConfusionMatrix> {
    let batches = batches.min(dataset.len()).max(1);
    let predictions = predict_in_batches(predictor, dataset.features(), batches, concurrency)
        .await
        .context("requesting predictions")?;
    let predicted: Vec<f32> = predictions.iter().map(|p| p.predicted_label).collect();
    let actual = dataset.labels().to_vec();
    Ok(ConfusionMatrix::from_labels(&actual, &predicted)?)
}

/// Deletes an endpoint.
pub async fn teardown_stage(hosting: &dyn HostingService, name: &str) -> Result<Endpoint> {
    hosting
        .delete(name)
        .await
        .with_context(|| format!("deleting endpoint {name}"))
}

/// Local object store rooted at `storage.root`.
#[must_use]
pub fn object_store_from_config(config: &PipelineConfig) -> Arc<dyn ObjectStore> {
    Arc::new(LocalObjectStore::new(&config.storage.root))
}

/// Runner-backed training service. Requires `training.runner`.
pub fn training_service_from_config(
    config: &PipelineConfig,
    store: Arc<dyn ObjectStore>,
) -> Result<Arc<dyn TrainingService>> {
    let runner = config
        .training
        .runner
        .clone()
        .context("training.runner is not set")?;
    let mut service = RunnerTrainingService::new(runner, &config.training.spec_dir)
        .with_args(config.training.runner_args.clone());
    if config.training.verify_artifact {
        service = service.with_artifact_check(store);
    }
    Ok(Arc::new(service))
}

/// Registry-backed hosting service.
#[must_use]
pub fn hosting_service_from_config(config: &PipelineConfig) -> Arc<dyn HostingService> {
    Arc::new(RegistryHostingService::new(
        &config.hosting.base_url,
        &config.hosting.registry,
    ))
}

/// Factory building an [`HttpPredictor`] per endpoint; `inference.url`
/// overrides the endpoint's own URL.
#[must_use]
pub fn http_predictor_factory(config: InferenceConfig) -> PredictorFactory {
    Arc::new(move |endpoint: &Endpoint| {
        let url = config.url.clone().unwrap_or_else(|| endpoint.url.clone());
        let mut predictor = HttpPredictor::new(url, config.timeout())?;
        if let Some(token) = &config.bearer_token {
            predictor = predictor.with_bearer_token(token.clone());
        }
        Ok(Arc::new(predictor) as Arc<dyn Predictor>)
    })
}

/// The linear load → encode → upload → train → deploy → evaluate → teardown run.
pub struct Pipeline {
    config: PipelineConfig,
    store: Arc<dyn ObjectStore>,
    training: Arc<dyn TrainingService>,
    hosting: Arc<dyn HostingService>,
    predictors: PredictorFactory,
    manifest: JobManifest,
    telemetry: PipelineTelemetry,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("manifest", &self.manifest.path())
            .field("telemetry", &self.telemetry)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Assembles a pipeline from explicit collaborators.
    #[must_use]
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn ObjectStore>,
        training: Arc<dyn TrainingService>,
        hosting: Arc<dyn HostingService>,
        predictors: PredictorFactory,
        telemetry: PipelineTelemetry,
    ) -> Self {
        let manifest = JobManifest::new(&config.training.manifest);
        Self {
            config,
            store,
            training,
            hosting,
            predictors,
            manifest,
            telemetry,
        }
    }

    /// Builds the local/HTTP collaborators named in `config`.
    pub fn from_config(config: PipelineConfig) -> Result<Self> {
        let store = object_store_from_config(&config);
        let training = training_service_from_config(&config, Arc::clone(&store))?;
        let hosting = hosting_service_from_config(&config);
        let predictors = http_predictor_factory(config.inference.clone());
        let telemetry = PipelineTelemetry::from_config(&config.telemetry)?;
        Ok(Self::new(config, store, training, hosting, predictors, telemetry))
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Job manifest.
    #[must_use]
    pub const fn manifest(&self) -> &JobManifest {
        &self.manifest
    }

    /// Telemetry handle.
    #[must_use]
    pub const fn telemetry(&self) -> &PipelineTelemetry {
        &self.telemetry
    }

    async fn stage<T, Fut>(
        &self,
        name: &str,
        started: Value,
        work: Fut,
        completed: impl FnOnce(&T) -> Value + Send,
    ) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        self.telemetry.stage_started(name, started)?;
        match work.await {
            Ok(value) => {
                self.telemetry.stage_completed(name, completed(&value)).await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(publish_err) = self.telemetry.stage_failed(name, &err).await {
                    eprintln!("telemetry for failed stage {name} not recorded: {publish_err:?}");
                }
                Err(err.context(format!("{name} stage failed")))
            }
        }
    }

    /// Runs every stage. With `hosting.delete_after_run` the endpoint is
    /// deleted even when evaluation fails.
    pub async fn run(&self) -> Result<PipelineReport> {
        let config = &self.config;
        let hyperparameters = &config.training.hyperparameters;

        let train = self
            .stage(
                "load",
                json!({ "split": "train" }),
                async {
                    let data = load_training_data(&config.dataset)?;
                    ensure!(
                        data.feature_dim() == hyperparameters.feature_dim,
                        "training rows have {} features but feature_dim is {}",
                        data.feature_dim(),
                        hyperparameters.feature_dim
                    );
                    Ok::<_, anyhow::Error>(data)
                },
                |data: &LabeledDataset| {
                    json!({ "rows": data.len(), "positives": data.positives(), "feature_dim": data.feature_dim() })
                },
            )
            .await?;

        let encoded = self
            .stage(
                "encode",
                json!({ "rows": train.len(), "policy": config.dataset.invalid_values }),
                async { encode_stage(&train, config.dataset.invalid_values) },
                |encoded: &EncodedData| {
                    json!({
                        "records": encoded.summary.records,
                        "skipped": encoded.summary.skipped_rows.len(),
                        "bytes": encoded.summary.bytes,
                    })
                },
            )
            .await?;
        drop(train);

        let train_channel = config.storage.training_data_uri()?;
        let EncodedData { bytes, summary } = encoded;
        let training_data = self
            .stage(
                "upload",
                json!({ "uri": train_channel.to_string(), "bytes": bytes.len() }),
                upload_stage(self.store.as_ref(), &train_channel, bytes),
                |receipt: &ObjectReceipt| json!({ "uri": receipt.uri.to_string(), "size": receipt.size }),
            )
            .await?;

        let spec = TrainingJobSpec::new(
            &config.training.image,
            hyperparameters.clone(),
            training_data.uri.clone(),
            config.storage.output_uri()?,
            config.training.resources.clone(),
        )?;
        let job = self
            .stage(
                "train",
                json!({ "job_id": spec.job_name, "hyperparameters": spec.hyperparameter_map }),
                submit_stage(self.training.as_ref(), &self.manifest, &spec),
                |job: &TrainingJob| json!({ "job_id": job.job_id, "status": job.status }),
            )
            .await?;

        let model_artifact = job
            .model_artifact
            .clone()
            .context("completed job has no model artifact")?;
        let endpoint_config = EndpointConfig {
            name: config
                .hosting
                .endpoint_name
                .clone()
                .unwrap_or_else(|| job.job_id.clone()),
            model_artifact,
            resources: config.hosting.resources.clone(),
        };
        let endpoint = self
            .stage(
                "deploy",
                json!({ "name": endpoint_config.name, "model": endpoint_config.model_artifact.to_string() }),
                deploy_stage(self.hosting.as_ref(), &endpoint_config),
                |endpoint: &Endpoint| json!({ "name": endpoint.name, "url": endpoint.url }),
            )
            .await?;

        let evaluation = self
            .stage(
                "evaluate",
                json!({ "endpoint": endpoint.name, "batches": config.inference.batches }),
                async {
                    let test = load_evaluation_data(&config.dataset)?;
                    let predictor = (self.predictors)(&endpoint)?;
                    evaluate_stage(
                        predictor.as_ref(),
                        &test,
                        config.inference.batches,
                        config.inference.concurrency,
                    )
                    .await
                },
                |matrix: &ConfusionMatrix| json!({ "total": matrix.total(), "accuracy": matrix.accuracy() }),
            )
            .await;

        let mut endpoint = endpoint;
        if config.hosting.delete_after_run {
            let teardown = self
                .stage(
                    "teardown",
                    json!({ "name": endpoint.name }),
                    teardown_stage(self.hosting.as_ref(), &endpoint.name),
                    |deleted: &Endpoint| json!({ "name": deleted.name, "status": deleted.status }),
                )
                .await;
            match teardown {
                Ok(deleted) => endpoint = deleted,
                Err(err) if evaluation.is_ok() => return Err(err),
                Err(_) => {}
            }
        }

        let confusion = evaluation?;
        Ok(PipelineReport {
            training_data,
            encode: summary,
            job,
            endpoint,
            accuracy: confusion.accuracy(),
            confusion,
        })
    }
}
