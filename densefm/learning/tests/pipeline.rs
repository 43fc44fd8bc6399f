use std::{fs, path::Path, sync::Arc};

use async_trait::async_trait;
use axum::{routing::post, Json, Router};
use densefm_learning::{
    hosting::EndpointStatus,
    inference::{InferenceRequest, InferenceResponse},
    pipeline::{hosting_service_from_config, http_predictor_factory, object_store_from_config},
    recordio::read_dense_tensor,
    Endpoint, HostingService, InferenceError, JobManifest, JobStatus, LocalObjectStore, ObjectStore, Pipeline,
    PipelineConfig, PipelineTelemetry, Prediction, Predictor, PredictorFactory, TrainingError,
    TrainingJob, TrainingJobSpec, TrainingService,
};
use ndarray::ArrayView2;
use shared_event_bus::MemoryEventBus;
use tempfile::{tempdir, TempDir};

/// Stands in for a managed job: checks the channel and writes an artifact.
struct ArtifactWritingTraining {
    store: Arc<dyn ObjectStore>,
}

#[async_trait]
impl TrainingService for ArtifactWritingTraining {
    async fn submit(&self, spec: &TrainingJobSpec) -> Result<TrainingJob, TrainingError> {
        assert!(self.store.exists(&spec.train_channel).await?);
        let artifact = spec.model_artifact()?;
        self.store.put(&artifact, b"fm-model".to_vec()).await?;
        Ok(TrainingJob {
            job_id: spec.job_name.clone(),
            status: JobStatus::Completed,
            model_artifact: Some(artifact),
            failure_reason: None,
        })
    }
}

/// Applies the synthetic target rule: first half of the row outweighs the second.
fn half_sum_rule(row: &[f32]) -> Prediction {
    let half = row.len() / 2;
    let head: f32 = row[..half].iter().sum();
    let tail: f32 = row[half..].iter().sum();
    let label = if head > tail { 1.0 } else { 0.0 };
    Prediction {
        score: label,
        predicted_label: label,
    }
}

struct Unreachable;

struct Rule;

#[async_trait]
impl Predictor for Rule {
    async fn predict(&self, features: ArrayView2<'_, f32>) -> Result<Vec<Prediction>, InferenceError> {
        Ok(features
            .rows()
            .into_iter()
            .map(|row| half_sum_rule(&row.to_vec()))
            .collect())
    }
}

#[async_trait]
impl Predictor for Unreachable {
    async fn predict(&self, _: ArrayView2<'_, f32>) -> Result<Vec<Prediction>, InferenceError> {
        Err(InferenceError::InvalidRequest("endpoint unreachable".into()))
    }
}

fn write_config(dir: &Path, hosting_extra: &str) -> PipelineConfig {
    let path = dir.join("densefm.toml");
    fs::write(
        &path,
        format!(
            r#"
[dataset.synthetic]
train_rows = 120
test_rows = 40
feature_dim = 16
seed = 7

[storage]
root = "store"
bucket = "localide"
prefix = "fm/DEMO-1"

[training]
manifest = "jobs/index.jsonl"

[training.hyperparameters]
feature_dim = 16

[hosting]
registry = "endpoints.jsonl"
{hosting_extra}

[inference]
batches = 6
concurrency = 3

[telemetry]
log_path = "logs/densefm.jsonl"
"#
        ),
    )
    .unwrap();
    PipelineConfig::load(&path).unwrap()
}

struct Harness {
    _dir: TempDir,
    config: PipelineConfig,
    store: Arc<dyn ObjectStore>,
    hosting: Arc<dyn HostingService>,
    bus: Arc<MemoryEventBus>,
}

fn harness(hosting_extra: &str) -> Harness {
    let dir = tempdir().unwrap();
    let config = write_config(dir.path(), hosting_extra);
    Harness {
        store: object_store_from_config(&config),
        hosting: hosting_service_from_config(&config),
        bus: Arc::new(MemoryEventBus::new(64)),
        config,
        _dir: dir,
    }
}

impl Harness {
    fn pipeline(&self, predictors: PredictorFactory) -> Pipeline {
        let telemetry = PipelineTelemetry::builder("densefm")
            .log_path(&self.config.telemetry.log_path)
            .event_publisher(self.bus.clone())
            .build()
            .unwrap();
        Pipeline::new(
            self.config.clone(),
            self.store.clone(),
            Arc::new(ArtifactWritingTraining {
                store: self.store.clone(),
            }),
            self.hosting.clone(),
            predictors,
            telemetry,
        )
    }

    fn event_types(&self) -> Vec<String> {
        self.bus
            .snapshot()
            .into_iter()
            .map(|event| event.event_type)
            .collect()
    }
}

async fn rule_endpoint() -> String {
    let router = Router::new().route(
        "/invocations",
        post(|Json(request): Json<InferenceRequest>| async move {
            Json(InferenceResponse {
                predictions: request
                    .instances
                    .iter()
                    .map(|instance| half_sum_rule(&instance.features))
                    .collect(),
            })
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}/invocations")
}

#[tokio::test]
async fn full_run_over_http_endpoint() {
    let url = rule_endpoint().await;
    let harness = harness("");
    let mut config = harness.config.clone();
    config.inference.url = Some(url);
    let pipeline = harness.pipeline(http_predictor_factory(config.inference.clone()));

    let report = pipeline.run().await.unwrap();

    assert_eq!(report.encode.records, 120);
    assert!(report.encode.skipped_rows.is_empty());
    assert_eq!(
        report.training_data.uri.to_string(),
        "s3://localide/fm/DEMO-1/train/recordio-pb-data"
    );
    assert_eq!(report.confusion.total(), 40);
    assert_eq!(report.accuracy, Some(1.0));
    assert_eq!(report.endpoint.status, EndpointStatus::Deleted);
    assert_eq!(report.endpoint.name, report.job.job_id);

    let local = LocalObjectStore::new(&harness.config.storage.root);
    let bytes = fs::read(local.path_for(&report.training_data.uri)).unwrap();
    let (features, labels) = read_dense_tensor(bytes.as_slice()).unwrap();
    assert_eq!(features.dim(), (120, 16));
    assert_eq!(labels.unwrap().len(), 120);

    let manifest = JobManifest::new(&harness.config.training.manifest);
    let entry = manifest.find(&report.job.job_id).unwrap().unwrap();
    assert_eq!(entry.status, JobStatus::Completed);
    assert_eq!(entry.hyperparameters["feature_dim"], "16");

    assert_eq!(
        harness.event_types(),
        [
            "pipeline.load.completed",
            "pipeline.encode.completed",
            "pipeline.upload.completed",
            "pipeline.train.completed",
            "pipeline.deploy.completed",
            "pipeline.evaluate.completed",
            "pipeline.teardown.completed",
        ]
    );
    let log = fs::read_to_string(&harness.config.telemetry.log_path).unwrap();
    assert!(log.contains("pipeline.evaluate.started"));
}

#[tokio::test]
async fn endpoint_is_deleted_when_evaluation_fails() {
    let harness = harness("");
    let predictors: PredictorFactory =
        Arc::new(|_: &Endpoint| Ok::<_, anyhow::Error>(Arc::new(Unreachable) as Arc<dyn Predictor>));
    let pipeline = harness.pipeline(predictors);

    let err = pipeline.run().await.unwrap_err();
    assert!(format!("{err:#}").contains("endpoint unreachable"));

    let types = harness.event_types();
    assert!(types.contains(&"pipeline.evaluate.failed".to_string()));
    assert_eq!(types.last().unwrap(), "pipeline.teardown.completed");
    let history = densefm_learning::RegistryHostingService::new(
        &harness.config.hosting.base_url,
        &harness.config.hosting.registry,
    )
    .history()
    .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, EndpointStatus::Deleted);
}

#[tokio::test]
async fn endpoint_is_kept_when_configured() {
    let harness = harness("delete_after_run = false\nendpoint_name = \"fm-keep\"");
    let predictors: PredictorFactory =
        Arc::new(|_: &Endpoint| Ok::<_, anyhow::Error>(Arc::new(Rule) as Arc<dyn Predictor>));
    let report = harness.pipeline(predictors).run().await.unwrap();
    assert_eq!(report.endpoint.name, "fm-keep");
    assert_eq!(report.endpoint.status, EndpointStatus::InService);
    assert_eq!(
        harness.hosting.describe("fm-keep").await.unwrap().status,
        EndpointStatus::InService
    );
}
