use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{ensure, Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand, ValueEnum};
use densefm_learning::{
    pipeline::{
        deploy_stage, encode_stage, evaluate_stage, hosting_service_from_config,
        http_predictor_factory, load_evaluation_data, load_training_data, object_store_from_config,
        submit_stage, teardown_stage, training_service_from_config, upload_stage,
    },
    recordio::RecordReader,
    EndpointConfig, HostingService, InvalidValuePolicy, JobManifest, LabeledDataset, ObjectStore, ObjectUri,
    Pipeline, PipelineConfig, PipelineTelemetry, TrainingJobSpec,
};
use serde_json::{json, Value};
use shared_logging::LogLevel;

#[derive(Parser, Debug)]
#[command(
    name = "densefm",
    version,
    about = "Dense tensor encoding and factorization machine training pipeline"
)]
struct Cli {
    /// Pipeline configuration (TOML).
    #[arg(long, global = true, default_value = "densefm.toml")]
    config: PathBuf,
    /// Overrides `telemetry.min_level`.
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Encodes a dataset split into a RecordIO file.
    Encode(EncodeArgs),
    /// Summarizes a RecordIO file.
    Inspect {
        /// File to read.
        file: PathBuf,
        /// Rows to print.
        #[arg(long, default_value_t = 3)]
        rows: usize,
    },
    /// Uploads a RecordIO file to the training channel.
    Upload {
        /// File to upload.
        file: PathBuf,
        /// Destination; defaults to `<prefix>/train/recordio-pb-data`.
        #[arg(long)]
        uri: Option<ObjectUri>,
    },
    /// Submits a training job and waits for it.
    Train {
        /// Training channel; defaults to the configured upload location.
        #[arg(long)]
        data: Option<ObjectUri>,
    },
    /// Deploys a model artifact behind an endpoint.
    Deploy {
        /// Model archive produced by training.
        #[arg(long)]
        model: ObjectUri,
        /// Endpoint name.
        #[arg(long)]
        name: String,
    },
    /// Scores the evaluation split against a live endpoint.
    Predict {
        /// Endpoint name.
        #[arg(long)]
        endpoint: String,
        /// Caps the rows sent.
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Deletes an endpoint.
    Teardown {
        /// Endpoint name.
        name: String,
    },
    /// Runs every stage end to end.
    Run,
    /// Inspects the job manifest.
    #[command(subcommand)]
    Jobs(JobsCommand),
}

#[derive(Subcommand, Debug)]
enum JobsCommand {
    /// Lists most recent jobs.
    List {
        /// Number of entries to display.
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Shows status for a given job id.
    Status {
        /// Job name.
        job_id: String,
    },
}

#[derive(Args, Debug)]
struct EncodeArgs {
    /// Output file.
    #[arg(long)]
    out: PathBuf,
    /// Dataset split to encode.
    #[arg(long, value_enum, default_value_t = Split::Train)]
    split: Split,
    /// Overrides `dataset.invalid_values`.
    #[arg(long, value_enum)]
    invalid_values: Option<PolicyArg>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Split {
    Train,
    Test,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum PolicyArg {
    Abort,
    SkipRow,
}

impl From<PolicyArg> for InvalidValuePolicy {
    fn from(value: PolicyArg) -> Self {
        match value {
            PolicyArg::Abort => Self::Abort,
            PolicyArg::SkipRow => Self::SkipRow,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if let Some(outcome) = run_without_config(&cli.command) {
        return outcome;
    }
    let mut config = PipelineConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(level) = cli.log_level {
        config.telemetry.min_level = level;
    }
    let telemetry = PipelineTelemetry::from_config(&config.telemetry)?;
    let command = command_name(&cli.command);
    telemetry.log(LogLevel::Info, &format!("cli.{command}.started"), json!({}))?;
    let outcome = dispatch(cli.command, config, &telemetry).await;
    if let Err(err) = &outcome {
        telemetry.log(
            LogLevel::Error,
            &format!("cli.{command}.failed"),
            json!({ "error": format!("{err:#}") }),
        )?;
    }
    outcome
}

/// Commands that only touch local files and never read the configuration.
fn run_without_config(command: &Commands) -> Option<Result<()>> {
    match command {
        Commands::Inspect { file, rows } => Some(handle_inspect(file, *rows)),
        _ => None,
    }
}

const fn command_name(command: &Commands) -> &'static str {
    match command {
        Commands::Encode(_) => "encode",
        Commands::Inspect { .. } => "inspect",
        Commands::Upload { .. } => "upload",
        Commands::Train { .. } => "train",
        Commands::Deploy { .. } => "deploy",
        Commands::Predict { .. } => "predict",
        Commands::Teardown { .. } => "teardown",
        Commands::Run => "run",
        Commands::Jobs(_) => "jobs",
    }
}

async fn dispatch(command: Commands, config: PipelineConfig, telemetry: &PipelineTelemetry) -> Result<()> {
    match command {
        Commands::Encode(args) => handle_encode(&config, &args, telemetry).await,
        Commands::Inspect { file, rows } => handle_inspect(&file, rows),
        Commands::Upload { file, uri } => handle_upload(&config, &file, uri, telemetry).await,
        Commands::Train { data } => handle_train(&config, data, telemetry).await,
        Commands::Deploy { model, name } => {
            let hosting = hosting_service_from_config(&config);
            let endpoint = deploy_stage(
                hosting.as_ref(),
                &EndpointConfig {
                    name,
                    model_artifact: model,
                    resources: config.hosting.resources.clone(),
                },
            )
            .await?;
            telemetry
                .event("cli.endpoint_deployed", json!({ "name": endpoint.name, "url": endpoint.url }))
                .await?;
            print_json(&endpoint)
        }
        Commands::Predict { endpoint, limit } => handle_predict(&config, &endpoint, limit).await,
        Commands::Teardown { name } => {
            let hosting = hosting_service_from_config(&config);
            let endpoint = teardown_stage(hosting.as_ref(), &name).await?;
            telemetry
                .event("cli.endpoint_deleted", json!({ "name": endpoint.name }))
                .await?;
            print_json(&endpoint)
        }
        Commands::Run => {
            let pipeline = Pipeline::from_config(config)?;
            let report = pipeline.run().await?;
            println!("{}", report.confusion.render());
            print_json(&report)
        }
        Commands::Jobs(JobsCommand::List { limit }) => {
            let manifest = JobManifest::new(&config.training.manifest);
            for entry in manifest.tail(limit)? {
                println!(
                    "{} | {} | {} | {}",
                    entry.job_id,
                    entry.status,
                    entry.submitted_at,
                    entry
                        .model_artifact
                        .as_ref()
                        .map_or_else(|| "-".to_string(), ToString::to_string)
                );
            }
            Ok(())
        }
        Commands::Jobs(JobsCommand::Status { job_id }) => {
            let manifest = JobManifest::new(&config.training.manifest);
            if let Some(entry) = manifest.find(&job_id)? {
                print_json(&entry)
            } else {
                println!("job {job_id} not found");
                Ok(())
            }
        }
    }
}

fn load_split(config: &PipelineConfig, split: Split) -> Result<LabeledDataset> {
    match split {
        Split::Train => load_training_data(&config.dataset),
        Split::Test => load_evaluation_data(&config.dataset),
    }
}

async fn handle_encode(
    config: &PipelineConfig,
    args: &EncodeArgs,
    telemetry: &PipelineTelemetry,
) -> Result<()> {
    let dataset = load_split(config, args.split)?;
    let policy = args
        .invalid_values
        .map_or(config.dataset.invalid_values, Into::into);
    let encoded = encode_stage(&dataset, policy)?;
    if let Some(parent) = args.out.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&args.out, &encoded.bytes)
        .with_context(|| format!("writing {}", args.out.display()))?;
    telemetry
        .event(
            "cli.encoded",
            json!({ "out": args.out, "records": encoded.summary.records }),
        )
        .await?;
    print_json(&encoded.summary)
}

fn handle_inspect(file: &Path, rows: usize) -> Result<()> {
    let handle = fs::File::open(file).with_context(|| format!("opening {}", file.display()))?;
    let mut records = 0usize;
    let mut positives = 0usize;
    let mut unlabelled = 0usize;
    let mut feature_dim = None;
    for (idx, record) in RecordReader::new(std::io::BufReader::new(handle)).enumerate() {
        let record = record.with_context(|| format!("decoding record {idx}"))?;
        if let Some(dim) = feature_dim {
            ensure!(
                record.features.len() == dim,
                "record {idx} has {} features, expected {dim}",
                record.features.len()
            );
        } else {
            feature_dim = Some(record.features.len());
        }
        match record.label {
            Some(label) if label > 0.5 => positives += 1,
            Some(_) => {}
            None => unlabelled += 1,
        }
        if idx < rows {
            let nonzero = record.features.iter().filter(|v| **v != 0.0).count();
            println!("#{idx}: label={:?} nonzero={nonzero}", record.label);
        }
        records += 1;
    }
    print_json(&json!({
        "file": file,
        "records": records,
        "feature_dim": feature_dim,
        "positives": positives,
        "unlabelled": unlabelled,
    }))
}

async fn handle_upload(
    config: &PipelineConfig,
    file: &Path,
    uri: Option<ObjectUri>,
    telemetry: &PipelineTelemetry,
) -> Result<()> {
    let uri = match uri {
        Some(uri) => uri,
        None => config.storage.training_data_uri()?,
    };
    let bytes = fs::read(file).with_context(|| format!("reading {}", file.display()))?;
    let store = object_store_from_config(config);
    let receipt = upload_stage(store.as_ref(), &uri, bytes).await?;
    telemetry
        .event("cli.uploaded", json!({ "uri": receipt.uri.to_string(), "size": receipt.size }))
        .await?;
    print_json(&receipt)
}

async fn handle_train(
    config: &PipelineConfig,
    data: Option<ObjectUri>,
    telemetry: &PipelineTelemetry,
) -> Result<()> {
    let train_channel = match data {
        Some(uri) => uri,
        None => config.storage.training_data_uri()?,
    };
    let store = object_store_from_config(config);
    ensure!(
        store.exists(&train_channel).await?,
        "no training data at {train_channel}; run `densefm upload` first"
    );
    let service = training_service_from_config(config, Arc::clone(&store))?;
    let manifest = JobManifest::new(&config.training.manifest);
    let spec = TrainingJobSpec::new(
        &config.training.image,
        config.training.hyperparameters.clone(),
        train_channel,
        config.storage.output_uri()?,
        config.training.resources.clone(),
    )?;
    publish_job_event(
        telemetry,
        "training.job_submitted",
        &spec.job_name,
        json!({ "train_channel": spec.train_channel.to_string(), "submitted_at": Utc::now() }),
    )
    .await?;
    match submit_stage(service.as_ref(), &manifest, &spec).await {
        Ok(job) => {
            publish_job_event(
                telemetry,
                "training.job_completed",
                &job.job_id,
                json!({ "model_artifact": job.model_artifact.as_ref().map(ToString::to_string) }),
            )
            .await?;
            print_json(&job)
        }
        Err(err) => {
            publish_job_event(
                telemetry,
                "training.job_failed",
                &spec.job_name,
                json!({ "error": format!("{err:#}") }),
            )
            .await?;
            Err(err)
        }
    }
}

async fn handle_predict(config: &PipelineConfig, name: &str, limit: Option<usize>) -> Result<()> {
    let hosting = hosting_service_from_config(config);
    let endpoint = hosting
        .describe(name)
        .await
        .with_context(|| format!("looking up endpoint {name}"))?;
    let mut dataset_config = config.dataset.clone();
    if let Some(limit) = limit {
        dataset_config.test_limit = Some(limit);
        if let Some(synthetic) = &mut dataset_config.synthetic {
            synthetic.test_rows = synthetic.test_rows.min(limit);
        }
    }
    let dataset = load_evaluation_data(&dataset_config)?;
    let predictor = http_predictor_factory(config.inference.clone())(&endpoint)?;
    let matrix = evaluate_stage(
        predictor.as_ref(),
        &dataset,
        config.inference.batches,
        config.inference.concurrency,
    )
    .await?;
    println!("{}", matrix.render());
    print_json(&json!({
        "endpoint": endpoint.name,
        "rows": matrix.total(),
        "accuracy": matrix.accuracy(),
    }))
}

async fn publish_job_event(
    telemetry: &PipelineTelemetry,
    event_type: &str,
    job_id: &str,
    payload: Value,
) -> Result<()> {
    let payload = match payload {
        Value::Object(mut map) => {
            map.insert("job_id".into(), Value::String(job_id.to_string()));
            Value::Object(map)
        }
        other => json!({ "job_id": job_id, "data": other }),
    };
    telemetry.log(LogLevel::Info, event_type, payload.clone())?;
    telemetry.event(event_type, payload).await
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
