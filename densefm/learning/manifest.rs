use std::{
    fs::{self, File, OpenOptions},
    io::{BufRead, BufReader, Write},
    marker::PhantomData,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    storage::ObjectUri,
    training::{JobStatus, TrainingJob, TrainingJobSpec},
};

/// Append-only JSON-lines file of `T` with whole-file rewrites for updates.
#[derive(Debug)]
pub struct JsonLinesFile<T> {
    path: PathBuf,
    lock: Mutex<()>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> JsonLinesFile<T> {
    /// Opens (lazily creates) the file at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
            _marker: PhantomData,
        }
    }

    /// Backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one entry.
    pub fn append(&self, entry: &T) -> Result<()> {
        let _guard = self.lock.lock();
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening {}", self.path.display()))?;
        serde_json::to_writer(&mut file, entry)?;
        file.write_all(b"\n")?;
        Ok(())
    }

    /// Reads every entry in file order. A missing file reads as empty.
    pub fn read_all(&self) -> Result<Vec<T>> {
        let _guard = self.lock.lock();
        self.read_unlocked()
    }

    /// Applies `update` to every entry and rewrites the file. Returns how many entries `update` reported as changed.
    pub fn update<F>(&self, mut update: F) -> Result<usize>
    where
        F: FnMut(&mut T) -> bool,
    {
        let _guard = self.lock.lock();
        let mut entries = self.read_unlocked()?;
        let changed = entries.iter_mut().filter_map(|entry| update(entry).then_some(())).count();
        if changed == 0 {
            return Ok(0);
        }
        let staging = self.path.with_extension("jsonl.tmp");
        {
            let mut file = File::create(&staging)
                .with_context(|| format!("creating {}", staging.display()))?;
            for entry in &entries {
                serde_json::to_writer(&mut file, entry)?;
                file.write_all(b"\n")?;
            }
            file.flush()?;
        }
        fs::rename(&staging, &self.path)
            .with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(changed)
    }

    fn read_unlocked(&self) -> Result<Vec<T>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.path)
            .with_context(|| format!("opening {}", self.path.display()))?;
        let mut entries = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry = serde_json::from_str(&line).with_context(|| {
                format!("parsing line {} of {}", idx + 1, self.path.display())
            })?;
            entries.push(entry);
        }
        Ok(entries)
    }
}

/// One submitted training job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobManifestEntry {
    /// Job name.
    pub job_id: String,
    /// Submission time.
    pub submitted_at: DateTime<Utc>,
    /// Training data location.
    pub train_channel: ObjectUri,
    /// Artifact prefix.
    pub output_path: ObjectUri,
    /// Wire hyperparameters sent with the job.
    pub hyperparameters: IndexMap<String, String>,
    /// Latest known state.
    pub status: JobStatus,
    /// Model archive once completed.
    #[serde(default)]
    pub model_artifact: Option<ObjectUri>,
    /// Failure description.
    #[serde(default)]
    pub failure_reason: Option<String>,
}

impl JobManifestEntry {
    /// Pending entry for a freshly built spec.
    #[must_use]
    pub fn pending(spec: &TrainingJobSpec) -> Self {
        Self {
            job_id: spec.job_name.clone(),
            submitted_at: Utc::now(),
            train_channel: spec.train_channel.clone(),
            output_path: spec.output_path.clone(),
            hyperparameters: spec.hyperparameter_map.clone(),
            status: JobStatus::Pending,
            model_artifact: None,
            failure_reason: None,
        }
    }
}

/// Training job history.
#[derive(Debug)]
pub struct JobManifest {
    file: JsonLinesFile<JobManifestEntry>,
}

impl JobManifest {
    /// Manifest backed by `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            file: JsonLinesFile::new(path),
        }
    }

    /// Backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Records a new job.
    pub fn append(&self, entry: &JobManifestEntry) -> Result<()> {
        self.file.append(entry)
    }

    /// All jobs, oldest first.
    pub fn read_all(&self) -> Result<Vec<JobManifestEntry>> {
        self.file.read_all()
    }

    /// The most recent `limit` jobs, newest first.
    pub fn tail(&self, limit: usize) -> Result<Vec<JobManifestEntry>> {
        Ok(self.read_all()?.into_iter().rev().take(limit).collect())
    }

    /// Looks up a job by id.
    pub fn find(&self, job_id: &str) -> Result<Option<JobManifestEntry>> {
        Ok(self.read_all()?.into_iter().find(|e| e.job_id == job_id))
    }

    /// Sets the status of `job_id`. Returns `false` when the job is unknown.
    pub fn update_status(&self, job_id: &str, status: JobStatus) -> Result<bool> {
        let changed = self.file.update(|entry| {
            if entry.job_id == job_id {
                entry.status = status;
                true
            } else {
                false
            }
        })?;
        Ok(changed > 0)
    }

    /// Copies a service outcome into the manifest.
    pub fn record_outcome(&self, job: &TrainingJob) -> Result<bool> {
        let changed = self.file.update(|entry| {
            if entry.job_id == job.job_id {
                entry.status = job.status;
                entry.model_artifact.clone_from(&job.model_artifact);
                entry.failure_reason.clone_from(&job.failure_reason);
                true
            } else {
                false
            }
        })?;
        Ok(changed > 0)
    }
}
