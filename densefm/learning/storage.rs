use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors raised by object storage backends.
#[derive(Debug, Error)]
pub enum StorageError {
    /// URI does not follow `scheme://bucket/key`.
    #[error("invalid object uri '{0}'")]
    InvalidUri(String),
    /// Key escapes the bucket or contains empty segments.
    #[error("invalid object key '{0}'")]
    InvalidKey(String),
    /// No object at the given location.
    #[error("object {0} not found")]
    NotFound(ObjectUri),
    /// I/O error (filesystem).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Location of an object, rendered as `scheme://bucket/key`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectUri {
    scheme: String,
    bucket: String,
    key: String,
}

impl ObjectUri {
    /// Builds a URI from parts. `key` may be empty (bucket root).
    pub fn new(
        scheme: impl Into<String>,
        bucket: impl Into<String>,
        key: impl Into<String>,
    ) -> Result<Self, StorageError> {
        let scheme = scheme.into();
        let bucket = bucket.into();
        let key = key.into().trim_matches('/').to_string();
        if scheme.is_empty() || bucket.is_empty() || bucket.contains('/') {
            return Err(StorageError::InvalidUri(format!("{scheme}://{bucket}/{key}")));
        }
        validate_key(&key)?;
        Ok(Self { scheme, bucket, key })
    }

    /// Appends a `/`-separated path to the key.
    pub fn join(&self, segment: &str) -> Result<Self, StorageError> {
        let segment = segment.trim_matches('/');
        let key = if self.key.is_empty() {
            segment.to_string()
        } else if segment.is_empty() {
            self.key.clone()
        } else {
            format!("{}/{segment}", self.key)
        };
        Self::new(self.scheme.clone(), self.bucket.clone(), key)
    }

    /// URI scheme.
    #[must_use]
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Bucket name.
    #[must_use]
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Object key without leading or trailing slashes.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

fn validate_key(key: &str) -> Result<(), StorageError> {
    if key.is_empty() {
        return Ok(());
    }
    if key
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}

impl fmt::Display for ObjectUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.key.is_empty() {
            write!(f, "{}://{}", self.scheme, self.bucket)
        } else {
            write!(f, "{}://{}/{}", self.scheme, self.bucket, self.key)
        }
    }
}

impl FromStr for ObjectUri {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| StorageError::InvalidUri(s.to_string()))?;
        let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
        Self::new(scheme, bucket, key).map_err(|_| StorageError::InvalidUri(s.to_string()))
    }
}

impl Serialize for ObjectUri {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ObjectUri {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Acknowledgement returned after a successful upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectReceipt {
    /// Where the object now lives.
    pub uri: ObjectUri,
    /// Stored size in bytes.
    pub size: u64,
    /// Completion time.
    pub stored_at: DateTime<Utc>,
}

/// Object storage boundary used for training data and model artifacts.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Stores `bytes` at `uri`, replacing any existing object.
    async fn put(&self, uri: &ObjectUri, bytes: Vec<u8>) -> Result<ObjectReceipt, StorageError>;

    /// Fetches the object at `uri`.
    async fn get(&self, uri: &ObjectUri) -> Result<Vec<u8>, StorageError>;

    /// Whether an object exists at `uri`.
    async fn exists(&self, uri: &ObjectUri) -> Result<bool, StorageError>;

    /// Lists object URIs whose key starts with `prefix`'s key, sorted.
    async fn list(&self, prefix: &ObjectUri) -> Result<Vec<ObjectUri>, StorageError>;
}

/// Stores objects under `root/<bucket>/<key>` on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    /// Creates a store rooted at `root`. The directory is created lazily.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filesystem path backing `uri`.
    #[must_use]
    pub fn path_for(&self, uri: &ObjectUri) -> PathBuf {
        let mut path = self.root.join(uri.bucket());
        for segment in uri.key().split('/').filter(|s| !s.is_empty()) {
            path.push(segment);
        }
        path
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(&self, uri: &ObjectUri, bytes: Vec<u8>) -> Result<ObjectReceipt, StorageError> {
        if uri.key().is_empty() {
            return Err(StorageError::InvalidKey(uri.to_string()));
        }
        let path = self.path_for(uri);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let staging = path.with_extension(format!("partial-{}", Uuid::new_v4().simple()));
        let size = bytes.len() as u64;
        tokio::fs::write(&staging, bytes).await?;
        if let Err(err) = tokio::fs::rename(&staging, &path).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(err.into());
        }
        Ok(ObjectReceipt {
            uri: uri.clone(),
            size,
            stored_at: Utc::now(),
        })
    }

    async fn get(&self, uri: &ObjectUri) -> Result<Vec<u8>, StorageError> {
        match tokio::fs::read(self.path_for(uri)).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(uri.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn exists(&self, uri: &ObjectUri) -> Result<bool, StorageError> {
        Ok(tokio::fs::metadata(self.path_for(uri))
            .await
            .map(|meta| meta.is_file())
            .unwrap_or(false))
    }

    async fn list(&self, prefix: &ObjectUri) -> Result<Vec<ObjectUri>, StorageError> {
        let bucket_root = self.root.join(prefix.bucket());
        let mut found = Vec::new();
        let mut pending = vec![bucket_root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Ok(relative) = path.strip_prefix(&bucket_root) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.contains(".partial-") || !key.starts_with(prefix.key()) {
                    continue;
                }
                found.push(ObjectUri::new(prefix.scheme(), prefix.bucket(), key)?);
            }
        }
        found.sort();
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parses_and_joins_uris() {
        let base: ObjectUri = "s3://localide/fm/DEMO-1".parse().unwrap();
        assert_eq!(base.bucket(), "localide");
        assert_eq!(base.key(), "fm/DEMO-1");
        let train = base.join("train").unwrap().join("recordio-pb-data").unwrap();
        assert_eq!(
            train.to_string(),
            "s3://localide/fm/DEMO-1/train/recordio-pb-data"
        );
        let root: ObjectUri = "file://bucket".parse().unwrap();
        assert_eq!(root.key(), "");
        assert_eq!(root.to_string(), "file://bucket");
    }

    #[test]
    fn rejects_malformed_uris_and_keys() {
        assert!("no-scheme/bucket".parse::<ObjectUri>().is_err());
        assert!("s3:///key".parse::<ObjectUri>().is_err());
        assert!("s3://bucket/a/../b".parse::<ObjectUri>().is_err());
        let base: ObjectUri = "s3://bucket/prefix".parse().unwrap();
        assert!(matches!(base.join("x//y"), Err(StorageError::InvalidKey(_))));
    }

    #[test]
    fn uri_serializes_as_string() {
        let uri: ObjectUri = "s3://bucket/a/b".parse().unwrap();
        let json = serde_json::to_string(&uri).unwrap();
        assert_eq!(json, "\"s3://bucket/a/b\"");
        let back: ObjectUri = serde_json::from_str(&json).unwrap();
        assert_eq!(back, uri);
    }

    #[tokio::test]
    async fn local_store_round_trip() {
        let dir = tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        let uri: ObjectUri = "s3://bucket/prefix/train/data".parse().unwrap();
        assert!(!store.exists(&uri).await.unwrap());

        let receipt = store.put(&uri, vec![1, 2, 3]).await.unwrap();
        assert_eq!(receipt.size, 3);
        assert!(store.exists(&uri).await.unwrap());
        assert_eq!(store.get(&uri).await.unwrap(), vec![1, 2, 3]);
        assert!(store.path_for(&uri).ends_with("bucket/prefix/train/data"));

        store.put(&uri, vec![9]).await.unwrap();
        assert_eq!(store.get(&uri).await.unwrap(), vec![9]);
    }

    #[tokio::test]
    async fn local_store_lists_by_prefix() {
        let dir = tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        for key in ["p/train/a", "p/train/b", "p/output/model"] {
            let uri = ObjectUri::new("s3", "bucket", key).unwrap();
            store.put(&uri, vec![0]).await.unwrap();
        }
        let prefix = ObjectUri::new("s3", "bucket", "p/train").unwrap();
        let listed: Vec<_> = store
            .list(&prefix)
            .await
            .unwrap()
            .into_iter()
            .map(|uri| uri.key().to_string())
            .collect();
        assert_eq!(listed, vec!["p/train/a", "p/train/b"]);
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let dir = tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        let uri = ObjectUri::new("s3", "bucket", "absent").unwrap();
        assert!(matches!(
            store.get(&uri).await.unwrap_err(),
            StorageError::NotFound(_)
        ));
        let root = ObjectUri::new("s3", "bucket", "").unwrap();
        assert!(matches!(
            store.put(&root, vec![]).await.unwrap_err(),
            StorageError::InvalidKey(_)
        ));
    }
}
