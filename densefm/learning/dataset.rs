use std::{fs, path::Path};

use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use thiserror::Error;

/// Side length of an MNIST digit.
pub const IMAGE_SIDE: usize = 28;
/// Flattened pixel count per image.
pub const IMAGE_PIXELS: usize = IMAGE_SIDE * IMAGE_SIDE;

const IDX_IMAGES_MAGIC: u32 = 0x0000_0803;
const IDX_LABELS_MAGIC: u32 = 0x0000_0801;
const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];

/// Errors raised while loading or assembling datasets.
#[derive(Debug, Error)]
pub enum DatasetError {
    /// I/O error (filesystem).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// File is gzip-compressed; decompress it before loading.
    #[error("{0} is gzip-compressed; decompress it first")]
    Compressed(String),
    /// IDX header magic does not match the expected file kind.
    #[error("{path}: expected IDX magic 0x{expected:08x}, found 0x{found:08x}")]
    BadMagic {
        /// File being read.
        path: String,
        /// Magic for the requested kind.
        expected: u32,
        /// Magic found in the file.
        found: u32,
    },
    /// File ended before the declared payload.
    #[error("{path} is truncated: need {needed} bytes, have {actual}")]
    Truncated {
        /// File being read.
        path: String,
        /// Bytes required by the header.
        needed: usize,
        /// Bytes available.
        actual: usize,
    },
    /// Header dimensions describe a payload larger than addressable memory.
    #[error("{path}: header declares {count} x {rows} x {cols}, which overflows")]
    BadHeader {
        /// File being read.
        path: String,
        /// Declared item count after the limit.
        count: usize,
        /// Declared rows per item.
        rows: usize,
        /// Declared columns per item.
        cols: usize,
    },
    /// Features and labels disagree on row count.
    #[error("{features} feature rows but {labels} labels")]
    ShapeMismatch {
        /// Rows in the feature matrix.
        features: usize,
        /// Entries in the label vector.
        labels: usize,
    },
    /// Positive class outside the digit range.
    #[error("positive digit {0} is not in 0..=9")]
    InvalidDigit(u8),
}

/// Feature matrix with a parallel binary label vector.
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledDataset {
    features: Array2<f32>,
    labels: Array1<f32>,
}

impl LabeledDataset {
    /// Pairs features with labels, rejecting mismatched row counts.
    pub fn new(features: Array2<f32>, labels: Array1<f32>) -> Result<Self, DatasetError> {
        if features.nrows() != labels.len() {
            return Err(DatasetError::ShapeMismatch {
                features: features.nrows(),
                labels: labels.len(),
            });
        }
        Ok(Self { features, labels })
    }

    /// Loads an IDX image/label pair and turns the digits into a one-vs-rest target.
    pub fn from_idx(
        images: impl AsRef<Path>,
        labels: impl AsRef<Path>,
        positive_digit: u8,
        limit: Option<usize>,
    ) -> Result<Self, DatasetError> {
        let features = load_idx_images(images, limit)?;
        let digits = load_idx_labels(labels, limit)?;
        let labels = one_vs_rest(&digits, positive_digit)?;
        Self::new(features, labels)
    }

    /// Random features with a linearly separable target, for demos and tests.
    #[must_use]
    pub fn synthetic(count: usize, feature_dim: usize, seed: u64) -> Self {
        let mut rng = SmallRng::seed_from_u64(seed);
        let features = Array2::from_shape_simple_fn((count, feature_dim), || rng.gen_range(0.0..1.0));
        let labels = features
            .rows()
            .into_iter()
            .map(|row| {
                let half = row.len() / 2;
                let head: f32 = row.slice(s![..half]).sum();
                let tail: f32 = row.slice(s![half..]).sum();
                if head > tail {
                    1.0
                } else {
                    0.0
                }
            })
            .collect();
        Self { features, labels }
    }

    /// Feature matrix view.
    #[must_use]
    pub fn features(&self) -> ArrayView2<'_, f32> {
        self.features.view()
    }

    /// Label vector view.
    #[must_use]
    pub fn labels(&self) -> ArrayView1<'_, f32> {
        self.labels.view()
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Whether the dataset has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Width of each feature vector.
    #[must_use]
    pub fn feature_dim(&self) -> usize {
        self.features.ncols()
    }

    /// Count of rows labelled 1.0.
    #[must_use]
    pub fn positives(&self) -> usize {
        self.labels.iter().filter(|label| **label == 1.0).count()
    }

    /// Splits into owned parts.
    #[must_use]
    pub fn into_parts(self) -> (Array2<f32>, Array1<f32>) {
        (self.features, self.labels)
    }
}

/// Maps digits to `1.0` when they equal `positive`, `0.0` otherwise.
pub fn one_vs_rest(digits: &[u8], positive: u8) -> Result<Array1<f32>, DatasetError> {
    if positive > 9 {
        return Err(DatasetError::InvalidDigit(positive));
    }
    Ok(digits
        .iter()
        .map(|digit| if *digit == positive { 1.0 } else { 0.0 })
        .collect())
}

/// Splits rows into `parts` contiguous chunks whose sizes differ by at most one.
///
/// The first `rows % parts` chunks carry the extra row. Never yields empty
/// chunks, so fewer than `parts` views come back when there are fewer rows.
#[must_use]
pub fn split_rows<'a>(features: ArrayView2<'a, f32>, parts: usize) -> Vec<ArrayView2<'a, f32>> {
    let rows = features.nrows();
    let parts = parts.max(1).min(rows);
    if parts == 0 {
        return Vec::new();
    }
    let base = rows / parts;
    let extra = rows % parts;
    let mut chunks = Vec::with_capacity(parts);
    let mut start = 0;
    for idx in 0..parts {
        let len = base + usize::from(idx < extra);
        chunks.push(features.slice_move(s![start..start + len, ..]));
        start += len;
    }
    chunks
}

/// Reads an IDX3 image file into an `N x 784` matrix scaled to `[0, 1]`.
pub fn load_idx_images(path: impl AsRef<Path>, limit: Option<usize>) -> Result<Array2<f32>, DatasetError> {
    let path = path.as_ref();
    let data = read_idx(path)?;
    let name = path.display().to_string();
    let mut offset = 0;
    expect_magic(&data, &mut offset, IDX_IMAGES_MAGIC, &name)?;
    let total = read_be_u32(&data, &mut offset, &name)? as usize;
    let rows = read_be_u32(&data, &mut offset, &name)? as usize;
    let cols = read_be_u32(&data, &mut offset, &name)? as usize;
    let count = limit.map_or(total, |limit| limit.min(total));
    let (pixels, needed) = rows
        .checked_mul(cols)
        .and_then(|pixels| Some((pixels, offset.checked_add(count.checked_mul(pixels)?)?)))
        .ok_or_else(|| DatasetError::BadHeader {
            path: name.clone(),
            count,
            rows,
            cols,
        })?;
    if data.len() < needed {
        return Err(DatasetError::Truncated {
            path: name,
            needed,
            actual: data.len(),
        });
    }
    let values = data[offset..needed]
        .iter()
        .map(|px| f32::from(*px) / 255.0)
        .collect();
    Array2::from_shape_vec((count, pixels), values).map_err(|_| DatasetError::Truncated {
        path: name,
        needed,
        actual: data.len(),
    })
}

/// Reads an IDX1 label file.
pub fn load_idx_labels(path: impl AsRef<Path>, limit: Option<usize>) -> Result<Vec<u8>, DatasetError> {
    let path = path.as_ref();
    let data = read_idx(path)?;
    let name = path.display().to_string();
    let mut offset = 0;
    expect_magic(&data, &mut offset, IDX_LABELS_MAGIC, &name)?;
    let total = read_be_u32(&data, &mut offset, &name)? as usize;
    let count = limit.map_or(total, |limit| limit.min(total));
    let needed = offset.saturating_add(count);
    if data.len() < needed {
        return Err(DatasetError::Truncated {
            path: name,
            needed,
            actual: data.len(),
        });
    }
    Ok(data[offset..needed].to_vec())
}

fn read_idx(path: &Path) -> Result<Vec<u8>, DatasetError> {
    let data = fs::read(path)?;
    if data.starts_with(&GZIP_MAGIC) {
        return Err(DatasetError::Compressed(path.display().to_string()));
    }
    Ok(data)
}

fn expect_magic(data: &[u8], offset: &mut usize, expected: u32, name: &str) -> Result<(), DatasetError> {
    let found = read_be_u32(data, offset, name)?;
    if found != expected {
        return Err(DatasetError::BadMagic {
            path: name.to_string(),
            expected,
            found,
        });
    }
    Ok(())
}

// IDX headers are big-endian.
fn read_be_u32(data: &[u8], offset: &mut usize, name: &str) -> Result<u32, DatasetError> {
    let end = *offset + 4;
    let bytes = data.get(*offset..end).ok_or_else(|| DatasetError::Truncated {
        path: name.to_string(),
        needed: end,
        actual: data.len(),
    })?;
    *offset = end;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use ndarray::array;
    use tempfile::tempdir;

    pub(crate) fn idx_images(images: &[[u8; 4]]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend(IDX_IMAGES_MAGIC.to_be_bytes());
        out.extend((images.len() as u32).to_be_bytes());
        out.extend(2u32.to_be_bytes());
        out.extend(2u32.to_be_bytes());
        for image in images {
            out.extend(image);
        }
        out
    }

    pub(crate) fn idx_labels(labels: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend(IDX_LABELS_MAGIC.to_be_bytes());
        out.extend((labels.len() as u32).to_be_bytes());
        out.extend(labels);
        out
    }

    #[test]
    fn loads_idx_pair_as_one_vs_rest() {
        let dir = tempdir().unwrap();
        let images = dir.path().join("images.idx3-ubyte");
        let labels = dir.path().join("labels.idx1-ubyte");
        fs::write(&images, idx_images(&[[0, 255, 0, 255], [255, 255, 0, 0], [0, 0, 0, 51]])).unwrap();
        fs::write(&labels, idx_labels(&[0, 7, 0])).unwrap();

        let dataset = LabeledDataset::from_idx(&images, &labels, 0, None).unwrap();
        assert_eq!(dataset.len(), 3);
        assert_eq!(dataset.feature_dim(), 4);
        assert_eq!(dataset.labels(), array![1.0_f32, 0.0, 1.0].view());
        assert_eq!(dataset.features()[[0, 1]], 1.0);
        assert!((dataset.features()[[2, 3]] - 0.2).abs() < 1e-6);
        assert_eq!(dataset.positives(), 2);

        let limited = LabeledDataset::from_idx(&images, &labels, 7, Some(2)).unwrap();
        assert_eq!(limited.labels(), array![0.0_f32, 1.0].view());
    }

    #[test]
    fn rejects_gzip_and_wrong_magic() {
        let dir = tempdir().unwrap();
        let gz = dir.path().join("train.gz");
        fs::write(&gz, [0x1F, 0x8B, 0x08, 0x00]).unwrap();
        assert!(matches!(
            load_idx_labels(&gz, None).unwrap_err(),
            DatasetError::Compressed(_)
        ));

        let labels = dir.path().join("labels");
        fs::write(&labels, idx_labels(&[1, 2])).unwrap();
        assert!(matches!(
            load_idx_images(&labels, None).unwrap_err(),
            DatasetError::BadMagic { .. }
        ));
    }

    #[test]
    fn reports_truncated_images() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("short");
        let mut bytes = idx_images(&[[1, 2, 3, 4], [5, 6, 7, 8]]);
        bytes.truncate(bytes.len() - 1);
        fs::write(&path, bytes).unwrap();
        assert!(matches!(
            load_idx_images(&path, None).unwrap_err(),
            DatasetError::Truncated { .. }
        ));
        assert_eq!(load_idx_images(&path, Some(1)).unwrap().nrows(), 1);
    }

    #[test]
    fn oversized_header_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("huge");
        let mut bytes = Vec::new();
        bytes.extend(IDX_IMAGES_MAGIC.to_be_bytes());
        bytes.extend(3u32.to_be_bytes());
        bytes.extend(u32::MAX.to_be_bytes());
        bytes.extend(u32::MAX.to_be_bytes());
        bytes.extend([0u8; 16]);
        fs::write(&path, bytes).unwrap();

        let err = load_idx_images(&path, None).unwrap_err();
        assert!(
            matches!(
                err,
                DatasetError::BadHeader { .. } | DatasetError::Truncated { .. }
            ),
            "{err}"
        );
    }

    #[test]
    fn one_vs_rest_validates_digit() {
        assert_eq!(one_vs_rest(&[3, 4, 3], 3).unwrap(), array![1.0_f32, 0.0, 1.0]);
        assert!(matches!(one_vs_rest(&[1], 10), Err(DatasetError::InvalidDigit(10))));
    }

    #[test]
    fn new_rejects_mismatched_rows() {
        let err = LabeledDataset::new(Array2::zeros((3, 2)), Array1::zeros(2)).unwrap_err();
        assert!(matches!(err, DatasetError::ShapeMismatch { features: 3, labels: 2 }));
    }

    #[test]
    fn split_rows_matches_array_split() {
        let features = Array2::from_shape_fn((10, 2), |(r, _)| r as f32);
        let sizes: Vec<_> = split_rows(features.view(), 3).iter().map(|c| c.nrows()).collect();
        assert_eq!(sizes, vec![4, 3, 3]);
        let chunks = split_rows(features.view(), 3);
        assert_eq!(chunks[1][[0, 0]], 4.0);

        assert_eq!(split_rows(features.view(), 25).len(), 10);
        assert!(split_rows(Array2::<f32>::zeros((0, 2)).view(), 4).is_empty());
    }

    #[test]
    fn synthetic_is_seeded() {
        let a = LabeledDataset::synthetic(16, 8, 7);
        let b = LabeledDataset::synthetic(16, 8, 7);
        assert_eq!(a, b);
        assert_eq!(a.feature_dim(), 8);
        assert!(a.labels().iter().all(|l| *l == 0.0 || *l == 1.0));
    }
}
