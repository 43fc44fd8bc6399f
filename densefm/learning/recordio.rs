//! Dense tensor RecordIO encoding.
//!
//! Every row of a feature matrix becomes one self-delimiting frame:
//!
//! ```text
//! magic: u32 LE (0xCED7230A) | length: u32 LE | payload | zero padding to 4 bytes
//! ```
//!
//! The payload is a protobuf [`Record`] holding the row under the `values`
//! feature key and, when labels are supplied, the label under the `values`
//! label key. Frames carry no cross-record state, so a consumer can start
//! reading at any frame boundary.

use std::io::{self, Read, Write};

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use prost::Message;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::proto::{value::Kind, Record, Value};

/// Frame marker preceding every record.
pub const RECORDIO_MAGIC: u32 = 0xCED7_230A;
/// Key under which feature and label tensors are stored.
pub const VALUES_KEY: &str = "values";
/// Size of the magic + length header.
pub const HEADER_LEN: usize = 8;

const LENGTH_MASK: u32 = (1 << 29) - 1;
/// Largest payload a single frame can describe.
pub const MAX_PAYLOAD_LEN: usize = LENGTH_MASK as usize;
const READ_CHUNK: usize = 64 * 1024;

/// What to do with a row containing a value the record format cannot carry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidValuePolicy {
    /// Fail the whole encode on the first bad value.
    #[default]
    Abort,
    /// Drop the row and keep going.
    SkipRow,
}

/// Errors raised while encoding.
#[derive(Debug, Error)]
pub enum EncodeError {
    /// Row counts or feature widths disagree.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(ShapeMismatch),
    /// A value cannot be represented in a record frame.
    #[error("cannot encode row {row}: {reason}")]
    Encoding {
        /// Index of the offending input row.
        row: usize,
        /// Human-readable cause.
        reason: String,
    },
    /// The sink failed.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Details of a shape disagreement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShapeMismatch {
    /// Matrix and label vector have different lengths.
    RowCount {
        /// Rows in the feature matrix.
        features: usize,
        /// Entries in the label vector.
        labels: usize,
    },
    /// A row's width differs from the first row written.
    FeatureDim {
        /// Index of the offending row.
        row: usize,
        /// Width established by earlier rows.
        expected: usize,
        /// Width of the offending row.
        actual: usize,
    },
}

impl std::fmt::Display for ShapeMismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RowCount { features, labels } => {
                write!(f, "{features} feature rows but {labels} labels")
            }
            Self::FeatureDim {
                row,
                expected,
                actual,
            } => write!(f, "row {row} has {actual} features, expected {expected}"),
        }
    }
}

/// Errors raised while decoding a record stream.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Frame did not start with [`RECORDIO_MAGIC`].
    #[error("bad magic 0x{found:08x} at byte {offset}")]
    BadMagic {
        /// Value read in place of the magic.
        found: u32,
        /// Stream offset of the frame.
        offset: u64,
    },
    /// Continuation flags are set; multi-part frames are not produced by this encoder.
    #[error("multi-part frame at byte {offset} is not supported")]
    MultiPart {
        /// Stream offset of the frame.
        offset: u64,
    },
    /// Stream ended inside a frame.
    #[error("truncated frame at byte {offset}")]
    Truncated {
        /// Stream offset of the frame.
        offset: u64,
    },
    /// Payload is not a valid record.
    #[error("protobuf decode error: {0}")]
    Protobuf(#[from] prost::DecodeError),
    /// Record does not carry a dense f32 tensor where one is expected.
    #[error("record {record} has no dense float32 '{field}' tensor")]
    MissingTensor {
        /// Index of the record in the stream.
        record: usize,
        /// `features` or `label`.
        field: &'static str,
    },
    /// Records disagree on feature width or label presence.
    #[error("record {record} is inconsistent with earlier records: {reason}")]
    Inconsistent {
        /// Index of the record in the stream.
        record: usize,
        /// Human-readable cause.
        reason: String,
    },
    /// The source failed.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Totals reported after a full encode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodeSummary {
    /// Frames written.
    pub records: usize,
    /// Input rows dropped under [`InvalidValuePolicy::SkipRow`].
    pub skipped_rows: Vec<usize>,
    /// Bytes written, padding included.
    pub bytes: u64,
    /// Width of the encoded feature vectors.
    pub feature_dim: usize,
}

/// Streaming writer producing one frame per row.
#[derive(Debug)]
pub struct DenseTensorWriter<W: Write> {
    inner: W,
    policy: InvalidValuePolicy,
    feature_dim: Option<usize>,
    rows_seen: usize,
    summary: EncodeSummary,
    scratch: Vec<u8>,
}

impl<W: Write> DenseTensorWriter<W> {
    /// Wraps a sink with the default abort policy.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            policy: InvalidValuePolicy::default(),
            feature_dim: None,
            rows_seen: 0,
            summary: EncodeSummary::default(),
            scratch: Vec::new(),
        }
    }

    /// Sets the invalid value policy.
    #[must_use]
    pub fn with_policy(mut self, policy: InvalidValuePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Pins the expected feature width before any row is written.
    #[must_use]
    pub fn with_feature_dim(mut self, dim: usize) -> Self {
        self.feature_dim = Some(dim);
        self
    }

    /// Encodes one row. Returns `false` when the row was skipped by policy.
    pub fn write_row(&mut self, features: &[f32], label: Option<f32>) -> Result<bool, EncodeError> {
        let row = self.rows_seen;
        self.rows_seen += 1;

        match self.feature_dim {
            Some(expected) if expected != features.len() => {
                return Err(EncodeError::ShapeMismatch(ShapeMismatch::FeatureDim {
                    row,
                    expected,
                    actual: features.len(),
                }));
            }
            Some(_) => {}
            None => self.feature_dim = Some(features.len()),
        }

        if let Some(reason) = unrepresentable(features, label) {
            return match self.policy {
                InvalidValuePolicy::Abort => Err(EncodeError::Encoding { row, reason }),
                InvalidValuePolicy::SkipRow => {
                    self.summary.skipped_rows.push(row);
                    Ok(false)
                }
            };
        }

        let record = dense_record(features, label);
        check_payload_len(row, record.encoded_len())?;
        self.scratch.clear();
        self.scratch.reserve(record.encoded_len());
        record
            .encode(&mut self.scratch)
            .map_err(|err| EncodeError::Encoding {
                row,
                reason: err.to_string(),
            })?;

        let written = write_frame(&mut self.inner, &self.scratch)?;
        self.summary.records += 1;
        self.summary.bytes += written as u64;
        Ok(true)
    }

    /// Frames written so far.
    #[must_use]
    pub const fn records_written(&self) -> usize {
        self.summary.records
    }

    /// Bytes written so far.
    #[must_use]
    pub const fn bytes_written(&self) -> u64 {
        self.summary.bytes
    }

    /// Flushes the sink and returns it with the encode totals.
    pub fn finish(mut self) -> Result<(W, EncodeSummary), EncodeError> {
        self.inner.flush()?;
        let mut summary = self.summary;
        if summary.records > 0 {
            summary.feature_dim = self.feature_dim.unwrap_or(0);
        }
        Ok((self.inner, summary))
    }

    /// Returns the sink without flushing.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

fn unrepresentable(features: &[f32], label: Option<f32>) -> Option<String> {
    if let Some((column, value)) = features
        .iter()
        .enumerate()
        .find(|(_, value)| !value.is_finite())
    {
        return Some(format!("feature {column} is {value}"));
    }
    match label {
        Some(value) if !value.is_finite() => Some(format!("label is {value}")),
        _ => None,
    }
}

fn check_payload_len(row: usize, len: usize) -> Result<(), EncodeError> {
    if len > MAX_PAYLOAD_LEN {
        return Err(EncodeError::Encoding {
            row,
            reason: format!("payload of {len} bytes exceeds the {MAX_PAYLOAD_LEN} byte frame limit"),
        });
    }
    Ok(())
}

fn dense_record(features: &[f32], label: Option<f32>) -> Record {
    let mut record = Record::default();
    record
        .features
        .insert(VALUES_KEY.to_string(), Value::dense_f32(features.to_vec()));
    if let Some(label) = label {
        record
            .label
            .insert(VALUES_KEY.to_string(), Value::dense_f32(vec![label]));
    }
    record
}

fn padding_for(len: usize) -> usize {
    (4 - len % 4) % 4
}

fn write_frame<W: Write>(sink: &mut W, payload: &[u8]) -> io::Result<usize> {
    // Callers guarantee payload.len() <= MAX_PAYLOAD_LEN.
    let length = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "payload too large"))?;
    let pad = padding_for(payload.len());
    sink.write_all(&RECORDIO_MAGIC.to_le_bytes())?;
    sink.write_all(&length.to_le_bytes())?;
    sink.write_all(payload)?;
    sink.write_all(&[0u8; 3][..pad])?;
    Ok(HEADER_LEN + payload.len() + pad)
}

/// Encodes a feature matrix and optional labels into `sink`.
///
/// Shapes are checked before anything is written, so a row-count mismatch
/// leaves the sink untouched. With [`InvalidValuePolicy::Abort`] the sink may
/// hold the frames preceding the bad row when an [`EncodeError::Encoding`]
/// is returned; use [`encode_dense_tensor`] when a partial stream must never
/// escape.
pub fn write_dense_tensor<W: Write>(
    sink: W,
    features: ArrayView2<'_, f32>,
    labels: Option<ArrayView1<'_, f32>>,
    policy: InvalidValuePolicy,
) -> Result<EncodeSummary, EncodeError> {
    if let Some(labels) = labels {
        if labels.len() != features.nrows() {
            return Err(EncodeError::ShapeMismatch(ShapeMismatch::RowCount {
                features: features.nrows(),
                labels: labels.len(),
            }));
        }
    }

    let mut writer = DenseTensorWriter::new(sink)
        .with_policy(policy)
        .with_feature_dim(features.ncols());
    let mut row_buf = Vec::with_capacity(features.ncols());
    for (idx, row) in features.rows().into_iter().enumerate() {
        row_buf.clear();
        row_buf.extend(row.iter().copied());
        let label = labels.map(|labels| labels[idx]);
        writer.write_row(&row_buf, label)?;
    }
    let (_, mut summary) = writer.finish()?;
    summary.feature_dim = features.ncols();
    Ok(summary)
}

/// Encodes into a fresh buffer with the abort policy.
pub fn encode_dense_tensor(
    features: ArrayView2<'_, f32>,
    labels: Option<ArrayView1<'_, f32>>,
) -> Result<Vec<u8>, EncodeError> {
    let mut buf = Vec::new();
    write_dense_tensor(&mut buf, features, labels, InvalidValuePolicy::Abort)?;
    Ok(buf)
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseRecord {
    /// Feature vector.
    pub features: Vec<f32>,
    /// Label, when the frame carried one.
    pub label: Option<f32>,
}

/// Iterator over the records of a RecordIO stream.
#[derive(Debug)]
pub struct RecordReader<R: Read> {
    inner: R,
    offset: u64,
    index: usize,
    done: bool,
}

impl<R: Read> RecordReader<R> {
    /// Wraps a source positioned at a frame boundary.
    pub const fn new(inner: R) -> Self {
        Self {
            inner,
            offset: 0,
            index: 0,
            done: false,
        }
    }

    /// Reads the next raw payload, or `None` at a clean end of stream.
    pub fn next_payload(&mut self) -> Result<Option<Vec<u8>>, DecodeError> {
        let frame_offset = self.offset;
        let mut header = [0u8; HEADER_LEN];
        let filled = read_full(&mut self.inner, &mut header)?;
        if filled == 0 {
            return Ok(None);
        }
        if filled < HEADER_LEN {
            return Err(DecodeError::Truncated {
                offset: frame_offset,
            });
        }
        let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        if magic != RECORDIO_MAGIC {
            return Err(DecodeError::BadMagic {
                found: magic,
                offset: frame_offset,
            });
        }
        let raw_len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if raw_len & !LENGTH_MASK != 0 {
            return Err(DecodeError::MultiPart {
                offset: frame_offset,
            });
        }
        let len = raw_len as usize;
        let framed = len + padding_for(len);
        // Sized by the bytes read, not by the header.
        let mut payload = Vec::with_capacity(framed.min(READ_CHUNK));
        let read = (&mut self.inner)
            .take(framed as u64)
            .read_to_end(&mut payload)?;
        if read < framed {
            return Err(DecodeError::Truncated {
                offset: frame_offset,
            });
        }
        payload.truncate(len);
        self.offset += (HEADER_LEN + len + padding_for(len)) as u64;
        Ok(Some(payload))
    }

    /// Reads and decodes the next record.
    pub fn next_record(&mut self) -> Result<Option<DenseRecord>, DecodeError> {
        let Some(payload) = self.next_payload()? else {
            return Ok(None);
        };
        let record = Record::decode(payload.as_slice())?;
        let index = self.index;
        self.index += 1;

        let features = dense_values(&record.features).ok_or(DecodeError::MissingTensor {
            record: index,
            field: "features",
        })?;
        let label = if record.label.is_empty() {
            None
        } else {
            let values = dense_values(&record.label).ok_or(DecodeError::MissingTensor {
                record: index,
                field: "label",
            })?;
            values.first().copied()
        };
        Ok(Some(DenseRecord { features, label }))
    }
}

impl<R: Read> Iterator for RecordReader<R> {
    type Item = Result<DenseRecord, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

fn dense_values(map: &std::collections::BTreeMap<String, Value>) -> Option<Vec<f32>> {
    match map.get(VALUES_KEY)?.kind.as_ref()? {
        Kind::Float32Tensor(tensor) if tensor.keys.is_empty() => Some(tensor.values.clone()),
        #[allow(clippy::cast_possible_truncation)]
        Kind::Float64Tensor(tensor) if tensor.keys.is_empty() => {
            Some(tensor.values.iter().map(|v| *v as f32).collect())
        }
        _ => None,
    }
}

fn read_full<R: Read>(source: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

/// Decodes every record of an in-memory stream.
pub fn decode_dense_tensor(bytes: &[u8]) -> Result<Vec<DenseRecord>, DecodeError> {
    RecordReader::new(bytes).collect()
}

/// Reads a stream back into a matrix and, when every record is labelled, a label vector.
pub fn read_dense_tensor<R: Read>(
    source: R,
) -> Result<(Array2<f32>, Option<Array1<f32>>), DecodeError> {
    let mut values = Vec::new();
    let mut labels = Vec::new();
    let mut dim = None;
    let mut labelled = None;
    let mut rows = 0usize;

    for (index, record) in RecordReader::new(source).enumerate() {
        let record = record?;
        match dim {
            None => dim = Some(record.features.len()),
            Some(expected) if expected != record.features.len() => {
                return Err(DecodeError::Inconsistent {
                    record: index,
                    reason: format!(
                        "{} features, expected {expected}",
                        record.features.len()
                    ),
                });
            }
            Some(_) => {}
        }
        match (labelled, record.label) {
            (None, label) => labelled = Some(label.is_some()),
            (Some(true), None) | (Some(false), Some(_)) => {
                return Err(DecodeError::Inconsistent {
                    record: index,
                    reason: "label presence differs from earlier records".into(),
                });
            }
            _ => {}
        }
        if let Some(label) = record.label {
            labels.push(label);
        }
        values.extend(record.features);
        rows += 1;
    }

    let dim = dim.unwrap_or(0);
    let features = Array2::from_shape_vec((rows, dim), values).map_err(|err| {
        DecodeError::Inconsistent {
            record: rows,
            reason: err.to_string(),
        }
    })?;
    let labels = if labelled == Some(true) {
        Some(Array1::from_vec(labels))
    } else {
        None
    };
    Ok((features, labels))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2};
    use proptest::prelude::*;

    #[test]
    fn identity_scenario_decodes_two_records_in_order() {
        let features = array![[1.0_f32, 0.0], [0.0, 1.0]];
        let labels = array![1.0_f32, 0.0];
        let bytes = encode_dense_tensor(features.view(), Some(labels.view())).unwrap();
        let records = decode_dense_tensor(&bytes).unwrap();
        assert_eq!(
            records,
            vec![
                DenseRecord {
                    features: vec![1.0, 0.0],
                    label: Some(1.0)
                },
                DenseRecord {
                    features: vec![0.0, 1.0],
                    label: Some(0.0)
                },
            ]
        );
    }

    #[test]
    fn row_count_mismatch_writes_nothing() {
        let features = Array2::<f32>::zeros((3, 4));
        let labels = array![1.0_f32, 0.0];
        let mut sink = Vec::new();
        let err = write_dense_tensor(
            &mut sink,
            features.view(),
            Some(labels.view()),
            InvalidValuePolicy::Abort,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            EncodeError::ShapeMismatch(ShapeMismatch::RowCount {
                features: 3,
                labels: 2
            })
        ));
        assert!(sink.is_empty());
    }

    #[test]
    fn nan_feature_aborts() {
        let features = array![[0.5_f32, f32::NAN]];
        let labels = array![1.0_f32];
        let err = encode_dense_tensor(features.view(), Some(labels.view())).unwrap_err();
        assert!(matches!(err, EncodeError::Encoding { row: 0, .. }));
    }

    #[test]
    fn infinite_label_aborts() {
        let features = array![[0.5_f32, 0.25]];
        let labels = array![f32::INFINITY];
        let err = encode_dense_tensor(features.view(), Some(labels.view())).unwrap_err();
        assert!(err.to_string().contains("label"));
    }

    #[test]
    fn skip_policy_drops_bad_rows() {
        let features = array![[1.0_f32, 2.0], [f32::NAN, 0.0], [3.0, 4.0]];
        let labels = array![1.0_f32, 1.0, 0.0];
        let mut sink = Vec::new();
        let summary = write_dense_tensor(
            &mut sink,
            features.view(),
            Some(labels.view()),
            InvalidValuePolicy::SkipRow,
        )
        .unwrap();
        assert_eq!(summary.records, 2);
        assert_eq!(summary.skipped_rows, vec![1]);
        let records = decode_dense_tensor(&sink).unwrap();
        assert_eq!(records[1].features, vec![3.0, 4.0]);
        assert_eq!(records[1].label, Some(0.0));
    }

    #[test]
    fn empty_matrix_is_empty_stream() {
        let features = Array2::<f32>::zeros((0, 784));
        let labels = Array1::<f32>::zeros(0);
        let mut sink = Vec::new();
        let summary = write_dense_tensor(
            &mut sink,
            features.view(),
            Some(labels.view()),
            InvalidValuePolicy::Abort,
        )
        .unwrap();
        assert_eq!(summary.records, 0);
        assert!(sink.is_empty());
        assert!(decode_dense_tensor(&sink).unwrap().is_empty());
    }

    #[test]
    fn encoding_is_deterministic() {
        let features = Array2::from_shape_fn((5, 7), |(r, c)| (r * 7 + c) as f32 * 0.125);
        let labels = Array1::from_shape_fn(5, |r| (r % 2) as f32);
        let first = encode_dense_tensor(features.view(), Some(labels.view())).unwrap();
        let second = encode_dense_tensor(features.view(), Some(labels.view())).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn frames_are_magic_prefixed_and_padded() {
        let features = array![[0.25_f32, 0.5, 0.75]];
        let labels = array![1.0_f32];
        let bytes = encode_dense_tensor(features.view(), Some(labels.view())).unwrap();
        assert_eq!(&bytes[..4], &RECORDIO_MAGIC.to_le_bytes());
        let length = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
        assert_eq!(bytes.len() % 4, 0);
        assert_eq!(bytes.len(), HEADER_LEN + length + padding_for(length));
        let record = Record::decode(&bytes[HEADER_LEN..HEADER_LEN + length]).unwrap();
        assert_eq!(record.features.len(), 1);
        assert!(record.label.contains_key(VALUES_KEY));
    }

    #[test]
    fn unlabelled_rows_round_trip() {
        let features = array![[1.5_f32, -2.0], [0.0, 9.0]];
        let bytes = encode_dense_tensor(features.view(), None).unwrap();
        let (decoded, labels) = read_dense_tensor(bytes.as_slice()).unwrap();
        assert_eq!(decoded, features);
        assert!(labels.is_none());
    }

    #[test]
    fn matrix_round_trips_through_reader() {
        let features = Array2::from_shape_fn((4, 784), |(r, c)| ((r + c) % 255) as f32 / 255.0);
        let labels = array![1.0_f32, 0.0, 0.0, 1.0];
        let bytes = encode_dense_tensor(features.view(), Some(labels.view())).unwrap();
        let (decoded, decoded_labels) = read_dense_tensor(bytes.as_slice()).unwrap();
        assert_eq!(decoded, features);
        assert_eq!(decoded_labels, Some(labels));
    }

    fn finite_f32() -> impl Strategy<Value = f32> {
        use proptest::num::f32::{NEGATIVE, NORMAL, POSITIVE, SUBNORMAL, ZERO};
        POSITIVE | NEGATIVE | NORMAL | SUBNORMAL | ZERO
    }

    fn labelled_matrix() -> impl Strategy<Value = (Array2<f32>, Array1<f32>)> {
        (1..20usize, 1..50usize).prop_flat_map(|(rows, cols)| {
            (
                proptest::collection::vec(finite_f32(), rows * cols),
                proptest::collection::vec(finite_f32(), rows),
            )
                .prop_map(move |(values, labels)| {
                    (
                        Array2::from_shape_vec((rows, cols), values).unwrap(),
                        Array1::from_vec(labels),
                    )
                })
        })
    }

    proptest! {
        #[test]
        fn finite_matrices_decode_bit_identical((features, labels) in labelled_matrix()) {
            let bytes = encode_dense_tensor(features.view(), Some(labels.view())).unwrap();
            prop_assert_eq!(bytes.len() % 4, 0);
            let (decoded, decoded_labels) = read_dense_tensor(bytes.as_slice()).unwrap();
            let decoded_labels = decoded_labels.unwrap();
            prop_assert_eq!(decoded.dim(), features.dim());
            for (got, want) in decoded.iter().zip(features.iter()) {
                prop_assert_eq!(got.to_bits(), want.to_bits());
            }
            for (got, want) in decoded_labels.iter().zip(labels.iter()) {
                prop_assert_eq!(got.to_bits(), want.to_bits());
            }
        }
    }

    #[test]
    fn streaming_writer_rejects_ragged_rows() {
        let mut writer = DenseTensorWriter::new(Vec::new());
        assert!(writer.write_row(&[1.0, 2.0], Some(1.0)).unwrap());
        let err = writer.write_row(&[1.0], Some(0.0)).unwrap_err();
        assert!(matches!(
            err,
            EncodeError::ShapeMismatch(ShapeMismatch::FeatureDim {
                row: 1,
                expected: 2,
                actual: 1
            })
        ));
        assert_eq!(writer.records_written(), 1);
        let (bytes, summary) = writer.finish().unwrap();
        assert_eq!(summary.feature_dim, 2);
        assert_eq!(decode_dense_tensor(&bytes).unwrap().len(), 1);
    }

    #[test]
    fn reader_rejects_bad_magic() {
        let mut bytes = encode_dense_tensor(array![[1.0_f32]].view(), None).unwrap();
        bytes[0] ^= 0xFF;
        let err = decode_dense_tensor(&bytes).unwrap_err();
        assert!(matches!(err, DecodeError::BadMagic { offset: 0, .. }));
    }

    #[test]
    fn reader_reports_truncation() {
        let features = array![[1.0_f32, 2.0], [3.0, 4.0]];
        let bytes = encode_dense_tensor(features.view(), None).unwrap();
        let cut = &bytes[..bytes.len() - 3];
        let mut reader = RecordReader::new(cut);
        assert!(reader.next_record().unwrap().is_some());
        assert!(matches!(
            reader.next_record().unwrap_err(),
            DecodeError::Truncated { .. }
        ));
    }

    #[test]
    fn oversized_length_on_short_stream_is_truncation() {
        let mut bytes = Vec::new();
        bytes.extend(RECORDIO_MAGIC.to_le_bytes());
        bytes.extend(LENGTH_MASK.to_le_bytes());
        bytes.extend([0u8; 12]);
        let mut reader = RecordReader::new(bytes.as_slice());
        assert!(matches!(
            reader.next_payload().unwrap_err(),
            DecodeError::Truncated { offset: 0 }
        ));
    }

    #[test]
    fn reader_rejects_continuation_flags() {
        let mut bytes = encode_dense_tensor(array![[1.0_f32]].view(), None).unwrap();
        bytes[7] |= 0x20;
        assert!(matches!(
            decode_dense_tensor(&bytes).unwrap_err(),
            DecodeError::MultiPart { .. }
        ));
    }

    #[test]
    fn oversized_payload_is_an_encoding_error() {
        assert!(check_payload_len(3, MAX_PAYLOAD_LEN).is_ok());
        let err = check_payload_len(3, MAX_PAYLOAD_LEN + 1).unwrap_err();
        assert!(matches!(err, EncodeError::Encoding { row: 3, .. }));
    }
}
