//! Binary snapshot files for vector indices.
//!
//! File format: `image.index` / `text.index`
//!
//! Header (50 bytes):
//! - version: u8 (1)
//! - metric: u8 (0 = inner product, 1 = squared L2)
//! - model_id: [u8; 32] (SHA256 of the embedding model pair)
//! - dimensions: u32 (little-endian)
//! - row_count: u64 (little-endian)
//! - checksum: u32 (CRC32 of header fields before checksum)
//!
//! Body: row_count * dimensions f32 (little-endian), rows in row id order.
//!
//! Trailer: body checksum u32 (CRC32 of the body bytes)

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::index::vector_index::{Metric, VectorIndex};

/// Current file format version
const FORMAT_VERSION: u8 = 1;

/// version(1) + metric(1) + model_id(32) + dimensions(4) + row_count(8) + checksum(4)
const HEADER_SIZE: usize = 50;

/// Bytes covered by the header checksum.
const HEADER_CHECKED: usize = HEADER_SIZE - 4;

/// Errors that can occur during snapshot operations.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Model mismatch: snapshot was built with a different embedding model")]
    ModelMismatch,

    #[error("Checksum mismatch: file may be corrupted")]
    ChecksumMismatch,

    #[error("Dimension mismatch: expected {expected}, file has {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// What a snapshot must agree with to be served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotSpec {
    pub model_id: [u8; 32],
    pub dimensions: usize,
    /// Metric of the empty index produced when no file exists.
    pub metric: Metric,
}

/// A snapshot file on disk.
#[derive(Debug, Clone)]
pub struct SnapshotFile {
    path: PathBuf,
}

impl SnapshotFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load the snapshot.
    ///
    /// A missing file is not an error: it yields an empty index with the
    /// expected dimensions and metric.
    pub fn load(&self, expected: &SnapshotSpec) -> Result<VectorIndex, SnapshotError> {
        if !self.exists() {
            log::warn!(
                "Index file not found: {}, serving an empty index",
                self.path.display()
            );
            return Ok(VectorIndex::new(expected.dimensions, expected.metric));
        }

        let file = File::open(&self.path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let header = Self::read_header(&mut reader)?;
        Self::validate_header(&header, expected)?;

        if header.metric != expected.metric {
            log::warn!(
                "{} was built with {:?}, configured metric is {:?}; using the snapshot's",
                self.path.display(),
                header.metric,
                expected.metric
            );
        }

        let dimensions = header.dimensions as usize;
        let rows = usize::try_from(header.row_count)
            .map_err(|_| SnapshotError::InvalidFormat("row count overflows usize".to_string()))?;
        let values = rows.checked_mul(dimensions).ok_or_else(|| {
            SnapshotError::InvalidFormat(format!("{rows} rows x {dimensions} dimensions overflows"))
        })?;

        let expected_len = (values as u64)
            .checked_mul(4)
            .and_then(|body| body.checked_add((HEADER_SIZE + 4) as u64));
        if expected_len.map_or(true, |len| len > file_len) {
            return Err(SnapshotError::InvalidFormat(format!(
                "header declares {rows} rows, file is only {file_len} bytes"
            )));
        }

        let mut data = Vec::with_capacity(values);
        let mut hasher = crc32fast::Hasher::new();
        let mut row_bytes = vec![0u8; dimensions * 4];
        for _ in 0..rows {
            reader.read_exact(&mut row_bytes)?;
            hasher.update(&row_bytes);
            data.extend(
                row_bytes
                    .chunks_exact(4)
                    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]])),
            );
        }

        let mut trailer = [0u8; 4];
        reader.read_exact(&mut trailer)?;
        if u32::from_le_bytes(trailer) != hasher.finalize() {
            return Err(SnapshotError::ChecksumMismatch);
        }

        let index = VectorIndex::from_raw(dimensions, header.metric, rows, data);
        log::info!(
            "Loaded {} vectors from {}",
            index.len(),
            self.path.display()
        );
        Ok(index)
    }

    /// Save the index.
    ///
    /// Uses atomic write: temp file -> fsync -> rename
    pub fn save(&self, index: &VectorIndex, model_id: &[u8; 32]) -> Result<(), SnapshotError> {
        self.stage(index, model_id)?.commit()
    }

    /// Write the index next to this file without replacing it.
    ///
    /// The current file stays in place until [`StagedSnapshot::commit`].
    pub fn stage(
        &self,
        index: &VectorIndex,
        model_id: &[u8; 32],
    ) -> Result<StagedSnapshot, SnapshotError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let temp_path = self.path.with_extension("tmp");

        if let Err(err) = Self::write_to_file(&temp_path, index, model_id) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(err);
        }

        Ok(StagedSnapshot {
            staged: temp_path,
            target: self.path.clone(),
            committed: false,
        })
    }

    fn write_to_file(
        path: &Path,
        index: &VectorIndex,
        model_id: &[u8; 32],
    ) -> Result<(), SnapshotError> {
        let dimensions = u32::try_from(index.dimensions()).map_err(|_| {
            SnapshotError::InvalidFormat(format!("{} dimensions overflow u32", index.dimensions()))
        })?;

        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        let header = Header {
            version: FORMAT_VERSION,
            metric: index.metric(),
            model_id: *model_id,
            dimensions,
            row_count: index.len() as u64,
        };
        Self::write_header(&mut writer, &header)?;

        let mut hasher = crc32fast::Hasher::new();
        for value in index.as_slice() {
            let bytes = value.to_le_bytes();
            hasher.update(&bytes);
            writer.write_all(&bytes)?;
        }
        writer.write_all(&hasher.finalize().to_le_bytes())?;

        writer.flush()?;
        let file = writer
            .into_inner()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        file.sync_all()?;

        Ok(())
    }

    fn read_header(reader: &mut impl Read) -> Result<Header, SnapshotError> {
        let mut bytes = [0u8; HEADER_SIZE];
        reader.read_exact(&mut bytes)?;

        let version = bytes[0];
        if version != FORMAT_VERSION {
            return Err(SnapshotError::VersionMismatch(version, FORMAT_VERSION));
        }

        let stored_checksum = u32::from_le_bytes([bytes[46], bytes[47], bytes[48], bytes[49]]);
        if stored_checksum != crc32fast::hash(&bytes[..HEADER_CHECKED]) {
            return Err(SnapshotError::ChecksumMismatch);
        }

        let metric = Metric::from_byte(bytes[1])
            .ok_or_else(|| SnapshotError::InvalidFormat(format!("unknown metric {}", bytes[1])))?;

        let mut model_id = [0u8; 32];
        model_id.copy_from_slice(&bytes[2..34]);

        let dimensions = u32::from_le_bytes([bytes[34], bytes[35], bytes[36], bytes[37]]);

        let mut row_count = [0u8; 8];
        row_count.copy_from_slice(&bytes[38..46]);

        Ok(Header {
            version,
            metric,
            model_id,
            dimensions,
            row_count: u64::from_le_bytes(row_count),
        })
    }

    fn validate_header(header: &Header, expected: &SnapshotSpec) -> Result<(), SnapshotError> {
        if header.model_id != expected.model_id {
            return Err(SnapshotError::ModelMismatch);
        }

        if header.dimensions as usize != expected.dimensions {
            return Err(SnapshotError::DimensionMismatch {
                expected: expected.dimensions,
                got: header.dimensions as usize,
            });
        }

        Ok(())
    }

    fn write_header(writer: &mut impl Write, header: &Header) -> Result<(), SnapshotError> {
        let mut bytes = [0u8; HEADER_SIZE];

        bytes[0] = header.version;
        bytes[1] = header.metric.to_byte();
        bytes[2..34].copy_from_slice(&header.model_id);
        bytes[34..38].copy_from_slice(&header.dimensions.to_le_bytes());
        bytes[38..46].copy_from_slice(&header.row_count.to_le_bytes());

        let checksum = crc32fast::hash(&bytes[..HEADER_CHECKED]);
        bytes[46..50].copy_from_slice(&checksum.to_le_bytes());

        writer.write_all(&bytes)?;
        Ok(())
    }
}

/// A fully written snapshot waiting to replace its target file.
///
/// Dropping it without [`commit`](Self::commit) deletes the staged file and
/// leaves the target untouched.
#[derive(Debug)]
pub struct StagedSnapshot {
    staged: PathBuf,
    target: PathBuf,
    committed: bool,
}

impl StagedSnapshot {
    /// Rename the staged file over the target.
    pub fn commit(mut self) -> Result<(), SnapshotError> {
        std::fs::rename(&self.staged, &self.target)?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for StagedSnapshot {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_file(&self.staged);
        }
    }
}

#[derive(Debug)]
struct Header {
    version: u8,
    metric: Metric,
    model_id: [u8; 32],
    dimensions: u32,
    row_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom};

    fn test_spec(dimensions: usize) -> SnapshotSpec {
        let mut model_id = [0u8; 32];
        model_id[0] = 0xAB;
        model_id[31] = 0xCD;
        SnapshotSpec {
            model_id,
            dimensions,
            metric: Metric::InnerProduct,
        }
    }

    fn sample_index() -> VectorIndex {
        VectorIndex::with_rows(
            3,
            Metric::InnerProduct,
            &[
                vec![1.0, 0.0, 0.0],
                vec![0.0, 1.0, 0.0],
                vec![0.6, 0.8, 0.0],
                vec![-0.25, 0.5, 0.125],
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_missing_file_loads_empty_index() {
        let dir = tempfile::tempdir().unwrap();
        let file = SnapshotFile::new(dir.path().join("nope.index"));

        let index = file.load(&test_spec(512)).unwrap();
        assert!(index.is_empty());
        assert_eq!(index.dimensions(), 512);
        assert!(index.search(&vec![0.0; 512], 10).unwrap().is_empty());
    }

    #[test]
    fn test_save_and_load_empty() {
        let dir = tempfile::tempdir().unwrap();
        let file = SnapshotFile::new(dir.path().join("image.index"));
        let spec = test_spec(384);

        file.save(&VectorIndex::new(384, Metric::InnerProduct), &spec.model_id)
            .unwrap();
        assert!(file.exists());

        let loaded = file.load(&spec).unwrap();
        assert_eq!(loaded.len(), 0);
        assert_eq!(loaded.dimensions(), 384);
    }

    #[test]
    fn test_round_trip_preserves_search_and_reconstruct() {
        let dir = tempfile::tempdir().unwrap();
        let file = SnapshotFile::new(dir.path().join("image.index"));
        let spec = test_spec(3);
        let index = sample_index();

        file.save(&index, &spec.model_id).unwrap();
        let loaded = file.load(&spec).unwrap();

        assert_eq!(loaded, index);
        for row in 0..index.len() as u64 {
            assert_eq!(loaded.reconstruct(row).unwrap(), index.reconstruct(row).unwrap());
        }
        for query in [[1.0, 0.0, 0.0], [0.0, 0.6, 0.8], [0.3, -0.2, 0.9]] {
            for k in [0, 1, 3, 10] {
                assert_eq!(loaded.search(&query, k).unwrap(), index.search(&query, k).unwrap());
            }
        }
    }

    #[test]
    fn test_metric_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let file = SnapshotFile::new(dir.path().join("text.index"));
        let spec = test_spec(2);

        let index = VectorIndex::with_rows(2, Metric::SquaredL2, &[vec![1.0, 0.0]]).unwrap();
        file.save(&index, &spec.model_id).unwrap();

        assert_eq!(file.load(&spec).unwrap().metric(), Metric::SquaredL2);
    }

    #[test]
    fn test_model_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let file = SnapshotFile::new(dir.path().join("image.index"));
        let spec = test_spec(3);
        file.save(&sample_index(), &spec.model_id).unwrap();

        let mut other = spec;
        other.model_id[0] = 0xFF;
        assert!(matches!(file.load(&other), Err(SnapshotError::ModelMismatch)));
    }

    #[test]
    fn test_dimension_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let file = SnapshotFile::new(dir.path().join("image.index"));
        let spec = test_spec(3);
        file.save(&sample_index(), &spec.model_id).unwrap();

        assert!(matches!(
            file.load(&test_spec(512)),
            Err(SnapshotError::DimensionMismatch { expected: 512, got: 3 })
        ));
    }

    #[test]
    fn test_header_corruption_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.index");
        let file = SnapshotFile::new(path.clone());
        let spec = test_spec(3);
        file.save(&sample_index(), &spec.model_id).unwrap();

        let mut raw = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        raw.seek(SeekFrom::Start(10)).unwrap();
        raw.write_all(&[0xFF]).unwrap();

        assert!(matches!(file.load(&spec), Err(SnapshotError::ChecksumMismatch)));
    }

    #[test]
    fn test_body_corruption_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.index");
        let file = SnapshotFile::new(path.clone());
        let spec = test_spec(3);
        file.save(&sample_index(), &spec.model_id).unwrap();

        let mut raw = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        raw.seek(SeekFrom::Start(HEADER_SIZE as u64 + 5)).unwrap();
        raw.write_all(&[0x42]).unwrap();

        assert!(matches!(file.load(&spec), Err(SnapshotError::ChecksumMismatch)));
    }

    #[test]
    fn test_truncated_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.index");
        let file = SnapshotFile::new(path.clone());
        let spec = test_spec(3);
        file.save(&sample_index(), &spec.model_id).unwrap();

        let len = std::fs::metadata(&path).unwrap().len();
        std::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(len - 10)
            .unwrap();

        assert!(matches!(file.load(&spec), Err(SnapshotError::InvalidFormat(_))));
    }

    #[test]
    fn test_huge_row_count_is_rejected_before_reading_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.index");
        let spec = test_spec(3);

        let header = Header {
            version: FORMAT_VERSION,
            metric: Metric::InnerProduct,
            model_id: spec.model_id,
            dimensions: 3,
            row_count: 1 << 40,
        };
        let mut bytes = Vec::new();
        SnapshotFile::write_header(&mut bytes, &header).unwrap();
        std::fs::write(&path, &bytes).unwrap();

        let result = SnapshotFile::new(path).load(&spec);
        assert!(matches!(result, Err(SnapshotError::InvalidFormat(_))));
    }

    #[test]
    fn test_dropped_stage_keeps_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.index");
        let file = SnapshotFile::new(path.clone());
        let spec = test_spec(3);
        file.save(&sample_index(), &spec.model_id).unwrap();

        let staged = file
            .stage(&VectorIndex::new(3, Metric::InnerProduct), &spec.model_id)
            .unwrap();
        assert!(path.with_extension("tmp").exists());
        assert_eq!(file.load(&spec).unwrap().len(), 4);

        drop(staged);
        assert!(!path.with_extension("tmp").exists());
        assert_eq!(file.load(&spec).unwrap(), sample_index());
    }

    #[test]
    fn test_committed_stage_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = SnapshotFile::new(dir.path().join("image.index"));
        let spec = test_spec(3);
        file.save(&sample_index(), &spec.model_id).unwrap();

        file.stage(&VectorIndex::new(3, Metric::InnerProduct), &spec.model_id)
            .unwrap()
            .commit()
            .unwrap();

        assert!(file.load(&spec).unwrap().is_empty());
    }

    #[test]
    fn test_atomic_write_cleans_up_on_error() {
        let dir = tempfile::tempdir().unwrap();
        // a directory where the temp file should go makes File::create fail
        let path = dir.path().join("image.index");
        std::fs::create_dir_all(path.with_extension("tmp")).unwrap();

        let file = SnapshotFile::new(path.clone());
        let result = file.save(&sample_index(), &test_spec(3).model_id);

        assert!(result.is_err());
        assert!(!path.exists());
    }
}
