//! Immutable index snapshots and the atomic swap used by the serving path.
//!
//! A query takes an `Arc<VectorIndex>` once and keeps using it until it is
//! done, so a concurrent rebuild never shows it a half-replaced index.

use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use crate::index::storage::{SnapshotError, SnapshotFile, SnapshotSpec, StagedSnapshot};
use crate::index::vector_index::VectorIndex;
use crate::index::Modality;

/// Holder of the current snapshot of one index.
pub struct SnapshotCell {
    current: RwLock<Arc<VectorIndex>>,
}

impl SnapshotCell {
    pub fn new(index: VectorIndex) -> Self {
        Self {
            current: RwLock::new(Arc::new(index)),
        }
    }

    /// The snapshot new readers should use.
    pub fn current(&self) -> Arc<VectorIndex> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Publish `next`, returning the snapshot it replaced.
    pub fn swap(&self, next: Arc<VectorIndex>) -> Arc<VectorIndex> {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *guard, next)
    }
}

/// The image and text indices served to queries.
pub struct ServingIndexes {
    image: SnapshotCell,
    text: SnapshotCell,
    image_file: SnapshotFile,
    text_file: SnapshotFile,
    spec: SnapshotSpec,
}

impl ServingIndexes {
    /// Load both snapshots from `index_dir`.
    ///
    /// Missing files, and files written for another model, dimension count or
    /// format version, give empty indices so a rebuild can replace them.
    pub fn open(index_dir: &Path, spec: SnapshotSpec) -> Result<Self, SnapshotError> {
        let image_file = SnapshotFile::new(Self::file_path(index_dir, Modality::Image));
        let text_file = SnapshotFile::new(Self::file_path(index_dir, Modality::Text));

        let image = load_or_fresh(&image_file, &spec)?;
        let text = load_or_fresh(&text_file, &spec)?;

        Ok(Self {
            image: SnapshotCell::new(image),
            text: SnapshotCell::new(text),
            image_file,
            text_file,
            spec,
        })
    }

    /// Serve the given indices without reading anything from disk.
    pub fn with_indexes(
        index_dir: &Path,
        spec: SnapshotSpec,
        image: VectorIndex,
        text: VectorIndex,
    ) -> Self {
        Self {
            image: SnapshotCell::new(image),
            text: SnapshotCell::new(text),
            image_file: SnapshotFile::new(Self::file_path(index_dir, Modality::Image)),
            text_file: SnapshotFile::new(Self::file_path(index_dir, Modality::Text)),
            spec,
        }
    }

    pub fn file_path(index_dir: &Path, modality: Modality) -> PathBuf {
        index_dir.join(format!("{}.index", modality.as_str()))
    }

    pub fn spec(&self) -> &SnapshotSpec {
        &self.spec
    }

    /// Current snapshot for `modality`.
    pub fn get(&self, modality: Modality) -> Arc<VectorIndex> {
        self.cell(modality).current()
    }

    /// Swap in a new snapshot for `modality` without touching disk.
    pub fn swap(&self, modality: Modality, index: VectorIndex) {
        let rows = index.len();
        let previous = self.cell(modality).swap(Arc::new(index));
        log::info!(
            "Swapped {} index: {} -> {} rows",
            modality,
            previous.len(),
            rows
        );
    }

    /// Write `index` as the snapshot file for `modality` without serving it.
    pub fn persist(&self, modality: Modality, index: &VectorIndex) -> Result<(), SnapshotError> {
        self.file(modality).save(index, &self.spec.model_id)
    }

    /// Write `index` next to the snapshot file for `modality`. The current
    /// file is replaced only when the returned stage is committed.
    pub fn stage(
        &self,
        modality: Modality,
        index: &VectorIndex,
    ) -> Result<StagedSnapshot, SnapshotError> {
        self.file(modality).stage(index, &self.spec.model_id)
    }

    /// Persist `index` as the snapshot file for `modality`, then serve it.
    pub fn publish(&self, modality: Modality, index: VectorIndex) -> Result<(), SnapshotError> {
        self.persist(modality, &index)?;
        self.swap(modality, index);
        Ok(())
    }

    /// Reload both snapshot files.
    ///
    /// Both files are read before either is swapped in, so a failure leaves
    /// the served indices unchanged.
    pub fn reload(&self) -> Result<(), SnapshotError> {
        let image = self.image_file.load(&self.spec)?;
        let text = self.text_file.load(&self.spec)?;

        self.swap(Modality::Image, image);
        self.swap(Modality::Text, text);
        Ok(())
    }

    fn cell(&self, modality: Modality) -> &SnapshotCell {
        match modality {
            Modality::Image => &self.image,
            Modality::Text => &self.text,
        }
    }

    fn file(&self, modality: Modality) -> &SnapshotFile {
        match modality {
            Modality::Image => &self.image_file,
            Modality::Text => &self.text_file,
        }
    }
}

fn load_or_fresh(file: &SnapshotFile, spec: &SnapshotSpec) -> Result<VectorIndex, SnapshotError> {
    match file.load(spec) {
        Ok(index) => Ok(index),
        Err(SnapshotError::ModelMismatch) => {
            log::warn!(
                "Model changed since {} was built, starting with an empty index",
                file.path().display()
            );
            Ok(VectorIndex::new(spec.dimensions, spec.metric))
        }
        Err(SnapshotError::VersionMismatch(file_ver, _)) => {
            log::warn!(
                "Snapshot version {} of {} unsupported, starting with an empty index",
                file_ver,
                file.path().display()
            );
            Ok(VectorIndex::new(spec.dimensions, spec.metric))
        }
        Err(SnapshotError::DimensionMismatch { got, .. }) => {
            log::warn!(
                "{} holds {}-dimensional vectors, starting with an empty index",
                file.path().display(),
                got
            );
            Ok(VectorIndex::new(spec.dimensions, spec.metric))
        }
        Err(e) => {
            log::error!("Failed to load {}: {}", file.path().display(), e);
            Err(e)
        }
    }
}
